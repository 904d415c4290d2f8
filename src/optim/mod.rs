pub mod adamw;
pub mod clip;
pub mod scheduler;

pub use adamw::AdamW;
pub use clip::clip_grad_norm;
pub use scheduler::CosineAnnealing;
