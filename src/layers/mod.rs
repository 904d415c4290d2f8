pub mod dense;
pub mod dropout;

pub use dense::{Init, Layer, LayerGradients, LayerTrace};
pub use dropout::DropoutMask;
