use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::error::{Error, Result};
use crate::math::standard_normal;

/// Dense row-major matrix used for layer weights, biases and their gradients.
///
/// Layer convention: a `(input_size × size)` weight matrix is multiplied on
/// the left by a row vector of inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix{
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<Vec<f64>>
}

impl Matrix{
    pub fn zeros(rows: usize, cols: usize) -> Matrix {
        Matrix{
            rows,
            cols,
            data: vec![vec![0.0; cols]; rows]
        }
    }

    /// He initialization: samples from N(0, sqrt(2 / rows)).
    ///
    /// Used ahead of ReLU. `rows` is the fan-in.
    pub fn he<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Matrix {
        let std_dev = (2.0 / rows.max(1) as f64).sqrt();
        let mut res = Matrix::zeros(rows, cols);
        for row in res.data.iter_mut() {
            for x in row.iter_mut() {
                *x = standard_normal(rng) * std_dev;
            }
        }
        res
    }

    /// Xavier (Glorot) uniform initialization: U(-a, a) with
    /// a = sqrt(6 / (fan_in + fan_out)).
    pub fn xavier_uniform<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Matrix {
        let bound = (6.0 / (rows + cols).max(1) as f64).sqrt();
        let mut res = Matrix::zeros(rows, cols);
        for row in res.data.iter_mut() {
            for x in row.iter_mut() {
                *x = rng.gen_range(-bound..=bound);
            }
        }
        res
    }

    /// Row vector × matrix: `v (1 × rows) · self (rows × cols)` → length `cols`.
    pub fn vec_mul(&self, v: &[f64]) -> Result<Vec<f64>> {
        if v.len() != self.rows {
            return Err(Error::Shape(format!(
                "cannot multiply vector of length {} by {}×{} matrix",
                v.len(), self.rows, self.cols
            )));
        }
        let mut out = vec![0.0; self.cols];
        for (x, row) in v.iter().zip(self.data.iter()) {
            if *x == 0.0 {
                continue;
            }
            for (o, w) in out.iter_mut().zip(row.iter()) {
                *o += x * w;
            }
        }
        Ok(out)
    }

    /// Matrix × column vector: `self (rows × cols) · v (cols)` → length `rows`.
    /// Backprop uses this to push a delta through the weights (`δ · Wᵀ`).
    pub fn mul_vec(&self, v: &[f64]) -> Vec<f64> {
        self.data.iter()
            .map(|row| row.iter().zip(v.iter()).map(|(w, x)| w * x).sum())
            .collect()
    }

    /// Accumulates the outer product `aᵀ · b` into `self`.
    pub fn add_outer(&mut self, a: &[f64], b: &[f64]) {
        for (row, x) in self.data.iter_mut().zip(a.iter()) {
            if *x == 0.0 {
                continue;
            }
            for (cell, y) in row.iter_mut().zip(b.iter()) {
                *cell += x * y;
            }
        }
    }

    /// Accumulates `v` into the single row of a `1 × cols` matrix.
    pub fn add_row(&mut self, v: &[f64]) {
        if let Some(row) = self.data.first_mut() {
            for (cell, x) in row.iter_mut().zip(v.iter()) {
                *cell += x;
            }
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for row in self.data.iter_mut() {
            for x in row.iter_mut() {
                *x *= factor;
            }
        }
    }

    pub fn squared_norm(&self) -> f64 {
        self.data.iter().flatten().map(|x| x * x).sum()
    }

    pub fn same_shape(&self, other: &Matrix) -> bool {
        self.rows == other.rows && self.cols == other.cols
    }

    pub fn map<F>(&self, functor: F) -> Matrix
    where
        F: Fn(f64) -> f64,
    {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter()
                .map(|row| row.iter().map(|&x| functor(x)).collect())
                .collect(),
        }
    }
}

impl Default for Matrix {
    fn default() -> Self {
        Matrix { rows: 0, cols: 0, data: vec![] }
    }
}
