/*
 * Row-major 2D matrix of f64.
 *
 * Everything the models need is a [batch, features] or [in, out] shape, so
 * this stays a plain Vec<f64> with index arithmetic instead of a general
 * n-dimensional tensor.
 */

use crate::error::{ModelError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Matrix::zeros(n, n);
        for i in 0..n {
            m.data[i * n + i] = 1.0;
        }
        m
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(ModelError::shape(
                "matrix data length",
                &[rows * cols],
                &[data.len()],
            ));
        }
        Ok(Matrix { rows, cols, data })
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows.iter() {
            if row.len() != cols {
                return Err(ModelError::shape("matrix row width", &[cols], &[row.len()]));
            }
            data.extend_from_slice(row);
        }
        Ok(Matrix {
            rows: rows.len(),
            cols,
            data,
        })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn column(&self, col: usize) -> Vec<f64> {
        (0..self.rows).map(|r| self.get(r, col)).collect()
    }

    pub fn transpose(&self) -> Matrix {
        let mut out = Matrix::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        out
    }

    /// `self · other`. Output rows are computed in parallel.
    pub fn matmul(&self, other: &Matrix) -> Result<Matrix> {
        if self.cols != other.rows {
            return Err(ModelError::shape(
                "matmul inner dimension",
                &[self.rows, self.cols],
                &[other.rows, other.cols],
            ));
        }
        let mut out = vec![0.0; self.rows * other.cols];
        let inner = self.cols;
        let width = other.cols;
        out.par_chunks_mut(width.max(1))
            .enumerate()
            .for_each(|(r, out_row)| {
                let lhs = &self.data[r * inner..(r + 1) * inner];
                for (k, a) in lhs.iter().enumerate() {
                    let rhs = &other.data[k * width..(k + 1) * width];
                    for (o, b) in out_row.iter_mut().zip(rhs.iter()) {
                        *o += a * b;
                    }
                }
            });
        Ok(Matrix {
            rows: self.rows,
            cols: width,
            data: out,
        })
    }

    fn zip_with<F>(&self, other: &Matrix, context: &str, f: F) -> Result<Matrix>
    where
        F: Fn(f64, f64) -> f64,
    {
        if self.shape() != other.shape() {
            return Err(ModelError::shape(context, &self.shape(), &other.shape()));
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| f(*a, *b))
            .collect();
        Ok(Matrix {
            rows: self.rows,
            cols: self.cols,
            data,
        })
    }

    pub fn add(&self, other: &Matrix) -> Result<Matrix> {
        self.zip_with(other, "elementwise add", |a, b| a + b)
    }

    pub fn hadamard(&self, other: &Matrix) -> Result<Matrix> {
        self.zip_with(other, "elementwise product", |a, b| a * b)
    }

    /// Broadcasts `bias` over every row.
    pub fn add_row_vector(&self, bias: &[f64]) -> Result<Matrix> {
        if bias.len() != self.cols {
            return Err(ModelError::shape("row broadcast", &[self.cols], &[bias.len()]));
        }
        let mut out = self.clone();
        for row in out.data.chunks_mut(self.cols.max(1)) {
            for (v, b) in row.iter_mut().zip(bias.iter()) {
                *v += b;
            }
        }
        Ok(out)
    }

    pub fn map<F>(&self, f: F) -> Matrix
    where
        F: Fn(f64) -> f64,
    {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|v| f(*v)).collect(),
        }
    }

    pub fn scale(&self, factor: f64) -> Matrix {
        self.map(|v| v * factor)
    }

    /// Splits columns into `pieces` equally wide, contiguous slices, left to
    /// right.
    pub fn split_columns(&self, pieces: usize) -> Result<Vec<Matrix>> {
        if pieces == 0 || self.cols % pieces != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "cannot split {} columns into {} equal pieces",
                self.cols, pieces
            )));
        }
        let width = self.cols / pieces;
        let mut out = Vec::with_capacity(pieces);
        for p in 0..pieces {
            let mut data = Vec::with_capacity(self.rows * width);
            for r in 0..self.rows {
                let start = r * self.cols + p * width;
                data.extend_from_slice(&self.data[start..start + width]);
            }
            out.push(Matrix {
                rows: self.rows,
                cols: width,
                data,
            });
        }
        Ok(out)
    }

    /// Concatenates along the column axis. All parts must have the same row count.
    pub fn hconcat(parts: &[&Matrix]) -> Result<Matrix> {
        let rows = parts.first().map(|m| m.rows).unwrap_or(0);
        let cols: usize = parts.iter().map(|m| m.cols).sum();
        for m in parts.iter() {
            if m.rows != rows {
                return Err(ModelError::shape("column concat rows", &[rows], &[m.rows]));
            }
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for m in parts.iter() {
                data.extend_from_slice(m.row(r));
            }
        }
        Ok(Matrix { rows, cols, data })
    }

    /// Copies `block` into `self` with its top-left corner at (row, col).
    pub fn set_block(&mut self, row: usize, col: usize, block: &Matrix) -> Result<()> {
        if row + block.rows > self.rows || col + block.cols > self.cols {
            return Err(ModelError::shape(
                "block placement",
                &[self.rows, self.cols],
                &[row + block.rows, col + block.cols],
            ));
        }
        for r in 0..block.rows {
            let dst = (row + r) * self.cols + col;
            self.data[dst..dst + block.cols].copy_from_slice(block.row(r));
        }
        Ok(())
    }

    pub fn block(&self, row: usize, col: usize, rows: usize, cols: usize) -> Matrix {
        let mut out = Matrix::zeros(rows, cols);
        for r in 0..rows {
            let src = (row + r) * self.cols + col;
            out.data[r * cols..(r + 1) * cols].copy_from_slice(&self.data[src..src + cols]);
        }
        out
    }

    /// Per-column mean and population (biased) variance, reducing over rows.
    pub fn column_moments(&self) -> (Vec<f64>, Vec<f64>) {
        let mut means = Vec::with_capacity(self.cols);
        let mut variances = Vec::with_capacity(self.cols);
        for c in 0..self.cols {
            let column = self.column(c);
            means.push(column.iter().mean());
            variances.push(column.iter().population_variance());
        }
        (means, variances)
    }

    /// Mean of each column, as a single-row matrix.
    pub fn mean_rows(&self) -> Matrix {
        let mut out = Matrix::zeros(1, self.cols);
        if self.rows == 0 {
            return out;
        }
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.data[c] += self.data[r * self.cols + c];
            }
        }
        let n = self.rows as f64;
        for v in out.data.iter_mut() {
            *v /= n;
        }
        out
    }

    pub fn sum_squares(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum()
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}
