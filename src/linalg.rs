/*
 * Thin singular value decomposition.
 *
 * One-sided Jacobi (Hestenes): rotate pairs of columns until they are all
 * mutually orthogonal. The rotated columns are U·Σ, and the accumulated
 * rotations are V. Only used to build orthogonal initial weights, so the
 * matrices are small and a few sweeps are enough.
 */

use crate::matrix::Matrix;

const MAX_SWEEPS: usize = 64;
const NULL_COLUMN: f64 = 1e-12;

/// `a = u · diag(singular_values) · vt` with `u` m×k, `vt` k×n, k = min(m, n).
#[derive(Clone, Debug)]
pub struct ThinSvd {
    pub u: Matrix,
    pub singular_values: Vec<f64>,
    pub vt: Matrix,
}

pub fn thin_svd(a: &Matrix) -> ThinSvd {
    if a.rows() >= a.cols() {
        jacobi_tall(a)
    } else {
        // a^T = V Σ U^T
        let t = jacobi_tall(&a.transpose());
        ThinSvd {
            u: t.vt.transpose(),
            singular_values: t.singular_values,
            vt: t.u.transpose(),
        }
    }
}

fn jacobi_tall(a: &Matrix) -> ThinSvd {
    let m = a.rows();
    let n = a.cols();
    let mut u = a.clone();
    let mut v = Matrix::identity(n);
    let tolerance = f64::EPSILON * (m.max(1) as f64);

    for _sweep in 0..MAX_SWEEPS {
        let mut rotated = false;
        for p in 0..n {
            for q in p + 1..n {
                let mut alpha = 0.0;
                let mut beta = 0.0;
                let mut gamma = 0.0;
                for i in 0..m {
                    let up = u.get(i, p);
                    let uq = u.get(i, q);
                    alpha += up * up;
                    beta += uq * uq;
                    gamma += up * uq;
                }
                if gamma.abs() <= tolerance * (alpha * beta).sqrt() || gamma == 0.0 {
                    continue;
                }
                rotated = true;

                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;
                rotate_columns(&mut u, p, q, c, s);
                rotate_columns(&mut v, p, q, c, s);
            }
        }
        if !rotated {
            break;
        }
    }

    let mut singular_values = Vec::with_capacity(n);
    for col in 0..n {
        let norm = (0..m).map(|i| u.get(i, col).powi(2)).sum::<f64>().sqrt();
        singular_values.push(norm);
        if norm > NULL_COLUMN {
            for i in 0..m {
                u.set(i, col, u.get(i, col) / norm);
            }
        }
    }

    // Descending singular values, permuting U and V columns alongside.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&x, &y| {
        singular_values[y]
            .partial_cmp(&singular_values[x])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut sorted_u = Matrix::zeros(m, n);
    let mut sorted_v = Matrix::zeros(n, n);
    let mut sorted_s = Vec::with_capacity(n);
    for (new_col, &old_col) in order.iter().enumerate() {
        sorted_s.push(singular_values[old_col]);
        for i in 0..m {
            sorted_u.set(i, new_col, u.get(i, old_col));
        }
        for i in 0..n {
            sorted_v.set(i, new_col, v.get(i, old_col));
        }
    }

    for col in 0..n {
        if sorted_s[col] <= NULL_COLUMN {
            complete_column(&mut sorted_u, col);
        }
    }

    ThinSvd {
        u: sorted_u,
        singular_values: sorted_s,
        vt: sorted_v.transpose(),
    }
}

#[inline]
fn rotate_columns(m: &mut Matrix, p: usize, q: usize, c: f64, s: f64) {
    for i in 0..m.rows() {
        let xp = m.get(i, p);
        let xq = m.get(i, q);
        m.set(i, p, c * xp - s * xq);
        m.set(i, q, s * xp + c * xq);
    }
}

// Rank-deficient input leaves a null column in U. Replace it with the first
// unit vector that survives Gram-Schmidt against the other columns.
fn complete_column(u: &mut Matrix, col: usize) {
    let m = u.rows();
    for basis in 0..m {
        let mut candidate = vec![0.0; m];
        candidate[basis] = 1.0;
        for other in 0..u.cols() {
            if other == col {
                continue;
            }
            let dot: f64 = (0..m).map(|i| candidate[i] * u.get(i, other)).sum();
            for i in 0..m {
                candidate[i] -= dot * u.get(i, other);
            }
        }
        let norm = candidate.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 1e-6 {
            for i in 0..m {
                u.set(i, col, candidate[i] / norm);
            }
            return;
        }
    }
}

/// Largest absolute deviation of the Gram matrix from identity, over rows
/// (`rows == true`) or columns.
pub fn orthonormality_error(m: &Matrix, rows: bool) -> f64 {
    let gram = if rows {
        m.matmul(&m.transpose())
    } else {
        m.transpose().matmul(m)
    };
    let gram = match gram {
        Ok(g) => g,
        Err(_) => return f64::INFINITY,
    };
    let mut worst: f64 = 0.0;
    for r in 0..gram.rows() {
        for c in 0..gram.cols() {
            let target = if r == c { 1.0 } else { 0.0 };
            worst = worst.max((gram.get(r, c) - target).abs());
        }
    }
    worst
}
