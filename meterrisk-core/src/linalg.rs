//! Cluster geometry on top of nalgebra
//!
//! Only what the Mahalanobis distance needs: member matrix, mean vector,
//! sample covariance and the lower Cholesky factor of the regularised
//! covariance, used to whiten difference vectors.

use nalgebra::{DMatrix, DVector};

/// Members as an `n × dim` matrix, one row per latent vector
pub fn member_matrix(rows: &[&[f64]], dim: usize) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), dim, |i, j| rows[i][j])
}

/// Column means; zeros for an empty matrix
pub fn mean_vector(members: &DMatrix<f64>) -> DVector<f64> {
    if members.nrows() == 0 {
        return DVector::zeros(members.ncols());
    }
    DVector::from_iterator(members.ncols(), members.column_iter().map(|c| c.mean()))
}

/// Unbiased sample covariance (n - 1 denominator). Requires at least two rows.
pub fn sample_covariance(members: &DMatrix<f64>, mean: &DVector<f64>) -> Option<DMatrix<f64>> {
    let n = members.nrows();
    if n < 2 {
        return None;
    }
    let centered = DMatrix::from_fn(n, members.ncols(), |i, j| members[(i, j)] - mean[j]);
    Some(centered.transpose() * &centered / (n - 1) as f64)
}

/// Lower Cholesky factor of `cov + ridge·I`; `None` if not positive definite
pub fn regularised_cholesky(cov: DMatrix<f64>, ridge: f64) -> Option<DMatrix<f64>> {
    let dim = cov.nrows();
    let regularised = cov + DMatrix::<f64>::identity(dim, dim) * ridge;
    regularised.cholesky().map(|chol| chol.unpack())
}

/// `sqrt(dᵀ Σ⁻¹ d)` via the triangular solve `L y = d`
pub fn mahalanobis(lower: &DMatrix<f64>, diff: &DVector<f64>) -> Option<f64> {
    lower.solve_lower_triangular(diff).map(|y| y.norm())
}

pub fn euclidean(a: &DVector<f64>, b: &DVector<f64>) -> f64 {
    (a - b).norm()
}
