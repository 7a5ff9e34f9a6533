//! Small dense linear-algebra helpers for the minimal solvers.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

/// Unit vector spanning the (approximate) null space of `a`.
///
/// Computed as the eigenvector of `AᵀA` with the smallest eigenvalue, which
/// also works for the square and underdetermined systems of the minimal
/// solvers where a thin SVD would drop the null direction.
pub fn null_vector(a: &DMatrix<f64>) -> Option<DVector<f64>> {
    if a.ncols() == 0 {
        return None;
    }
    let ata = a.transpose() * a;
    let eigen = ata.symmetric_eigen();
    let (idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let v = eigen.eigenvectors.column(idx).into_owned();
    let norm = v.norm();
    (norm > 0.0 && norm.is_finite()).then(|| v / norm)
}

/// 3x3 SVD with singular values sorted in descending order.
///
/// Returns `(U, σ, V)` with `M = U diag(σ) Vᵀ`.
pub fn svd3_sorted(m: &Matrix3<f64>) -> Option<(Matrix3<f64>, Vector3<f64>, Matrix3<f64>)> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v = svd.v_t?.transpose();
    let s = svd.singular_values;

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| s[b].total_cmp(&s[a]));

    let mut u_sorted = Matrix3::zeros();
    let mut v_sorted = Matrix3::zeros();
    let mut s_sorted = Vector3::zeros();
    for (dst, &src) in order.iter().enumerate() {
        u_sorted.set_column(dst, &u.column(src));
        v_sorted.set_column(dst, &v.column(src));
        s_sorted[dst] = s[src];
    }
    Some((u_sorted, s_sorted, v_sorted))
}

/// Median of a slice, `None` when empty. Reorders the input.
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    Some(values[values.len() / 2])
}
