//! Packed and sparse vector arithmetic plus the smooth complementarity
//! surrogate used by the Newton Jacobian.
//!
//! The active-set machinery works with two vector layouts: *full* vectors of
//! length `m` indexed by multiplier, and *packed* vectors holding only the
//! currently-active entries. The helpers here multiply rows of the full
//! matrix against packed or sparse columns and scatter packed results back
//! into full vectors, so the solver never forms reduced matrices except for
//! the Newton Jacobian itself.

use nalgebra::{DMatrix, DVector};

/// Threshold below which a constraint violation or segment length is treated
/// as zero.
pub(crate) const SIGNIFICANT: f64 = 1e-14;

/// Threshold below which a slip magnitude cannot be safely normalized.
pub(crate) const TINY: f64 = 1e-20;

/// Multiply the active entries of row `row` of the full matrix `a` by a
/// packed column containing only active entries: `Σ_ax a(row, active[ax]) *
/// col_active[ax]`.
pub(crate) fn mult_row_times_active_col(
    a: &DMatrix<f64>,
    row: usize,
    active: &[usize],
    col_active: &DVector<f64>,
) -> f64 {
    let mut result = 0.0;
    for (ax, &mx) in active.iter().enumerate() {
        result += a[(row, mx)] * col_active[ax];
    }
    result
}

/// Multiply row `row` of the full matrix `a` by a sparse full-length column
/// whose only non-zero entries are those listed in `non_zero`.
pub(crate) fn mult_row_times_sparse_col(
    a: &DMatrix<f64>,
    row: usize,
    non_zero: &[usize],
    sparse_col: &DVector<f64>,
) -> f64 {
    let mut result = 0.0;
    for &mx in non_zero {
        result += a[(row, mx)] * sparse_col[mx];
    }
    result
}

/// Unpack a packed active column and add its values into a full column.
pub(crate) fn add_in_active_col(
    active: &[usize],
    col_active: &DVector<f64>,
    col_full: &mut DVector<f64>,
) {
    for (ax, &mx) in active.iter().enumerate() {
        col_full[mx] += col_active[ax];
    }
}

/// Smooth, concave approximation to `min(z, 0)`; smaller `eps` is sharper.
pub(crate) fn softmin0(z: f64, eps: f64) -> f64 {
    debug_assert!(eps > 0.0);
    (z - (z * z + eps).sqrt()) / 2.0
}

/// Partial derivative of [`softmin0`] with respect to `z`.
pub(crate) fn d_softmin0(z: f64, eps: f64) -> f64 {
    debug_assert!(eps > 0.0);
    (1.0 - z / (z * z + eps).sqrt()) / 2.0
}

/// Three-valued sign: -1, 0, or +1.
pub(crate) fn sign3(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mult_row_times_active_col() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        // Active multipliers 2 and 0, in that packed order.
        let active = [2, 0];
        let col = DVector::from_vec(vec![10.0, 100.0]);
        // Row 1: a(1,2)*10 + a(1,0)*100 = 60 + 400
        assert_relative_eq!(
            mult_row_times_active_col(&a, 1, &active, &col),
            460.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_mult_row_times_sparse_col() {
        let a = DMatrix::from_row_slice(2, 4, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let sparse = DVector::from_vec(vec![0.0, -1.0, 0.0, 2.0]);
        // Row 0, non-zeros at 1 and 3: 2*(-1) + 4*2
        assert_relative_eq!(
            mult_row_times_sparse_col(&a, 0, &[1, 3], &sparse),
            6.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_add_in_active_col() {
        let mut full = DVector::from_vec(vec![1.0, 1.0, 1.0, 1.0]);
        let packed = DVector::from_vec(vec![5.0, -2.0]);
        add_in_active_col(&[3, 1], &packed, &mut full);
        assert_eq!(full, DVector::from_vec(vec![1.0, -1.0, 1.0, 6.0]));
    }

    #[test]
    fn test_softmin0_limits() {
        let eps = 1e-8;
        // Far from the kink the surrogate matches min(z, 0) closely.
        assert_relative_eq!(softmin0(2.0, eps), 0.0, epsilon = 1e-8);
        assert_relative_eq!(softmin0(-2.0, eps), -2.0, epsilon = 1e-8);
        // At the kink it splits the difference.
        assert!(softmin0(0.0, eps) < 0.0);
        assert_relative_eq!(d_softmin0(0.0, eps), 0.5, epsilon = 1e-12);
        // Derivative approaches the 0/1 branches away from the kink.
        assert_relative_eq!(d_softmin0(1.0, eps), 0.0, epsilon = 1e-8);
        assert_relative_eq!(d_softmin0(-1.0, eps), 1.0, epsilon = 1e-8);
    }

    #[test]
    fn test_softmin0_derivative_matches_central_difference() {
        let eps = 1e-4;
        let h = 1e-6;
        for &z in &[-0.5, -1e-3, 0.0, 1e-3, 0.5] {
            let numeric = (softmin0(z + h, eps) - softmin0(z - h, eps)) / (2.0 * h);
            assert_relative_eq!(d_softmin0(z, eps), numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_sign3() {
        assert_eq!(sign3(3.5), 1.0);
        assert_eq!(sign3(-0.1), -1.0);
        assert_eq!(sign3(0.0), 0.0);
    }
}
