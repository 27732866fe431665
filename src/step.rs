//! Closed-form step-length routines for sliding friction.
//!
//! During a sliding interval the slip velocity of each sliding contact moves
//! along a straight segment from its start value `A` toward its full-step end
//! value `B`. Two questions decide how much of the interval can be accepted:
//!
//! 1. At what fraction does the slip pass closest to (or reach) the origin,
//!    i.e. where does friction bring the slip to a halt?
//! 2. At what fraction has the slip direction rotated by the maximum
//!    admissible angle?
//!
//! Both have closed-form answers. The second reduces to a quadratic in the
//! step fraction `s`, obtained by squaring the rotation condition
//! `cos∠(A, A + s(B − A)) = c`:
//!
//! ```text
//! ((A·A) + s(A·v))² = c² (A·A) |A + s v|²,   v = B − A
//! ```
//!
//! which rearranges to
//!
//! ```text
//! ((A·v)² − c²(A·A)(v·v)) s² + 2(A·A)(A·v)(1 − c²) s + (A·A)²(1 − c²) = 0.
//! ```
//!
//! By construction at least one root is non-negative when the full step
//! exceeds the rotation budget; the smaller non-negative root is returned.

use nalgebra::{Vector2, Vector3};

use crate::math::SIGNIFICANT;

/// Step fraction along `start → end` at which the slip velocity passes
/// closest to the origin, clamped to `[0, 1]`, plus the slip at that point.
///
/// Returns fraction 1 (with slip `end`) when `start` is already below the
/// rolling threshold or the segment is degenerately short.
#[must_use]
pub fn step_to_origin_2d(
    start: &Vector2<f64>,
    end: &Vector2<f64>,
    rolling_vel_threshold: f64,
) -> (f64, Vector2<f64>) {
    // Initial tangential velocity small means impending slip; no limit.
    if start.norm_squared() < rolling_vel_threshold * rolling_vel_threshold {
        return (1.0, *end);
    }
    let seg = end - start;
    let seg_sq = seg.norm_squared();
    if seg_sq < SIGNIFICANT {
        return (1.0, *end);
    }
    let s = (-start.dot(&seg) / seg_sq).clamp(0.0, 1.0);
    (s, start + seg * s)
}

/// 3D variant of [`step_to_origin_2d`].
#[must_use]
pub fn step_to_origin_3d(
    start: &Vector3<f64>,
    end: &Vector3<f64>,
    rolling_vel_threshold: f64,
) -> (f64, Vector3<f64>) {
    if start.norm_squared() < rolling_vel_threshold * rolling_vel_threshold {
        return (1.0, *end);
    }
    let seg = end - start;
    let seg_sq = seg.norm_squared();
    if seg_sq < SIGNIFICANT {
        return (1.0, *end);
    }
    let s = (-start.dot(&seg) / seg_sq).clamp(0.0, 1.0);
    (s, start + seg * s)
}

/// Largest step fraction keeping the slip direction within the rotation
/// budget, i.e. the smaller non-negative root of the direction-change
/// quadratic. `cos_max` is the cosine of the maximum admissible rotation.
///
/// Callers must only invoke this when the full step violates the budget
/// (`cos∠(start, end') < cos_max`), which guarantees a crossing exists.
#[must_use]
pub fn step_to_max_direction_change_2d(
    start: &Vector2<f64>,
    end: &Vector2<f64>,
    cos_max: f64,
) -> f64 {
    let seg = end - start;
    max_change_root(
        start.norm_squared(),
        start.dot(&seg),
        seg.norm_squared(),
        cos_max,
    )
}

/// 3D variant of [`step_to_max_direction_change_2d`].
#[must_use]
pub fn step_to_max_direction_change_3d(
    start: &Vector3<f64>,
    end: &Vector3<f64>,
    cos_max: f64,
) -> f64 {
    let seg = end - start;
    max_change_root(
        start.norm_squared(),
        start.dot(&seg),
        seg.norm_squared(),
        cos_max,
    )
}

/// Smaller non-negative root of the direction-change quadratic, expressed in
/// the dimension-free invariants `a_sq = A·A`, `proj = A·v`, `v_sq = v·v`.
fn max_change_root(a_sq: f64, proj: f64, v_sq: f64, cos_max: f64) -> f64 {
    let c_sq = cos_max * cos_max;
    let r = 1.0 - c_sq;
    // |A x v|^2 = (A·A)(v·v) - (A·v)^2 by Lagrange's identity; the max(0)
    // guards roundoff for nearly parallel segments.
    let cross_sq = (a_sq * v_sq - proj * proj).max(0.0);
    let quad = proj * proj - c_sq * a_sq * v_sq;
    let root = a_sq * cos_max * (r * cross_sq).sqrt();
    let lin = -a_sq * proj * r;

    let sol1 = (lin - root) / quad;
    let sol2 = (lin + root) / quad;
    debug_assert!(sol1 >= 0.0 || sol2 >= 0.0);
    if sol1 < 0.0 {
        sol2
    } else if sol2 < 0.0 {
        sol1
    } else {
        sol1.min(sol2)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const ROLL: f64 = 1e-2;

    #[test]
    fn test_step_to_origin_halts_reversal() {
        // Slip reverses through the origin: closest approach is the origin
        // itself, at the midpoint of the segment.
        let a = Vector2::new(1.0, 0.0);
        let b = Vector2::new(-1.0, 0.0);
        let (s, q) = step_to_origin_2d(&a, &b, ROLL);
        assert_relative_eq!(s, 0.5, epsilon = 1e-12);
        assert_relative_eq!(q.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_step_to_origin_clamped_to_unit_interval() {
        // Slip speeding up: closest approach is behind the start, clamps to 0.
        let a = Vector2::new(1.0, 0.0);
        let b = Vector2::new(2.0, 0.0);
        let (s, q) = step_to_origin_2d(&a, &b, ROLL);
        assert_eq!(s, 0.0);
        assert_relative_eq!(q.x, 1.0, epsilon = 1e-12);

        // Slip slowing but never reversing: closest approach is the end.
        let b = Vector2::new(0.4, 0.0);
        let (s, _) = step_to_origin_2d(&a, &b, ROLL);
        assert_eq!(s, 1.0);
        assert!((0.0..=1.0).contains(&s));
    }

    #[test]
    fn test_step_to_origin_small_start_is_full_step() {
        let a = Vector2::new(1e-3, 0.0);
        let b = Vector2::new(5.0, 5.0);
        let (s, q) = step_to_origin_2d(&a, &b, ROLL);
        assert_eq!(s, 1.0);
        assert_eq!(q, b);
    }

    #[test]
    fn test_step_to_origin_degenerate_segment() {
        let a = Vector2::new(1.0, 0.0);
        let b = Vector2::new(1.0 + 1e-9, 0.0);
        let (s, _) = step_to_origin_2d(&a, &b, ROLL);
        assert_eq!(s, 1.0);
    }

    #[test]
    fn test_max_change_known_rotation() {
        // From (1,0) toward (0,1) the endpoint A + s(B - A) = (1-s, s)
        // reaches angle θ when s/(1-s) = tan θ.
        let a = Vector2::new(1.0, 0.0);
        let b = Vector2::new(0.0, 1.0);
        let theta = 30.0_f64.to_radians();
        let s = step_to_max_direction_change_2d(&a, &b, theta.cos());
        let expected = theta.tan() / (1.0 + theta.tan());
        assert_relative_eq!(s, expected, epsilon = 1e-10);
    }

    #[test]
    fn test_max_change_root_satisfies_rotation_condition() {
        let a = Vector2::new(2.0, 0.5);
        let b = Vector2::new(-1.0, 1.5);
        let cos_max = 20.0_f64.to_radians().cos();
        let s = step_to_max_direction_change_2d(&a, &b, cos_max);
        assert!(s >= 0.0);
        let at_s = a + (b - a) * s;
        let cos_there = a.dot(&at_s) / (a.norm() * at_s.norm());
        assert_relative_eq!(cos_there, cos_max, epsilon = 1e-9);
    }

    #[test]
    fn test_max_change_3d_matches_planar_embedding() {
        let a2 = Vector2::new(1.0, 0.2);
        let b2 = Vector2::new(-0.5, 0.9);
        let a3 = Vector3::new(a2.x, a2.y, 0.0);
        let b3 = Vector3::new(b2.x, b2.y, 0.0);
        let cos_max = 30.0_f64.to_radians().cos();
        let s2 = step_to_max_direction_change_2d(&a2, &b2, cos_max);
        let s3 = step_to_max_direction_change_3d(&a3, &b3, cos_max);
        assert_relative_eq!(s2, s3, epsilon = 1e-12);
    }

    #[test]
    fn test_step_to_origin_3d() {
        let a = Vector3::new(1.0, 1.0, 1.0);
        let b = Vector3::new(-1.0, -1.0, -1.0);
        let (s, q) = step_to_origin_3d(&a, &b, ROLL);
        assert_relative_eq!(s, 0.5, epsilon = 1e-12);
        assert_relative_eq!(q.norm(), 0.0, epsilon = 1e-12);
    }
}
