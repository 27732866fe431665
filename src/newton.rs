//! Newton engine for one active-set subproblem.
//!
//! Each active-set iteration solves a square nonlinear system in the packed
//! active impulses `pi`: linear rows for unconditional, bounded, rolling, and
//! normal equations, and nonlinear rows for sliding and impending friction.
//!
//! # Formulation
//!
//! Linear rows are the restriction of the full system to the active set:
//!
//! ```text
//! err[a] = Σ_j A(m_a, active[j]) * pi[j] - rhs[a]
//! ```
//!
//! Sliding and impending friction rows couple a friction pair `(x, y)` to its
//! normal `z` through the Coulomb cone. With slip direction `d`, coefficient
//! `μ`, and remaining expansion impulse `pizE` on the normal:
//!
//! ```text
//! err_x = |d| pi_x + μ d_x (pizE + min(pi_z, 0))     (normal active)
//! err_x = |d| pi_x + μ d_x pizE                      (normal known)
//! ```
//!
//! For impending slip, `d` is recomputed from the current impulses before
//! every residual evaluation, which makes those rows nonlinear in every
//! active unknown. The Jacobian replaces `min(pi_z, 0)` with a smooth
//! surrogate so Newton's derivative stays continuous across `pi_z = 0`.
//!
//! # Solve
//!
//! The Newton step solves `Jac * dpi = err` with a rank-revealing
//! factorization: column-pivoting QR, falling back to an SVD least-squares
//! solution when the active Jacobian loses rank. A backtracking line search
//! accepts the first fraction of the step that strictly reduces the residual
//! norm, and accepts a small increase rather than stalling when the fraction
//! bottoms out.

use nalgebra::{DMatrix, DVector, Vector2};
use tracing::{debug, trace};

use crate::active_set::ActiveSet;
use crate::math::{
    d_softmin0, mult_row_times_active_col, sign3, softmin0, SIGNIFICANT, TINY,
};
use crate::solver::PlusSolverConfig;
use crate::types::{ContactCond, FrictionCond, UniContact};

/// Minimum line-search fraction; a step at least this long is always taken.
const MIN_FRAC: f64 = 0.01;

/// Backtracking reduction factor for the line search.
const SEARCH_REDUCE_FAC: f64 = 0.5;

/// Scratch state for the Newton subproblem, sized to the active set.
#[derive(Debug, Clone)]
pub(crate) struct NewtonWorkspace {
    /// Active-restricted Jacobian (linear rows copied from `A`, friction
    /// rows rewritten each Newton step).
    pub(crate) jac: DMatrix<f64>,
    /// Active-restricted right-hand side `verr_left - verr_expand`.
    pub(crate) rhs: DVector<f64>,
    /// Current packed impulse iterate.
    pub(crate) pi: DVector<f64>,
    /// Current packed residual.
    pub(crate) err: DVector<f64>,
}

impl NewtonWorkspace {
    pub(crate) fn new() -> Self {
        Self {
            jac: DMatrix::zeros(0, 0),
            rhs: DVector::zeros(0),
            pi: DVector::zeros(0),
            err: DVector::zeros(0),
        }
    }

    /// Size the workspace to the active set, copy in the linear Jacobian and
    /// right-hand side, and seed the impulse iterate.
    ///
    /// The iterate starts from `pi_guess` (the projected result of the
    /// previous active-set iteration). Each active contact normal is then
    /// re-seeded with a small impulse of the sign of its right-hand side,
    /// which puts the `min(pi_z, 0)` branch in the Jacobian on the correct
    /// side for the first step.
    pub(crate) fn initialize(
        &mut self,
        a: &DMatrix<f64>,
        active: &ActiveSet,
        verr_left: &DVector<f64>,
        verr_expand: &DVector<f64>,
        pi_guess: &DVector<f64>,
        contacts: &[UniContact],
    ) {
        let na = active.len();
        self.jac.resize_mut(na, na, 0.0);
        self.rhs.resize_vertically_mut(na, 0.0);
        self.pi.resize_vertically_mut(na, 0.0);
        self.err.resize_vertically_mut(na, 0.0);

        for (aj, &mj) in active.list().iter().enumerate() {
            for (ai, &mi) in active.list().iter().enumerate() {
                self.jac[(ai, aj)] = a[(mi, mj)];
            }
            self.rhs[aj] = verr_left[mj] - verr_expand[mj];
            self.pi[aj] = pi_guess[mj];
        }

        for rt in contacts {
            if rt.contact_cond != ContactCond::Active {
                continue;
            }
            let Some(ax) = active.position(rt.normal) else {
                continue;
            };
            self.pi[ax] = 0.01 * sign3(self.rhs[ax]);
            trace!(
                normal = rt.normal,
                rhs = self.rhs[ax],
                seed = self.pi[ax],
                "seeded active contact normal"
            );
        }
    }

    /// Evaluate the residual at the current iterate.
    ///
    /// For impending-slip contacts the slip direction is first recomputed
    /// from the current impulses, and the contact's `slip_vel`/`slip_mag`
    /// are updated so the subsequent Jacobian rewrite sees the same
    /// direction.
    pub(crate) fn eval_residual(
        &mut self,
        a: &DMatrix<f64>,
        active: &ActiveSet,
        contacts: &mut [UniContact],
        pi_e_left: &DVector<f64>,
        verr_expand: &DVector<f64>,
    ) {
        let na = active.len();
        debug_assert_eq!(self.pi.len(), na);
        self.err.resize_vertically_mut(na, 0.0);

        // Initialize as though all rows were linear.
        for (ai, &mi) in active.list().iter().enumerate() {
            self.err[ai] =
                mult_row_times_active_col(a, mi, active.list(), &self.pi) - self.rhs[ai];
        }

        // Replace the error equations for sliding and impending slip.
        for (k, rt) in contacts.iter_mut().enumerate() {
            if rt.contact_cond == ContactCond::Off || !rt.has_friction() {
                continue;
            }
            if !matches!(
                rt.friction_cond,
                FrictionCond::Sliding | FrictionCond::Impending
            ) {
                continue;
            }
            assert_eq!(rt.friction.len(), 2, "friction must be planar");
            let (mx, my, mz) = (rt.friction[0], rt.friction[1], rt.normal);

            if rt.friction_cond == FrictionCond::Impending {
                let d = Vector2::new(
                    mult_row_times_active_col(a, mx, active.list(), &self.pi) + verr_expand[mx],
                    mult_row_times_active_col(a, my, active.list(), &self.pi) + verr_expand[my],
                );
                rt.slip_vel = d;
                rt.slip_mag = d.norm();
                trace!(contact = k, dx = d.x, dy = d.y, "updated impending slip direction");
            }

            let mu = rt.mu;
            let (Some(ax), Some(ay)) = (active.position(mx), active.position(my)) else {
                debug_assert!(false, "friction rows of an enforced contact must be active");
                continue;
            };
            let (pix, piy) = (self.pi[ax], self.pi[ay]);
            let piz_e = pi_e_left[mz];

            self.err[ax] = rt.slip_mag * pix + mu * rt.slip_vel.x * piz_e;
            self.err[ay] = rt.slip_mag * piy + mu * rt.slip_vel.y * piz_e;
            if rt.contact_cond == ContactCond::Active {
                let Some(az) = active.position(mz) else {
                    debug_assert!(false, "active contact normal must be active");
                    continue;
                };
                // The residual keeps the hard complementarity branch; only
                // the Jacobian is smoothed.
                let minz = self.pi[az].min(0.0);
                self.err[ax] += mu * rt.slip_vel.x * minz;
                self.err[ay] += mu * rt.slip_vel.y * minz;
            }
        }
    }

    /// Rewrite the Jacobian rows of sliding and impending friction pairs.
    ///
    /// Linear rows were filled once at [`initialize`](Self::initialize) and
    /// cannot change during the iteration; only these rows are nonlinear.
    pub(crate) fn update_sliding_jacobian(
        &mut self,
        a: &DMatrix<f64>,
        active: &ActiveSet,
        contacts: &[UniContact],
        pi_e_left: &DVector<f64>,
        min_smoothness: f64,
    ) {
        let na = active.len();
        for rt in contacts {
            if !matches!(rt.contact_cond, ContactCond::Active | ContactCond::Known)
                || !rt.has_friction()
            {
                continue;
            }
            if !matches!(
                rt.friction_cond,
                FrictionCond::Sliding | FrictionCond::Impending
            ) {
                continue;
            }
            assert_eq!(rt.friction.len(), 2, "friction must be planar");
            let (mx, my) = (rt.friction[0], rt.friction[1]);
            let (Some(ax), Some(ay)) = (active.position(mx), active.position(my)) else {
                debug_assert!(false, "friction rows of an enforced contact must be active");
                continue;
            };

            let mu = rt.mu;
            let (pix, piy) = (self.pi[ax], self.pi[ay]);
            let d = rt.slip_vel;
            let dnorm = rt.slip_mag;
            let dhat = if dnorm > TINY { d / dnorm } else { Vector2::zeros() };

            for j in 0..na {
                self.jac[(ax, j)] = 0.0;
                self.jac[(ay, j)] = 0.0;
            }

            if rt.friction_cond == FrictionCond::Impending {
                let mz = rt.normal;
                let piz_e = pi_e_left[mz];

                if rt.contact_cond == ContactCond::Active {
                    let Some(az) = active.position(mz) else {
                        debug_assert!(false, "active contact normal must be active");
                        continue;
                    };
                    let piz = self.pi[az];
                    let minz = softmin0(piz, min_smoothness);
                    let dminz = d_softmin0(piz, min_smoothness);
                    // err_x = |d| pi_x + μ d_x (pizE + softmin0(pi_z)), with
                    // d a function of every active impulse:
                    //   ∂err_x/∂pi_i = (d̂·[A_xi, A_yi]) pi_x + μ A_xi (pizE + softmin0(pi_z))
                    // plus |d| on the diagonal and the softmin derivative on
                    // the normal column.
                    for (ai, &mi) in active.list().iter().enumerate() {
                        let (axi, ayi) = (a[(mx, mi)], a[(my, mi)]);
                        let s = dhat.x * axi + dhat.y * ayi;
                        self.jac[(ax, ai)] = s * pix + mu * axi * (piz_e + minz);
                        self.jac[(ay, ai)] = s * piy + mu * ayi * (piz_e + minz);
                    }
                    self.jac[(ax, ax)] += dnorm;
                    self.jac[(ay, ay)] += dnorm;
                    self.jac[(ax, az)] += mu * d.x * dminz;
                    self.jac[(ay, az)] += mu * d.y * dminz;
                } else {
                    // Normal is a known expander: no normal column, the
                    // expansion term is constant.
                    for (ai, &mi) in active.list().iter().enumerate() {
                        let (axi, ayi) = (a[(mx, mi)], a[(my, mi)]);
                        let s = dhat.x * axi + dhat.y * ayi;
                        self.jac[(ax, ai)] = s * pix + mu * axi * piz_e;
                        self.jac[(ay, ai)] = s * piy + mu * ayi * piz_e;
                    }
                    self.jac[(ax, ax)] += dnorm;
                    self.jac[(ay, ay)] += dnorm;
                }
            } else {
                // Sliding: the direction is frozen for the interval, so the
                // rows are diagonal apart from the normal coupling.
                self.jac[(ax, ax)] = dnorm;
                self.jac[(ay, ay)] = dnorm;
                if rt.contact_cond == ContactCond::Active {
                    let Some(az) = active.position(rt.normal) else {
                        debug_assert!(false, "active contact normal must be active");
                        continue;
                    };
                    let dminz = d_softmin0(self.pi[az], min_smoothness);
                    self.jac[(ax, az)] = mu * d.x * dminz;
                    self.jac[(ay, az)] = mu * d.y * dminz;
                }
            }
        }
    }

    /// Solve `Jac * dpi = err` with a rank-revealing least-squares step.
    fn solve_step(&self) -> DVector<f64> {
        self.jac.clone().col_piv_qr().solve(&self.err).unwrap_or_else(|| {
            // Rank-deficient active set: fall back to the SVD pseudo-inverse
            // least-squares solution.
            self.jac
                .clone()
                .svd(true, true)
                .solve(&self.err, SIGNIFICANT)
                .unwrap_or_else(|_| DVector::zeros(self.err.len()))
        })
    }

    /// Run the Newton iteration with backtracking line search.
    ///
    /// Returns the iteration count and the final residual norm. The residual
    /// in `self.err` must already be evaluated at the current iterate.
    /// Non-convergence is not an error; the caller proceeds with whatever
    /// residual was reached.
    pub(crate) fn run(
        &mut self,
        a: &DMatrix<f64>,
        active: &ActiveSet,
        contacts: &mut [UniContact],
        pi_e_left: &DVector<f64>,
        verr_expand: &DVector<f64>,
        config: &PlusSolverConfig,
    ) -> (usize, f64) {
        self.update_sliding_jacobian(a, active, contacts, pi_e_left, config.min_smoothness);
        let mut err_norm = self.err.norm();
        let mut iters = 0;
        trace!(err_norm, "newton start");

        while err_norm > config.convergence_tol {
            iters += 1;
            let dpi = self.solve_step();

            let pi_save = self.pi.clone();
            let mut frac = 1.0;
            let mut nsearch = 0;
            loop {
                nsearch += 1;
                self.pi.copy_from(&pi_save);
                self.pi.axpy(-frac, &dpi, 1.0);
                self.eval_residual(a, active, contacts, pi_e_left, verr_expand);
                let norm_now = self.err.norm();
                if norm_now < err_norm {
                    err_norm = norm_now;
                    break;
                }
                frac *= SEARCH_REDUCE_FAC;
                if frac * SEARCH_REDUCE_FAC < MIN_FRAC {
                    trace!(
                        nsearch,
                        frac,
                        norm_now,
                        "line search stuck; accepting small norm increase"
                    );
                    err_norm = norm_now;
                    break;
                }
                trace!(nsearch, frac, "residual got worse; backtracking");
            }

            if err_norm < config.convergence_tol {
                break;
            }
            if iters >= config.max_iters {
                debug!(
                    iters,
                    err_norm, "newton did not converge; continuing with current residual"
                );
                break;
            }
            self.update_sliding_jacobian(a, active, contacts, pi_e_left, config.min_smoothness);
        }
        trace!(iters, err_norm, "newton done");
        (iters, err_norm)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_matrix() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            3,
            3,
            &[2.0, 0.3, 0.1, 0.3, 1.5, 0.2, 0.1, 0.2, 1.0],
        )
    }

    fn workspace_for(
        a: &DMatrix<f64>,
        active: &ActiveSet,
        contacts: &[UniContact],
        verr_left: &DVector<f64>,
        verr_expand: &DVector<f64>,
        pi: &[f64],
    ) -> NewtonWorkspace {
        let mut ws = NewtonWorkspace::new();
        let guess = DVector::zeros(a.nrows());
        ws.initialize(a, active, verr_left, verr_expand, &guess, contacts);
        ws.pi = DVector::from_row_slice(pi);
        ws
    }

    /// Central-difference Jacobian through the residual evaluation, cloning
    /// the contact state so impending-slip direction updates don't leak
    /// between evaluations.
    fn numeric_jacobian(
        ws: &NewtonWorkspace,
        a: &DMatrix<f64>,
        active: &ActiveSet,
        contacts: &[UniContact],
        pi_e_left: &DVector<f64>,
        verr_expand: &DVector<f64>,
    ) -> DMatrix<f64> {
        let na = active.len();
        let h = 1e-6;
        let mut num = DMatrix::zeros(na, na);
        for i in 0..na {
            let mut lo = ws.clone();
            let mut lo_contacts = contacts.to_vec();
            lo.pi[i] -= h;
            lo.eval_residual(a, active, &mut lo_contacts, pi_e_left, verr_expand);

            let mut hi = ws.clone();
            let mut hi_contacts = contacts.to_vec();
            hi.pi[i] += h;
            hi.eval_residual(a, active, &mut hi_contacts, pi_e_left, verr_expand);

            for r in 0..na {
                num[(r, i)] = (hi.err[r] - lo.err[r]) / (2.0 * h);
            }
        }
        num
    }

    fn assert_jacobians_agree(
        a: &DMatrix<f64>,
        active: &ActiveSet,
        contacts: &mut [UniContact],
        ws: &mut NewtonWorkspace,
        pi_e_left: &DVector<f64>,
        verr_expand: &DVector<f64>,
    ) {
        // Evaluate once at the base point so stored slip directions match
        // the current iterate, then build the analytic Jacobian there.
        ws.eval_residual(a, active, contacts, pi_e_left, verr_expand);
        ws.update_sliding_jacobian(a, active, contacts, pi_e_left, 1e-8);
        let numeric = numeric_jacobian(ws, a, active, contacts, pi_e_left, verr_expand);
        let diff = (&ws.jac - &numeric).norm();
        assert!(
            diff < 1e-5,
            "analytic vs numeric Jacobian differ by {diff}:\n{}\n{}",
            ws.jac,
            numeric
        );
    }

    #[test]
    fn test_jacobian_linear_rows() {
        let a = test_matrix();
        let mut active = ActiveSet::new();
        active.reset(&[0, 1, 2], 3);
        let mut contacts: Vec<UniContact> = Vec::new();
        let verr_left = DVector::from_row_slice(&[1.0, 0.5, -1.0]);
        let verr_expand = DVector::zeros(3);
        let pi_e_left = DVector::zeros(3);
        let mut ws = workspace_for(&a, &active, &contacts, &verr_left, &verr_expand, &[0.2, -0.1, -0.4]);
        assert_jacobians_agree(&a, &active, &mut contacts, &mut ws, &pi_e_left, &verr_expand);
        // Linear rows are exactly the restriction of A.
        assert_relative_eq!(ws.jac[(0, 1)], a[(0, 1)], epsilon = 1e-12);
    }

    #[test]
    fn test_jacobian_sliding_active_normal() {
        let a = test_matrix();
        let mut active = ActiveSet::new();
        active.reset(&[0, 1, 2], 3);
        let mut rt = UniContact::participating(2).with_friction(0, 1, 0.7);
        rt.contact_cond = ContactCond::Active;
        rt.friction_cond = FrictionCond::Sliding;
        rt.slip_vel = Vector2::new(0.8, 0.6);
        rt.slip_mag = 1.0;
        let mut contacts = vec![rt];
        let verr_left = DVector::from_row_slice(&[1.0, 0.5, -1.0]);
        let verr_expand = DVector::zeros(3);
        let pi_e_left = DVector::zeros(3);
        let mut ws = workspace_for(&a, &active, &contacts, &verr_left, &verr_expand, &[0.2, -0.1, -0.4]);
        assert_jacobians_agree(&a, &active, &mut contacts, &mut ws, &pi_e_left, &verr_expand);
    }

    #[test]
    fn test_jacobian_impending_active_normal() {
        let a = test_matrix();
        let mut active = ActiveSet::new();
        active.reset(&[0, 1, 2], 3);
        let mut rt = UniContact::participating(2).with_friction(0, 1, 0.7);
        rt.contact_cond = ContactCond::Active;
        rt.friction_cond = FrictionCond::Impending;
        let mut contacts = vec![rt];
        let verr_left = DVector::from_row_slice(&[1.0, 0.5, -1.0]);
        let verr_expand = DVector::from_row_slice(&[0.05, -0.02, 0.1]);
        let pi_e_left = DVector::from_row_slice(&[0.0, 0.0, -0.3]);
        let mut ws = workspace_for(&a, &active, &contacts, &verr_left, &verr_expand, &[0.2, -0.1, -0.4]);
        assert_jacobians_agree(&a, &active, &mut contacts, &mut ws, &pi_e_left, &verr_expand);
    }

    #[test]
    fn test_jacobian_impending_known_normal() {
        let a = test_matrix();
        let mut active = ActiveSet::new();
        active.reset(&[0, 1], 3); // normal 2 is a known expander, not active
        let mut rt = UniContact::known(2).with_friction(0, 1, 0.7);
        rt.contact_cond = ContactCond::Known;
        rt.friction_cond = FrictionCond::Impending;
        let mut contacts = vec![rt];
        let verr_left = DVector::from_row_slice(&[1.0, 0.5, -1.0]);
        let verr_expand = DVector::from_row_slice(&[0.05, -0.02, 0.1]);
        let pi_e_left = DVector::from_row_slice(&[0.0, 0.0, -0.3]);
        let mut ws = workspace_for(&a, &active, &contacts, &verr_left, &verr_expand, &[0.2, -0.1]);
        assert_jacobians_agree(&a, &active, &mut contacts, &mut ws, &pi_e_left, &verr_expand);
    }

    #[test]
    fn test_newton_solves_linear_system() {
        // With no frictional contacts the system is linear and one Newton
        // step lands on A pi = rhs.
        let a = test_matrix();
        let mut active = ActiveSet::new();
        active.reset(&[0, 1, 2], 3);
        let mut contacts: Vec<UniContact> = Vec::new();
        let verr_left = DVector::from_row_slice(&[1.0, -2.0, 0.5]);
        let verr_expand = DVector::zeros(3);
        let pi_e_left = DVector::zeros(3);
        let guess = DVector::zeros(3);

        let mut ws = NewtonWorkspace::new();
        ws.initialize(&a, &active, &verr_left, &verr_expand, &guess, &contacts);
        ws.eval_residual(&a, &active, &mut contacts, &pi_e_left, &verr_expand);
        let config = PlusSolverConfig::default();
        let (iters, err_norm) = ws.run(&a, &active, &mut contacts, &pi_e_left, &verr_expand, &config);

        assert!(iters <= 2);
        assert!(err_norm <= config.convergence_tol);
        let residual = &a * &ws.pi - &verr_left;
        assert!(residual.norm() < 1e-8);
    }

    #[test]
    fn test_seed_biases_active_normals() {
        let a = DMatrix::identity(1, 1);
        let mut active = ActiveSet::new();
        active.reset(&[0], 1);
        let rt = {
            let mut rt = UniContact::participating(0);
            rt.contact_cond = ContactCond::Active;
            rt
        };
        let verr_left = DVector::from_row_slice(&[-1.0]);
        let verr_expand = DVector::zeros(1);
        let guess = DVector::zeros(1);
        let mut ws = NewtonWorkspace::new();
        ws.initialize(&a, &active, &verr_left, &verr_expand, &guess, &[rt]);
        assert_relative_eq!(ws.pi[0], -0.01, epsilon = 1e-12);
    }
}
