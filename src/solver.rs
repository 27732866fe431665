//! Successive-pruning impulse solver.
//!
//! This module provides the solver entry point and the two loops wrapped
//! around the Newton engine:
//!
//! 1. **Sliding intervals**: slip directions of sliding contacts are held
//!    constant during an interval. After each interval solve, the accepted
//!    fraction is limited so no sliding contact rotates its slip direction
//!    past the configured budget (or it is allowed to run exactly to a
//!    halt). Accepting a fraction below 1 restarts the next interval from
//!    the full participating set, because earlier pruning decisions are
//!    invalidated once slip directions change.
//! 2. **Active set**: within an interval, the Newton solution is projected
//!    back into the admissible region, the worst violation per category is
//!    measured, and exactly one constraint is pruned (a separating normal
//!    released, a rolling contact forced to impending slip, or a saturated
//!    bounded row released) before re-solving. The loop ends when every
//!    projected violation is insignificant.
//!
//! # Degradation
//!
//! Algorithmic difficulty never raises an error. Newton non-convergence and
//! stuck line searches are accepted and iteration continues; the returned
//! flag reports whether the interval loop ran to completion. Size and
//! symmetry invariants on the inputs are programming errors and are
//! enforced with assertions.

use nalgebra::{DMatrix, DVector, Vector2};
use tracing::{debug, trace, warn};

use crate::active_set::ActiveSet;
use crate::math::{
    add_in_active_col, mult_row_times_active_col, mult_row_times_sparse_col, SIGNIFICANT,
};
use crate::newton::NewtonWorkspace;
use crate::step::{step_to_max_direction_change_2d, step_to_origin_2d};
use crate::types::{ConstraintRts, ContactCond, ContactType, FrictionCond, Phase, UniContact};
use crate::ImpulseError;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for the successive-pruning impulse solver.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PlusSolverConfig {
    /// Newton stops when the residual norm falls to this tolerance.
    pub convergence_tol: f64,

    /// Hard cap on Newton iterations per active-set subproblem.
    pub max_iters: usize,

    /// Smoothing width of the `min(pi_z, 0)` surrogate in the Jacobian.
    pub min_smoothness: f64,

    /// Tangential speed at or below which a contact is treated as rolling.
    pub max_rolling_tang_vel: f64,

    /// Cosine of the maximum slip-direction rotation per sliding interval.
    pub cos_max_sliding_dir_change: f64,

    /// Defensive cap on the number of sliding intervals per solve.
    pub max_intervals: usize,
}

impl Default for PlusSolverConfig {
    fn default() -> Self {
        Self {
            convergence_tol: 1e-9,
            max_iters: 100,
            min_smoothness: 1e-8,
            max_rolling_tang_vel: 1e-2,
            cos_max_sliding_dir_change: 30.0_f64.to_radians().cos(),
            max_intervals: 50,
        }
    }
}

impl PlusSolverConfig {
    /// High-accuracy configuration for offline analysis.
    #[must_use]
    pub fn high_accuracy() -> Self {
        Self {
            convergence_tol: 1e-12,
            max_iters: 200,
            min_smoothness: 1e-10,
            max_rolling_tang_vel: 1e-3,
            cos_max_sliding_dir_change: 15.0_f64.to_radians().cos(),
            max_intervals: 200,
        }
    }

    /// Fast configuration for real-time stepping.
    #[must_use]
    pub fn realtime() -> Self {
        Self {
            convergence_tol: 1e-6,
            max_iters: 20,
            min_smoothness: 1e-8,
            max_rolling_tang_vel: 2e-2,
            cos_max_sliding_dir_change: 45.0_f64.to_radians().cos(),
            max_intervals: 8,
        }
    }

    /// Set the Newton convergence tolerance.
    #[must_use]
    pub const fn with_convergence_tol(mut self, tol: f64) -> Self {
        self.convergence_tol = tol;
        self
    }

    /// Set the Newton iteration cap.
    #[must_use]
    pub const fn with_max_iters(mut self, iters: usize) -> Self {
        self.max_iters = iters;
        self
    }

    /// Set the rolling/sliding transition speed.
    #[must_use]
    pub const fn with_max_rolling_tang_vel(mut self, vel: f64) -> Self {
        self.max_rolling_tang_vel = vel;
        self
    }

    /// Set the cosine of the maximum slip rotation per interval.
    #[must_use]
    pub const fn with_cos_max_sliding_dir_change(mut self, cos: f64) -> Self {
        self.cos_max_sliding_dir_change = cos;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ImpulseError::InvalidConfig`] naming the offending option.
    pub fn validate(&self) -> Result<(), ImpulseError> {
        if !(self.convergence_tol > 0.0 && self.convergence_tol.is_finite()) {
            return Err(ImpulseError::invalid_config(
                "convergence_tol must be positive and finite",
            ));
        }
        if self.max_iters == 0 {
            return Err(ImpulseError::invalid_config("max_iters must be at least 1"));
        }
        if !(self.min_smoothness > 0.0) {
            return Err(ImpulseError::invalid_config(
                "min_smoothness must be positive",
            ));
        }
        if !(self.max_rolling_tang_vel > 0.0) {
            return Err(ImpulseError::invalid_config(
                "max_rolling_tang_vel must be positive",
            ));
        }
        if !(-1.0..=1.0).contains(&self.cos_max_sliding_dir_change) {
            return Err(ImpulseError::invalid_config(
                "cos_max_sliding_dir_change must be a cosine in [-1, 1]",
            ));
        }
        if self.max_intervals == 0 {
            return Err(ImpulseError::invalid_config(
                "max_intervals must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Statistics from the most recent solve.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolveStats {
    /// Sliding intervals taken.
    pub intervals: usize,
    /// Total active-set iterations across all intervals.
    pub active_set_iters: usize,
    /// Total Newton iterations across all subproblems.
    pub newton_iters: usize,
    /// Residual norm of the last Newton subproblem.
    pub final_residual: f64,
    /// Whether the interval loop ran to completion.
    pub converged: bool,
}

/// Worst projected violation per constraint category, from one active-set
/// iteration. Payloads identify the offender: a record index for contacts,
/// a multiplier index for bounded rows.
#[derive(Debug, Clone, Copy, Default)]
struct Violations {
    worst_bounded_mult: usize,
    worst_bounded: f64,
    worst_normal_contact: usize,
    worst_normal: f64,
    worst_friction_contact: usize,
    worst_friction: f64,
}

impl Violations {
    fn all_within(&self, tol: f64) -> bool {
        self.worst_bounded <= tol && self.worst_normal <= tol && self.worst_friction <= tol
    }
}

/// The successive-pruning (PLUS) impulse solver.
///
/// The solver is a reusable object carrying its scratch buffers; they are
/// resized in place per call so repeated solves do not allocate in the
/// inner loops. It is cheap to create but not thread-safe: concurrent
/// callers must use independent instances.
#[derive(Debug, Clone)]
pub struct PlusSolver {
    /// Solver configuration, read-only during a solve.
    config: PlusSolverConfig,

    /// Per-phase solve invocation counters.
    n_solves: [u64; Phase::COUNT],

    /// Statistics from the last solve.
    last_stats: SolveStats,

    // Scratch, sized per call.
    active: ActiveSet,
    newton: NewtonWorkspace,
    verr_left: DVector<f64>,
    verr_expand: DVector<f64>,
    pi_guess: DVector<f64>,
    pi_total: DVector<f64>,
}

impl PlusSolver {
    /// Create a solver with the given configuration.
    #[must_use]
    pub fn new(config: PlusSolverConfig) -> Self {
        Self {
            config,
            n_solves: [0; Phase::COUNT],
            last_stats: SolveStats::default(),
            active: ActiveSet::new(),
            newton: NewtonWorkspace::new(),
            verr_left: DVector::zeros(0),
            verr_expand: DVector::zeros(0),
            pi_guess: DVector::zeros(0),
            pi_total: DVector::zeros(0),
        }
    }

    /// Create a solver with the default configuration.
    #[must_use]
    pub fn default_solver() -> Self {
        Self::new(PlusSolverConfig::default())
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &PlusSolverConfig {
        &self.config
    }

    /// Replace the configuration. Must not be called during a solve (the
    /// borrow rules enforce this).
    pub fn set_config(&mut self, config: PlusSolverConfig) {
        self.config = config;
    }

    /// Statistics from the most recent solve.
    #[must_use]
    pub fn last_stats(&self) -> &SolveStats {
        &self.last_stats
    }

    /// Number of solves performed in the given phase.
    #[must_use]
    pub fn solve_count(&self, phase: Phase) -> u64 {
        self.n_solves[phase.index()]
    }

    /// Reset the per-phase solve counters.
    pub fn reset_solve_counts(&mut self) {
        self.n_solves = [0; Phase::COUNT];
    }

    /// Resolve the impulse problem for one instant.
    ///
    /// On entry `verr` holds the constraint velocity error and `pi_expand`
    /// the known expansion (restitution) impulse. On return `pi` holds the
    /// unknown impulse (zero outside the participating set), `verr` the
    /// remaining velocity error after both impulses, and `pi_expand` the
    /// unapplied remainder of the expansion impulse (zero when the solve
    /// ran to completion).
    ///
    /// Returns whether the sliding-interval loop ran to completion. Partial
    /// progress is written to the outputs either way.
    ///
    /// # Panics
    ///
    /// Panics if the input dimensions are inconsistent, or if an internal
    /// consistency check fails (a contact classified sliding at rolling
    /// speed).
    #[allow(clippy::too_many_arguments)]
    pub fn solve(
        &mut self,
        phase: Phase,
        participating: &[usize],
        a: &DMatrix<f64>,
        d: Option<&DVector<f64>>,
        expanding: &[usize],
        pi_expand: &mut DVector<f64>,
        verr: &mut DVector<f64>,
        pi: &mut DVector<f64>,
        rts: &mut ConstraintRts,
    ) -> bool {
        self.n_solves[phase.index()] += 1;
        self.last_stats = SolveStats::default();

        let m = a.nrows();
        assert_eq!(a.ncols(), m, "A must be square");
        assert_eq!(verr.len(), m, "verr must have length m");
        assert_eq!(pi_expand.len(), m, "pi_expand must have length m");
        if let Some(d) = d {
            assert_eq!(d.len(), m, "D must have length m");
        }
        let p = participating.len();
        assert!(p <= m, "more participating rows than multipliers");
        assert!(expanding.len() <= m, "more expanding rows than multipliers");
        debug_assert_eq!(
            rts.expected_participating_rows(),
            p,
            "constraint records disagree with the participating count"
        );
        #[cfg(debug_assertions)]
        for i in 0..m {
            for j in (i + 1)..m {
                debug_assert!(
                    (a[(i, j)] - a[(j, i)]).abs() <= 1e-12 * (1.0 + a[(i, j)].abs()),
                    "A must be symmetric"
                );
            }
        }

        pi.resize_vertically_mut(m, 0.0);
        pi.fill(0.0);

        if p == 0 {
            debug!(?phase, "nothing to do; converged in 0 intervals");
            self.last_stats.converged = true;
            return true;
        }

        self.verr_left.resize_vertically_mut(m, 0.0);
        self.verr_left.copy_from(verr);
        self.verr_expand.resize_vertically_mut(m, 0.0);
        self.pi_guess.resize_vertically_mut(m, 0.0);
        self.pi_total.resize_vertically_mut(m, 0.0);
        self.pi_total.fill(0.0);
        let mut pi_e_left = pi_expand.clone();

        let mut interval = 0;
        let mut frac = 0.0;
        while frac < 1.0 {
            if interval >= self.config.max_intervals {
                warn!(
                    interval,
                    "sliding interval cap reached; accepting partial solution"
                );
                break;
            }
            interval += 1;

            // Complete restart: a fractional interval invalidates earlier
            // pruning decisions because slip directions have changed.
            self.active.reset(participating, m);

            // Velocity change if the full remaining expansion impulse were
            // applied this interval.
            for mx in 0..m {
                self.verr_expand[mx] = mult_row_times_sparse_col(a, mx, expanding, &pi_e_left)
                    + d.map_or(0.0, |d| d[mx] * pi_e_left[mx]);
            }

            debug!(interval, na = self.active.len(), "sliding interval start");
            self.pi_guess.fill(0.0);
            self.classify_frictionals(&mut rts.uni_contact);

            loop {
                self.last_stats.active_set_iters += 1;
                self.active.rebuild_map(m);

                let Self {
                    active,
                    newton,
                    verr_left,
                    verr_expand,
                    pi_guess,
                    config,
                    ..
                } = self;
                newton.initialize(a, active, verr_left, verr_expand, pi_guess, &rts.uni_contact);
                newton.eval_residual(a, active, &mut rts.uni_contact, &pi_e_left, verr_expand);
                if active.is_empty() {
                    break;
                }
                let (iters, err_norm) =
                    newton.run(a, active, &mut rts.uni_contact, &pi_e_left, verr_expand, config);
                self.last_stats.newton_iters += iters;
                self.last_stats.final_residual = err_norm;

                let viol = self.project_active_impulses(rts, &pi_e_left);
                if viol.all_within(SIGNIFICANT) {
                    trace!(
                        bounded = viol.worst_bounded,
                        normal = viol.worst_normal,
                        friction = viol.worst_friction,
                        "all projected violations insignificant"
                    );
                    break;
                }
                if !self.prune_one(rts, &viol) {
                    debug!("no pruning rule applies; accepting current active set");
                    break;
                }
            }

            frac = self.interval_fraction(a, &rts.uni_contact);
            debug!(interval, frac, "sliding interval accepted");

            for &mx in expanding {
                let applied = frac * pi_e_left[mx];
                pi_e_left[mx] -= applied;
            }
            self.newton.pi *= frac;
            add_in_active_col(self.active.list(), &self.newton.pi, &mut self.pi_total);
            for mx in 0..m {
                let delta = mult_row_times_active_col(a, mx, self.active.list(), &self.newton.pi)
                    + frac * self.verr_expand[mx];
                self.verr_left[mx] -= delta;
            }
        }
        let converged = frac >= 1.0;

        pi.copy_from(&self.pi_total);
        verr.copy_from(&self.verr_left);
        pi_expand.copy_from(&pi_e_left);

        for (k, rt) in rts.uni_contact.iter().enumerate() {
            let mx = rt.normal;
            debug!(
                contact = k,
                pi = pi[mx],
                verr = verr[mx],
                product = pi[mx] * verr[mx],
                "normal complementarity at exit"
            );
        }

        self.last_stats.intervals = interval;
        self.last_stats.converged = converged;
        converged
    }

    /// Classify every frictional contact at the start of a sliding interval.
    ///
    /// Observing contacts are switched off entirely. For the rest, the slip
    /// velocity is read from the remaining velocity error and the contact is
    /// marked sliding or rolling against the transition speed. No contact is
    /// ever classified impending here; that state only arises from a
    /// rolling contact pruned during the active-set loop.
    fn classify_frictionals(&self, contacts: &mut [UniContact]) {
        for (k, rt) in contacts.iter_mut().enumerate() {
            rt.contact_cond = match rt.contact_type {
                ContactType::Participating => ContactCond::Active,
                ContactType::Known => ContactCond::Known,
                ContactType::Observing => ContactCond::Off,
            };

            if rt.contact_type == ContactType::Observing || !rt.has_friction() {
                rt.friction_cond = FrictionCond::Off;
                rt.slip_vel = Vector2::repeat(f64::NAN);
                rt.slip_mag = f64::NAN;
            } else {
                assert_eq!(rt.friction.len(), 2, "friction must be planar");
                rt.slip_vel = Vector2::new(
                    self.verr_left[rt.friction[0]],
                    self.verr_left[rt.friction[1]],
                );
                rt.slip_mag = rt.slip_vel.norm();
                rt.friction_cond = if rt.slip_mag > self.config.max_rolling_tang_vel {
                    FrictionCond::Sliding
                } else {
                    FrictionCond::Rolling
                };
            }
            trace!(
                contact = k,
                cond = ?rt.friction_cond,
                slip = rt.slip_mag,
                "classified contact"
            );
        }
    }

    /// Project the Newton solution into the admissible region, writing the
    /// in-bounds values to `pi_guess` (the next subproblem's initial guess),
    /// and record the worst violation per constraint category.
    fn project_active_impulses(
        &mut self,
        rts: &mut ConstraintRts,
        pi_e_left: &DVector<f64>,
    ) -> Violations {
        let mut viol = Violations::default();

        // Unconditional rows are always active; copy through.
        for rt in &rts.unconditional {
            for &mx in &rt.mults {
                if let Some(ax) = self.active.position(mx) {
                    self.pi_guess[mx] = self.newton.pi[ax];
                }
            }
        }

        // Bounded rows clamp to their interval.
        for rt in &rts.bounded {
            let Some(ax) = self.active.position(rt.mult) else {
                continue; // released earlier in this interval
            };
            let clamped = self.newton.pi[ax].clamp(rt.lower, rt.upper);
            self.pi_guess[rt.mult] = clamped;
            let err = (self.newton.pi[ax] - clamped).abs();
            if err > viol.worst_bounded {
                viol.worst_bounded = err;
                viol.worst_bounded_mult = rt.mult;
            }
        }

        // Contact normals admit only compressive impulses.
        for (k, rt) in rts.uni_contact.iter().enumerate() {
            let mx = rt.normal;
            if matches!(rt.contact_cond, ContactCond::Off | ContactCond::Known) {
                self.pi_guess[mx] = 0.0;
                continue;
            }
            let Some(ax) = self.active.position(mx) else {
                debug_assert!(false, "active contact normal must be active");
                continue;
            };
            let adjusted = if rt.sign * self.newton.pi[ax] < 0.0 {
                self.newton.pi[ax]
            } else {
                0.0
            };
            self.pi_guess[mx] = adjusted;
            let err = (self.newton.pi[ax] - adjusted).abs();
            if err > viol.worst_normal {
                viol.worst_normal = err;
                viol.worst_normal_contact = k;
            }
        }

        // Rolling friction must stay inside the cone of its normal impulse
        // (including any expansion impulse still to be applied). Sliding and
        // impending friction satisfy the cone by construction.
        for (k, rt) in rts.uni_contact.iter().enumerate() {
            if rt.contact_cond == ContactCond::Off || !rt.has_friction() {
                continue;
            }
            let mu = rt.mu;
            let mut scale = 1.0;
            if rt.friction_cond == FrictionCond::Rolling {
                let mut tmag_sq = 0.0;
                for &mx in &rt.friction {
                    if let Some(ax) = self.active.position(mx) {
                        tmag_sq += self.newton.pi[ax] * self.newton.pi[ax];
                    }
                }
                let tmag = tmag_sq.sqrt();
                // Separating normals are already zero in pi_guess; known
                // normals contribute only their expansion impulse.
                let nmag = (self.pi_guess[rt.normal] + pi_e_left[rt.normal]).abs();
                if tmag > mu * nmag {
                    scale = mu * nmag / tmag;
                    let err = tmag - mu * nmag;
                    if err > viol.worst_friction {
                        viol.worst_friction = err;
                        viol.worst_friction_contact = k;
                    }
                }
            }
            for &mx in &rt.friction {
                if let Some(ax) = self.active.position(mx) {
                    self.pi_guess[mx] = scale * self.newton.pi[ax];
                }
            }
        }

        viol
    }

    /// Prune exactly one constraint in response to the worst violation.
    ///
    /// Returns false when no pruning rule applies, in which case the caller
    /// accepts the current active set as-is.
    fn prune_one(&mut self, rts: &mut ConstraintRts, viol: &Violations) -> bool {
        let contacts = &mut rts.uni_contact;
        let mut fric_k =
            (viol.worst_friction > 0.0).then_some(viol.worst_friction_contact);

        if viol.worst_normal > viol.worst_friction && viol.worst_normal >= viol.worst_bounded {
            // A contact normal is the worst offender. If it has a rolling
            // friction constraint active, release that first; doing so may
            // fix the normal.
            let k = viol.worst_normal_contact;
            let rt = &mut contacts[k];
            if !rt.has_friction() || rt.friction_cond != FrictionCond::Rolling {
                rt.contact_cond = ContactCond::Off;
                if rt.has_friction() {
                    let rows = [rt.normal, rt.friction[0], rt.friction[1]];
                    self.active.release(&rows);
                } else {
                    self.active.release(&[rt.normal]);
                }
                debug!(contact = k, err = viol.worst_normal, "released contact normal");
                return true;
            }
            debug!(contact = k, "worst normal is rolling; its friction goes first");
            fric_k = Some(k);
        } else if viol.worst_bounded > viol.worst_friction {
            // A bounded row with no admissible value: release it so the
            // remaining system can settle. It contributes nothing for the
            // rest of this interval.
            self.active.release(&[viol.worst_bounded_mult]);
            debug!(
                mult = viol.worst_bounded_mult,
                err = viol.worst_bounded,
                "released bounded row"
            );
            return true;
        }

        if let Some(k) = fric_k {
            let rt = &mut contacts[k];
            if rt.friction_cond == FrictionCond::Rolling {
                rt.friction_cond = FrictionCond::Impending;
                debug!(contact = k, "rolling friction switched to impending");
                return true;
            }
        }
        false
    }

    /// Fraction of this interval acceptable without any sliding contact
    /// either over-rotating its slip direction or sliding through a halt.
    ///
    /// Only sliding contacts limit the interval; rolling and impending-slip
    /// contacts do not.
    fn interval_fraction(&self, a: &DMatrix<f64>, contacts: &[UniContact]) -> f64 {
        let mut frac = 1.0_f64;
        for (k, rt) in contacts.iter().enumerate() {
            if rt.friction_cond != FrictionCond::Sliding {
                continue;
            }
            assert_eq!(rt.friction.len(), 2, "friction must be planar");
            assert!(
                rt.slip_mag > self.config.max_rolling_tang_vel,
                "contact {k} misclassified as sliding: slip speed {} at or below rolling threshold {}",
                rt.slip_mag,
                self.config.max_rolling_tang_vel
            );
            let (mx, my) = (rt.friction[0], rt.friction[1]);
            let db = Vector2::new(
                mult_row_times_active_col(a, mx, self.active.list(), &self.newton.pi)
                    + self.verr_expand[mx],
                mult_row_times_active_col(a, my, self.active.list(), &self.newton.pi)
                    + self.verr_expand[my],
            );
            // Slip at the end of a full step.
            let bend = rt.slip_vel - db;
            let bend_mag = bend.norm();

            if bend_mag <= self.config.max_rolling_tang_vel {
                trace!(contact = k, speed = bend_mag, "friction slowed to a halt");
                continue;
            }
            let cos_theta = (rt.slip_vel.dot(&bend) / (rt.slip_mag * bend_mag)).clamp(-1.0, 1.0);
            if cos_theta >= self.config.cos_max_sliding_dir_change {
                trace!(contact = k, cos_theta, "slip rotation within budget");
                continue;
            }

            let (frac1, end_pt) =
                step_to_origin_2d(&rt.slip_vel, &bend, self.config.max_rolling_tang_vel);
            if end_pt.norm() <= self.config.max_rolling_tang_vel {
                debug!(contact = k, frac = frac1, "truncating interval at slip halt");
                frac = frac.min(frac1);
                continue;
            }
            let frac2 = step_to_max_direction_change_2d(
                &rt.slip_vel,
                &bend,
                self.config.cos_max_sliding_dir_change,
            );
            debug!(contact = k, frac = frac2, "truncating interval at max slip rotation");
            frac = frac.min(frac2);
        }
        frac
    }
}

impl Default for PlusSolver {
    fn default() -> Self {
        Self::default_solver()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::float_cmp,
    clippy::similar_names,
    clippy::too_many_lines
)]
mod tests {
    use super::*;
    use crate::types::{Bounded, Unconditional};
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    struct Problem {
        a: DMatrix<f64>,
        verr: DVector<f64>,
        pi_expand: DVector<f64>,
        pi: DVector<f64>,
        rts: ConstraintRts,
    }

    impl Problem {
        fn new(a: DMatrix<f64>, verr: &[f64]) -> Self {
            let m = a.nrows();
            Self {
                a,
                verr: DVector::from_row_slice(verr),
                pi_expand: DVector::zeros(m),
                pi: DVector::zeros(m),
                rts: ConstraintRts::new(),
            }
        }

        fn solve(&mut self, solver: &mut PlusSolver, participating: &[usize]) -> bool {
            self.solve_expanding(solver, participating, &[])
        }

        fn solve_expanding(
            &mut self,
            solver: &mut PlusSolver,
            participating: &[usize],
            expanding: &[usize],
        ) -> bool {
            solver.solve(
                Phase::Compression,
                participating,
                &self.a,
                None,
                expanding,
                &mut self.pi_expand,
                &mut self.verr,
                &mut self.pi,
                &mut self.rts,
            )
        }
    }

    #[test]
    fn test_empty_participation() {
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(DMatrix::identity(2, 2), &[3.0, -4.0]);
        let converged = problem.solve(&mut solver, &[]);

        assert!(converged);
        assert_eq!(problem.pi, DVector::zeros(2));
        assert_eq!(problem.verr, DVector::from_row_slice(&[3.0, -4.0]));
        assert!(solver.last_stats().converged);
        assert_eq!(solver.last_stats().intervals, 0);
    }

    #[test]
    fn test_single_unconditional_row() {
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(DMatrix::from_element(1, 1, 2.0), &[4.0]);
        problem.rts.unconditional.push(Unconditional::new(vec![0]));
        let converged = problem.solve(&mut solver, &[0]);

        assert!(converged);
        assert_relative_eq!(problem.pi[0], 2.0, epsilon = 1e-8);
        assert_abs_diff_eq!(problem.verr[0], 0.0, epsilon = 1e-8);
    }

    #[test]
    fn test_unconditional_block_solves_linear_system() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]);
        let verr = [1.0, -2.0, 0.7];
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(a.clone(), &verr);
        problem
            .rts
            .unconditional
            .push(Unconditional::new(vec![0, 1, 2]));
        let converged = problem.solve(&mut solver, &[0, 1, 2]);

        assert!(converged);
        let residual = &a * &problem.pi - DVector::from_row_slice(&verr);
        assert!(residual.norm() <= 1e-8);
        assert!(problem.verr.norm() <= 1e-8);
    }

    #[test]
    fn test_uni_contact_compressive() {
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(DMatrix::identity(1, 1), &[-1.0]);
        problem.rts.uni_contact.push(UniContact::participating(0));
        let converged = problem.solve(&mut solver, &[0]);

        assert!(converged);
        assert_relative_eq!(problem.pi[0], -1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(problem.verr[0], 0.0, epsilon = 1e-8);
        // Normal complementarity: compressive impulse, vanishing velocity.
        let rt = &problem.rts.uni_contact[0];
        assert!(rt.sign * problem.pi[0] <= 0.0);
        assert_eq!(rt.contact_cond, ContactCond::Active);
    }

    #[test]
    fn test_uni_contact_separating() {
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(DMatrix::identity(1, 1), &[1.0]);
        problem.rts.uni_contact.push(UniContact::participating(0));
        let converged = problem.solve(&mut solver, &[0]);

        assert!(converged);
        assert_abs_diff_eq!(problem.pi[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(problem.verr[0], 1.0, epsilon = 1e-12);
        assert_eq!(problem.rts.uni_contact[0].contact_cond, ContactCond::Off);
    }

    #[test]
    fn test_sliding_friction_cone() {
        // Unit slip along +x; the sliding friction multiplier takes the
        // value mu*|pi_N| with the sign that opposes the slip through
        // verr -= A * pi.
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(DMatrix::identity(3, 3), &[1.0, 0.0, -1.0]);
        problem
            .rts
            .uni_contact
            .push(UniContact::participating(2).with_friction(0, 1, 0.5));
        let converged = problem.solve(&mut solver, &[0, 1, 2]);

        assert!(converged);
        assert_relative_eq!(problem.pi[2], -1.0, epsilon = 1e-7);
        assert_relative_eq!(problem.pi[0], 0.5, epsilon = 1e-7);
        assert_abs_diff_eq!(problem.pi[1], 0.0, epsilon = 1e-7);
        assert_eq!(problem.rts.uni_contact[0].friction_cond, FrictionCond::Sliding);

        // Friction cone (exactly on the boundary while sliding).
        let tangential = (problem.pi[0].powi(2) + problem.pi[1].powi(2)).sqrt();
        assert!(tangential <= 0.5 * problem.pi[2].abs() + 1e-9);
        // The tangential velocity is reduced, not reversed.
        assert_relative_eq!(problem.verr[0], 0.5, epsilon = 1e-7);
        assert_abs_diff_eq!(problem.verr[2], 0.0, epsilon = 1e-7);
    }

    #[test]
    fn test_rolling_contact_stays_rolling() {
        // No tangential velocity and plenty of cone: rolling holds and the
        // friction impulse vanishes.
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(DMatrix::identity(3, 3), &[0.0, 0.0, -1.0]);
        problem
            .rts
            .uni_contact
            .push(UniContact::participating(2).with_friction(0, 1, 0.1));
        let converged = problem.solve(&mut solver, &[0, 1, 2]);

        assert!(converged);
        assert_abs_diff_eq!(problem.pi[0], 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(problem.pi[1], 0.0, epsilon = 1e-8);
        assert_relative_eq!(problem.pi[2], -1.0, epsilon = 1e-8);
        assert_eq!(problem.rts.uni_contact[0].friction_cond, FrictionCond::Rolling);
        assert!(problem.verr.norm() <= 1e-8);
    }

    #[test]
    fn test_interval_truncation_on_slip_reversal() {
        // Friction strong enough to reverse the slip in one step: the driver
        // must truncate the first interval where the slip halts, then finish
        // with a rolling interval.
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(DMatrix::identity(3, 3), &[1.0, 0.0, -1.0]);
        problem
            .rts
            .uni_contact
            .push(UniContact::participating(2).with_friction(0, 1, 2.0));
        let converged = problem.solve(&mut solver, &[0, 1, 2]);

        assert!(converged);
        assert!(solver.last_stats().intervals >= 2);
        assert_relative_eq!(problem.pi[0], 1.0, epsilon = 1e-7);
        assert_abs_diff_eq!(problem.pi[1], 0.0, epsilon = 1e-7);
        assert_relative_eq!(problem.pi[2], -1.0, epsilon = 1e-7);
        assert!(problem.verr.norm() <= 1e-7);
        // The slip halted instead of reversing, so the contact ends rolling.
        assert_eq!(problem.rts.uni_contact[0].friction_cond, FrictionCond::Rolling);
    }

    #[test]
    fn test_two_contacts_truncate_and_converge() {
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(
            DMatrix::identity(6, 6),
            &[1.0, 0.0, -1.0, 0.0, 1.0, -1.0],
        );
        problem
            .rts
            .uni_contact
            .push(UniContact::participating(2).with_friction(0, 1, 2.0));
        problem
            .rts
            .uni_contact
            .push(UniContact::participating(5).with_friction(3, 4, 2.0));
        let converged = problem.solve(&mut solver, &[0, 1, 2, 3, 4, 5]);

        assert!(converged);
        assert!(solver.last_stats().intervals >= 2);
        assert!(problem.verr.norm() <= 1e-7);
        for rt in &problem.rts.uni_contact {
            let t = (problem.pi[rt.friction[0]].powi(2) + problem.pi[rt.friction[1]].powi(2)).sqrt();
            assert!(t <= rt.mu * problem.pi[rt.normal].abs() + 1e-9);
        }
    }

    #[test]
    fn test_known_contact_consumes_expansion_impulse() {
        // The normal is a known expander: its friction participates against
        // the expansion impulse, and the remaining expansion is consumed.
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(DMatrix::identity(3, 3), &[1.0, 0.0, -1.0]);
        problem.pi_expand[2] = -2.0;
        problem
            .rts
            .uni_contact
            .push(UniContact::known(2).with_friction(0, 1, 0.5));
        let converged = problem.solve_expanding(&mut solver, &[0, 1], &[2]);

        assert!(converged);
        assert_relative_eq!(problem.pi[0], 1.0, epsilon = 1e-7);
        assert_abs_diff_eq!(problem.pi[1], 0.0, epsilon = 1e-7);
        assert_abs_diff_eq!(problem.pi[2], 0.0, epsilon = 1e-12);
        // verr absorbed the expansion impulse on the normal row.
        assert_relative_eq!(problem.verr[2], 1.0, epsilon = 1e-7);
        // All of the expansion impulse was applied.
        assert_abs_diff_eq!(problem.pi_expand[2], 0.0, epsilon = 1e-12);
        // Cone against the original expansion impulse.
        assert!(problem.pi[0].abs() <= 0.5 * 2.0 + 1e-9);
    }

    #[test]
    fn test_observing_contact_untouched() {
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(DMatrix::identity(4, 4), &[-1.0, 0.5, 0.5, -0.2]);
        problem.rts.uni_contact.push(UniContact::participating(0));
        problem
            .rts
            .uni_contact
            .push(UniContact::observing(3).with_friction(1, 2, 0.5));
        let converged = problem.solve(&mut solver, &[0]);

        assert!(converged);
        assert_relative_eq!(problem.pi[0], -1.0, epsilon = 1e-8);
        for mx in 1..4 {
            assert_abs_diff_eq!(problem.pi[mx], 0.0, epsilon = 1e-12);
        }
        let rt = &problem.rts.uni_contact[1];
        assert_eq!(rt.contact_cond, ContactCond::Off);
        assert_eq!(rt.friction_cond, FrictionCond::Off);
        assert!(rt.slip_mag.is_nan());
    }

    #[test]
    fn test_bounded_row_within_bounds() {
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(DMatrix::from_element(1, 1, 2.0), &[1.0]);
        problem.rts.bounded.push(Bounded::new(0, -1.0, 1.0));
        let converged = problem.solve(&mut solver, &[0]);

        assert!(converged);
        assert_relative_eq!(problem.pi[0], 0.5, epsilon = 1e-8);
        assert!((-1.0..=1.0).contains(&problem.pi[0]));
    }

    #[test]
    fn test_bounded_row_released_when_saturated() {
        // The unconstrained impulse (3.0) exceeds the bound; the row is
        // released and contributes nothing, which is admissible.
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(DMatrix::identity(1, 1), &[3.0]);
        problem.rts.bounded.push(Bounded::new(0, -1.0, 1.0));
        let converged = problem.solve(&mut solver, &[0]);

        assert!(converged);
        assert!((-1.0..=1.0).contains(&problem.pi[0]));
        assert_relative_eq!(problem.verr[0], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_classifier_idempotent() {
        let mut solver = PlusSolver::default_solver();
        solver.verr_left = DVector::from_row_slice(&[0.3, -0.4, -1.0, 0.0, 0.001, -2.0]);

        let make = || {
            vec![
                UniContact::participating(2).with_friction(0, 1, 0.5),
                UniContact::known(5).with_friction(3, 4, 0.2),
                UniContact::observing(5),
            ]
        };
        let mut first = make();
        solver.classify_frictionals(&mut first);
        let mut second = first.clone();
        solver.classify_frictionals(&mut second);

        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.contact_cond, b.contact_cond);
            assert_eq!(a.friction_cond, b.friction_cond);
            if a.slip_mag.is_nan() {
                assert!(b.slip_mag.is_nan());
            } else {
                assert_eq!(a.slip_vel, b.slip_vel);
                assert_eq!(a.slip_mag, b.slip_mag);
            }
        }
        assert_eq!(first[0].friction_cond, FrictionCond::Sliding);
        assert_eq!(first[1].friction_cond, FrictionCond::Rolling);
        assert_eq!(first[2].friction_cond, FrictionCond::Off);
    }

    #[test]
    fn test_solve_counters_per_phase() {
        let mut solver = PlusSolver::default_solver();
        let mut problem = Problem::new(DMatrix::identity(1, 1), &[-1.0]);
        problem.rts.uni_contact.push(UniContact::participating(0));
        problem.solve(&mut solver, &[0]);

        let mut problem = Problem::new(DMatrix::identity(1, 1), &[-1.0]);
        problem.rts.uni_contact.push(UniContact::participating(0));
        problem.solve(&mut solver, &[0]);

        assert_eq!(solver.solve_count(Phase::Compression), 2);
        assert_eq!(solver.solve_count(Phase::Expansion), 0);
        solver.reset_solve_counts();
        assert_eq!(solver.solve_count(Phase::Compression), 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(PlusSolverConfig::default().validate().is_ok());
        assert!(PlusSolverConfig::high_accuracy().validate().is_ok());
        assert!(PlusSolverConfig::realtime().validate().is_ok());

        let bad = PlusSolverConfig::default().with_convergence_tol(-1.0);
        assert!(bad.validate().is_err());
        let bad = PlusSolverConfig::default().with_max_iters(0);
        assert!(bad.validate().is_err());
        let bad = PlusSolverConfig::default().with_cos_max_sliding_dir_change(1.5);
        assert!(bad.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_scratch_reuse_across_solves() {
        // Back-to-back solves of different sizes through the same solver
        // must not interfere.
        let mut solver = PlusSolver::default_solver();

        let mut big = Problem::new(DMatrix::identity(3, 3), &[1.0, 0.0, -1.0]);
        big.rts
            .uni_contact
            .push(UniContact::participating(2).with_friction(0, 1, 0.5));
        assert!(big.solve(&mut solver, &[0, 1, 2]));

        let mut small = Problem::new(DMatrix::identity(1, 1), &[-2.0]);
        small.rts.uni_contact.push(UniContact::participating(0));
        assert!(small.solve(&mut solver, &[0]));
        assert_relative_eq!(small.pi[0], -2.0, epsilon = 1e-8);
        assert_eq!(small.pi.len(), 1);
    }
}
