//! Constraint runtime records shared between the solver and its caller.
//!
//! The caller assembles the constraint-space problem (the mass-matrix inverse
//! `A`, velocity error `verr`, expansion impulse) and describes each
//! constraint with one of the record types here. The solver reads the
//! descriptive fields and writes only the runtime fields (`contact_cond`,
//! `friction_cond`, slip state) during a solve.
//!
//! # Index conventions
//!
//! A *multiplier index* is a 0-based position into the full constraint-space
//! vectors and matrix of width `m`. All record types refer to constraint rows
//! by multiplier index; the packed *active index* space used internally by
//! the solver never leaks into these records.

use nalgebra::Vector2;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which pass of an impact/correction sequence a solve belongs to.
///
/// The phase has no effect on the algorithm; it selects which per-phase
/// invocation counter the solver increments (see
/// [`PlusSolver::solve_count`](crate::PlusSolver::solve_count)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Phase {
    /// Compression round of an impact.
    Compression,
    /// Expansion (Poisson restitution) round of an impact.
    Expansion,
    /// Velocity/position correction round.
    Correction,
}

impl Phase {
    /// Number of distinct phases.
    pub const COUNT: usize = 3;

    /// Dense index of this phase, for counter arrays.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Compression => 0,
            Self::Expansion => 1,
            Self::Correction => 2,
        }
    }
}

/// How a unilateral contact participates in the solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ContactType {
    /// The contact's normal impulse is an unknown of the problem.
    Participating,
    /// The contact's normal impulse is prescribed (an expansion impulse);
    /// only its friction components are unknowns.
    Known,
    /// The contact is merely monitored; none of its rows participate.
    Observing,
}

/// Runtime state of a unilateral contact's normal equation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ContactCond {
    /// Normal impulse is an active unknown.
    Active,
    /// Normal impulse has a known (prescribed) value.
    Known,
    /// Normal equation is inactive; the contact contributes nothing.
    Off,
}

/// Runtime frictional regime of a unilateral contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FrictionCond {
    /// No friction, or friction disabled because the contact is off.
    Off,
    /// No slip; friction rows are linear rolling equations.
    Rolling,
    /// Continuous slip along a fixed direction for this sliding interval.
    Sliding,
    /// On the verge of slipping; direction is recomputed each Newton step.
    Impending,
}

/// A group of multipliers always enforced as equality constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Unconditional {
    /// Multiplier indices of the enforced rows.
    pub mults: Vec<usize>,
}

impl Unconditional {
    /// Create an unconditional record over the given multiplier indices.
    #[must_use]
    pub fn new(mults: Vec<usize>) -> Self {
        Self { mults }
    }
}

/// A scalar conditional constraint whose impulse is held within fixed bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Bounded {
    /// Multiplier index of the constrained row.
    pub mult: usize,
    /// Lower admissible impulse.
    pub lower: f64,
    /// Upper admissible impulse.
    pub upper: f64,
}

impl Bounded {
    /// Create a bounded record. `lower` must not exceed `upper`.
    #[must_use]
    pub fn new(mult: usize, lower: f64, upper: f64) -> Self {
        Self { mult, lower, upper }
    }
}

/// A unilateral contact: one normal row and optionally two friction rows.
///
/// The descriptive fields (`normal`, `friction`, `contact_type`, `sign`,
/// `mu`) are set by the caller. The remaining fields are runtime state
/// written by the solver; their values on entry are ignored.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UniContact {
    /// Multiplier index of the normal row.
    pub normal: usize,
    /// Multiplier indices of the friction rows; empty for a frictionless
    /// contact, otherwise exactly two (planar friction).
    pub friction: Vec<usize>,
    /// How this contact participates in the solve.
    pub contact_type: ContactType,
    /// Sign convention of the normal multiplier: admissible impulses satisfy
    /// `sign * pi[normal] <= 0`.
    pub sign: f64,
    /// Effective Coulomb friction coefficient.
    pub mu: f64,

    /// Runtime: state of the normal equation.
    pub contact_cond: ContactCond,
    /// Runtime: frictional regime.
    pub friction_cond: FrictionCond,
    /// Runtime: tangential slip velocity (NaN when friction is off).
    pub slip_vel: Vector2<f64>,
    /// Runtime: magnitude of `slip_vel`.
    pub slip_mag: f64,
}

impl UniContact {
    fn with_type(normal: usize, contact_type: ContactType) -> Self {
        Self {
            normal,
            friction: Vec::new(),
            contact_type,
            sign: 1.0,
            mu: 0.0,
            contact_cond: ContactCond::Off,
            friction_cond: FrictionCond::Off,
            slip_vel: Vector2::zeros(),
            slip_mag: 0.0,
        }
    }

    /// Create a participating (unknown-normal) contact.
    #[must_use]
    pub fn participating(normal: usize) -> Self {
        Self::with_type(normal, ContactType::Participating)
    }

    /// Create a known (prescribed-normal) contact.
    #[must_use]
    pub fn known(normal: usize) -> Self {
        Self::with_type(normal, ContactType::Known)
    }

    /// Create an observing (monitored-only) contact.
    #[must_use]
    pub fn observing(normal: usize) -> Self {
        Self::with_type(normal, ContactType::Observing)
    }

    /// Attach planar friction rows and a friction coefficient.
    #[must_use]
    pub fn with_friction(mut self, fx: usize, fy: usize, mu: f64) -> Self {
        self.friction = vec![fx, fy];
        self.mu = mu;
        self
    }

    /// Set the sign convention of the normal multiplier.
    #[must_use]
    pub fn with_sign(mut self, sign: f64) -> Self {
        self.sign = sign;
        self
    }

    /// Whether this contact carries friction rows.
    #[must_use]
    pub fn has_friction(&self) -> bool {
        !self.friction.is_empty()
    }
}

/// A one-sided speed limit on a single multiplier.
///
/// Declared for completeness of the constraint taxonomy; these rows are
/// solved as linear equations while active but carry no pruning rules.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UniSpeed {
    /// Multiplier index of the constrained row.
    pub mult: usize,
    /// Sign of the admissible impulse.
    pub sign: f64,
}

/// Friction rows limited by a known, state-dependent normal force.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StateLimitedFriction {
    /// Multiplier indices of the friction rows.
    pub friction: Vec<usize>,
    /// Magnitude of the known normal force.
    pub normal_force: f64,
    /// Effective Coulomb friction coefficient.
    pub mu: f64,
}

/// Friction rows limited by the impulse of other constraint rows.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConstraintLimitedFriction {
    /// Multiplier indices of the friction rows.
    pub friction: Vec<usize>,
    /// Multiplier indices of the limiting constraint rows.
    pub normals: Vec<usize>,
    /// Effective Coulomb friction coefficient.
    pub mu: f64,
}

/// The full set of constraint runtime records for one solve.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConstraintRts {
    /// Always-enforced equality groups.
    pub unconditional: Vec<Unconditional>,
    /// Bounded scalar constraints.
    pub bounded: Vec<Bounded>,
    /// Unilateral contacts.
    pub uni_contact: Vec<UniContact>,
    /// One-sided speed limits.
    pub uni_speed: Vec<UniSpeed>,
    /// Friction limited by known state forces.
    pub state_ltd_friction: Vec<StateLimitedFriction>,
    /// Friction limited by other constraint impulses.
    pub cons_ltd_friction: Vec<ConstraintLimitedFriction>,
}

impl ConstraintRts {
    /// Create an empty record set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of constraint rows these records contribute to the
    /// participating set. Used to cross-check the caller-supplied
    /// `participating` list.
    #[must_use]
    pub fn expected_participating_rows(&self) -> usize {
        let mut count = self.uni_speed.len() + self.bounded.len();
        for rt in &self.unconditional {
            count += rt.mults.len();
        }
        for rt in &self.uni_contact {
            if rt.contact_type == ContactType::Observing {
                continue; // neither normal nor friction participate
            }
            if rt.contact_type == ContactType::Participating {
                count += 1; // normal participates
            }
            if rt.has_friction() {
                count += rt.friction.len(); // friction participates even if normal is known
            }
        }
        for rt in &self.state_ltd_friction {
            count += rt.friction.len();
        }
        for rt in &self.cons_ltd_friction {
            count += rt.friction.len();
        }
        count
    }

    /// Validate record indices and shapes against a problem of dimension `m`.
    ///
    /// # Errors
    ///
    /// Returns the first [`crate::ImpulseError`] found: an out-of-range
    /// multiplier index, a non-planar friction list, or inverted bounds.
    pub fn validate(&self, m: usize) -> Result<(), crate::ImpulseError> {
        use crate::ImpulseError;

        let check = |kind: &'static str, index: usize| {
            if index < m {
                Ok(())
            } else {
                Err(ImpulseError::IndexOutOfRange {
                    kind,
                    index,
                    size: m,
                })
            }
        };

        for rt in &self.unconditional {
            for &mx in &rt.mults {
                check("unconditional", mx)?;
            }
        }
        for rt in &self.bounded {
            check("bounded", rt.mult)?;
            if rt.lower > rt.upper {
                return Err(ImpulseError::InvalidBounds {
                    lower: rt.lower,
                    upper: rt.upper,
                });
            }
        }
        for (k, rt) in self.uni_contact.iter().enumerate() {
            check("contact normal", rt.normal)?;
            if rt.has_friction() && rt.friction.len() != 2 {
                return Err(ImpulseError::NonPlanarFriction {
                    contact: k,
                    arity: rt.friction.len(),
                });
            }
            for &mx in &rt.friction {
                check("contact friction", mx)?;
            }
        }
        for rt in &self.uni_speed {
            check("speed limit", rt.mult)?;
        }
        for rt in &self.state_ltd_friction {
            for &mx in &rt.friction {
                check("state-limited friction", mx)?;
            }
        }
        for rt in &self.cons_ltd_friction {
            for &mx in &rt.friction {
                check("constraint-limited friction", mx)?;
            }
            for &mx in &rt.normals {
                check("constraint-limited normal", mx)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_indices_distinct() {
        assert_eq!(Phase::Compression.index(), 0);
        assert_eq!(Phase::Expansion.index(), 1);
        assert_eq!(Phase::Correction.index(), 2);
        assert!(Phase::Correction.index() < Phase::COUNT);
    }

    #[test]
    fn test_contact_builders() {
        let rt = UniContact::participating(2)
            .with_friction(0, 1, 0.5)
            .with_sign(-1.0);
        assert_eq!(rt.normal, 2);
        assert_eq!(rt.friction, vec![0, 1]);
        assert!(rt.has_friction());
        assert_eq!(rt.mu, 0.5);
        assert_eq!(rt.sign, -1.0);
        assert_eq!(rt.contact_type, ContactType::Participating);

        let rt = UniContact::observing(0);
        assert!(!rt.has_friction());
        assert_eq!(rt.contact_type, ContactType::Observing);
    }

    #[test]
    fn test_expected_participating_rows() {
        let mut rts = ConstraintRts::new();
        rts.unconditional.push(Unconditional::new(vec![0, 1]));
        rts.bounded.push(Bounded::new(2, -1.0, 1.0));
        rts.uni_contact
            .push(UniContact::participating(5).with_friction(3, 4, 0.5));
        rts.uni_contact
            .push(UniContact::known(8).with_friction(6, 7, 0.5));
        rts.uni_contact.push(UniContact::observing(9));
        // 2 unconditional + 1 bounded + (1 normal + 2 friction) + (2 friction) + 0
        assert_eq!(rts.expected_participating_rows(), 8);
    }

    #[test]
    fn test_validate_catches_bad_records() {
        let mut rts = ConstraintRts::new();
        rts.bounded.push(Bounded::new(3, 0.0, 1.0));
        assert!(rts.validate(3).is_err());
        assert!(rts.validate(4).is_ok());

        rts.bounded[0] = Bounded::new(0, 1.0, -1.0);
        assert!(matches!(
            rts.validate(4),
            Err(crate::ImpulseError::InvalidBounds { .. })
        ));

        let mut rts = ConstraintRts::new();
        let mut contact = UniContact::participating(0);
        contact.friction = vec![1, 2, 3];
        rts.uni_contact.push(contact);
        assert!(matches!(
            rts.validate(4),
            Err(crate::ImpulseError::NonPlanarFriction { arity: 3, .. })
        ));
    }
}
