//! Contact impulse solver using the PLUS (Poisson–Linear Uncoupled
//! Successive-pruning) method.
//!
//! This crate resolves simultaneous unilateral contacts with Coulomb
//! friction at a single instant. Given a snapshot of constraint geometry (a
//! symmetric constraint-space mass-matrix inverse `A`), a velocity error
//! `verr`, a known expansion (Poisson restitution) impulse, and a
//! classification of each contact, it finds an impulse vector `pi` such
//! that the post-impulse constraint velocities satisfy the non-penetration,
//! bounded, and friction-cone complementarity conditions.
//!
//! # Method
//!
//! Mixed complementarity problems with Coulomb friction are nonsmooth and
//! in general non-convex. The solver decomposes the problem along three
//! nested loops:
//!
//! - **Sliding intervals**: slip directions are held constant during an
//!   interval; the accepted interval length is truncated so no slip
//!   direction rotates past a configured budget.
//! - **Active set**: each interval repeatedly solves for the currently
//!   active multipliers, projects the result into the admissible region,
//!   and prunes exactly one offending constraint until the projected
//!   violations are insignificant.
//! - **Newton**: each active set is a square nonlinear system (sliding and
//!   impending friction rows are nonlinear) solved by Newton iteration with
//!   an analytic Jacobian, a rank-revealing least-squares step, and a
//!   backtracking line search.
//!
//! # Example
//!
//! ```
//! use nalgebra::{DMatrix, DVector};
//! use sim_impulse::{ConstraintRts, Phase, PlusSolver, UniContact};
//!
//! // One contact approaching at speed 1 with unit effective mass.
//! let a = DMatrix::identity(1, 1);
//! let mut verr = DVector::from_element(1, -1.0);
//! let mut pi_expand = DVector::zeros(1);
//! let mut pi = DVector::zeros(1);
//! let mut rts = ConstraintRts::new();
//! rts.uni_contact.push(UniContact::participating(0));
//!
//! let mut solver = PlusSolver::default_solver();
//! let converged = solver.solve(
//!     Phase::Compression,
//!     &[0],
//!     &a,
//!     None,
//!     &[],
//!     &mut pi_expand,
//!     &mut verr,
//!     &mut pi,
//!     &mut rts,
//! );
//!
//! // The compressive impulse stops the approach exactly.
//! assert!(converged);
//! assert!((pi[0] + 1.0).abs() < 1e-8);
//! assert!(verr[0].abs() < 1e-8);
//! ```
//!
//! # Scope
//!
//! The multibody pipeline that assembles `A`, `verr`, and the contact
//! classification lives upstream; this crate is the solve step only. It is
//! single-threaded and synchronous: a [`PlusSolver`] owns reusable scratch
//! buffers, so concurrent callers need independent instances.

#![doc(html_root_url = "https://docs.rs/sim-impulse/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]

mod active_set;
mod error;
mod math;
mod newton;
mod solver;
mod step;
mod types;

pub use error::ImpulseError;
pub use solver::{PlusSolver, PlusSolverConfig, SolveStats};
pub use step::{
    step_to_max_direction_change_2d, step_to_max_direction_change_3d, step_to_origin_2d,
    step_to_origin_3d,
};
pub use types::{
    Bounded, ConstraintLimitedFriction, ConstraintRts, ContactCond, ContactType, FrictionCond,
    Phase, StateLimitedFriction, UniContact, UniSpeed, Unconditional,
};

// Re-export the linear-algebra types appearing in the public API.
pub use nalgebra::{DMatrix, DVector, Vector2, Vector3};
