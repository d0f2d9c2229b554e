//! Optimistic concurrency control.
//!
//! Commits never block on each other. Each written key carries a reservation
//! marker placed with compare-and-set; a commit that finds a key reserved, or
//! modified since it was first touched, fails instead of waiting.

pub mod colocation;
pub mod reservation;

pub use colocation::{resolve_host, HostAssignment};
pub use reservation::{
    pending_event, CommitOutcome, PreparedCommit, Reservation, ReservationCoordinator,
    SingleWrite,
};
