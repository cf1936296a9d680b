//! Group State Machine
//!
//! The per-node role states and the legal transitions between them. The
//! monitor assigns goal roles; the keeper executes the matching transition.

pub mod role;
pub mod transition;

pub use role::Role;
pub use transition::{legal_transitions_from, lookup, TransitionKind, TransitionRule};
