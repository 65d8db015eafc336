//! Evalcycle Core - Evaluation Lifecycle Types
//!
//! Pure data types, date normalization and lifecycle derivation for course
//! evaluations, plus the token codecs and lock typestate used by the
//! scheduler. Nothing in this crate performs I/O; the outbound ports are
//! declared here and implemented by the host.

mod action;
mod clock;
mod entities;
mod enums;
mod error;
mod identity;
mod lock;
mod normalize;
mod ports;
mod reminder;
mod state;

pub use action::*;
pub use clock::*;
pub use entities::*;
pub use enums::*;
pub use error::*;
pub use identity::*;
pub use lock::*;
pub use normalize::*;
pub use ports::*;
pub use reminder::*;
pub use state::*;
