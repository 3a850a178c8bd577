//! # Core Error Types
//!
//! Errors raised by the validated constructors in this crate. Domain
//! state-machine errors live in the crates that own the state machines.

use thiserror::Error;

/// Error from a core type's validated constructor.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Input failed validation at construction.
    #[error("validation error: {0}")]
    Validation(String),
}
