//! Shared types

mod error;

pub use error::{KeywardenError, Result};
