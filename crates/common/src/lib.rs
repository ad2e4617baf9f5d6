//! Common types for the habit-tracker client workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
