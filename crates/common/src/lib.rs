//! Common types shared by the speech gateway crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
