//! Common types shared by the key pool and the draft gateway

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
