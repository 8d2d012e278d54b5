//! Types shared by the session crates and the API gateway

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
