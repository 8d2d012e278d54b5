//! Session credentials for the bizdesk API
//!
//! Holds the pieces of the authenticated request pipeline that deal with the
//! credentials themselves, independent of how requests are sent:
//!
//! 1. `CredentialStore` is the key/value adapter over a durable store
//!    (`FileCredentialStore`) or process memory (`MemoryCredentialStore`)
//! 2. `token::refresh_session()` exchanges a refresh credential for a new pair
//! 3. `credentials::persist_pair()` / `credentials::clear_pair()` write or wipe
//!    both keys in one step after a refresh cycle settles

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, StoreFuture, clear_pair,
    persist_pair,
};
pub use error::{Error, Result};
pub use token::{TokenPair, TokenResponse, refresh_session};
