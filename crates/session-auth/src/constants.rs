//! Session credential constants
//!
//! Key names shared with the browser client so a store written by either side
//! reads the same way, plus the conventional refresh endpoint.

/// Store key holding the access credential
pub const ACCESS_TOKEN_KEY: &str = "token";

/// Store key holding the refresh credential
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Path of the credential refresh endpoint, relative to the API base URL
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// Scheme prefix for the Authorization header
pub const BEARER_PREFIX: &str = "Bearer ";
