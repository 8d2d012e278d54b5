//! Session presence tracking
//!
//! The pipeline signs the session out through its unauthorized notifier; the
//! admin API signs it back in by seeding a new credential pair. Health reports
//! whichever happened last.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use session_auth::{ACCESS_TOKEN_KEY, CredentialStore, REFRESH_TOKEN_KEY, TokenPair};
use session_client::UnauthorizedNotifier;
use tracing::{info, warn};

#[derive(Clone)]
pub struct SessionState {
    store: Arc<dyn CredentialStore>,
    signed_out: Arc<AtomicBool>,
}

/// Snapshot returned by the admin API. Never carries credential values.
#[derive(Debug, serde::Serialize)]
pub struct SessionStatus {
    pub active: bool,
    pub access_token: bool,
    pub refresh_token: bool,
}

impl SessionState {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            signed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn has(&self, key: &str) -> bool {
        match self.store.get(key).await {
            Ok(value) => value.is_some_and(|v| !v.is_blank()),
            Err(e) => {
                warn!(key, error = %e, "failed to read credential store");
                false
            }
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let access_token = self.has(ACCESS_TOKEN_KEY).await;
        let refresh_token = self.has(REFRESH_TOKEN_KEY).await;
        let signed_out = self.signed_out.load(Ordering::Relaxed);
        SessionStatus {
            active: !signed_out && (access_token || refresh_token),
            access_token,
            refresh_token,
        }
    }

    pub async fn is_active(&self) -> bool {
        self.status().await.active
    }

    /// Store a new credential pair and mark the session active.
    pub async fn sign_in(&self, pair: &TokenPair) -> session_auth::Result<()> {
        session_auth::persist_pair(self.store.as_ref(), pair).await?;
        self.signed_out.store(false, Ordering::Relaxed);
        info!("session credentials installed");
        Ok(())
    }

    /// Wipe both credentials and mark the session signed out.
    pub async fn sign_out(&self) -> session_auth::Result<()> {
        self.signed_out.store(true, Ordering::Relaxed);
        session_auth::clear_pair(self.store.as_ref()).await?;
        info!("session credentials cleared");
        Ok(())
    }

    /// Notifier handed to the pipeline.
    pub fn notifier(&self) -> SignOutNotifier {
        SignOutNotifier {
            signed_out: self.signed_out.clone(),
        }
    }
}

/// Flags the session as signed out when the pipeline gives up.
pub struct SignOutNotifier {
    signed_out: Arc<AtomicBool>,
}

impl UnauthorizedNotifier for SignOutNotifier {
    fn notify(&self) {
        if !self.signed_out.swap(true, Ordering::Relaxed) {
            warn!("session is no longer authorized, signing out until new credentials arrive");
        }
    }
}
