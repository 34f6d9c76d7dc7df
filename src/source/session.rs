// Session - per-connection authentication token
//
// The token slot is guarded by one async mutex that is held across the whole
// invalidate+connect sequence, so concurrent pollers hitting an expired token
// at the same moment cannot invalidate each other's fresh token.

use tokio::sync::Mutex;
use tracing::{error, info};

use super::MetricSource;

/// Authentication state of one connection
#[derive(Default)]
pub struct Session {
    token: Mutex<Option<String>>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            token: Mutex::new(None),
        }
    }

    /// Current token, if the session is connected
    pub async fn token(&self) -> Option<String> {
        self.token.lock().await.clone()
    }

    /// Exchanges credentials for a new token.
    ///
    /// Never fails past this boundary: on rejection the token is cleared and
    /// `None` is returned, callers check for its presence.
    pub async fn connect(&self, source: &dyn MetricSource) -> Option<String> {
        let mut slot = self.token.lock().await;
        Self::connect_locked(&mut slot, source).await
    }

    /// Clears the token so the next request goes through `connect()` again
    pub async fn invalidate(&self) {
        *self.token.lock().await = None;
    }

    /// Clears the token only while it still holds `stale`.
    ///
    /// A token another task has already refreshed is left in place.
    pub async fn invalidate_if(&self, stale: &str) {
        let mut slot = self.token.lock().await;
        if slot.as_deref() == Some(stale) {
            *slot = None;
        }
    }

    /// Returns the current token, connecting first when there is none
    pub async fn current_or_connect(&self, source: &dyn MetricSource) -> Option<String> {
        let mut slot = self.token.lock().await;
        if let Some(token) = slot.as_ref() {
            return Some(token.clone());
        }
        Self::connect_locked(&mut slot, source).await
    }

    /// Replaces a token the source reported as expired.
    ///
    /// If another task already replaced `stale`, its fresh token is returned
    /// untouched instead of being invalidated a second time.
    pub async fn refresh_after_expiry(
        &self,
        source: &dyn MetricSource,
        stale: &str,
    ) -> Option<String> {
        let mut slot = self.token.lock().await;
        if let Some(current) = slot.as_ref() {
            if current != stale {
                return Some(current.clone());
            }
        }

        *slot = None;
        Self::connect_locked(&mut slot, source).await
    }

    async fn connect_locked(
        slot: &mut Option<String>,
        source: &dyn MetricSource,
    ) -> Option<String> {
        let token = source.authenticate().await.filter(|t| !t.is_empty());

        match &token {
            Some(_) => info!("Session connected"),
            None => error!("Session could not authenticate"),
        }

        *slot = token.clone();
        token
    }
}
