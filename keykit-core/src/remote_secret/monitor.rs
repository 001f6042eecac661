//! Remote-secret monitoring loop and the single-slot secret handoff.
//!
//! The loop fetches the secret, verifies its fingerprint, publishes it
//! into a single-slot handoff and re-polls at the server-provided
//! interval. Before the first successful fetch a constant retry interval
//! and failure budget apply; afterwards the server's `checkIntervalS` and
//! `nMissedChecksMax` govern. Exceeding the consecutive-failure budget is
//! a hard failure: the caller must treat the secret as unavailable and
//! lock.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::{
    MAX_FAILED_ATTEMPTS_WHILE_LOCKED, RETRY_INTERVAL_WHILE_LOCKED, VALID_CHECK_INTERVAL_RANGE_S,
};
use crate::error::{RemoteSecretEndpointError, RemoteSecretMonitorError};
use crate::master_key::state::{RemoteSecret, RemoteSecretParameters};
use crate::remote_secret::client::RemoteSecretClient;

fn clamp_check_interval(check_interval_s: u32) -> Duration {
    Duration::from_secs(u64::from(check_interval_s.clamp(
        *VALID_CHECK_INTERVAL_RANGE_S.start(),
        *VALID_CHECK_INTERVAL_RANGE_S.end(),
    )))
}

/// Single-slot handoff plus the monitoring loop around it.
///
/// Each fetched secret is published into the slot; a value is delivered
/// to exactly one waiter and then forgotten, so repeated calls to
/// [`RemoteSecretMonitor::await_remote_secret_and_clear`] suspend again
/// until the next fetch.
pub struct RemoteSecretMonitor {
    slot: Mutex<Option<RemoteSecret>>,
    notify: Notify,
}

impl Default for RemoteSecretMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteSecretMonitor {
    /// Creates a monitor with an empty handoff slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Runs the monitoring loop until it fails; the error tells the
    /// caller why the secret must be treated as unavailable.
    ///
    /// Cancellation (dropping the future) aborts any in-flight request
    /// and leaves no background work behind.
    pub async fn monitor(
        &self,
        client: &RemoteSecretClient,
        work_server_base_url: &str,
        parameters: &RemoteSecretParameters,
    ) -> RemoteSecretMonitorError {
        // Constant schedule until the first fetch succeeds; the server's
        // schedule afterwards.
        let mut schedule: Option<(Duration, u16)> = None;
        let mut n_failed_attempts: u16 = 0;

        loop {
            info!("Requesting remote secret");
            match client
                .fetch_remote_secret(work_server_base_url, &parameters.authentication_token)
                .await
            {
                Ok(fetched) => {
                    if fetched.remote_secret.derive_hash() != parameters.remote_secret_hash {
                        warn!("Remote secret mismatch");
                        return RemoteSecretMonitorError::Mismatch;
                    }
                    let check_interval = clamp_check_interval(fetched.check_interval_s);
                    schedule = Some((check_interval, fetched.n_missed_checks_max));
                    n_failed_attempts = 0;

                    info!(refresh_in = ?check_interval, "Fetching remote secret successful");
                    self.publish(fetched.remote_secret);
                    tokio::time::sleep(check_interval).await;
                }
                Err(RemoteSecretEndpointError::Forbidden) => {
                    info!("Access to remote secret blocked");
                    return RemoteSecretMonitorError::Blocked;
                }
                Err(RemoteSecretEndpointError::NotFound) => {
                    info!("Remote secret does not exist");
                    return RemoteSecretMonitorError::NotFound;
                }
                Err(error) => {
                    let (retry_interval, n_failed_attempts_max) = schedule
                        .unwrap_or((RETRY_INTERVAL_WHILE_LOCKED, MAX_FAILED_ATTEMPTS_WHILE_LOCKED));
                    if n_failed_attempts >= n_failed_attempts_max {
                        info!("Maximum number of failed remote secret fetch attempts exceeded");
                        return RemoteSecretMonitorError::Timeout { cause: error };
                    }
                    n_failed_attempts = n_failed_attempts.saturating_add(1);
                    info!(
                        cause = %error,
                        retry_in = ?retry_interval,
                        "Fetching remote secret failed",
                    );
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }

    /// Consumes the pending secret, suspending until one is published.
    ///
    /// Exactly one waiter receives each publication; afterwards the slot
    /// is empty again.
    pub async fn await_remote_secret_and_clear(&self) -> RemoteSecret {
        loop {
            let notified = self.notify.notified();
            if let Some(secret) = self.take_pending() {
                return secret;
            }
            notified.await;
        }
    }

    /// Takes the pending secret without waiting.
    pub(crate) fn take_pending(&self) -> Option<RemoteSecret> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    pub(crate) fn publish(&self, secret: RemoteSecret) {
        // Overwriting drops (and zeroizes) an unconsumed older secret.
        *self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(secret);
        self.notify.notify_one();
    }
}
