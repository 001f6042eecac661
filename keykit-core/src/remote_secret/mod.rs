//! Remote-secret protection: protocol client, monitoring loop and the
//! manager deciding when protection must change.

pub mod client;
pub mod monitor;

use std::sync::Arc;

use tracing::debug;

use crate::error::{RemoteSecretEndpointError, RemoteSecretMonitorError};
use crate::master_key::state::{RemoteSecret, RemoteSecretLockData, RemoteSecretParameters};

pub use client::{
    ClientKey, FetchedRemoteSecret, RemoteSecretClient, RemoteSecretClientParameters,
    RemoteSecretCreationResult, WorkCredentials,
};
pub use monitor::RemoteSecretMonitor;

/// Outcome of checking whether remote-secret protection must change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSecretProtectionCheck {
    /// Policy wants protection and none is active.
    ShouldActivate,
    /// Policy no longer wants protection but one is active.
    ShouldDeactivate,
    /// Protection already matches the policy.
    NoChangeNeeded,
}

/// When a protection-state check is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSecretCheckType {
    /// During the application's startup sequence.
    Startup,
    /// While the application is already running.
    AppRuntime,
}

/// Policy predicate: should remote-secret protection be active right now.
///
/// Supplied by the surrounding application (typically derived from the
/// organization's management configuration).
pub type RemoteSecretPolicy = dyn Fn() -> bool + Send + Sync;

/// Decides on and performs remote-secret protection changes.
pub struct RemoteSecretManager {
    work_server_base_url: String,
    policy: Box<RemoteSecretPolicy>,
    client: RemoteSecretClient,
    monitor: Arc<RemoteSecretMonitor>,
}

impl RemoteSecretManager {
    /// Creates a manager talking to the given work server, with the given
    /// activation policy.
    #[must_use]
    pub fn new(work_server_base_url: impl Into<String>, policy: Box<RemoteSecretPolicy>) -> Self {
        Self {
            work_server_base_url: work_server_base_url.into(),
            policy,
            client: RemoteSecretClient::new(),
            monitor: Arc::new(RemoteSecretMonitor::new()),
        }
    }

    /// Pure decision: compare the policy with the currently active
    /// protection.
    #[must_use]
    pub fn check_remote_secret_protection(
        &self,
        lock_data: Option<&RemoteSecretLockData>,
    ) -> RemoteSecretProtectionCheck {
        let should_use = (self.policy)();
        debug!(should_use, active = lock_data.is_some(), "Checking remote secret protection");
        match (should_use, lock_data) {
            (true, None) => RemoteSecretProtectionCheck::ShouldActivate,
            (false, Some(_)) => RemoteSecretProtectionCheck::ShouldDeactivate,
            _ => RemoteSecretProtectionCheck::NoChangeNeeded,
        }
    }

    /// Creates a fresh remote secret on the server.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteSecretEndpointError`], notably
    /// `InvalidCredentials` when the server rejects the caller.
    pub async fn create_remote_secret(
        &self,
        parameters: &RemoteSecretClientParameters,
    ) -> Result<RemoteSecretCreationResult, RemoteSecretEndpointError> {
        self.client.create_remote_secret(parameters).await
    }

    /// Revokes a remote secret on the server.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteSecretEndpointError`], notably
    /// `InvalidCredentials` when the server rejects the caller.
    pub async fn delete_remote_secret(
        &self,
        parameters: &RemoteSecretClientParameters,
        authentication_token: &crate::master_key::state::RemoteSecretAuthenticationToken,
    ) -> Result<(), RemoteSecretEndpointError> {
        self.client
            .delete_remote_secret(parameters, authentication_token)
            .await
    }

    /// Runs the monitoring loop for the given parameters until it fails.
    pub async fn monitor_remote_secret(
        &self,
        parameters: &RemoteSecretParameters,
    ) -> RemoteSecretMonitorError {
        self.monitor
            .monitor(&self.client, &self.work_server_base_url, parameters)
            .await
    }

    /// Consumes the monitored secret, suspending until one is available.
    pub async fn await_remote_secret_and_clear(&self) -> RemoteSecret {
        self.monitor.await_remote_secret_and_clear().await
    }

    /// Publishes a secret into the monitor handoff, as a fetch of the
    /// monitoring loop would.
    #[cfg(test)]
    pub(crate) fn publish_remote_secret_for_test(&self, secret: RemoteSecret) {
        self.monitor.publish(secret);
    }
}
