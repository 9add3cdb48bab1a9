//! Waiting for servers and load balancers to become usable
//!
//! A freshly created server shows up in the provider API before it has a
//! public address and well before it accepts SSH. Each probe below is a single
//! attempt; the `wait_for_*` methods wrap it in [`retry_bounded`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::provider::CloudProvider;
use crate::remote::RemoteExecutor;
use crate::retry::{retry_bounded, RetryPolicy};
use crate::{scripts, Error, Result};

/// Bounded polling for server and load balancer readiness
pub struct ReadinessPoller {
    provider: Arc<dyn CloudProvider>,
    executor: Arc<dyn RemoteExecutor>,
    policy: RetryPolicy,
}

impl ReadinessPoller {
    /// Create a poller using `policy` for every wait
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        executor: Arc<dyn RemoteExecutor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            executor,
            policy,
        }
    }

    /// Retry budget used by the `wait_for_*` methods
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Single attempt: resolve the server's address and run a trivial command on it
    pub async fn probe_server(&self, name: &str, user: &str) -> Result<String> {
        let server = self
            .provider
            .get_server(name)
            .await?
            .ok_or_else(|| Error::not_ready(format!("server {} not found", name)))?;

        let ip = server
            .public_ipv4
            .ok_or_else(|| Error::not_ready(format!("server {} has no public address", name)))?;

        self.executor.execute(&ip, user, scripts::PROBE).await?;
        debug!(server = %name, ip = %ip, "Server reachable");
        Ok(ip)
    }

    /// Single attempt: resolve the load balancer's public address
    pub async fn probe_load_balancer(&self, name: &str) -> Result<String> {
        let load_balancer = self
            .provider
            .get_load_balancer(name)
            .await?
            .ok_or_else(|| Error::not_ready(format!("load balancer {} not found", name)))?;

        load_balancer.public_ipv4.ok_or_else(|| {
            Error::not_ready(format!("load balancer {} has no public address", name))
        })
    }

    /// Wait until the server accepts SSH as `user`, returning its public IP
    pub async fn wait_for_server(
        &self,
        name: &str,
        user: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        info!(server = %name, "Waiting for server");
        let operation = format!("wait for server {}", name);
        retry_bounded(&self.policy, cancel, &operation, |_| {
            self.probe_server(name, user)
        })
        .await
    }

    /// Wait until the load balancer has a public IP
    pub async fn wait_for_load_balancer(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        info!(load_balancer = %name, "Waiting for load balancer");
        let operation = format!("wait for load balancer {}", name);
        retry_bounded(&self.policy, cancel, &operation, |_| {
            self.probe_load_balancer(name)
        })
        .await
    }
}
