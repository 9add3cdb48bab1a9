//! hkctl core - Kubernetes clusters on Hetzner Cloud
//!
//! This crate provides everything behind the `hcloud-k8s-ctl` binary:
//!
//! - **Provisioning**: network, firewalls, SSH key, load balancer, placement
//!   group and masters, then control-plane bootstrap over SSH
//! - **Post-install**: cluster workloads on the first master, reused by patch
//! - **Drain**: convergent teardown of every resource the cluster owns
//! - **Ad-hoc**: one command fanned out to masters and autoscaler workers
//!
//! # Architecture
//!
//! ```text
//! ClusterApi ──► ProvisioningPipeline ──► CloudProvider (Hetzner REST)
//!            ├─► ClusterDrainer        └─► RemoteExecutor (SSH)
//!            ├─► PostInstallRunner
//!            └─► FleetCommandExecutor
//! ```
//!
//! Cloud and shell access sit behind the [`provider::CloudProvider`] and
//! [`remote::RemoteExecutor`] traits; every component receives them, together
//! with the loaded [`config::ClusterSpec`], at construction.

#![deny(missing_docs)]

pub mod adhoc;
pub mod cluster;
pub mod config;
pub mod drain;
pub mod error;
pub mod firewall;
pub mod pipeline;
pub mod post_install;
pub mod provider;
pub mod readiness;
pub mod remote;
pub mod retry;
pub mod scripts;
pub mod selector;

#[cfg(test)]
mod testing;

pub use cluster::ClusterApi;
pub use config::ClusterSpec;
pub use error::{Error, RemoteError, StepContext};

/// Result type for hkctl operations
pub type Result<T> = std::result::Result<T, Error>;
