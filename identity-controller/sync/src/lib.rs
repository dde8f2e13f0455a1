//! Verifies KSA -> GSA mappings and propagates the verified view.
//!
//! The [`Verifier`] owns the only copy of the verified mappings. Four
//! pipelines, each driven by its own [`Queue`](identity_controller_queue::Queue),
//! react to changes and keep the consumers of that view up to date:
//!
//! - [`ServiceAccountPipeline`] re-verifies a ServiceAccount and, when its
//!   mapping changes, notifies the snapshot and every node running it;
//! - [`PodPipeline`] notifies a pod's node once the pod's ServiceAccount is
//!   verified;
//! - [`NodePipeline`] reports the GSAs in use on a node to the authority;
//! - [`SnapshotPipeline`] mirrors the verified view into a `ConfigMap`.
//!
//! Pipelines never touch each other's state. They coordinate only by
//! enqueueing keys into each other's queues.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod collapse;
mod node;
mod pod;
mod resync;
mod service_account;
mod snapshot;
mod verifier;

#[cfg(test)]
mod tests;

pub use self::{
    node::{NodeGsaState, NodePipeline, DEBOUNCE_INTERVAL},
    pod::PodPipeline,
    resync::Resync,
    service_account::ServiceAccountPipeline,
    snapshot::{render, ConfigMapStore, Snapshot, SnapshotPipeline, SnapshotStore, MAPPINGS_KEY},
    verifier::Verifier,
};
use identity_controller_client as client;
use identity_controller_core::ServiceAccount;
use std::{sync::Arc, time::Duration};

/// Errors returned to a pipeline's queue. Every error is retried with backoff.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// The authority may take minutes to reflect a newly granted permission,
    /// so a denial is retried rather than treated as final.
    #[error("{0} is denied its GSA; waiting for the authority to propagate")]
    Denied(ServiceAccount),

    #[error("node {0} has no zone label")]
    MissingZone(String),

    #[error("node {node} was synced {elapsed:?} ago; syncs are at least {debounce:?} apart")]
    Debounced {
        node: String,
        elapsed: Duration,
        debounce: Duration,
    },

    #[error("failed to sync node {node}: {source}")]
    Sync {
        node: String,
        #[source]
        source: client::Error,
    },

    #[error("failed to render snapshot: {0}")]
    Render(#[from] serde_json::Error),

    #[error("failed to reconcile snapshot: {0}")]
    Snapshot(#[source] anyhow::Error),
}

/// Errors shared by every caller of a collapsed verification.
#[derive(Clone, Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("failed to authorize {ksa}: {source}")]
    Authority {
        ksa: ServiceAccount,
        #[source]
        source: Arc<client::Error>,
    },

    #[error("verification of {0} was abandoned")]
    Abandoned(ServiceAccount),
}
