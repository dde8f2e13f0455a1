//! Identity Controller Index
//!
//! Maintains the subset of cluster state the controller's pipelines read, and
//! notifies the pipelines' queues as that state changes. It watches:
//!
//! - `ServiceAccount`s, recording the GSA each one asks to impersonate;
//! - `Pod`s, recording the ServiceAccount each pod runs as and the node it
//!   runs on, indexed both by ServiceAccount and by node;
//! - `Node`s, recording each node's zone;
//! - the snapshot `ConfigMap`, so that external changes to it are reverted.
//!
//! ```text
//! [ ServiceAccount ] <- [ Pod ] -> [ Node ]
//! ```
//!
//! The index only records what the API server says. It never decides whether
//! a mapping is authorized.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;


pub use self::metrics::{IndexMetrics, SizedIndex};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use identity_controller_core::{object_key, GsaEmail, ServiceAccount};
use identity_controller_k8s_api::{self as k8s, ResourceExt};
use identity_controller_queue::Enqueue;
use parking_lot::RwLock;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, trace};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Handles used to notify each pipeline of changes.
#[derive(Clone)]
pub struct Queues {
    pub service_accounts: Arc<dyn Enqueue>,
    pub pods: Arc<dyn Enqueue>,
    pub nodes: Arc<dyn Enqueue>,
    pub snapshot: Arc<dyn Enqueue>,
}

/// Identifies the snapshot `ConfigMap`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotRef {
    pub namespace: String,
    pub name: String,
}

pub struct Index {
    /// The GSA annotation of each ServiceAccount, if set.
    service_accounts: HashMap<ServiceAccount, Option<GsaEmail>>,

    pods: HashMap<PodRef, PodState>,
    pods_by_service_account: HashMap<ServiceAccount, HashSet<PodRef>>,
    pods_by_node: HashMap<String, HashSet<PodRef>>,

    nodes: HashMap<String, NodeState>,

    snapshot: SnapshotRef,
    queues: Queues,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodState {
    pub service_account: ServiceAccount,

    /// Set only for pods that use their node's credential service.
    pub node: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeState {
    pub zone: Option<String>,
}

// === impl SnapshotRef ===

impl SnapshotRef {
    /// The snapshot pipeline's only key.
    pub fn key(&self) -> String {
        object_key(Some(&self.namespace), &self.name)
    }
}

// === impl PodRef ===

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn key(&self) -> String {
        object_key(Some(&self.namespace), &self.name)
    }
}

impl std::fmt::Display for PodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Index ===

impl Index {
    pub fn shared(snapshot: SnapshotRef, queues: Queues) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            service_accounts: HashMap::new(),
            pods: HashMap::new(),
            pods_by_service_account: HashMap::new(),
            pods_by_node: HashMap::new(),
            nodes: HashMap::new(),
            snapshot,
            queues,
        }))
    }

    /// Returns `None` when the ServiceAccount is unknown or has no GSA
    /// annotation.
    pub fn gsa_annotation(&self, sa: &ServiceAccount) -> Option<&GsaEmail> {
        self.service_accounts.get(sa)?.as_ref()
    }

    pub fn service_accounts(&self) -> Vec<ServiceAccount> {
        let mut sas = self.service_accounts.keys().cloned().collect::<Vec<_>>();
        sas.sort();
        sas
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<&PodState> {
        self.pods.get(&PodRef::new(namespace, name))
    }

    /// The nodes running at least one pod as `sa`.
    pub fn nodes_for_service_account(&self, sa: &ServiceAccount) -> BTreeSet<String> {
        self.pods_by_service_account
            .get(sa)
            .into_iter()
            .flatten()
            .filter_map(|pod| self.pods.get(pod)?.node.clone())
            .collect()
    }

    /// The pods running on `node`, with the ServiceAccount each runs as.
    pub fn pods_on_node(&self, node: &str) -> Vec<(PodRef, ServiceAccount)> {
        let mut pods = self
            .pods_by_node
            .get(node)
            .into_iter()
            .flatten()
            .filter_map(|pod| {
                let state = self.pods.get(pod)?;
                Some((pod.clone(), state.service_account.clone()))
            })
            .collect::<Vec<_>>();
        pods.sort();
        pods
    }

    pub fn node(&self, name: &str) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    pub fn node_names(&self) -> Vec<String> {
        let mut names = self.nodes.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> &SnapshotRef {
        &self.snapshot
    }

    fn unlink_pod(&mut self, pod: &PodRef, state: &PodState) {
        if let Some(pods) = self.pods_by_service_account.get_mut(&state.service_account) {
            pods.remove(pod);
            if pods.is_empty() {
                self.pods_by_service_account.remove(&state.service_account);
            }
        }
        if let Some(node) = state.node.as_ref() {
            if let Some(pods) = self.pods_by_node.get_mut(node) {
                pods.remove(pod);
                if pods.is_empty() {
                    self.pods_by_node.remove(node);
                }
            }
        }
    }

    fn link_pod(&mut self, pod: &PodRef, state: &PodState) {
        self.pods_by_service_account
            .entry(state.service_account.clone())
            .or_default()
            .insert(pod.clone());
        if let Some(node) = state.node.as_ref() {
            self.pods_by_node
                .entry(node.clone())
                .or_default()
                .insert(pod.clone());
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::ServiceAccount> for Index {
    fn apply(&mut self, sa: k8s::ServiceAccount) {
        let id = ServiceAccount::new(sa.namespace().unwrap_or_default(), sa.name_unchecked());
        let gsa = k8s::gsa_annotation(&sa);

        if self.service_accounts.get(&id) == Some(&gsa) {
            trace!(%id, "Unchanged");
            return;
        }
        debug!(%id, ?gsa, "Updated");
        self.service_accounts.insert(id.clone(), gsa);
        self.queues.service_accounts.enqueue_key(&id.key());
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ServiceAccount::new(namespace, name);
        if self.service_accounts.remove(&id).is_some() {
            debug!(%id, "Deleted");
            self.queues.service_accounts.enqueue_key(&id.key());
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let id = PodRef::new(pod.namespace().unwrap_or_default(), pod.name_unchecked());
        let state = PodState {
            service_account: k8s::service_account(&pod),
            node: k8s::node_name(&pod).filter(|_| k8s::runs_on_node(&pod)),
        };

        let prior = self.pods.insert(id.clone(), state.clone());
        if prior.as_ref() == Some(&state) {
            trace!(pod = %id, "Unchanged");
            return;
        }
        if let Some(prior) = prior.as_ref() {
            self.unlink_pod(&id, prior);
        }
        self.link_pod(&id, &state);
        debug!(pod = %id, sa = %state.service_account, node = ?state.node, "Updated");

        // A pod appearing under a ServiceAccount is a reason to re-check its
        // mapping.
        if prior.map(|p| p.service_account) != Some(state.service_account.clone()) {
            self.queues
                .service_accounts
                .enqueue_key(&state.service_account.key());
        }
        self.queues.pods.enqueue_key(&id.key());
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = PodRef::new(namespace, name);
        if let Some(state) = self.pods.remove(&id) {
            self.unlink_pod(&id, &state);
            debug!(pod = %id, "Deleted");
            self.queues.pods.enqueue_key(&id.key());
        }
    }
}

impl kubert::index::IndexClusterResource<k8s::Node> for Index {
    fn apply(&mut self, node: k8s::Node) {
        let name = node.name_unchecked();
        let state = NodeState {
            zone: k8s::zone(&node),
        };

        if self.nodes.get(&name) == Some(&state) {
            trace!(%name, "Unchanged");
            return;
        }
        debug!(%name, zone = ?state.zone, "Updated");
        self.nodes.insert(name.clone(), state);
        self.queues.nodes.enqueue_key(&name);
    }

    fn delete(&mut self, name: String) {
        if self.nodes.remove(&name).is_some() {
            debug!(%name, "Deleted");
            self.queues.nodes.enqueue_key(&name);
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::ConfigMap> for Index {
    fn apply(&mut self, cm: k8s::ConfigMap) {
        if cm.namespace().as_deref() == Some(&self.snapshot.namespace)
            && cm.name_unchecked() == self.snapshot.name
        {
            self.queues.snapshot.enqueue_key(&self.snapshot.key());
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if namespace == self.snapshot.namespace && name == self.snapshot.name {
            debug!(%namespace, %name, "Snapshot deleted");
            self.queues.snapshot.enqueue_key(&self.snapshot.key());
        }
    }
}

impl SizedIndex<k8s::ServiceAccount> for Index {
    fn size(&self) -> usize {
        self.service_accounts.len()
    }
}

impl SizedIndex<k8s::Pod> for Index {
    fn size(&self) -> usize {
        self.pods.len()
    }
}

impl SizedIndex<k8s::Node> for Index {
    fn size(&self) -> usize {
        self.nodes.len()
    }
}
