#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod gsa;
mod service_account;

pub use self::{
    gsa::GsaEmail,
    service_account::{InvalidKey, ServiceAccount},
};

pub const IDENTITY_CONTROLLER_NAME: &str = "identity-controller";

/// Annotation on a ServiceAccount naming the GSA it wants to impersonate.
pub const GSA_ANNOTATION: &str = "iam.gke.io/gcp-service-account";

/// Node label carrying the node's zone.
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// Deprecated zone label, still set on older nodes.
pub const LEGACY_ZONE_LABEL: &str = "failure-domain.beta.kubernetes.io/zone";

pub const DEFAULT_NAMESPACE: &str = "default";

/// The outcome of a single forced verification of a ServiceAccount.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyResult {
    /// The verified GSA before this verification ran (empty if none).
    pub pre_verified_gsa: GsaEmail,

    /// The verified GSA after this verification (empty if none).
    pub cur_gsa: GsaEmail,

    /// Set when the authority explicitly denied the requested mapping.
    pub denied: bool,
}

impl VerifyResult {
    pub fn changed(&self) -> bool {
        self.pre_verified_gsa != self.cur_gsa
    }
}

/// Builds the stable work-queue key for an object.
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

/// Splits a work-queue key into its namespace (if any) and name.
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}
