//! Request and response bodies of the authority's JSON API.
//!
//! The legacy and current backends accept the same messages under different
//! field names.

use identity_controller_core::{GsaEmail, ServiceAccount};
use serde::{Deserialize, Serialize};

/// A protocol-independent KSA -> GSA mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub namespace: String,
    pub ksa_name: String,
    pub gsa_email: String,
}

pub(crate) struct AuthorizeResponse {
    pub permitted: Vec<Mapping>,
    pub denied: Vec<Mapping>,
}

impl Mapping {
    pub(crate) fn new(ksa: &ServiceAccount, gsa: &GsaEmail) -> Self {
        Self {
            namespace: ksa.namespace.clone(),
            ksa_name: ksa.name.clone(),
            gsa_email: gsa.to_string(),
        }
    }
}

pub(crate) mod current {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Mapping {
        pub namespace: String,
        pub ksa_name: String,
        pub gsa_email: String,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AuthorizeRequest {
        pub requested_mappings: Vec<Mapping>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AuthorizeResponse {
        #[serde(default)]
        pub permitted_mappings: Vec<Mapping>,
        #[serde(default)]
        pub denied_mappings: Vec<Mapping>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SyncRequest<'a> {
        pub node: &'a str,
        pub zone: &'a str,
        pub gsa_emails: Vec<&'a str>,
    }

    impl From<super::Mapping> for Mapping {
        fn from(m: super::Mapping) -> Self {
            Self {
                namespace: m.namespace,
                ksa_name: m.ksa_name,
                gsa_email: m.gsa_email,
            }
        }
    }

    impl From<Mapping> for super::Mapping {
        fn from(m: Mapping) -> Self {
            Self {
                namespace: m.namespace,
                ksa_name: m.ksa_name,
                gsa_email: m.gsa_email,
            }
        }
    }

    impl From<AuthorizeResponse> for super::AuthorizeResponse {
        fn from(rsp: AuthorizeResponse) -> Self {
            Self {
                permitted: rsp.permitted_mappings.into_iter().map(Into::into).collect(),
                denied: rsp.denied_mappings.into_iter().map(Into::into).collect(),
            }
        }
    }
}

pub(crate) mod legacy {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Mapping {
        pub kubernetes_namespace: String,
        pub kubernetes_service_account: String,
        pub google_service_account: String,
    }

    #[derive(Debug, Serialize)]
    pub struct AuthorizeRequest {
        pub mappings: Vec<Mapping>,
    }

    #[derive(Debug, Deserialize)]
    pub struct AuthorizeResponse {
        #[serde(default)]
        pub permitted: Vec<Mapping>,
        #[serde(default)]
        pub denied: Vec<Mapping>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SyncRequest<'a> {
        pub node_name: &'a str,
        pub zone: &'a str,
        pub google_service_accounts: Vec<&'a str>,
    }

    impl From<super::Mapping> for Mapping {
        fn from(m: super::Mapping) -> Self {
            Self {
                kubernetes_namespace: m.namespace,
                kubernetes_service_account: m.ksa_name,
                google_service_account: m.gsa_email,
            }
        }
    }

    impl From<Mapping> for super::Mapping {
        fn from(m: Mapping) -> Self {
            Self {
                namespace: m.kubernetes_namespace,
                ksa_name: m.kubernetes_service_account,
                gsa_email: m.google_service_account,
            }
        }
    }

    impl From<AuthorizeResponse> for super::AuthorizeResponse {
        fn from(rsp: AuthorizeResponse) -> Self {
            Self {
                permitted: rsp.permitted.into_iter().map(Into::into).collect(),
                denied: rsp.denied.into_iter().map(Into::into).collect(),
            }
        }
    }
}
