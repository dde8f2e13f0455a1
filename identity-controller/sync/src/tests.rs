use crate::*;
use ahash::AHashMap as HashMap;
use identity_controller_client::{self as client, Authority};
use identity_controller_core::{GsaEmail, ServiceAccount, VerifyResult, GSA_ANNOTATION, ZONE_LABEL};
use identity_controller_k8s_api::{self as k8s, ObjectMeta};
use identity_controller_k8s_index::{Index, Queues, SharedIndex, SnapshotRef};
use identity_controller_queue::{Enqueue, Process};
use maplit::btreemap;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

mod snapshot;

const GSA1: &str = "gsa1@p.iam.gserviceaccount.com";
const GSA2: &str = "gsa2@p.iam.gserviceaccount.com";
const GSA3: &str = "gsa3@p.iam.gserviceaccount.com";

#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

#[derive(Clone, Copy, Debug)]
enum Decision {
    Permit,
    Deny,
    Fail,
}

/// An authority whose decisions are set per ServiceAccount. Unknown
/// ServiceAccounts are denied.
#[derive(Default)]
struct MockAuthority {
    decisions: Mutex<HashMap<ServiceAccount, Decision>>,
    authorized: Mutex<Vec<(ServiceAccount, GsaEmail)>>,
    synced: Mutex<Vec<(String, String, Vec<GsaEmail>)>>,
    latency: Duration,
    fail_syncs: AtomicBool,
}

struct Fixture {
    index: SharedIndex,
    authority: Arc<MockAuthority>,
    verifier: Verifier,
    service_accounts: Arc<Recorder>,
    pods: Arc<Recorder>,
    nodes: Arc<Recorder>,
    snapshot: Arc<Recorder>,
}

// === impl Recorder ===

impl Enqueue for Recorder {
    fn enqueue_key(&self, key: &str) {
        self.0.lock().push(key.to_string());
    }
}

impl Recorder {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

// === impl MockAuthority ===

impl MockAuthority {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    fn decide(&self, ksa: &ServiceAccount, decision: Decision) {
        self.decisions.lock().insert(ksa.clone(), decision);
    }

    fn authorizations(&self) -> usize {
        self.authorized.lock().len()
    }

    fn take_syncs(&self) -> Vec<(String, String, Vec<GsaEmail>)> {
        std::mem::take(&mut *self.synced.lock())
    }
}

#[async_trait::async_trait]
impl Authority for MockAuthority {
    async fn authorize(&self, ksa: &ServiceAccount, gsa: &GsaEmail) -> Result<bool, client::Error> {
        self.authorized.lock().push((ksa.clone(), gsa.clone()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let decision = self
            .decisions
            .lock()
            .get(ksa)
            .copied()
            .unwrap_or(Decision::Deny);
        match decision {
            Decision::Permit => Ok(true),
            Decision::Deny => Ok(false),
            Decision::Fail => Err(client::Error::Protocol {
                ksa: ksa.clone(),
                gsa: gsa.clone(),
            }),
        }
    }

    async fn sync(&self, node: &str, zone: &str, gsas: &[GsaEmail]) -> Result<(), client::Error> {
        if self.fail_syncs.load(Ordering::SeqCst) {
            return Err(client::Error::InvalidUrl {
                url: "http://authority.test".to_string(),
            });
        }
        self.synced
            .lock()
            .push((node.to_string(), zone.to_string(), gsas.to_vec()));
        Ok(())
    }
}

// === impl Fixture ===

impl Fixture {
    fn new() -> Self {
        Self::with_authority(MockAuthority::default())
    }

    fn with_authority(authority: MockAuthority) -> Self {
        let service_accounts = Arc::new(Recorder::default());
        let pods = Arc::new(Recorder::default());
        let nodes = Arc::new(Recorder::default());
        let snapshot = Arc::new(Recorder::default());
        let index = Index::shared(
            SnapshotRef {
                namespace: "kube-system".to_string(),
                name: "workload-identity-verified-mappings".to_string(),
            },
            Queues {
                service_accounts: service_accounts.clone(),
                pods: pods.clone(),
                nodes: nodes.clone(),
                snapshot: snapshot.clone(),
            },
        );
        let authority = Arc::new(authority);
        let verifier = Verifier::new(index.clone(), authority.clone());
        Self {
            index,
            authority,
            verifier,
            service_accounts,
            pods,
            nodes,
            snapshot,
        }
    }

    /// Discards every notification recorded so far.
    fn clear(&self) {
        self.service_accounts.take();
        self.pods.take();
        self.nodes.take();
        self.snapshot.take();
    }

    fn apply_sa(&self, ns: &str, name: &str, gsa: Option<&str>) -> ServiceAccount {
        let sa = k8s::ServiceAccount {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                annotations: gsa.map(|gsa| btreemap! { GSA_ANNOTATION.to_string() => gsa.to_string() }),
                ..Default::default()
            },
            ..Default::default()
        };
        kubert::index::IndexNamespacedResource::apply(&mut *self.index.write(), sa);
        ServiceAccount::new(ns, name)
    }

    fn apply_pod(&self, ns: &str, name: &str, sa: &str, node: Option<&str>) {
        let pod = k8s::Pod {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(k8s::PodSpec {
                service_account_name: Some(sa.to_string()),
                node_name: node.map(Into::into),
                ..Default::default()
            }),
            status: None,
        };
        kubert::index::IndexNamespacedResource::apply(&mut *self.index.write(), pod);
    }

    fn delete_pod(&self, ns: &str, name: &str) {
        kubert::index::IndexNamespacedResource::<k8s::Pod>::delete(
            &mut *self.index.write(),
            ns.to_string(),
            name.to_string(),
        );
    }

    fn apply_node(&self, name: &str, zone: Option<&str>) {
        let node = k8s::Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: zone.map(|zone| btreemap! { ZONE_LABEL.to_string() => zone.to_string() }),
                ..Default::default()
            },
            ..Default::default()
        };
        kubert::index::IndexClusterResource::apply(&mut *self.index.write(), node);
    }

    fn delete_node(&self, name: &str) {
        kubert::index::IndexClusterResource::<k8s::Node>::delete(
            &mut *self.index.write(),
            name.to_string(),
        );
    }

    fn service_account_pipeline(&self) -> ServiceAccountPipeline {
        ServiceAccountPipeline::new(
            self.verifier.clone(),
            self.index.clone(),
            self.nodes.clone(),
            self.snapshot.clone(),
        )
    }

    fn pod_pipeline(&self) -> PodPipeline {
        PodPipeline::new(self.verifier.clone(), self.index.clone(), self.nodes.clone())
    }

    fn node_pipeline(&self, resync_period: Duration) -> NodePipeline {
        NodePipeline::new(
            self.verifier.clone(),
            self.index.clone(),
            self.authority.clone(),
            resync_period,
        )
    }
}

fn gsa(email: &str) -> GsaEmail {
    GsaEmail::new(email)
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn resync_enqueues_everything_known() {
    let f = Fixture::new();
    f.apply_sa("t", "ksa1", Some(GSA1));
    f.apply_sa("t", "ksa2", None);
    f.apply_node("n1", Some("z"));
    f.clear();

    let queues = Queues {
        service_accounts: f.service_accounts.clone(),
        pods: f.pods.clone(),
        nodes: f.nodes.clone(),
        snapshot: f.snapshot.clone(),
    };
    let resync = tokio::spawn(Resync::new(f.index.clone(), queues, Duration::from_secs(60)).run());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(f.service_accounts.take().is_empty(), "resync must wait a full period");

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(f.service_accounts.take(), vec!["t/ksa1", "t/ksa2"]);
    assert_eq!(f.nodes.take(), vec!["n1"]);
    assert_eq!(
        f.snapshot.take(),
        vec!["kube-system/workload-identity-verified-mappings"]
    );
    assert!(f.pods.take().is_empty());

    resync.abort();
}
