use super::*;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

/// An in-memory store that can be told to reject updates.
#[derive(Default)]
struct MemoryStore {
    current: Mutex<Option<Snapshot>>,
    writes: Mutex<usize>,
    reject_updates: AtomicBool,
}

#[async_trait::async_trait]
impl SnapshotStore for MemoryStore {
    async fn get(&self) -> anyhow::Result<Option<Snapshot>> {
        Ok(self.current.lock().clone())
    }

    async fn create(&self, mappings: String) -> anyhow::Result<()> {
        let mut current = self.current.lock();
        anyhow::ensure!(current.is_none(), "already exists");
        *current = Some(Snapshot {
            resource_version: Some("1".to_string()),
            mappings: Some(mappings),
        });
        *self.writes.lock() += 1;
        Ok(())
    }

    async fn update(&self, observed: &Snapshot, mappings: String) -> anyhow::Result<()> {
        anyhow::ensure!(!self.reject_updates.load(Ordering::SeqCst), "conflict");
        let mut current = self.current.lock();
        let stored = current.as_mut().ok_or_else(|| anyhow::anyhow!("not found"))?;
        anyhow::ensure!(stored.resource_version == observed.resource_version, "conflict");
        let version = stored
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        *stored = Snapshot {
            resource_version: Some((version + 1).to_string()),
            mappings: Some(mappings),
        };
        *self.writes.lock() += 1;
        Ok(())
    }

    async fn delete(&self) -> anyhow::Result<()> {
        self.current.lock().take();
        Ok(())
    }
}

impl MemoryStore {
    fn mappings(&self) -> Option<BTreeMap<String, String>> {
        let current = self.current.lock().clone()?;
        Some(serde_json::from_str(&current.mappings?).expect("snapshot must be valid JSON"))
    }

    fn writes(&self) -> usize {
        *self.writes.lock()
    }
}

fn mk_pipeline(f: &Fixture) -> (SnapshotPipeline, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    (SnapshotPipeline::new(f.verifier.clone(), store.clone()), store)
}

#[test]
fn rendered_keys_are_sorted() {
    let verified = btreemap! {
        ServiceAccount::new("a", "x") => gsa(GSA1),
        ServiceAccount::new("a-b", "x") => gsa(GSA2),
    };
    assert_eq!(
        render(&verified).unwrap(),
        format!(r#"{{"a-b/x":"{GSA2}","a/x":"{GSA1}"}}"#)
    );
    assert_eq!(render(&BTreeMap::new()).unwrap(), "{}");
}

#[tokio::test(flavor = "current_thread")]
async fn snapshot_converges_on_verified_mappings() {
    let f = Fixture::new();
    let ksa1 = f.apply_sa("t", "ksa1", Some(GSA1));
    let ksa2 = f.apply_sa("t", "ksa2", Some(GSA2));
    let ksa3 = f.apply_sa("t", "ksa3", Some(GSA3));
    f.apply_sa("t", "ksa4", None);
    f.authority.decide(&ksa1, Decision::Permit);
    f.authority.decide(&ksa2, Decision::Permit);
    f.authority.decide(&ksa3, Decision::Deny);

    let (pipeline, store) = mk_pipeline(&f);
    pipeline
        .process("kube-system/workload-identity-verified-mappings")
        .await
        .expect("must reconcile");
    assert_eq!(
        store.mappings(),
        Some(btreemap! {
            "t/ksa1".to_string() => GSA1.to_string(),
            "t/ksa2".to_string() => GSA2.to_string(),
        })
    );
    assert_eq!(store.writes(), 1);

    // Reconciling an up-to-date snapshot writes nothing.
    pipeline
        .process("kube-system/workload-identity-verified-mappings")
        .await
        .expect("must reconcile");
    assert_eq!(store.writes(), 1);

    // A revoked mapping is removed.
    f.authority.decide(&ksa2, Decision::Deny);
    f.verifier.force_verify(&ksa2).await.expect("must verify");
    pipeline
        .process("kube-system/workload-identity-verified-mappings")
        .await
        .expect("must reconcile");
    assert_eq!(
        store.mappings(),
        Some(btreemap! { "t/ksa1".to_string() => GSA1.to_string() })
    );
    assert_eq!(store.writes(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn empty_snapshot_is_still_written() {
    let f = Fixture::new();
    let (pipeline, store) = mk_pipeline(&f);
    pipeline.process("k").await.expect("must reconcile");
    assert_eq!(store.mappings(), Some(BTreeMap::new()));
}

#[tokio::test(flavor = "current_thread")]
async fn failed_updates_delete_the_snapshot() {
    let f = Fixture::new();
    let ksa1 = f.apply_sa("t", "ksa1", Some(GSA1));
    f.authority.decide(&ksa1, Decision::Permit);

    let (pipeline, store) = mk_pipeline(&f);
    *store.current.lock() = Some(Snapshot {
        resource_version: Some("7".to_string()),
        mappings: Some(r#"{"t/stale":"stale@p.iam.gserviceaccount.com"}"#.to_string()),
    });
    store.reject_updates.store(true, Ordering::SeqCst);

    let error = pipeline.process("k").await.expect_err("update must fail");
    assert!(matches!(error, Error::Snapshot(_)), "{error}");
    assert_eq!(store.mappings(), None, "a stale snapshot must not survive");

    // The retry recreates it.
    pipeline.process("k").await.expect("must reconcile");
    assert_eq!(
        store.mappings(),
        Some(btreemap! { "t/ksa1".to_string() => GSA1.to_string() })
    );
}

#[tokio::test(flavor = "current_thread")]
async fn external_edits_are_reverted() {
    let f = Fixture::new();
    let ksa1 = f.apply_sa("t", "ksa1", Some(GSA1));
    f.authority.decide(&ksa1, Decision::Permit);

    let (pipeline, store) = mk_pipeline(&f);
    pipeline.process("k").await.expect("must reconcile");
    if let Some(current) = store.current.lock().as_mut() {
        current.mappings = Some("{}".to_string());
    }

    pipeline.process("k").await.expect("must reconcile");
    assert_eq!(
        store.mappings(),
        Some(btreemap! { "t/ksa1".to_string() => GSA1.to_string() })
    );
    assert_eq!(store.writes(), 2);
}
