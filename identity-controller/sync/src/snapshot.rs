use crate::{Error, Verifier};
use anyhow::Context;
use identity_controller_core::{GsaEmail, ServiceAccount, IDENTITY_CONTROLLER_NAME};
use identity_controller_k8s_api::{self as k8s, Api, ConfigMap, DeleteParams, ObjectMeta, PostParams};
use identity_controller_queue::Process;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info, warn};

/// The `ConfigMap` data key holding the rendered mappings.
pub const MAPPINGS_KEY: &str = "mappings.json";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// The stored snapshot as last observed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Carried on updates so that a concurrent writer causes a conflict.
    pub resource_version: Option<String>,
    pub mappings: Option<String>,
}

/// Where the snapshot is persisted.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    async fn get(&self) -> anyhow::Result<Option<Snapshot>>;

    async fn create(&self, mappings: String) -> anyhow::Result<()>;

    async fn update(&self, current: &Snapshot, mappings: String) -> anyhow::Result<()>;

    async fn delete(&self) -> anyhow::Result<()>;
}

/// Mirrors the verified mappings into the snapshot store.
pub struct SnapshotPipeline {
    verifier: Verifier,
    store: Arc<dyn SnapshotStore>,
}

/// Stores the snapshot in a single `ConfigMap`.
#[derive(Clone)]
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
}

/// Renders mappings as a JSON object keyed by `namespace/name`, with sorted
/// keys.
pub fn render(verified: &BTreeMap<ServiceAccount, GsaEmail>) -> serde_json::Result<String> {
    let mappings = verified
        .iter()
        .map(|(ksa, gsa)| (ksa.key(), gsa.as_str()))
        .collect::<BTreeMap<_, _>>();
    serde_json::to_string(&mappings)
}

// === impl SnapshotPipeline ===

impl SnapshotPipeline {
    pub fn new(verifier: Verifier, store: Arc<dyn SnapshotStore>) -> Self {
        Self { verifier, store }
    }
}

#[async_trait::async_trait]
impl Process for SnapshotPipeline {
    type Error = Error;

    async fn process(&self, _key: &str) -> Result<(), Error> {
        let verified = self.verifier.all_verified().await;
        let mappings = render(&verified)?;

        let current = self.store.get().await.map_err(Error::Snapshot)?;
        match current {
            None => {
                self.store.create(mappings).await.map_err(Error::Snapshot)?;
                info!(mappings = verified.len(), "Created snapshot");
            }
            Some(current) if current.mappings.as_deref() == Some(mappings.as_str()) => {
                debug!("Snapshot is up to date");
            }
            Some(current) => {
                if let Err(error) = self.store.update(&current, mappings).await {
                    // A stale snapshot must not outlive a failed update.
                    warn!(%error, "Failed to update snapshot; deleting it");
                    self.store.delete().await.map_err(Error::Snapshot)?;
                    return Err(Error::Snapshot(error));
                }
                info!(mappings = verified.len(), "Updated snapshot");
            }
        }
        Ok(())
    }
}

// === impl ConfigMapStore ===

impl ConfigMapStore {
    pub fn new(client: k8s::Client, namespace: impl ToString, name: impl ToString) -> Self {
        let namespace = namespace.to_string();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            name: name.to_string(),
        }
    }

    fn config_map(&self, resource_version: Option<String>, mappings: String) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    IDENTITY_CONTROLLER_NAME.to_string(),
                )])),
                resource_version,
                ..Default::default()
            },
            data: Some(BTreeMap::from([(MAPPINGS_KEY.to_string(), mappings)])),
            ..Default::default()
        }
    }

    fn params() -> PostParams {
        PostParams {
            field_manager: Some(IDENTITY_CONTROLLER_NAME.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl SnapshotStore for ConfigMapStore {
    async fn get(&self) -> anyhow::Result<Option<Snapshot>> {
        let config_map = self
            .api
            .get_opt(&self.name)
            .await
            .with_context(|| format!("failed to get {}/{}", self.namespace, self.name))?;
        Ok(config_map.map(|cm| Snapshot {
            resource_version: cm.metadata.resource_version,
            mappings: cm.data.and_then(|mut data| data.remove(MAPPINGS_KEY)),
        }))
    }

    async fn create(&self, mappings: String) -> anyhow::Result<()> {
        self.api
            .create(&Self::params(), &self.config_map(None, mappings))
            .await
            .with_context(|| format!("failed to create {}/{}", self.namespace, self.name))?;
        Ok(())
    }

    async fn update(&self, current: &Snapshot, mappings: String) -> anyhow::Result<()> {
        let config_map = self.config_map(current.resource_version.clone(), mappings);
        self.api
            .replace(&self.name, &Self::params(), &config_map)
            .await
            .with_context(|| format!("failed to update {}/{}", self.namespace, self.name))?;
        Ok(())
    }

    async fn delete(&self) -> anyhow::Result<()> {
        self.api
            .delete(&self.name, &DeleteParams::default())
            .await
            .with_context(|| format!("failed to delete {}/{}", self.namespace, self.name))?;
        Ok(())
    }
}
