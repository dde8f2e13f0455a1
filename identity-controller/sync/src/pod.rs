use crate::{Error, Verifier};
use identity_controller_core::split_key;
use identity_controller_k8s_index::SharedIndex;
use identity_controller_queue::{Enqueue, Process};
use std::sync::Arc;
use tracing::{debug, warn};

/// Notifies a pod's node once the pod's ServiceAccount has a verified GSA.
pub struct PodPipeline {
    verifier: Verifier,
    index: SharedIndex,
    nodes: Arc<dyn Enqueue>,
}

impl PodPipeline {
    pub fn new(verifier: Verifier, index: SharedIndex, nodes: Arc<dyn Enqueue>) -> Self {
        Self {
            verifier,
            index,
            nodes,
        }
    }
}

#[async_trait::async_trait]
impl Process for PodPipeline {
    type Error = Error;

    async fn process(&self, key: &str) -> Result<(), Error> {
        let (Some(namespace), name) = split_key(key) else {
            warn!(%key, "Dropping key without a namespace");
            return Ok(());
        };

        let pod = self.index.read().pod(namespace, name).cloned();
        let Some(pod) = pod else {
            debug!(%key, "Pod no longer exists");
            return Ok(());
        };

        let gsa = self.verifier.verified_gsa(&pod.service_account).await?;
        if gsa.is_empty() {
            debug!(%key, ksa = %pod.service_account, "No verified GSA");
            return Ok(());
        }
        let Some(node) = pod.node else {
            debug!(%key, "Pod is not running on a node");
            return Ok(());
        };

        debug!(%key, %node, %gsa, "Notifying node");
        self.nodes.enqueue_key(&node);
        Ok(())
    }
}
