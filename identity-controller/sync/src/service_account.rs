use crate::{Error, Verifier};
use identity_controller_core::ServiceAccount;
use identity_controller_k8s_index::SharedIndex;
use identity_controller_queue::{Enqueue, Process};
use std::sync::Arc;
use tracing::{info, trace, warn};

/// Re-verifies ServiceAccounts and notifies the consumers of changed mappings.
pub struct ServiceAccountPipeline {
    verifier: Verifier,
    index: SharedIndex,
    nodes: Arc<dyn Enqueue>,
    snapshot: Arc<dyn Enqueue>,
    snapshot_key: String,
}

impl ServiceAccountPipeline {
    pub fn new(
        verifier: Verifier,
        index: SharedIndex,
        nodes: Arc<dyn Enqueue>,
        snapshot: Arc<dyn Enqueue>,
    ) -> Self {
        let snapshot_key = index.read().snapshot().key();
        Self {
            verifier,
            index,
            nodes,
            snapshot,
            snapshot_key,
        }
    }
}

#[async_trait::async_trait]
impl Process for ServiceAccountPipeline {
    type Error = Error;

    async fn process(&self, key: &str) -> Result<(), Error> {
        let ksa = match ServiceAccount::from_key(key) {
            Ok(ksa) => ksa,
            Err(error) => {
                warn!(%error, "Dropping key");
                return Ok(());
            }
        };

        let result = self.verifier.force_verify(&ksa).await?;
        if result.denied {
            return Err(Error::Denied(ksa));
        }
        if !result.changed() {
            trace!(%ksa, gsa = %result.cur_gsa, "Mapping unchanged");
            return Ok(());
        }

        info!(
            %ksa,
            from = %result.pre_verified_gsa,
            to = %result.cur_gsa,
            "Verified mapping changed",
        );
        self.snapshot.enqueue_key(&self.snapshot_key);
        let nodes = self.index.read().nodes_for_service_account(&ksa);
        for node in &nodes {
            self.nodes.enqueue_key(node);
        }
        Ok(())
    }
}
