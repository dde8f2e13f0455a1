use crate::{Error, Verifier};
use ahash::AHashMap as HashMap;
use identity_controller_client::Authority;
use identity_controller_core::GsaEmail;
use identity_controller_k8s_index::SharedIndex;
use identity_controller_queue::Process;
use parking_lot::Mutex;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// The minimum time between two `sync` calls for the same node.
pub const DEBOUNCE_INTERVAL: Duration = Duration::from_secs(10);

/// Reports the set of verified GSAs used on each node to the authority.
pub struct NodePipeline {
    verifier: Verifier,
    index: SharedIndex,
    authority: Arc<dyn Authority>,
    states: Mutex<HashMap<String, Arc<tokio::sync::Mutex<NodeGsaState>>>>,
    resync_period: Duration,
    debounce: Duration,
}

/// What was last reported to the authority for a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeGsaState {
    last_sent_gsas: Vec<GsaEmail>,
    last_sent_at: Option<Instant>,
}

// === impl NodePipeline ===

impl NodePipeline {
    pub fn new(
        verifier: Verifier,
        index: SharedIndex,
        authority: Arc<dyn Authority>,
        resync_period: Duration,
    ) -> Self {
        Self {
            verifier,
            index,
            authority,
            states: Default::default(),
            resync_period,
            debounce: DEBOUNCE_INTERVAL,
        }
    }

    /// Returns the GSAs last reported for `node`, if any were.
    #[cfg(test)]
    pub(crate) async fn last_sent(&self, node: &str) -> Option<Vec<GsaEmail>> {
        let state = self.states.lock().get(node).cloned()?;
        let state = state.lock().await;
        state.last_sent_at.map(|_| state.last_sent_gsas.clone())
    }

    fn state(&self, node: &str) -> Arc<tokio::sync::Mutex<NodeGsaState>> {
        self.states
            .lock()
            .entry(node.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait::async_trait]
impl Process for NodePipeline {
    type Error = Error;

    async fn process(&self, node: &str) -> Result<(), Error> {
        let zone = self.index.read().node(node).map(|n| n.zone.clone());
        let zone = match zone {
            None => {
                debug!(%node, "Node deleted");
                self.states.lock().remove(node);
                return Ok(());
            }
            Some(None) => return Err(Error::MissingZone(node.to_string())),
            Some(Some(zone)) => zone,
        };

        let pods = self.index.read().pods_on_node(node);
        let mut gsas = BTreeSet::new();
        for (pod, ksa) in pods {
            match self.verifier.verified_gsa(&ksa).await {
                Ok(gsa) if gsa.is_empty() => trace!(%pod, %ksa, "No verified GSA"),
                Ok(gsa) => {
                    gsas.insert(gsa);
                }
                Err(error) => warn!(%pod, %ksa, %error, "Skipping pod"),
            }
        }
        if gsas.is_empty() {
            debug!(%node, "No verified GSAs in use");
            return Ok(());
        }

        let state = self.state(node);
        let mut state = state.lock().await;
        state
            .sync(
                &*self.authority,
                node,
                &zone,
                gsas.into_iter().collect(),
                self.resync_period,
                self.debounce,
            )
            .await
    }
}

// === impl NodeGsaState ===

impl NodeGsaState {
    /// Sends `gsas` unless they were already sent within `resync_period`.
    ///
    /// `gsas` must be sorted and free of duplicates.
    pub async fn sync(
        &mut self,
        authority: &dyn Authority,
        node: &str,
        zone: &str,
        gsas: Vec<GsaEmail>,
        resync_period: Duration,
        debounce: Duration,
    ) -> Result<(), Error> {
        let elapsed = self.last_sent_at.map(|at| at.elapsed());
        if let Some(elapsed) = elapsed {
            if gsas == self.last_sent_gsas && elapsed < resync_period {
                trace!(%node, "GSAs already reported");
                return Ok(());
            }
            if elapsed < debounce {
                return Err(Error::Debounced {
                    node: node.to_string(),
                    elapsed,
                    debounce,
                });
            }
        }

        authority
            .sync(node, zone, &gsas)
            .await
            .map_err(|source| Error::Sync {
                node: node.to_string(),
                source,
            })?;
        info!(%node, %zone, gsas = gsas.len(), "Reported GSAs");
        self.last_sent_gsas = gsas;
        self.last_sent_at = Some(Instant::now());
        Ok(())
    }
}
