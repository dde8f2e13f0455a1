use identity_controller_k8s_index::{Queues, SharedIndex};
use std::time::Duration;
use tokio::time;
use tracing::debug;

/// Periodically re-enqueues every known ServiceAccount, node and the
/// snapshot so that missed or failed notifications eventually converge.
pub struct Resync {
    index: SharedIndex,
    queues: Queues,
    period: Duration,
}

impl Resync {
    pub fn new(index: SharedIndex, queues: Queues, period: Duration) -> Self {
        Self {
            index,
            queues,
            period,
        }
    }

    pub async fn run(self) {
        let mut interval = time::interval_at(time::Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.resync();
        }
    }

    fn resync(&self) {
        let (service_accounts, nodes, snapshot) = {
            let index = self.index.read();
            (
                index.service_accounts(),
                index.node_names(),
                index.snapshot().key(),
            )
        };
        debug!(
            service_accounts = service_accounts.len(),
            nodes = nodes.len(),
            "Resyncing"
        );
        for sa in &service_accounts {
            self.queues.service_accounts.enqueue_key(&sa.key());
        }
        for node in &nodes {
            self.queues.nodes.enqueue_key(node);
        }
        self.queues.snapshot.enqueue_key(&snapshot);
    }
}
