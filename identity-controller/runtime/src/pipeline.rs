use crate::queue::{Process, Queue};
use futures::prelude::*;
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;

/// A queue and the workers that drain it.
pub(crate) struct Pipeline<P> {
    pub(crate) queue: Queue,
    pub(crate) process: Arc<P>,
    pub(crate) workers: usize,
}

impl<P: Process> Pipeline<P> {
    /// Runs workers until shutdown is signaled, then holds shutdown until the
    /// keys in flight are finished.
    pub(crate) async fn serve(self, item_timeout: Duration, drain: drain::Watch) {
        let Self {
            queue,
            process,
            workers,
        } = self;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let run = queue.run(process, workers, item_timeout, stop_rx.map(|_| ()));
        tokio::pin!(run);

        tokio::select! {
            () = &mut run => {}
            handle = drain.signaled() => {
                let _ = stop_tx.send(());
                handle.release_after(run).await;
            }
        }
    }
}
