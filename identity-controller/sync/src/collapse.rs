use ahash::AHashMap as HashMap;
use futures::{
    future::{BoxFuture, Shared},
    prelude::*,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

type Call<T> = Shared<BoxFuture<'static, Option<T>>>;

/// Runs at most one computation per key at a time.
///
/// Callers that arrive while a computation for their key is in flight wait
/// for it and receive a copy of its result. The computation runs on its own
/// task, so it completes even if every caller goes away.
pub(crate) struct Collapse<T> {
    inflight: Arc<Mutex<HashMap<String, Call<T>>>>,
}

/// Removes a key from the in-flight map when its computation ends, including
/// when it panics.
struct Complete<T> {
    inflight: Arc<Mutex<HashMap<String, Call<T>>>>,
    key: String,
}

impl<T> Default for Collapse<T> {
    fn default() -> Self {
        Self {
            inflight: Default::default(),
        }
    }
}

impl<T> Collapse<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Returns `None` if the computation panicked or was cancelled.
    pub(crate) async fn run<F>(&self, key: &str, compute: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let call = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(call) => {
                    trace!(%key, "Joining in-flight call");
                    call.clone()
                }
                None => {
                    let complete = Complete {
                        inflight: self.inflight.clone(),
                        key: key.to_string(),
                    };
                    let task = tokio::spawn(async move {
                        let _complete = complete;
                        compute.await
                    });
                    let call = task.map(Result::ok).boxed().shared();
                    inflight.insert(key.to_string(), call.clone());
                    call
                }
            }
        };
        call.await
    }

    #[cfg(test)]
    pub(crate) fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl<T> Drop for Complete<T> {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.key);
    }
}
