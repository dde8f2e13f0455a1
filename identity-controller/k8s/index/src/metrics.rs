use kube::Resource;
use parking_lot::RwLock;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

/// Wraps a shared index, recording each watch event it receives and the
/// resulting number of cached resources of that kind.
pub struct IndexMetrics<T> {
    inner: T,
    events: Family<EventLabels, Counter>,
    size: Family<KindLabels, Gauge>,
}

/// Reports how many resources of kind `R` an index holds.
pub trait SizedIndex<R> {
    fn size(&self) -> usize;
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    kind: String,
    event: Event,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum Event {
    Apply,
    Delete,
}

// === impl IndexMetrics ===

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Registry) -> Self {
        let events = Family::default();
        prom.register(
            "events",
            "Watch events applied to the index, by resource kind",
            events.clone(),
        );

        let size = Family::default();
        prom.register(
            "size",
            "Resources currently cached by the index, by kind",
            size.clone(),
        );

        Self {
            inner,
            events,
            size,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }
}

impl<T> IndexMetrics<Arc<RwLock<T>>> {
    /// Applies `update` to the wrapped index and records it as `event`.
    fn record<R>(&self, event: Event, update: impl FnOnce(&mut T))
    where
        R: Resource<DynamicType = ()>,
        T: SizedIndex<R>,
    {
        let kind = R::kind(&()).to_string();
        self.events
            .get_or_create(&EventLabels {
                kind: kind.clone(),
                event,
            })
            .inc();

        let mut index = self.inner.write();
        update(&mut index);
        let size = SizedIndex::<R>::size(&*index);
        drop(index);
        self.size.get_or_create(&KindLabels { kind }).set(size as i64);
    }
}

impl<T: Clone> Clone for IndexMetrics<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            events: self.events.clone(),
            size: self.size.clone(),
        }
    }
}

impl<R, T> kubert::index::IndexNamespacedResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    R: Resource<DynamicType = ()>,
    T: kubert::index::IndexNamespacedResource<R> + SizedIndex<R>,
{
    fn apply(&mut self, resource: R) {
        self.record::<R>(Event::Apply, |index| {
            kubert::index::IndexNamespacedResource::apply(index, resource)
        });
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.record::<R>(Event::Delete, |index| {
            kubert::index::IndexNamespacedResource::<R>::delete(index, namespace, name)
        });
    }
}

impl<R, T> kubert::index::IndexClusterResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    R: Resource<DynamicType = ()>,
    T: kubert::index::IndexClusterResource<R> + SizedIndex<R>,
{
    fn apply(&mut self, resource: R) {
        self.record::<R>(Event::Apply, |index| {
            kubert::index::IndexClusterResource::apply(index, resource)
        });
    }

    fn delete(&mut self, name: String) {
        self.record::<R>(Event::Delete, |index| {
            kubert::index::IndexClusterResource::<R>::delete(index, name)
        });
    }
}
