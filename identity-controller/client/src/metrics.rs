use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct AuthorityMetrics {
    requests: Family<RpcLabels, Counter>,
    failures: Family<RpcLabels, Counter>,
    denials: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RpcLabels {
    rpc: &'static str,
}

impl AuthorityMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let requests = Family::default();
        prom.register(
            "requests",
            "Count of requests sent to the authority, including retries",
            requests.clone(),
        );

        let failures = Family::default();
        prom.register(
            "failures",
            "Count of requests that failed with a transport error or a non-2xx status",
            failures.clone(),
        );

        let denials = Counter::default();
        prom.register(
            "denials",
            "Count of mappings denied by the authority",
            denials.clone(),
        );

        Self {
            requests,
            failures,
            denials,
        }
    }

    pub(crate) fn request(&self, rpc: &'static str) {
        self.requests.get_or_create(&RpcLabels { rpc }).inc();
    }

    pub(crate) fn failure(&self, rpc: &'static str) {
        self.failures.get_or_create(&RpcLabels { rpc }).inc();
    }

    pub(crate) fn denial(&self) {
        self.denials.inc();
    }
}
