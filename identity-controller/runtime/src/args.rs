use crate::{
    client::{self, AuthorityMetrics, HttpAuthority, Protocol},
    index::{Index, IndexMetrics, Queues, SnapshotRef},
    k8s, lease,
    pipeline::Pipeline,
    queue::{Queue, QueueMetrics, RateLimiter},
    sync::{
        ConfigMapStore, NodePipeline, PodPipeline, Resync, ServiceAccountPipeline,
        SnapshotPipeline, Verifier,
    },
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, instrument, Instrument};

const AUTHORITY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[clap(
    name = "identity-controller",
    about = "Verifies and distributes workload identity mappings"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "identity_controller=info,warn",
        env = "IDENTITY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Base URL of the authorization service.
    #[clap(long, env = "IDENTITY_CONTROLLER_AUTHORITY_URL")]
    authority_url: String,

    /// Field naming used on the wire: `current` or `legacy`.
    #[clap(long, default_value = "current")]
    authority_protocol: Protocol,

    /// Interval at which every ServiceAccount, node and the snapshot are
    /// reconciled even without changes.
    #[clap(long, default_value = "300", value_parser = clap::value_parser!(u64).range(1..))]
    resync_period_secs: u64,

    #[clap(long, default_value = "4")]
    service_account_workers: usize,

    #[clap(long, default_value = "4")]
    pod_workers: usize,

    #[clap(long, default_value = "4")]
    node_workers: usize,

    /// Upper bound on processing a single key before it is retried.
    #[clap(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    item_timeout_secs: u64,

    #[clap(long, default_value = "kube-system")]
    snapshot_namespace: String,

    #[clap(long, default_value = "workload-identity-verified-mappings")]
    snapshot_name: String,

    /// Namespace holding the write Lease.
    #[clap(long, default_value = "kube-system")]
    controller_namespace: String,
}

/// The pipelines started once this replica holds the write lease.
struct Pipelines {
    service_accounts: Pipeline<ServiceAccountPipeline>,
    pods: Pipeline<PodPipeline>,
    nodes: Pipeline<NodePipeline>,
    snapshot: Pipeline<SnapshotPipeline>,
    resync: Resync,
    item_timeout: Duration,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            authority_url,
            authority_protocol,
            resync_period_secs,
            service_account_workers,
            pod_workers,
            node_workers,
            item_timeout_secs,
            snapshot_namespace,
            snapshot_name,
            controller_namespace,
        } = self;
        let resync_period = Duration::from_secs(resync_period_secs);

        let mut prom = <Registry>::default();
        let queue_metrics = QueueMetrics::register(prom.sub_registry_with_prefix("queue"));
        let authority_metrics =
            AuthorityMetrics::register(prom.sub_registry_with_prefix("authority"));
        let index_registry = prom.sub_registry_with_prefix("index");

        let mk_queue = |name: &str| Queue::new(name, RateLimiter::default(), queue_metrics.clone());
        let service_accounts = mk_queue("serviceaccounts");
        let pods = mk_queue("pods");
        let nodes = mk_queue("nodes");
        let snapshot = mk_queue("snapshot");
        let queues = Queues {
            service_accounts: Arc::new(service_accounts.clone()),
            pods: Arc::new(pods.clone()),
            nodes: Arc::new(nodes.clone()),
            snapshot: Arc::new(snapshot.clone()),
        };

        // Build the index that caches the watched resources and notifies the
        // queues of changes.
        let index = Index::shared(
            SnapshotRef {
                namespace: snapshot_namespace.clone(),
                name: snapshot_name.clone(),
            },
            queues.clone(),
        );
        let metered = IndexMetrics::register(index.clone(), index_registry).shared();

        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("failed to fetch `HOSTNAME` environment variable")?;
        let claims = lease::init(&runtime, &controller_namespace, &hostname).await?;

        // Spawn resource watches. The index is kept warm on every replica so
        // that a new leader starts from a populated cache.

        let service_account_events =
            runtime.watch_all::<k8s::ServiceAccount>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(metered.clone(), service_account_events)
                .instrument(info_span!("serviceaccounts")),
        );

        let pod_events = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(metered.clone(), pod_events).instrument(info_span!("pods")),
        );

        let node_events = runtime.watch_all::<k8s::Node>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(metered, node_events).instrument(info_span!("nodes")),
        );

        let snapshot_events = runtime.watch_namespaced::<k8s::ConfigMap>(
            snapshot_namespace.clone(),
            watcher::Config::default().fields(&format!("metadata.name={snapshot_name}")),
        );
        tokio::spawn(
            kubert::index::namespaced(index.clone(), snapshot_events)
                .instrument(info_span!("snapshot")),
        );

        let authority = Arc::new(
            HttpAuthority::new(
                &authority_url,
                authority_protocol,
                client::Backoff::default(),
                AUTHORITY_REQUEST_TIMEOUT,
                authority_metrics,
            )
            .context("failed to build authority client")?,
        );
        let verifier = Verifier::new(index.clone(), authority.clone());
        let store = ConfigMapStore::new(runtime.client(), &snapshot_namespace, &snapshot_name);

        let pipelines = Pipelines {
            service_accounts: Pipeline {
                process: Arc::new(ServiceAccountPipeline::new(
                    verifier.clone(),
                    index.clone(),
                    queues.nodes.clone(),
                    queues.snapshot.clone(),
                )),
                queue: service_accounts,
                workers: service_account_workers,
            },
            pods: Pipeline {
                process: Arc::new(PodPipeline::new(
                    verifier.clone(),
                    index.clone(),
                    queues.nodes.clone(),
                )),
                queue: pods,
                workers: pod_workers,
            },
            nodes: Pipeline {
                process: Arc::new(NodePipeline::new(
                    verifier.clone(),
                    index.clone(),
                    authority,
                    resync_period,
                )),
                queue: nodes,
                workers: node_workers,
            },
            snapshot: Pipeline {
                process: Arc::new(SnapshotPipeline::new(verifier, Arc::new(store))),
                queue: snapshot,
                workers: 1,
            },
            resync: Resync::new(index, queues, resync_period),
            item_timeout: Duration::from_secs(item_timeout_secs),
        };
        tokio::spawn(controller(
            pipelines,
            claims.clone(),
            hostname.clone(),
            runtime.shutdown_handle(),
        ));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting. A replica that loses the lease exits so
        // that it never writes alongside the new holder.
        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
            () = lease::lost(claims, &hostname) => bail!("Lost the write lease"),
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(%hostname))]
async fn controller(
    pipelines: Pipelines,
    mut claims: tokio::sync::watch::Receiver<Arc<kubert::lease::Claim>>,
    hostname: String,
    drain: drain::Watch,
) {
    info!("Waiting for the write lease");
    tokio::select! {
        res = lease::claimed(&mut claims, &hostname) => {
            if let Err(error) = res {
                tracing::error!(%error, "Lease claims ended");
                return;
            }
        }
        _release = drain.clone().signaled() => return,
    }
    info!("Claimed the write lease; starting workers");

    let Pipelines {
        service_accounts,
        pods,
        nodes,
        snapshot,
        resync,
        item_timeout,
    } = pipelines;
    let resync = tokio::spawn(resync.run().instrument(info_span!("resync")));

    tokio::join!(
        service_accounts
            .serve(item_timeout, drain.clone())
            .instrument(info_span!("serviceaccounts")),
        pods.serve(item_timeout, drain.clone())
            .instrument(info_span!("pods")),
        nodes
            .serve(item_timeout, drain.clone())
            .instrument(info_span!("nodes")),
        snapshot
            .serve(item_timeout, drain)
            .instrument(info_span!("snapshot")),
    );
    resync.abort();
}
