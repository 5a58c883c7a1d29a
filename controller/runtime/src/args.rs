use crate::{
    controller,
    core::{
        event_bus::EventBus, Clock, Config, ReconcilerMetrics, Reconciler, ResourceName,
        RetryMetrics, RetryPolicy, ScaleMetrics, StatusWriter,
    },
    k8s::{annotations, Pod},
    kube_client::{CacheSync, CacheSyncMetrics, KubePodClient},
    lease,
    logging::LogSettings,
    watch::Watch,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::{reflector, watcher};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, Instrument};

// The maximum number of reconcile triggers to buffer between the watch and
// the work queue. The queue deduplicates pods, so this only bounds bursts.
const TRIGGER_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Parser)]
#[clap(
    name = "startup-scaler",
    about = "Scales container resources down in place once startup completes",
    after_help = "Metrics (/metrics) and probes (/live, /ready) share the --admin-addr \
                  listener. No profiling endpoint is served."
)]
pub struct Args {
    /// A tracing filter. Overrides `--log-v` when set.
    #[clap(long, env = "STARTUP_SCALER_LOG")]
    log_level: Option<String>,

    /// Controller log verbosity: 0 (info), 1 (debug), or 2 (trace).
    #[clap(long, default_value = "0", value_parser = clap::value_parser!(u8).range(0..=2))]
    log_v: u8,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(
        long,
        default_value = "true",
        action = clap::ArgAction::Set,
        env = "STARTUP_SCALER_LEADER_ELECTION_ENABLED"
    )]
    leader_election_enabled: bool,

    #[clap(
        long,
        default_value = "startup-scaler",
        env = "STARTUP_SCALER_LEADER_ELECTION_RESOURCE_NAMESPACE"
    )]
    leader_election_resource_namespace: String,

    /// How often successfully reconciled pods are reconciled again.
    #[clap(long, default_value = "60", env = "STARTUP_SCALER_CACHE_SYNC_PERIOD_MINS")]
    cache_sync_period_mins: u64,

    #[clap(
        long,
        default_value = "10",
        env = "STARTUP_SCALER_GRACEFUL_SHUTDOWN_TIMEOUT_SECS"
    )]
    graceful_shutdown_timeout_secs: u64,

    #[clap(long, default_value = "1", env = "STARTUP_SCALER_REQUEUE_DURATION_SECS")]
    requeue_duration_secs: u64,

    #[clap(long, default_value = "10", env = "STARTUP_SCALER_MAX_CONCURRENT_RECONCILES")]
    max_concurrent_reconciles: u16,

    #[clap(long, default_value = "3", env = "STARTUP_SCALER_STANDARD_RETRY_ATTEMPTS")]
    standard_retry_attempts: u32,

    #[clap(long, default_value = "1", env = "STARTUP_SCALER_STANDARD_RETRY_DELAY_SECS")]
    standard_retry_delay_secs: u64,

    /// Command startup resources even when the container's current resources
    /// match neither the startup nor the post-startup values.
    #[clap(long, env = "STARTUP_SCALER_SCALE_WHEN_UNKNOWN_RESOURCES")]
    scale_when_unknown_resources: bool,

    /// Resources the controller may scale.
    #[clap(long, default_value = "cpu,memory", env = "STARTUP_SCALER_SCALE_RESOURCES")]
    scale_resources: ResourceNames,

    /// How long a write waits for the informer cache to observe it.
    #[clap(long, default_value = "3000", env = "STARTUP_SCALER_CACHE_SYNC_TIMEOUT_MS")]
    cache_sync_timeout_ms: u64,

    /// A resize error whose message contains this text is treated as a resize
    /// still in progress. Empty disables the match.
    #[clap(
        long,
        default_value = "attempting to resize memory limit",
        env = "STARTUP_SCALER_RESIZE_AWAITING_MEMORY_MESSAGE"
    )]
    resize_awaiting_memory_message: String,
}

#[derive(Clone, Debug)]
struct ResourceNames(Vec<ResourceName>);

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_v,
            log_format,
            client,
            admin,
            leader_election_enabled,
            leader_election_resource_namespace,
            cache_sync_period_mins,
            graceful_shutdown_timeout_secs,
            requeue_duration_secs,
            max_concurrent_reconciles,
            standard_retry_attempts,
            standard_retry_delay_secs,
            scale_when_unknown_resources,
            scale_resources: ResourceNames(enabled_resources),
            cache_sync_timeout_ms,
            resize_awaiting_memory_message,
        } = self;

        let log_filter = LogSettings {
            filter: log_level,
            verbosity: log_v,
        }
        .filter()?;

        let config = Config {
            enabled_resources,
            retry: RetryPolicy::new(
                standard_retry_attempts,
                Duration::from_secs(standard_retry_delay_secs),
            ),
            requeue_after: Duration::from_secs(requeue_duration_secs),
            resync_after: Duration::from_secs(cache_sync_period_mins * 60),
            scale_when_unknown_resources,
            awaiting_memory_message: resize_awaiting_memory_message,
        };

        let mut prom = <Registry>::default();
        let reconciler_metrics =
            ReconcilerMetrics::register(prom.sub_registry_with_prefix("reconciler"));
        let retry_metrics = RetryMetrics::register(prom.sub_registry_with_prefix("retrykubeapi"));
        let scale_metrics = ScaleMetrics::register(prom.sub_registry_with_prefix("scale"));
        let cache_metrics =
            CacheSyncMetrics::register(prom.sub_registry_with_prefix("informercache"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_filter, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;
        tracing::info!(?config, "Starting");

        let leadership = match lease_identity(
            leader_election_enabled,
            std::env::var("HOSTNAME").ok(),
        )? {
            Some(hostname) => {
                let claims =
                    lease::init(&runtime, &leader_election_resource_namespace, &hostname).await?;
                Some((claims, hostname))
            }
            None => {
                tracing::info!("Leader election disabled");
                None
            }
        };

        let (cache, writer) = reflector::store::<Pod>();
        let client = KubePodClient::new(
            runtime.client(),
            CacheSync::new(cache.clone(), cache_metrics)
                .with_timeout(Duration::from_millis(cache_sync_timeout_ms)),
            retry_metrics,
        );
        let reconciler = Arc::new(Reconciler::new(
            config,
            Arc::new(client),
            StatusWriter::new(scale_metrics, Clock::default()),
            reconciler_metrics.clone(),
        ));

        let (triggers_tx, triggers_rx) = mpsc::channel(TRIGGER_QUEUE_SIZE);
        let watch = Watch::new(
            writer,
            Arc::new(EventBus::default()),
            reconciler_metrics,
            triggers_tx,
        );
        let pods = runtime.watch_all::<Pod>(
            watcher::Config::default().labels(&format!("{}=true", annotations::ENABLED_LABEL)),
        );

        let settings = controller::Settings {
            concurrency: max_concurrent_reconciles,
            graceful_shutdown_timeout: Duration::from_secs(graceful_shutdown_timeout_secs),
        };
        let drain = runtime.shutdown_handle();
        let mut leading = leadership.clone();
        tokio::spawn(
            async move {
                if let Some((claims, identity)) = leading.as_mut() {
                    tokio::select! {
                        res = lease::acquired(claims, identity) => {
                            if let Err(error) = res {
                                tracing::error!(%error, "Failed to acquire leadership lease");
                                return;
                            }
                        }
                        _ = drain.clone().signaled() => return,
                    }
                }
                tokio::spawn(watch.run(pods).instrument(info_span!("pods")));
                controller::run(cache, triggers_rx, reconciler, settings, drain).await;
            }
            .instrument(info_span!("controller")),
        );

        let lost = async move {
            match leadership {
                Some((claims, hostname)) => lease::lost(claims, &hostname).await,
                None => future::pending().await,
            }
        };

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
            res = lost => {
                res?;
                bail!("Lost leadership lease");
            }
        }

        Ok(())
    }
}

/// The pod name identifies this replica in the lease. It is only required
/// when leader election is enabled.
fn lease_identity(
    leader_election_enabled: bool,
    hostname: Option<String>,
) -> Result<Option<String>> {
    if !leader_election_enabled {
        return Ok(None);
    }
    hostname
        .filter(|h| !h.is_empty())
        .map(Some)
        .context("Failed to fetch `HOSTNAME` environment variable")
}

impl std::str::FromStr for ResourceNames {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let mut names = s
            .split(',')
            .filter(|n| !n.trim().is_empty())
            .map(|n| n.parse().map_err(anyhow::Error::msg))
            .collect::<Result<Vec<ResourceName>>>()?;
        names.sort();
        names.dedup();
        if names.is_empty() {
            bail!("at least one resource must be enabled");
        }
        Ok(Self(names))
    }
}
