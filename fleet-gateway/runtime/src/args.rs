use crate::{
    cluster::{
        CacheMetrics, ClientCaches, ClusterFetcher, ConfigMapFetcher, DelegatingOptions,
        LeafConnector, RulesReviewChecker, SingleClusterFetcher, DEFAULT_CONFIG_MAP,
    },
    fleet::{ClustersManager, FleetMetrics, ManagerConfig, SUBSCRIBER_CAPACITY},
    k8s::{
        config::{DialTimeouts, FlowControl, RequestTimeout},
        ConfigOption, GoDuration, KubeClientFactory, KubeClusterClient,
    },
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "fleet-gateway", about = "Multi-cluster Kubernetes access for a GitOps server")]
pub struct Args {
    #[clap(
        long,
        default_value = "fleet_gateway=info,warn",
        env = "FLEET_GATEWAY_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Where leaf clusters are listed: `single` serves only the cluster the
    /// gateway runs in, `config-map` reads them from the hub.
    #[clap(long, default_value = "single")]
    fleet_source: FleetSource,

    #[clap(long, default_value = "flux-system")]
    fleet_namespace: String,

    #[clap(long, default_value = DEFAULT_CONFIG_MAP)]
    fleet_config_map: String,

    #[clap(long, default_value = "30s")]
    fleet_refresh_interval: GoDuration,

    #[clap(long, default_value = "30s")]
    namespace_refresh_interval: GoDuration,

    #[clap(long, default_value = "30m")]
    user_namespace_ttl: GoDuration,

    #[clap(long, default_value = "30m")]
    client_ttl: GoDuration,

    #[clap(long, default_value = "30s")]
    cache_resolution: GoDuration,

    #[clap(long, default_value = "30s")]
    request_timeout: GoDuration,

    /// Serves reads from informer caches once a user's access to a kind has
    /// been confirmed.
    #[clap(long)]
    delegating_cache: bool,

    /// Probes each API server for flow control and only rate limits clients
    /// of servers that do not enforce it.
    #[clap(long)]
    flow_control_probe: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FleetSource {
    Single,
    ConfigMap,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            fleet_source,
            fleet_namespace,
            fleet_config_map,
            fleet_refresh_interval,
            namespace_refresh_interval,
            user_namespace_ttl,
            client_ttl,
            cache_resolution,
            request_timeout,
            delegating_cache,
            flow_control_probe,
        } = self;

        let mut prom = <Registry>::default();
        let fleet_metrics = FleetMetrics::register(prom.sub_registry_with_prefix("fleet"));
        let cache_metrics = CacheMetrics::register(prom.sub_registry_with_prefix("fleet"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let fetcher: Arc<dyn ClusterFetcher> = match fleet_source {
            FleetSource::Single => Arc::new(SingleClusterFetcher::new(kube::Config::infer().await?)),
            FleetSource::ConfigMap => Arc::new(ConfigMapFetcher::with_name(
                Arc::new(KubeClusterClient::new(runtime.client())),
                fleet_namespace,
                fleet_config_map,
            )),
        };

        let mut options: Vec<Arc<dyn ConfigOption>> = vec![
            Arc::new(DialTimeouts::default()),
            Arc::new(RequestTimeout::from_env()),
        ];
        if flow_control_probe {
            options.push(Arc::new(FlowControl));
        }

        let caches = Arc::new(
            ClientCaches::new(client_ttl.into(), cache_resolution.into())
                .with_metrics(cache_metrics),
        );
        let mut connector = LeafConnector::new(Arc::new(KubeClientFactory), caches.clone())
            .with_options(options);
        if delegating_cache {
            connector = connector.with_read_cache(DelegatingOptions::default());
        }
        let checker = RulesReviewChecker::new(Arc::new(KubeClientFactory));

        let manager = ClustersManager::new(
            fetcher,
            Arc::new(connector),
            Arc::new(checker),
            caches,
            ManagerConfig {
                fleet_refresh: fleet_refresh_interval.into(),
                namespace_refresh: namespace_refresh_interval.into(),
                user_namespace_ttl: user_namespace_ttl.into(),
                cache_resolution: cache_resolution.into(),
                request_timeout: request_timeout.into(),
                subscriber_capacity: SUBSCRIBER_CAPACITY,
            },
            fleet_metrics,
        );
        manager.start();

        let mut updates = manager.subscribe();
        tokio::spawn(
            async move {
                while let Some(update) = updates.recv().await {
                    info!(
                        added = update.added.len(),
                        removed = update.removed.len(),
                        "Fleet updated"
                    );
                }
            }
            .instrument(info_span!("fleet_updates")),
        );

        // Stop the manager's background work once shutdown is signaled.
        let drain = runtime.shutdown_handle();
        tokio::spawn(async move {
            let release = drain.signaled().await;
            release.release_after(manager.stop()).await;
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

impl std::str::FromStr for FleetSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(Self::Single),
            "config-map" | "configmap" => Ok(Self::ConfigMap),
            _ => bail!("invalid fleet source: {s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fleet_flags() {
        let args = Args::try_parse_from([
            "fleet-gateway",
            "--fleet-source=config-map",
            "--fleet-namespace=hub",
            "--fleet-refresh-interval=1m30s",
            "--delegating-cache",
        ])
        .expect("args must parse");
        assert_eq!(args.fleet_source, FleetSource::ConfigMap);
        assert_eq!(args.fleet_namespace, "hub");
        assert_eq!(args.fleet_config_map, DEFAULT_CONFIG_MAP);
        assert_eq!(
            std::time::Duration::from(args.fleet_refresh_interval),
            std::time::Duration::from_secs(90)
        );
        assert_eq!(
            std::time::Duration::from(args.user_namespace_ttl),
            std::time::Duration::from_secs(30 * 60)
        );
        assert!(args.delegating_cache);
        assert!(!args.flow_control_probe);
    }

    #[test]
    fn rejects_unknown_sources() {
        assert!(Args::try_parse_from(["fleet-gateway", "--fleet-source=everywhere"]).is_err());
    }
}
