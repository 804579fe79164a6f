use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct FleetMetrics {
    pub(crate) clusters: Gauge,
    pub(crate) fetch_failures: Counter,
    pub(crate) updates: Counter,
    pub(crate) dropped_updates: Counter,
    pub(crate) namespace_failures: Family<ClusterLabels, Counter>,
    pub(crate) user_namespace_refreshes: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct ClusterLabels {
    pub(crate) cluster: String,
}

impl FleetMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let clusters = Gauge::default();
        prom.register(
            "clusters",
            "Gauge of the number of clusters in the fleet",
            clusters.clone(),
        );

        let fetch_failures = Counter::default();
        prom.register(
            "fetch_failures",
            "Count of failed fleet fetches",
            fetch_failures.clone(),
        );

        let updates = Counter::default();
        prom.register(
            "updates",
            "Count of fleet membership changes",
            updates.clone(),
        );

        let dropped_updates = Counter::default();
        prom.register(
            "dropped_updates",
            "Count of fleet updates dropped by lagging subscribers",
            dropped_updates.clone(),
        );

        let namespace_failures = Family::default();
        prom.register(
            "namespace_failures",
            "Count of failed namespace listings by cluster",
            namespace_failures.clone(),
        );

        let user_namespace_refreshes = Counter::default();
        prom.register(
            "user_namespace_refreshes",
            "Count of user namespace refreshes",
            user_namespace_refreshes.clone(),
        );

        Self {
            clusters,
            fetch_failures,
            updates,
            dropped_updates,
            namespace_failures,
            user_namespace_refreshes,
        }
    }

    pub(crate) fn namespace_failed(&self, cluster: &str) {
        self.namespace_failures
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
            })
            .inc();
    }
}
