use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Metric families shared by every materialized store, labeled by document kind.
#[derive(Clone, Debug)]
pub struct Metrics {
    size: Family<KindLabels, Gauge>,
    applies: Family<KindLabels, Counter>,
    deletes: Family<KindLabels, Counter>,
    stale: Family<KindLabels, Counter>,
    restarts: Family<KindLabels, Counter>,
    writes: Family<KindLabels, Counter>,
    write_failures: Family<KindLabels, Counter>,
}

/// The metrics of a single document kind.
#[derive(Clone, Debug, Default)]
pub struct KindMetrics {
    pub(crate) size: Gauge,
    pub(crate) applies: Counter,
    pub(crate) deletes: Counter,
    pub(crate) stale: Counter,
    pub(crate) restarts: Counter,
    pub(crate) writes: Counter,
    pub(crate) write_failures: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: &'static str,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(prom: &mut Registry) -> Self {
        let size = Family::default();
        prom.register(
            "size",
            "Gauge of the number of documents in the store",
            size.clone(),
        );

        let applies = Family::default();
        prom.register(
            "applies",
            "Count of upserts applied to the store",
            applies.clone(),
        );

        let deletes = Family::default();
        prom.register(
            "deletes",
            "Count of tombstones applied to the store",
            deletes.clone(),
        );

        let stale = Family::default();
        prom.register(
            "stale_entries",
            "Count of entries skipped because a later entry was already applied under the same key",
            stale.clone(),
        );

        let restarts = Family::default();
        prom.register(
            "consumer_restarts",
            "Count of log consumer restarts",
            restarts.clone(),
        );

        let writes = Family::default();
        prom.register(
            "writes",
            "Count of writes appended to the log",
            writes.clone(),
        );

        let write_failures = Family::default();
        prom.register(
            "write_failures",
            "Count of writes that failed validation or could not be appended",
            write_failures.clone(),
        );

        Self {
            size,
            applies,
            deletes,
            stale,
            restarts,
            writes,
            write_failures,
        }
    }

    pub fn kind(&self, kind: &'static str) -> KindMetrics {
        let labels = KindLabels { kind };
        KindMetrics {
            size: self.size.get_or_create(&labels).clone(),
            applies: self.applies.get_or_create(&labels).clone(),
            deletes: self.deletes.get_or_create(&labels).clone(),
            stale: self.stale.get_or_create(&labels).clone(),
            restarts: self.restarts.get_or_create(&labels).clone(),
            writes: self.writes.get_or_create(&labels).clone(),
            write_failures: self.write_failures.get_or_create(&labels).clone(),
        }
    }
}

impl KindMetrics {
    pub fn restarts(&self) -> u64 {
        self.restarts.get()
    }
}
