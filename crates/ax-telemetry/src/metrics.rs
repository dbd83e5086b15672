use ahash::AHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A sorted list of key=value pairs distinguishing counter families.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    fn json_key(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Tracks the distribution of observed values across fixed buckets.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // Store sum as bits so we can do an atomic add on f64.
        loop {
            let current = self.sum.load(Ordering::Relaxed);
            let new = (f64::from_bits(current) + value).to_bits();
            if self
                .sum
                .compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}

// ---------------------------------------------------------------------------
// Metrics registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Metrics {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl Metrics {
    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let counters = self.counters.read().expect("metrics lock poisoned");
            if let Some(counter) = counters.get(&key) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write().expect("metrics lock poisoned");
        counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let histograms = self.histograms.read().expect("metrics lock poisoned");
            if let Some(histogram) = histograms.get(name) {
                histogram.observe(value);
                return;
            }
        }
        let mut histograms = self.histograms.write().expect("metrics lock poisoned");
        histograms
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    /// Snapshot all counters and histogram summaries as JSON.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let mut counters = serde_json::Map::new();
        for ((name, labels), value) in self.counters.read().expect("metrics lock poisoned").iter()
        {
            let key = if labels.0.is_empty() {
                name.clone()
            } else {
                format!("{name}{{{}}}", labels.json_key())
            };
            counters.insert(key, value.load(Ordering::Relaxed).into());
        }

        let mut histograms = serde_json::Map::new();
        for (name, histogram) in self.histograms.read().expect("metrics lock poisoned").iter() {
            histograms.insert(
                name.clone(),
                serde_json::json!({
                    "count": histogram.get_count(),
                    "sum": histogram.get_sum(),
                }),
            );
        }

        serde_json::json!({ "counters": counters, "histograms": histograms })
    }
}

/// Process-wide metrics registry.
pub fn global_metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::default)
}
