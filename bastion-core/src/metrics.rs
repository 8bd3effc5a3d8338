//! In-process metrics store.
//!
//! Counters, gauges and histograms keyed by `(name, sorted label set)`,
//! queried directly by tests and exported in the Prometheus text
//! exposition format for a monitoring endpoint.
//!
//! One store is constructed at startup and shared as `Arc<MetricsStore>`
//! by every component; nothing here is a global.
//!
//! # Histograms
//!
//! Each histogram series keeps cumulative bucket counts, a running sum and a
//! total count over every observation, plus a bounded window of raw samples
//! (`MetricsConfig::max_samples_per_series`, oldest dropped first) used for
//! percentile queries. A percentile query sorts the retained window, so it
//! costs O(n log n) in the number of retained samples.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;

use chrono::Utc;
use dashmap::DashMap;

use crate::config::MetricsConfig;
use crate::error::ConfigError;

/// Label set. A `BTreeMap` keeps labels sorted so label order at the call
/// site never produces a second series.
pub type Labels = BTreeMap<String, String>;

/// Identity of one time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub name: String,
    pub labels: Labels,
}

impl SeriesKey {
    pub fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// Kind of a metric family, as written in the `# TYPE` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ScalarSeries {
    value: f64,
    updated_at_ms: i64,
}

#[derive(Debug, Clone)]
struct HistogramSeries {
    samples: VecDeque<f64>,
    /// Cumulative counts, one per finite bucket bound.
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
    updated_at_ms: i64,
}

impl HistogramSeries {
    fn new(bucket_len: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            bucket_counts: vec![0; bucket_len],
            sum: 0.0,
            count: 0,
            updated_at_ms: 0,
        }
    }

    fn record(&mut self, value: f64, bounds: &[f64], max_samples: usize, now_ms: i64) {
        for (bound, count) in bounds.iter().zip(self.bucket_counts.iter_mut()) {
            if value <= *bound {
                *count += 1;
            }
        }
        self.sum += value;
        self.count += 1;
        self.samples.push_back(value);
        while self.samples.len() > max_samples {
            self.samples.pop_front();
        }
        self.updated_at_ms = now_ms;
    }
}

/// Point-in-time view of one histogram series.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// `(upper_bound, cumulative_count)` pairs ending with `+Inf`.
    pub buckets: Vec<(f64, u64)>,
    pub sum: f64,
    pub count: u64,
}

/// Process-wide metrics registry.
pub struct MetricsStore {
    config: MetricsConfig,
    counters: DashMap<SeriesKey, ScalarSeries>,
    gauges: DashMap<SeriesKey, ScalarSeries>,
    histograms: DashMap<SeriesKey, HistogramSeries>,
    help: DashMap<String, String>,
}

impl MetricsStore {
    pub fn new(config: MetricsConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
            help: DashMap::new(),
        })
    }

    /// Attach help text to a metric name for the `# HELP` header.
    pub fn describe(&self, name: &str, help: &str) {
        self.help.insert(name.to_string(), help.to_string());
    }

    /// Increment a counter by one.
    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.inc_counter_by(name, 1.0, labels);
    }

    /// Increment a counter. Counters never decrease, so negative or NaN
    /// increments are dropped.
    pub fn inc_counter_by(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        if !(value >= 0.0) {
            tracing::warn!(metric = name, value, "Ignoring negative or NaN counter increment");
            return;
        }
        let now_ms = Utc::now().timestamp_millis();
        let mut series = self
            .counters
            .entry(SeriesKey::new(name, labels))
            .or_insert(ScalarSeries {
                value: 0.0,
                updated_at_ms: now_ms,
            });
        series.value += value;
        series.updated_at_ms = now_ms;
    }

    pub fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.gauges.insert(
            SeriesKey::new(name, labels),
            ScalarSeries {
                value,
                updated_at_ms: Utc::now().timestamp_millis(),
            },
        );
    }

    /// Record one histogram observation.
    pub fn observe(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        if value.is_nan() {
            tracing::warn!(metric = name, "Ignoring NaN histogram observation");
            return;
        }
        let bounds = &self.config.buckets;
        self.histograms
            .entry(SeriesKey::new(name, labels))
            .or_insert_with(|| HistogramSeries::new(bounds.len()))
            .record(
                value,
                bounds,
                self.config.max_samples_per_series,
                Utc::now().timestamp_millis(),
            );
    }

    /// Current counter value; zero for a series never incremented.
    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.counters
            .get(&SeriesKey::new(name, labels))
            .map(|s| s.value)
            .unwrap_or(0.0)
    }

    pub fn get_gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges
            .get(&SeriesKey::new(name, labels))
            .map(|s| s.value)
    }

    pub fn get_histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramSnapshot> {
        self.histograms
            .get(&SeriesKey::new(name, labels))
            .map(|series| self.snapshot(&series))
    }

    /// Lowest retained sample such that at least `p` percent of retained
    /// samples are less than or equal to it.
    ///
    /// Uses the rank `ceil(p / 100 * n) - 1`, clamped to the sample range.
    pub fn get_percentile(&self, name: &str, p: f64, labels: &[(&str, &str)]) -> Option<f64> {
        let mut samples: Vec<f64> = {
            let series = self.histograms.get(&SeriesKey::new(name, labels))?;
            series.samples.iter().copied().collect()
        };
        percentile_of(&mut samples, p)
    }

    /// Render every series in the Prometheus text exposition format.
    ///
    /// Series are grouped by metric name with one `# HELP`/`# TYPE` pair per
    /// name. Each sample line carries the last-update timestamp in
    /// milliseconds.
    pub fn export_text(&self) -> String {
        let mut out = String::new();

        for (name, series) in group_scalars(&self.counters) {
            self.write_header(&mut out, &name, MetricKind::Counter);
            for (labels, s) in series {
                write_sample(&mut out, &name, &labels, None, s.value, s.updated_at_ms);
            }
        }

        for (name, series) in group_scalars(&self.gauges) {
            self.write_header(&mut out, &name, MetricKind::Gauge);
            for (labels, s) in series {
                write_sample(&mut out, &name, &labels, None, s.value, s.updated_at_ms);
            }
        }

        let mut histograms: BTreeMap<String, Vec<(Labels, HistogramSeries)>> = BTreeMap::new();
        for entry in self.histograms.iter() {
            histograms
                .entry(entry.key().name.clone())
                .or_default()
                .push((entry.key().labels.clone(), entry.value().clone()));
        }
        for (name, mut series) in histograms {
            series.sort_by(|a, b| a.0.cmp(&b.0));
            self.write_header(&mut out, &name, MetricKind::Histogram);
            let bucket_name = format!("{}_bucket", name);
            for (labels, hist) in series {
                let snapshot = self.snapshot(&hist);
                for (bound, count) in &snapshot.buckets {
                    write_sample(
                        &mut out,
                        &bucket_name,
                        &labels,
                        Some(("le", format_value(*bound))),
                        *count as f64,
                        hist.updated_at_ms,
                    );
                }
                write_sample(
                    &mut out,
                    &format!("{}_sum", name),
                    &labels,
                    None,
                    snapshot.sum,
                    hist.updated_at_ms,
                );
                write_sample(
                    &mut out,
                    &format!("{}_count", name),
                    &labels,
                    None,
                    snapshot.count as f64,
                    hist.updated_at_ms,
                );
            }
        }

        out
    }

    /// Drop every series. Help text is kept.
    pub fn reset(&self) {
        self.counters.clear();
        self.gauges.clear();
        self.histograms.clear();
    }

    fn snapshot(&self, series: &HistogramSeries) -> HistogramSnapshot {
        let mut buckets: Vec<(f64, u64)> = self
            .config
            .buckets
            .iter()
            .copied()
            .zip(series.bucket_counts.iter().copied())
            .collect();
        buckets.push((f64::INFINITY, series.count));
        HistogramSnapshot {
            buckets,
            sum: series.sum,
            count: series.count,
        }
    }

    fn write_header(&self, out: &mut String, name: &str, kind: MetricKind) {
        let help = self
            .help
            .get(name)
            .map(|h| h.value().clone())
            .unwrap_or_else(|| name.replace('_', " "));
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} {}", name, kind.as_str());
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self {
            config: MetricsConfig::default(),
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
            help: DashMap::new(),
        }
    }
}

impl std::fmt::Debug for MetricsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsStore")
            .field("counters", &self.counters.len())
            .field("gauges", &self.gauges.len())
            .field("histograms", &self.histograms.len())
            .finish()
    }
}

/// Ceil-rank percentile over `samples`, sorting them in place.
pub fn percentile_of(samples: &mut [f64], p: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(|a, b| a.total_cmp(b));
    let n = samples.len();
    let p = p.clamp(0.0, 100.0);
    let rank = (p / 100.0 * n as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    Some(samples[idx])
}

fn group_scalars(map: &DashMap<SeriesKey, ScalarSeries>) -> BTreeMap<String, Vec<(Labels, ScalarSeries)>> {
    let mut grouped: BTreeMap<String, Vec<(Labels, ScalarSeries)>> = BTreeMap::new();
    for entry in map.iter() {
        grouped
            .entry(entry.key().name.clone())
            .or_default()
            .push((entry.key().labels.clone(), *entry.value()));
    }
    for series in grouped.values_mut() {
        series.sort_by(|a, b| a.0.cmp(&b.0));
    }
    grouped
}

fn write_sample(
    out: &mut String,
    name: &str,
    labels: &Labels,
    extra: Option<(&str, String)>,
    value: f64,
    timestamp_ms: i64,
) {
    out.push_str(name);
    let mut pairs: Vec<(&str, String)> = labels
        .iter()
        .map(|(k, v)| (k.as_str(), escape_label_value(v)))
        .collect();
    if let Some(extra) = extra {
        pairs.push(extra);
    }
    if !pairs.is_empty() {
        out.push('{');
        for (i, (k, v)) in pairs.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{}=\"{}\"", k, v);
        }
        out.push('}');
    }
    let _ = writeln!(out, " {} {}", format_value(value), timestamp_ms);
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else if value.is_nan() {
        "NaN".to_string()
    } else {
        format!("{}", value)
    }
}
