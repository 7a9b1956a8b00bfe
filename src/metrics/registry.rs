use std::collections::BTreeSet;
use std::fmt::Write as _;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::model::EngineMetric;

use super::LatencyHistogram;
use super::histogram::QUANTILES;

const NAMESPACE: &str = "loadplane";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum LatencyScope {
    Collection,
    Plan(i64),
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct LatencyKey {
    collection_id: i64,
    run_id: i64,
    scope: LatencyScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct StatusKey {
    collection_id: i64,
    plan_id: i64,
    run_id: i64,
    engine_no: usize,
    label: String,
    status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ThreadsKey {
    collection_id: i64,
    plan_id: i64,
    run_id: i64,
    engine_no: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ResourceKey {
    collection_id: i64,
    plan_id: i64,
    engine_no: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ResourceSample {
    cpu: f64,
    mem: f64,
}

/// Destination for decoded engine metrics and engine health samples.
pub trait MetricsSink: Send + Sync {
    fn observe(&self, metric: &EngineMetric);

    fn record_resource_usage(
        &self,
        collection_id: i64,
        plan_id: i64,
        engine_no: &str,
        cpu: f64,
        mem: f64,
    );

    /// Drop every series recorded for a run.
    fn delete_run(&self, run_id: i64);

    /// Drop cpu and mem gauges of engines `0..engines`.
    fn delete_engine_health(&self, collection_id: i64, plan_id: i64, engines: usize);

    /// Run ids with series still held, paired with their collection.
    fn cached_runs(&self) -> Vec<(i64, i64)>;
}

/// In-process time series keyed the same way the exposition labels them.
#[derive(Debug, Default)]
pub struct TimeSeriesRegistry {
    latency: DashMap<LatencyKey, LatencyHistogram>,
    status: DashMap<StatusKey, u64>,
    threads: DashMap<ThreadsKey, f64>,
    resources: DashMap<ResourceKey, ResourceSample>,
    runs: DashMap<i64, i64>,
}

impl TimeSeriesRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn observe_latency(&self, key: LatencyKey, latency_ms: f64) {
        let result = match self.latency.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().record(latency_ms),
            Entry::Vacant(entry) => LatencyHistogram::new().and_then(|mut hist| {
                hist.record(latency_ms)?;
                entry.insert(hist);
                Ok(())
            }),
        };
        if let Err(err) = result {
            tracing::warn!("Dropping latency sample: {}", err);
        }
    }

    /// Count of status responses for one engine, label and status.
    #[must_use]
    pub fn status_count(
        &self,
        collection_id: i64,
        plan_id: i64,
        run_id: i64,
        engine_no: usize,
        label: &str,
        status: &str,
    ) -> u64 {
        let key = StatusKey {
            collection_id,
            plan_id,
            run_id,
            engine_no,
            label: label.to_owned(),
            status: status.to_owned(),
        };
        self.status.get(&key).map_or(0, |count| *count)
    }

    #[must_use]
    pub fn resource_gauges(&self, collection_id: i64, plan_id: i64, engine_no: &str) -> Option<(f64, f64)> {
        let key = ResourceKey {
            collection_id,
            plan_id,
            engine_no: engine_no.to_owned(),
        };
        self.resources.get(&key).map(|sample| (sample.cpu, sample.mem))
    }

    #[must_use]
    pub fn series_count(&self) -> usize {
        self.latency
            .len()
            .saturating_add(self.status.len())
            .saturating_add(self.threads.len())
            .saturating_add(self.resources.len())
    }

    /// Render every series in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the output buffer cannot be written.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut output = String::new();
        self.render_latency(&mut output)?;
        self.render_status(&mut output)?;
        self.render_threads(&mut output)?;
        self.render_resources(&mut output)?;
        Ok(output)
    }

    fn render_latency(&self, output: &mut String) -> std::fmt::Result {
        let mut series: Vec<(LatencyKey, LatencyHistogram)> = self
            .latency
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        series.sort_by(|left, right| left.0.cmp(&right.0));

        for (name, help) in [
            ("latency_collection", "Percentile latency of a collection"),
            ("latency_plan", "Percentile latency of a plan"),
            ("latency_label", "Percentile latency of a sampler label"),
        ] {
            write_header(output, name, help, "summary")?;
            for (key, hist) in &series {
                let (scope_name, labels) = match &key.scope {
                    LatencyScope::Collection => (
                        "latency_collection",
                        format!(
                            "collection_id=\"{}\",run_id=\"{}\"",
                            key.collection_id, key.run_id
                        ),
                    ),
                    LatencyScope::Plan(plan_id) => (
                        "latency_plan",
                        format!(
                            "collection_id=\"{}\",plan_id=\"{}\",run_id=\"{}\"",
                            key.collection_id, plan_id, key.run_id
                        ),
                    ),
                    LatencyScope::Label(label) => (
                        "latency_label",
                        format!(
                            "collection_id=\"{}\",label=\"{}\",run_id=\"{}\"",
                            key.collection_id,
                            escape_label(label),
                            key.run_id
                        ),
                    ),
                };
                if scope_name != name {
                    continue;
                }
                for quantile in QUANTILES {
                    writeln!(
                        output,
                        "{}_{}{{{},quantile=\"{}\"}} {}",
                        NAMESPACE,
                        name,
                        labels,
                        quantile,
                        hist.quantile(quantile)
                    )?;
                }
                writeln!(output, "{}_{}_sum{{{}}} {}", NAMESPACE, name, labels, hist.sum_ms())?;
                writeln!(output, "{}_{}_count{{{}}} {}", NAMESPACE, name, labels, hist.count())?;
            }
        }
        Ok(())
    }

    fn render_status(&self, output: &mut String) -> std::fmt::Result {
        let mut series: Vec<(StatusKey, u64)> = self
            .status
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        series.sort();
        write_header(
            output,
            "status_counter",
            "Responses grouped by response code",
            "counter",
        )?;
        for (key, count) in series {
            writeln!(
                output,
                "{}_status_counter{{collection_id=\"{}\",plan_id=\"{}\",run_id=\"{}\",engine_no=\"{}\",label=\"{}\",status=\"{}\"}} {}",
                NAMESPACE,
                key.collection_id,
                key.plan_id,
                key.run_id,
                key.engine_no,
                escape_label(&key.label),
                escape_label(&key.status),
                count
            )?;
        }
        Ok(())
    }

    fn render_threads(&self, output: &mut String) -> std::fmt::Result {
        let mut series: Vec<(ThreadsKey, f64)> = self
            .threads
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        series.sort_by(|left, right| left.0.cmp(&right.0));
        write_header(
            output,
            "threads_gauge",
            "Current number of threads running in the engine",
            "gauge",
        )?;
        for (key, threads) in series {
            writeln!(
                output,
                "{}_threads_gauge{{collection_id=\"{}\",plan_id=\"{}\",run_id=\"{}\",engine_no=\"{}\"}} {}",
                NAMESPACE, key.collection_id, key.plan_id, key.run_id, key.engine_no, threads
            )?;
        }
        Ok(())
    }

    fn render_resources(&self, output: &mut String) -> std::fmt::Result {
        let mut series: Vec<(ResourceKey, ResourceSample)> = self
            .resources
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        series.sort_by(|left, right| left.0.cmp(&right.0));
        for (name, help) in [
            ("cpu_gauge", "CPU used by engine in millicores"),
            ("mem_gauge", "Memory used by engine in bytes"),
        ] {
            write_header(output, name, help, "gauge")?;
            for (key, sample) in &series {
                let value = if name == "cpu_gauge" {
                    sample.cpu
                } else {
                    sample.mem
                };
                writeln!(
                    output,
                    "{}_{}{{collection_id=\"{}\",plan_id=\"{}\",engine_no=\"{}\"}} {}",
                    NAMESPACE,
                    name,
                    key.collection_id,
                    key.plan_id,
                    escape_label(&key.engine_no),
                    value
                )?;
            }
        }
        Ok(())
    }
}

impl MetricsSink for TimeSeriesRegistry {
    fn observe(&self, metric: &EngineMetric) {
        self.runs
            .entry(metric.run_id)
            .or_insert(metric.collection_id);

        let collection_id = metric.collection_id;
        let run_id = metric.run_id;
        self.observe_latency(
            LatencyKey {
                collection_id,
                run_id,
                scope: LatencyScope::Collection,
            },
            metric.latency,
        );
        self.observe_latency(
            LatencyKey {
                collection_id,
                run_id,
                scope: LatencyScope::Plan(metric.plan_id),
            },
            metric.latency,
        );
        self.observe_latency(
            LatencyKey {
                collection_id,
                run_id,
                scope: LatencyScope::Label(metric.label.clone()),
            },
            metric.latency,
        );

        let status_key = StatusKey {
            collection_id,
            plan_id: metric.plan_id,
            run_id,
            engine_no: metric.engine_id,
            label: metric.label.clone(),
            status: metric.status.clone(),
        };
        let mut count = self.status.entry(status_key).or_insert(0);
        *count = count.saturating_add(1);
        drop(count);

        self.threads.insert(
            ThreadsKey {
                collection_id,
                plan_id: metric.plan_id,
                run_id,
                engine_no: metric.engine_id,
            },
            metric.threads,
        );
    }

    fn record_resource_usage(
        &self,
        collection_id: i64,
        plan_id: i64,
        engine_no: &str,
        cpu: f64,
        mem: f64,
    ) {
        self.resources.insert(
            ResourceKey {
                collection_id,
                plan_id,
                engine_no: engine_no.to_owned(),
            },
            ResourceSample { cpu, mem },
        );
    }

    fn delete_run(&self, run_id: i64) {
        self.latency.retain(|key, _| key.run_id != run_id);
        self.status.retain(|key, _| key.run_id != run_id);
        self.threads.retain(|key, _| key.run_id != run_id);
        self.runs.remove(&run_id);
        tracing::debug!("Deleted time series of run {}", run_id);
    }

    fn delete_engine_health(&self, collection_id: i64, plan_id: i64, engines: usize) {
        let engine_numbers: BTreeSet<String> =
            (0..engines).map(|engine_no| engine_no.to_string()).collect();
        self.resources.retain(|key, _| {
            !(key.collection_id == collection_id
                && key.plan_id == plan_id
                && engine_numbers.contains(&key.engine_no))
        });
        tracing::info!(
            "Deleted engine health metrics {}-{} ({} engines)",
            collection_id,
            plan_id,
            engines
        );
    }

    fn cached_runs(&self) -> Vec<(i64, i64)> {
        let mut runs: Vec<(i64, i64)> = self
            .runs
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        runs.sort_unstable();
        runs
    }
}

fn write_header(output: &mut String, name: &str, help: &str, kind: &str) -> std::fmt::Result {
    writeln!(output, "# HELP {}_{} {}.", NAMESPACE, name, help)?;
    writeln!(output, "# TYPE {}_{} {}", NAMESPACE, name, kind)
}

fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}
