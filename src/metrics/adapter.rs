//! Metric adapter: one prometheus collector per probe client.
//!
//! The collector is built from the stats descriptor table, registered when
//! a target starts and unregistered at cleanup, so metric registrations
//! live exactly as long as the probe loop. Values are read from the
//! client's shared snapshot at scrape time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use prometheus::core::{Collector, Desc};
use prometheus::proto;
use tracing::warn;

use crate::probe::stats::{FieldDesc, FieldKind, Stats, FIELDS};

#[derive(Clone)]
pub struct StatsCollector {
    target: String,
    descs: Vec<Desc>,
    fields: Vec<&'static FieldDesc>,
    label_pairs: Vec<proto::LabelPair>,
    stats: Arc<Mutex<Stats>>,
}

impl StatsCollector {
    /// Build the collector for one target: a `tp_`-prefixed descriptor per
    /// exported numeric field, const-labeled with the target and the
    /// sanitized user labels.
    pub fn new(target: &str, labels_json: Option<&str>, stats: Arc<Mutex<Stats>>) -> Self {
        let labels = target_labels(target, labels_json);

        let mut descs = Vec::new();
        let mut fields = Vec::new();
        for field in FIELDS {
            if !field.is_numeric() {
                continue;
            }
            match Desc::new(
                format!("tp_{}", field.metric),
                field.help.to_string(),
                Vec::new(),
                labels.clone(),
            ) {
                Ok(desc) => {
                    descs.push(desc);
                    fields.push(field);
                }
                Err(err) => warn!("metric descriptor {} for {}: {}", field.metric, target, err),
            }
        }

        Self {
            target: target.to_string(),
            descs,
            fields,
            label_pairs: label_pairs(&labels),
            stats,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Collector for StatsCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        let stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        self.fields
            .iter()
            .zip(&self.descs)
            .filter_map(|(field, desc)| {
                let value = (field.get)(&stats).as_f64()?;

                let mut metric = proto::Metric::default();
                for pair in &self.label_pairs {
                    metric.mut_label().push(pair.clone());
                }

                let mut family = proto::MetricFamily::default();
                family.set_name(desc.fq_name.clone());
                family.set_help(desc.help.clone());
                match field.kind {
                    FieldKind::Counter => {
                        let mut counter = proto::Counter::default();
                        counter.set_value(value);
                        metric.set_counter(counter);
                        family.set_field_type(proto::MetricType::COUNTER);
                    }
                    FieldKind::Gauge => {
                        let mut gauge = proto::Gauge::default();
                        gauge.set_value(value);
                        metric.set_gauge(gauge);
                        family.set_field_type(proto::MetricType::GAUGE);
                    }
                }
                family.mut_metric().push(metric);
                Some(family)
            })
            .collect()
    }
}

/// Register the collector with the shared registry; failures are logged
/// and the probe runs without metrics.
pub fn register(collector: &StatsCollector) {
    if let Err(err) = prometheus::default_registry().register(Box::new(collector.clone())) {
        warn!("prometheus register {}: {}", collector.target, err);
    }
}

/// Unregister at cleanup; an unknown collector is logged but never blocks
/// teardown.
pub fn unregister(collector: &StatsCollector) {
    if let Err(err) = prometheus::default_registry().unregister(Box::new(collector.clone())) {
        warn!("prometheus unregister {}: {}", collector.target, err);
    }
}

/// Per-target label set: `target` plus the user labels carried as a JSON
/// object. Dashes become underscores; keys outside `[A-Za-z0-9_]*` are
/// dropped, and invalid JSON degrades to the bare target label.
pub fn target_labels(target: &str, labels_json: Option<&str>) -> HashMap<String, String> {
    let mut labels = HashMap::from([("target".to_string(), target.to_string())]);

    if let Some(raw) = labels_json {
        if let Ok(user) = serde_json::from_str::<HashMap<String, String>>(raw) {
            for (key, value) in user {
                let key = key.replace('-', "_");
                if key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    labels.insert(key, value);
                }
            }
        }
    }

    labels
}

fn label_pairs(labels: &HashMap<String, String>) -> Vec<proto::LabelPair> {
    let mut pairs: Vec<proto::LabelPair> = labels
        .iter()
        .map(|(name, value)| {
            let mut pair = proto::LabelPair::default();
            pair.set_name(name.clone());
            pair.set_value(value.clone());
            pair
        })
        .collect();
    pairs.sort_by(|a, b| a.get_name().cmp(b.get_name()));
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_carry_target_and_sanitized_keys() {
        let labels = target_labels(
            "127.0.0.1",
            Some(r#"{"key":"value","my-key":"v2","bad key":"x"}"#),
        );
        assert_eq!(labels.get("target").map(String::as_str), Some("127.0.0.1"));
        assert_eq!(labels.get("key").map(String::as_str), Some("value"));
        assert_eq!(labels.get("my_key").map(String::as_str), Some("v2"));
        assert!(!labels.contains_key("bad key"));
    }

    #[test]
    fn invalid_labels_json_degrades_to_target_only() {
        let labels = target_labels("127.0.0.1", Some("not json"));
        assert_eq!(labels.len(), 1);
        assert!(labels.contains_key("target"));

        let labels = target_labels("127.0.0.1", None);
        assert_eq!(labels.len(), 1);
    }

    fn gauge_value(target: &str, name: &str) -> Option<f64> {
        for family in prometheus::default_registry().gather() {
            if family.get_name() != name {
                continue;
            }
            for metric in family.get_metric() {
                if metric
                    .get_label()
                    .iter()
                    .any(|l| l.get_name() == "target" && l.get_value() == target)
                {
                    return Some(metric.get_gauge().get_value());
                }
            }
        }
        None
    }

    #[test]
    fn register_scrape_unregister() {
        let target = "adapter-test:4242";
        let stats = Arc::new(Mutex::new(Stats::default()));
        stats.lock().expect("lock").tcp.rtt = 55;

        let collector = StatsCollector::new(target, Some(r#"{"pop":"bur"}"#), stats.clone());
        register(&collector);

        assert_eq!(gauge_value(target, "tp_tcpinfo_rtt"), Some(55.0));

        // readers observe the newest snapshot on the next scrape
        stats.lock().expect("lock").tcp.rtt = 60;
        assert_eq!(gauge_value(target, "tp_tcpinfo_rtt"), Some(60.0));

        unregister(&collector);
        assert_eq!(gauge_value(target, "tp_tcpinfo_rtt"), None);

        // double unregister is logged, not fatal
        unregister(&collector);
    }

    #[test]
    fn collector_skips_the_text_field() {
        let stats = Arc::new(Mutex::new(Stats::default()));
        let collector = StatsCollector::new("adapter-test:4243", None, stats);
        assert!(collector
            .desc()
            .iter()
            .all(|d| !d.fq_name.is_empty() && d.fq_name.starts_with("tp_")));
        assert_eq!(
            collector.desc().len(),
            FIELDS.iter().filter(|f| f.is_numeric()).count()
        );
    }
}
