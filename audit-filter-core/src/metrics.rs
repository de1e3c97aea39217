//! Prometheus metrics (spec.md §6), grounded on the original's
//! `pkg/metrics/metrics.go` for metric names, labels and the stderr dump,
//! reimplemented with the `prometheus` crate's registry/vec API.

use std::io::Write as _;

use prometheus::{CounterVec, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::event::Event;

const METRIC_NAMESPACE: &str = "splunkforwarder";
const METRIC_SUBSYSTEM: &str = "audit_filter";

/// All counters/gauges the filter pipeline emits, registered together so a
/// single `Registry` backs both the HTTP endpoint and the stderr dump.
pub struct Metrics {
    registry: Registry,
    events_total: IntCounter,
    events_processed_total: CounterVec,
    events_forwarded_resource: CounterVec,
    events_forwarded_subject: CounterVec,
    events_dropped_resource: CounterVec,
    events_dropped_subject: CounterVec,
    errors_total: IntCounter,
    cached_objects: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(METRIC_NAMESPACE).subsystem(METRIC_SUBSYSTEM);

        let events_total = IntCounter::with_opts(opts("events_total", "count of events parsed"))?;
        let events_processed_total = CounterVec::new(opts("events_processed_total", "count of processed events"), &["decision", "reason"])?;
        let events_forwarded_resource = CounterVec::new(
            opts("events_forwarded_resource", "count of accepted events by resource and verb"),
            &["verb", "resource"],
        )?;
        let events_forwarded_subject = CounterVec::new(
            opts("events_forwarded_subject", "count of accepted events by subject and verb"),
            &["verb", "subject"],
        )?;
        let events_dropped_resource = CounterVec::new(
            opts("events_dropped_resource", "count of dropped events by resource and verb"),
            &["verb", "resource"],
        )?;
        let events_dropped_subject = CounterVec::new(
            opts("events_dropped_subject", "count of dropped events by subject kind and verb"),
            &["verb", "subject"],
        )?;
        let errors_total = IntCounter::with_opts(opts("errors_total", "count of encoding or decoding errors"))?;
        let cached_objects = IntGauge::with_opts(opts("cached_objects", "number of objects in the dedup cache"))?;

        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(events_processed_total.clone()))?;
        registry.register(Box::new(events_forwarded_resource.clone()))?;
        registry.register(Box::new(events_forwarded_subject.clone()))?;
        registry.register(Box::new(events_dropped_resource.clone()))?;
        registry.register(Box::new(events_dropped_subject.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(cached_objects.clone()))?;

        Ok(Self {
            registry,
            events_total,
            events_processed_total,
            events_forwarded_resource,
            events_forwarded_subject,
            events_dropped_resource,
            events_dropped_subject,
            errors_total,
            cached_objects,
        })
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn record_parsed(&self) {
        self.events_total.inc();
    }

    pub fn record_error(&self) {
        self.errors_total.inc();
    }

    pub fn set_cached_objects(&self, count: usize) {
        self.cached_objects.set(count as i64);
    }

    /// Records a forward decision and returns `true`, mirroring the
    /// original's `RecordForward` boolean-return convenience.
    ///
    /// Uses the decode-time `resource_label`/`subject_label` stored on the
    /// event, not the (possibly dedup-mutated) live `audit.verb` — the
    /// original's `RecordForward` takes `e.ResourceLabels`/`e.SubjectLabels`
    /// computed once at decode, so a dedup-reduced event (verb rewritten to
    /// `"patch"` by `reduce_to_patch`) still records under its original verb.
    pub fn record_forward(&self, event: &Event, reason: &str) -> bool {
        let (verb, resource) = &event.resource_label;
        let (verb_s, subject) = &event.subject_label;
        self.events_forwarded_resource.with_label_values(&[verb, resource]).inc();
        self.events_forwarded_subject.with_label_values(&[verb_s, subject]).inc();
        self.events_processed_total.with_label_values(&["forward", reason]).inc();
        true
    }

    /// Records a drop decision and returns `false`, mirroring
    /// `RecordDrop`. See [`Metrics::record_forward`] on label provenance.
    pub fn record_drop(&self, event: &Event, reason: &str) -> bool {
        let (verb, resource) = &event.resource_label;
        let (verb_s, subject) = &event.subject_label;
        self.events_dropped_resource.with_label_values(&[verb, resource]).inc();
        self.events_dropped_subject.with_label_values(&[verb_s, subject]).inc();
        self.events_processed_total.with_label_values(&["drop", reason]).inc();
        false
    }

    /// Renders the current metric snapshot in Prometheus text exposition
    /// format, used by both the `/metrics` endpoint and `--print-metrics`.
    pub fn encode(&self) -> prometheus::Result<String> {
        let families = self.registry.gather();
        TextEncoder::new().encode_to_string(&families)
    }

    /// Dumps the current snapshot to stderr, for `--print-metrics`.
    pub fn print(&self) {
        match self.encode() {
            Ok(text) => {
                let _ = std::io::stderr().write_all(text.as_bytes());
            }
            Err(e) => warn!(error = %e, "failed to encode metrics"),
        }
    }
}
