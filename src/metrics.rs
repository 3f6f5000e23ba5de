use std::sync::OnceLock;

use prometheus::{GaugeVec, HistogramVec, IntCounterVec, Opts, Registry};

/// Process-wide metrics registry.
///
/// Services record through the free helpers below; when metrics are
/// disabled (or never initialized, as in most tests) every hook is a
/// no-op. The registry itself is exposed for an external scrape surface.
struct Metrics {
    registry: Registry,
    gauges: GaugeVec,
    counters: IntCounterVec,
    histograms: HistogramVec,
}

static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();

fn build() -> Metrics {
    let registry = Registry::new();

    let gauges = GaugeVec::new(
        Opts::new("bigbrotr_gauge", "BigBrotr service gauges"),
        &["name"],
    )
    .expect("valid gauge opts");
    let counters = IntCounterVec::new(
        Opts::new("bigbrotr_counter_total", "BigBrotr service counters"),
        &["name"],
    )
    .expect("valid counter opts");
    let histograms = HistogramVec::new(
        prometheus::HistogramOpts::new("bigbrotr_histogram", "BigBrotr service histograms")
            .buckets(vec![
                0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
            ]),
        &["name"],
    )
    .expect("valid histogram opts");

    registry
        .register(Box::new(gauges.clone()))
        .expect("register gauges");
    registry
        .register(Box::new(counters.clone()))
        .expect("register counters");
    registry
        .register(Box::new(histograms.clone()))
        .expect("register histograms");

    Metrics {
        registry,
        gauges,
        counters,
        histograms,
    }
}

/// Initialize metrics for the process. Safe to call more than once; the
/// first call wins.
pub fn init(enabled: bool) {
    METRICS.get_or_init(|| enabled.then(build));
}

fn get() -> Option<&'static Metrics> {
    METRICS.get().and_then(Option::as_ref)
}

/// Registry for an external scrape endpoint, when metrics are enabled.
pub fn registry() -> Option<Registry> {
    get().map(|m| m.registry.clone())
}

pub fn set_gauge(name: &str, value: f64) {
    if let Some(m) = get() {
        m.gauges.with_label_values(&[name]).set(value);
    }
}

pub fn inc_counter(name: &str, amount: u64) {
    if let Some(m) = get() {
        m.counters.with_label_values(&[name]).inc_by(amount);
    }
}

pub fn observe_histogram(name: &str, value: f64) {
    if let Some(m) = get() {
        m.histograms.with_label_values(&[name]).observe(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_are_noops_without_init() {
        // Never initialized in this test binary unless another test ran
        // init(true) first; either way these must not panic.
        set_gauge("cycle_relays", 10.0);
        inc_counter("ssl_fallback", 1);
        observe_histogram("cycle_duration_seconds", 1.5);
    }

    #[test]
    fn init_is_idempotent() {
        init(false);
        init(true);
        init(false);
    }
}
