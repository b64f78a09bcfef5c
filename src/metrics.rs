use std::{net::SocketAddr, time::Instant};

use ::metrics::{describe_counter, describe_gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install and start a prometheus http exporter listening on `metrics_addr` and
/// defines all metrics.
pub(crate) fn install_prom(metrics_addr: &str) -> anyhow::Result<()> {
    let metrics_addr: SocketAddr = metrics_addr.parse()?;

    // it's 2024 prometheus still makes you define your own damn buckets for
    // histograms.
    //
    // start with an exponential series of bounds, starting at 250 micros and
    // see how it goes.
    const US_PER_SEC: f64 = 1000000.0;
    let buckets: Vec<f64> = (0..16)
        .map(|i| (2u32.pow(i) as f64) * 250.0 / US_PER_SEC)
        .collect();

    let builder = PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .set_buckets(&buckets)
        .expect("invalid bucket settings. this is a bug");
    builder.install()?;

    describe_metrics();

    Ok(())
}

/// Describe a timer. Shorthand for `describe_histogram!(name, Unit::Seconds,
/// description)` so you don't have to remember what units timers are in.
macro_rules! describe_timer {
    ($name:expr, $description:expr $(,)?) => {{
        ::metrics::describe_histogram!($name, ::metrics::Unit::Seconds, $description)
    }};
}

/// Creates a timer that runs until it goes out of scope. Timed values are
/// tracked with a metrics histogram and assumes that durations are recorded as
/// an f64 number of seconds.
macro_rules! scoped_timer {
    ($name:expr $(, $label_key:expr $(=> $label_value:expr)?)* $(,)?) => {{
        let hist = ::metrics::histogram!($name $(, $label_key $(=> $label_value)?)*);
        crate::metrics::TimerGuard::new_at(hist, std::time::Instant::now())
    }};
}
pub(crate) use scoped_timer;

// TODO: This sucks, metrics are defined all over the place. Make metric names
// and/or values module-level variables with actual symbols or even just pass
// the Arc around.
fn describe_metrics() {
    describe_timer!(
        "sync_time",
        "Time to reconcile one queued resource event (seconds)",
    );
    describe_gauge!("queue.depth", "The number of queued resource events");
    describe_counter!(
        "queue.requeued",
        "The total number of events requeued after a retryable error"
    );
    describe_counter!(
        "declarations.posted",
        "The total number of declarations handed to the agent"
    );
}

/// An RAII timer guard that records its duration on drop.
///
/// Created with [scoped_timer].
pub(crate) struct TimerGuard {
    hist: Histogram,
    started_at: Instant,
}

impl TimerGuard {
    pub(crate) fn new_at(hist: Histogram, started_at: Instant) -> Self {
        Self { hist, started_at }
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.hist.record(self.started_at.elapsed().as_secs_f64());
    }
}
