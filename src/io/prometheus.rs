//! Prometheus text exposition of gateway metrics
//!
//! Served by the HTTP API at `GET /metrics`.

use crate::infra::metrics::{MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a counter split by one extra label
fn write_labeled_counter(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    label: &str,
    values: &[(&str, u64)],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{site=\"{site}\",{label}=\"{value}\"}} {count}");
    }
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format a metrics summary in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary, site_id: &str) -> String {
    let mut output = String::with_capacity(4096);

    write_ping_metrics(&mut output, site_id, summary);
    write_access_metrics(&mut output, site_id, summary);
    write_occupancy_metrics(&mut output, site_id, summary);
    write_drop_metrics(&mut output, site_id, summary);

    output
}

fn write_ping_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "access_pings_total",
        "Location pings processed",
        MetricType::Counter,
        site,
        summary.pings_total,
    );
    let _ = writeln!(output, "# HELP access_pings_per_sec Pings processed per second");
    let _ = writeln!(output, "# TYPE access_pings_per_sec gauge");
    let _ = writeln!(output, "access_pings_per_sec{{site=\"{site}\"}} {:.2}", summary.pings_per_sec);

    write_histogram(
        output,
        "access_ping_latency_us",
        "Ping processing latency in microseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_ping_latency_us,
    );
    write_metric(
        output,
        "access_ping_latency_p99_us",
        "99th percentile ping latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );
}

fn write_access_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_labeled_counter(
        output,
        "access_entries_total",
        "Entries registered by detection method",
        site,
        "method",
        &[
            ("automatic", summary.entries_automatic),
            ("manual", summary.entries_manual),
            ("device_scan", summary.entries_device_scan),
        ],
    );
    write_metric(
        output,
        "access_exits_total",
        "Exits registered",
        MetricType::Counter,
        site,
        summary.exits_total,
    );
    write_labeled_counter(
        output,
        "access_rejections_total",
        "Operations rejected by reason",
        site,
        "reason",
        &[
            ("already_open", summary.rejected_already_open),
            ("no_open_record", summary.rejected_no_open_record),
            ("capacity_exceeded", summary.rejected_capacity),
            ("subject_not_found", summary.rejected_subject_not_found),
            ("invalid", summary.rejected_invalid),
        ],
    );
}

fn write_occupancy_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "access_occupancy",
        "Subjects currently inside",
        MetricType::Gauge,
        site,
        summary.occupancy,
    );
    write_metric(
        output,
        "access_occupancy_level",
        "Occupancy level (0=normal, 1=warning, 2=critical)",
        MetricType::Gauge,
        site,
        summary.occupancy_level,
    );
}

fn write_drop_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "access_pings_dropped_total",
        "Pings dropped due to channel full",
        MetricType::Counter,
        site,
        summary.pings_dropped,
    );
    write_metric(
        output,
        "access_alerts_sent_total",
        "Alerts handed to the publisher",
        MetricType::Counter,
        site,
        summary.alerts_sent,
    );
    write_metric(
        output,
        "access_alerts_dropped_total",
        "Alerts dropped due to channel full",
        MetricType::Counter,
        site,
        summary.alerts_dropped,
    );
    write_metric(
        output,
        "access_ping_queue_depth",
        "Pings waiting for the worker",
        MetricType::Gauge,
        site,
        summary.ping_queue_depth,
    );
}
