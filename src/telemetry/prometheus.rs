//! Prometheus text-format export for collector snapshots.

use super::metrics::MetricsSnapshot;

/// Render a snapshot in the Prometheus exposition text format.
pub fn render(prefix: &str, snapshot: &MetricsSnapshot) -> String {
    let mut lines = Vec::with_capacity(32);

    gauge(&mut lines, prefix, "latency_p50_milliseconds", "P50 latency", snapshot.latency.p50_ms);
    gauge(&mut lines, prefix, "latency_p95_milliseconds", "P95 latency", snapshot.latency.p95_ms);
    gauge(&mut lines, prefix, "latency_p99_milliseconds", "P99 latency", snapshot.latency.p99_ms);

    lines.push(format!(
        "# HELP {prefix}_throughput_tokens_per_second Token throughput over rolling windows"
    ));
    lines.push(format!("# TYPE {prefix}_throughput_tokens_per_second gauge"));
    for (window, rate) in [
        ("5s", snapshot.throughput.tokens_per_sec_5s),
        ("30s", snapshot.throughput.tokens_per_sec_30s),
        ("60s", snapshot.throughput.tokens_per_sec_60s),
    ] {
        lines.push(format!(
            "{prefix}_throughput_tokens_per_second{{window=\"{window}\"}} {rate:.2}"
        ));
    }

    gauge(
        &mut lines,
        prefix,
        "batch_size_current",
        "Current batch size",
        snapshot.batch.current_size as f64,
    );
    gauge(&mut lines, prefix, "queue_depth", "Current queue depth", snapshot.queue_depth as f64);

    lines.push(format!("# HELP {prefix}_mode_transitions_total Total mode transitions"));
    lines.push(format!("# TYPE {prefix}_mode_transitions_total counter"));
    lines.push(format!("{prefix}_mode_transitions_total {}", snapshot.mode_transitions));

    gauge(&mut lines, prefix, "uptime_seconds", "Collector uptime", snapshot.uptime_seconds);

    lines.join("\n") + "\n"
}

fn gauge(lines: &mut Vec<String>, prefix: &str, name: &str, help: &str, value: f64) {
    lines.push(format!("# HELP {prefix}_{name} {help}"));
    lines.push(format!("# TYPE {prefix}_{name} gauge"));
    lines.push(format!("{prefix}_{name} {value:.2}"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MetricsCollector;

    #[test]
    fn test_render_contains_core_series() {
        let collector = MetricsCollector::new();
        collector.record_latency(12.0);
        collector.record_batch_size(4);
        let text = render("mx", &collector.snapshot());

        assert!(text.contains("mx_latency_p99_milliseconds"));
        assert!(text.contains("mx_throughput_tokens_per_second{window=\"30s\"}"));
        assert!(text.contains("mx_batch_size_current 4.00"));
        assert!(text.contains("mx_mode_transitions_total 0"));
        assert!(text.ends_with('\n'));
    }
}
