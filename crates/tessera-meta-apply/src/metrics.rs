//! Apply-path metrics for Prometheus
//!
//! Tracks applied requests per command, live entity counts and flush
//! activity.

use crate::response::CommandType;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tessera_meta_store::FlushStatsSnapshot;

/// Per-command counters
#[derive(Debug, Default)]
struct CommandMetrics {
    requests_total: AtomicU64,
    failures_total: AtomicU64,
    replays_total: AtomicU64,
    apply_latency_sum_us: AtomicU64,
}

/// Change in live entity counts caused by one applied request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntityDelta {
    pub volumes: i64,
    pub buckets: i64,
    pub s3_buckets: i64,
}

/// Metrics collector for the request pipeline
#[derive(Debug)]
pub struct MetaMetrics {
    commands: [CommandMetrics; CommandType::ALL.len()],
    volumes: AtomicU64,
    buckets: AtomicU64,
    s3_buckets: AtomicU64,
    invariant_violations: AtomicU64,
    start_time: Instant,
}

impl Default for MetaMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_delta(gauge: &AtomicU64, delta: i64) {
    if delta >= 0 {
        gauge.fetch_add(delta.unsigned_abs(), Ordering::Relaxed);
    } else {
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(delta.unsigned_abs()))
        });
    }
}

impl MetaMetrics {
    pub fn new() -> Self {
        Self {
            commands: Default::default(),
            volumes: AtomicU64::new(0),
            buckets: AtomicU64::new(0),
            s3_buckets: AtomicU64::new(0),
            invariant_violations: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn command(&self, cmd: CommandType) -> &CommandMetrics {
        &self.commands[cmd.ordinal()]
    }

    /// Record one applied request
    pub fn record_apply(&self, cmd: CommandType, success: bool, latency_us: u64) {
        let m = self.command(cmd);
        m.requests_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            m.failures_total.fetch_add(1, Ordering::Relaxed);
        }
        m.apply_latency_sum_us
            .fetch_add(latency_us, Ordering::Relaxed);
    }

    pub fn record_replay(&self, cmd: CommandType) {
        self.command(cmd)
            .replays_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invariant_violation(&self) {
        self.invariant_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn apply_entity_delta(&self, delta: EntityDelta) {
        apply_delta(&self.volumes, delta.volumes);
        apply_delta(&self.buckets, delta.buckets);
        apply_delta(&self.s3_buckets, delta.s3_buckets);
    }

    pub fn requests(&self, cmd: CommandType) -> u64 {
        self.command(cmd).requests_total.load(Ordering::Relaxed)
    }

    pub fn failures(&self, cmd: CommandType) -> u64 {
        self.command(cmd).failures_total.load(Ordering::Relaxed)
    }

    pub fn replays(&self, cmd: CommandType) -> u64 {
        self.command(cmd).replays_total.load(Ordering::Relaxed)
    }

    pub fn num_volumes(&self) -> u64 {
        self.volumes.load(Ordering::Relaxed)
    }

    pub fn num_buckets(&self) -> u64 {
        self.buckets.load(Ordering::Relaxed)
    }

    pub fn num_s3_buckets(&self) -> u64 {
        self.s3_buckets.load(Ordering::Relaxed)
    }

    pub fn invariant_violations(&self) -> u64 {
        self.invariant_violations.load(Ordering::Relaxed)
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self, flush: &FlushStatsSnapshot) -> String {
        let mut output = String::with_capacity(4 * 1024);

        gauge(
            &mut output,
            "tessera_meta_uptime_seconds",
            "Metadata service uptime in seconds",
            self.start_time.elapsed().as_secs(),
        );

        let per_command: [(&str, &str, fn(&CommandMetrics) -> u64); 4] = [
            ("tessera_meta_requests_total", "Applied requests", |m| {
                m.requests_total.load(Ordering::Relaxed)
            }),
            ("tessera_meta_failures_total", "Applied requests that failed", |m| {
                m.failures_total.load(Ordering::Relaxed)
            }),
            ("tessera_meta_replays_total", "Log entries detected as replays", |m| {
                m.replays_total.load(Ordering::Relaxed)
            }),
            (
                "tessera_meta_apply_latency_microseconds_sum",
                "Sum of apply latencies",
                |m| m.apply_latency_sum_us.load(Ordering::Relaxed),
            ),
        ];
        for (name, help, read) in per_command {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            for cmd in CommandType::ALL {
                let _ = writeln!(
                    output,
                    "{name}{{command=\"{}\"}} {}",
                    cmd.label(),
                    read(self.command(cmd))
                );
            }
        }

        gauge(&mut output, "tessera_meta_volumes", "Live volumes", self.num_volumes());
        gauge(&mut output, "tessera_meta_buckets", "Live buckets", self.num_buckets());
        gauge(
            &mut output,
            "tessera_meta_s3_buckets",
            "Live S3 buckets",
            self.num_s3_buckets(),
        );
        counter(
            &mut output,
            "tessera_meta_invariant_violations_total",
            "Cross-table inconsistencies detected while applying",
            self.invariant_violations(),
        );

        counter(
            &mut output,
            "tessera_meta_flush_batches_total",
            "Batches committed by the double buffer",
            flush.batches,
        );
        counter(
            &mut output,
            "tessera_meta_flush_entries_total",
            "Log entries committed by the double buffer",
            flush.entries,
        );
        gauge(
            &mut output,
            "tessera_meta_flush_max_batch_size",
            "Largest batch committed so far",
            flush.max_batch_size as u64,
        );
        gauge(
            &mut output,
            "tessera_meta_flushed_index",
            "Highest durable log index",
            flush.flushed_index,
        );

        output
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    let _ = writeln!(output, "{name} {value}");
}

fn gauge(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_delta_saturates() {
        let metrics = MetaMetrics::new();
        metrics.apply_entity_delta(EntityDelta {
            volumes: 1,
            buckets: 2,
            s3_buckets: 1,
        });
        metrics.apply_entity_delta(EntityDelta {
            volumes: -3,
            buckets: -1,
            s3_buckets: 0,
        });
        assert_eq!(metrics.num_volumes(), 0);
        assert_eq!(metrics.num_buckets(), 1);
        assert_eq!(metrics.num_s3_buckets(), 1);
    }

    #[test]
    fn test_export_prometheus() {
        let metrics = MetaMetrics::new();
        metrics.record_apply(CommandType::CreateS3Bucket, true, 120);
        metrics.record_apply(CommandType::CreateS3Bucket, false, 80);
        metrics.record_replay(CommandType::CreateS3Bucket);

        let flush = FlushStatsSnapshot {
            batches: 2,
            entries: 5,
            max_batch_size: 3,
            flushed_index: 9,
        };
        let text = metrics.export_prometheus(&flush);
        assert!(text.contains("tessera_meta_requests_total{command=\"create_s3_bucket\"} 2"));
        assert!(text.contains("tessera_meta_failures_total{command=\"create_s3_bucket\"} 1"));
        assert!(text.contains("tessera_meta_replays_total{command=\"create_s3_bucket\"} 1"));
        assert!(text.contains("tessera_meta_requests_total{command=\"delete_volume\"} 0"));
        assert!(text.contains("# TYPE tessera_meta_s3_buckets gauge"));
        assert!(text.contains("tessera_meta_flushed_index 9"));
    }
}
