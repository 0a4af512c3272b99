//! Process telemetry feeding the node registry.
//!
//! CPU and memory come from the operating system via `sysinfo`. Latency is
//! measured by the registry itself (store round trip) and load is the live
//! session count, so neither appears here.

use std::sync::Mutex;
use sysinfo::System;

/// One telemetry reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricsSample {
    pub cpu_usage_pct: f64,
    pub mem_usage_pct: f64,
}

/// Source of live CPU/memory figures for the hosting process.
pub trait MetricsSource: Send + Sync {
    fn sample(&self) -> MetricsSample;
}

/// Operating-system telemetry.
pub struct SystemTelemetry {
    system: Mutex<System>,
}

impl SystemTelemetry {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SystemTelemetry {
    fn sample(&self) -> MetricsSample {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu = system.global_cpu_info().cpu_usage() as f64;
        let total = system.total_memory();
        let mem = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };

        MetricsSample {
            cpu_usage_pct: cpu.clamp(0.0, 100.0),
            mem_usage_pct: mem.clamp(0.0, 100.0),
        }
    }
}

/// Externally driven readings (simulated fleets, tests).
pub struct FixedMetrics {
    current: Mutex<MetricsSample>,
}

impl FixedMetrics {
    pub fn new(cpu_usage_pct: f64, mem_usage_pct: f64) -> Self {
        Self {
            current: Mutex::new(MetricsSample {
                cpu_usage_pct,
                mem_usage_pct,
            }),
        }
    }

    pub fn set(&self, cpu_usage_pct: f64, mem_usage_pct: f64) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = MetricsSample {
            cpu_usage_pct,
            mem_usage_pct,
        };
    }
}

impl MetricsSource for FixedMetrics {
    fn sample(&self) -> MetricsSample {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_telemetry_in_range() {
        let telemetry = SystemTelemetry::new();
        let sample = telemetry.sample();
        assert!((0.0..=100.0).contains(&sample.cpu_usage_pct));
        assert!((0.0..=100.0).contains(&sample.mem_usage_pct));
    }

    #[test]
    fn test_fixed_metrics() {
        let metrics = FixedMetrics::new(20.0, 30.0);
        assert_eq!(metrics.sample().cpu_usage_pct, 20.0);
        metrics.set(90.0, 85.0);
        assert_eq!(
            metrics.sample(),
            MetricsSample {
                cpu_usage_pct: 90.0,
                mem_usage_pct: 85.0
            }
        );
    }
}
