//! System load sampling with smoothing and last-known-good fallback

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use sysinfo::System;
use tracing::debug;

/// Number of CPU readings kept for the moving average.
const SMOOTHING_WINDOW: usize = 5;

/// A point-in-time load measurement.
///
/// `load` is normalized to [0, 1]; `cpu` and `memory` are raw percentages.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LoadSample {
    pub load: f64,
    pub cpu: f64,
    pub memory: f64,
}

/// Source of server load information.
///
/// The limiter and queue manager only depend on this trait, so any
/// implementation with the same shape can stand in for the real monitor.
pub trait LoadSource: Send + Sync {
    /// Current load. Must never fail: implementations degrade to a cached
    /// or default value instead of propagating measurement errors.
    fn current_load(&self) -> LoadSample;
}

/// Fixed load value, for tests and for running with monitoring disabled.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoad(pub f64);

impl LoadSource for FixedLoad {
    fn current_load(&self) -> LoadSample {
        let load = self.0.clamp(0.0, 1.0);
        LoadSample {
            load,
            cpu: load * 100.0,
            memory: load * 100.0,
        }
    }
}

/// Raw CPU/memory percentage reader, separated out so the smoothing and
/// fallback logic can be tested without touching the host system.
trait Sampler: Send {
    fn sample(&mut self) -> Option<(f64, f64)>;
}

struct SysinfoSampler {
    system: System,
}

impl Sampler for SysinfoSampler {
    fn sample(&mut self) -> Option<(f64, f64)> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpu = self.system.global_cpu_info().cpu_usage() as f64;
        let total = self.system.total_memory();
        if total == 0 {
            return None;
        }
        let memory = (self.system.used_memory() as f64 / total as f64) * 100.0;
        Some((cpu, memory))
    }
}

struct MonitorState {
    sampler: Box<dyn Sampler>,
    cpu_readings: VecDeque<f64>,
    last_cpu: f64,
    last_good: Option<LoadSample>,
}

/// Samples CPU and memory utilization and exposes a combined load score.
///
/// CPU is smoothed over the last few readings to avoid acting on a single
/// spiky sample. The combined score weighs CPU at 70% and memory at 30%.
pub struct LoadMonitor {
    state: Mutex<MonitorState>,
    throttle_threshold: f64,
}

impl LoadMonitor {
    pub fn new(throttle_threshold: f64) -> Self {
        // Prime the CPU counters so the first real reading has a baseline.
        let mut system = System::new();
        system.refresh_cpu_usage();

        Self::with_sampler(Box::new(SysinfoSampler { system }), throttle_threshold)
    }

    fn with_sampler(sampler: Box<dyn Sampler>, throttle_threshold: f64) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                sampler,
                cpu_readings: VecDeque::with_capacity(SMOOTHING_WINDOW),
                last_cpu: 0.0,
                last_good: None,
            }),
            throttle_threshold,
        }
    }

    /// Whether inbound work should be throttled at the current load.
    pub fn should_throttle(&self) -> bool {
        self.current_load().load >= self.throttle_threshold
    }

    fn combine(cpu: f64, memory: f64) -> f64 {
        ((cpu * 0.7 + memory * 0.3) / 100.0).clamp(0.0, 1.0)
    }
}

impl LoadSource for LoadMonitor {
    fn current_load(&self) -> LoadSample {
        let mut state = self.state.lock();

        match state.sampler.sample() {
            Some((raw_cpu, memory)) => {
                // A zero reading usually means the counters have not ticked
                // since the previous refresh; reuse the last known value.
                let mut cpu = if raw_cpu > 0.0 {
                    state.last_cpu = raw_cpu;
                    state.cpu_readings.push_back(raw_cpu);
                    if state.cpu_readings.len() > SMOOTHING_WINDOW {
                        state.cpu_readings.pop_front();
                    }
                    raw_cpu
                } else {
                    state.last_cpu
                };

                if state.cpu_readings.len() >= 2 {
                    cpu = state.cpu_readings.iter().sum::<f64>()
                        / state.cpu_readings.len() as f64;
                }

                let sample = LoadSample {
                    load: Self::combine(cpu, memory),
                    cpu,
                    memory,
                };
                state.last_good = Some(sample);
                sample
            }
            None => {
                debug!("load sampling failed, using fallback value");
                state.last_good.unwrap_or_else(|| {
                    let cpu = state.last_cpu.max(1.0);
                    let memory = 50.0;
                    LoadSample {
                        load: Self::combine(cpu, memory),
                        cpu,
                        memory,
                    }
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedSampler {
        samples: VecDeque<Option<(f64, f64)>>,
    }

    impl Sampler for ScriptedSampler {
        fn sample(&mut self) -> Option<(f64, f64)> {
            self.samples.pop_front().flatten()
        }
    }

    fn monitor_with(samples: Vec<Option<(f64, f64)>>) -> LoadMonitor {
        LoadMonitor::with_sampler(
            Box::new(ScriptedSampler {
                samples: samples.into(),
            }),
            0.8,
        )
    }

    #[test]
    fn combines_cpu_and_memory_with_weights() {
        let monitor = monitor_with(vec![Some((50.0, 100.0))]);
        let sample = monitor.current_load();
        assert!((sample.load - 0.65).abs() < 1e-9);
        assert_eq!(sample.cpu, 50.0);
        assert_eq!(sample.memory, 100.0);
    }

    #[test]
    fn smooths_cpu_over_recent_readings() {
        let monitor = monitor_with(vec![Some((10.0, 0.0)), Some((90.0, 0.0))]);
        monitor.current_load();
        let sample = monitor.current_load();
        // Average of 10 and 90.
        assert!((sample.cpu - 50.0).abs() < 1e-9);
    }

    #[test]
    fn zero_cpu_reading_reuses_last_value() {
        let monitor = monitor_with(vec![Some((40.0, 20.0)), Some((0.0, 20.0))]);
        monitor.current_load();
        let sample = monitor.current_load();
        assert!((sample.cpu - 40.0).abs() < 1e-9);
    }

    #[test]
    fn sampling_failure_returns_last_good_sample() {
        let monitor = monitor_with(vec![Some((30.0, 30.0)), None]);
        let first = monitor.current_load();
        let second = monitor.current_load();
        assert!((first.load - second.load).abs() < 1e-9);
    }

    #[test]
    fn sampling_failure_without_history_uses_default() {
        let monitor = monitor_with(vec![None]);
        let sample = monitor.current_load();
        assert_eq!(sample.memory, 50.0);
        assert!(sample.cpu >= 1.0);
        assert!(sample.load > 0.0 && sample.load <= 1.0);
    }

    #[test]
    fn load_is_clamped_to_unit_range() {
        let monitor = monitor_with(vec![Some((400.0, 300.0))]);
        assert_eq!(monitor.current_load().load, 1.0);
    }

    #[test]
    fn throttles_at_and_above_the_threshold() {
        // (95*0.7 + 95*0.3)/100 = 0.95, above the 0.8 threshold.
        let monitor = monitor_with(vec![Some((95.0, 95.0)), Some((10.0, 10.0))]);
        assert!(monitor.should_throttle());
        // The smoothed follow-up reading drops the load back under it.
        assert!(!monitor.should_throttle());
    }

    #[test]
    fn fixed_load_reports_constant_value() {
        let source = FixedLoad(0.4);
        assert!((source.current_load().load - 0.4).abs() < 1e-9);
        assert_eq!(FixedLoad(2.0).current_load().load, 1.0);
    }
}
