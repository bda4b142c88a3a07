use crate::config::PerformanceConfig;
use log::debug;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Discrete device-pressure summary controlling scale, antialiasing and
/// whether frames are emitted at all. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PerformanceLevel {
    Normal,
    Reduced,
    Minimal,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalState {
    Nominal,
    Fair,
    Serious,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy)]
pub struct BatteryState {
    /// Charge fraction in [0, 1]; negative when unknown.
    pub level: f32,
    pub charging: bool,
}

/// O(1) host queries for device pressure. Sampled on a background task,
/// never on the capture path.
pub trait DeviceSignals: Send + Sync {
    fn thermal_state(&self) -> ThermalState;
    fn battery(&self) -> BatteryState;
    fn resident_memory_bytes(&self) -> u64;
    fn memory_pressure(&self) -> MemoryPressure;
    fn cpu_usage_percent(&self) -> f32;
}

/// Folds raw signal samples into a level. Thermal and memory criticals
/// short-circuit to Paused; everything else contributes its severity and the
/// published level is the maximum.
///
/// CPU is smoothed with an EMA (0.3 new / 0.7 old) and hysteresis: promotion
/// needs three consecutive high samples, demotion steps one level at a time
/// and only once the average falls below the Normal threshold.
pub struct LevelTracker {
    config: PerformanceConfig,
    cpu_ema: Option<f32>,
    consecutive_high: u32,
    cpu_level: PerformanceLevel,
}

impl LevelTracker {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            config,
            cpu_ema: None,
            consecutive_high: 0,
            cpu_level: PerformanceLevel::Normal,
        }
    }

    pub fn observe(&mut self, signals: &dyn DeviceSignals) -> PerformanceLevel {
        let thermal = signals.thermal_state();
        if thermal == ThermalState::Critical {
            return PerformanceLevel::Paused;
        }
        if signals.memory_pressure() == MemoryPressure::Critical {
            return PerformanceLevel::Paused;
        }

        let thermal_level = match thermal {
            ThermalState::Nominal => PerformanceLevel::Normal,
            ThermalState::Fair => PerformanceLevel::Reduced,
            ThermalState::Serious => PerformanceLevel::Minimal,
            ThermalState::Critical => unreachable!("short-circuited above"),
        };

        let memory_level = if signals.memory_pressure() == MemoryPressure::Warning {
            PerformanceLevel::Minimal
        } else if signals.resident_memory_bytes() > self.config.memory_resident_limit_bytes {
            PerformanceLevel::Reduced
        } else {
            PerformanceLevel::Normal
        };

        let battery = signals.battery();
        let battery_level = if !battery.charging
            && battery.level >= 0.0
            && battery.level < self.config.battery_low_fraction
        {
            PerformanceLevel::Reduced
        } else {
            PerformanceLevel::Normal
        };

        let cpu_level = self.observe_cpu(signals.cpu_usage_percent());

        thermal_level.max(memory_level).max(battery_level).max(cpu_level)
    }

    fn observe_cpu(&mut self, sample: f32) -> PerformanceLevel {
        let sample = sample.clamp(0.0, 100.0);
        let ema = match self.cpu_ema {
            Some(prev) => self.config.cpu_ema_alpha * sample + (1.0 - self.config.cpu_ema_alpha) * prev,
            None => sample,
        };
        self.cpu_ema = Some(ema);

        if sample >= self.config.cpu_high_percent {
            self.consecutive_high += 1;
            if self.consecutive_high >= self.config.cpu_promote_samples {
                let target = if ema >= self.config.cpu_critical_percent {
                    PerformanceLevel::Minimal
                } else {
                    PerformanceLevel::Reduced
                };
                self.cpu_level = self.cpu_level.max(target);
            }
        } else {
            self.consecutive_high = 0;
            if ema < self.config.cpu_normal_percent {
                self.cpu_level = match self.cpu_level {
                    PerformanceLevel::Minimal => PerformanceLevel::Reduced,
                    _ => PerformanceLevel::Normal,
                };
            }
        }
        self.cpu_level
    }

    pub fn cpu_rolling_average(&self) -> Option<f32> {
        self.cpu_ema
    }
}

/// Samples device signals on an interval and publishes level changes over a
/// watch channel. Changes are visible to subsequent intents; an in-flight
/// emit keeps the level it started with.
pub fn spawn_performance_manager(
    signals: Arc<dyn DeviceSignals>,
    config: PerformanceConfig,
) -> (watch::Receiver<PerformanceLevel>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(PerformanceLevel::Normal);
    let interval = config.sample_interval;
    let handle = tokio::spawn(async move {
        let mut tracker = LevelTracker::new(config);
        loop {
            tokio::time::sleep(interval).await;
            let level = tracker.observe(signals.as_ref());
            if *tx.borrow() != level {
                debug!("performance level -> {level:?}");
                if tx.send(level).is_err() {
                    break;
                }
            }
            if tx.is_closed() {
                break;
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::{
        BatteryState, DeviceSignals, LevelTracker, MemoryPressure, PerformanceLevel, ThermalState,
        spawn_performance_manager,
    };
    use crate::config::PerformanceConfig;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone)]
    struct FakeSignals {
        thermal: Arc<Mutex<ThermalState>>,
        battery: Arc<Mutex<BatteryState>>,
        resident: Arc<Mutex<u64>>,
        pressure: Arc<Mutex<MemoryPressure>>,
        cpu: Arc<Mutex<f32>>,
    }

    impl FakeSignals {
        fn nominal() -> Self {
            Self {
                thermal: Arc::new(Mutex::new(ThermalState::Nominal)),
                battery: Arc::new(Mutex::new(BatteryState {
                    level: 0.9,
                    charging: true,
                })),
                resident: Arc::new(Mutex::new(50 * 1024 * 1024)),
                pressure: Arc::new(Mutex::new(MemoryPressure::Normal)),
                cpu: Arc::new(Mutex::new(10.0)),
            }
        }
    }

    impl DeviceSignals for FakeSignals {
        fn thermal_state(&self) -> ThermalState {
            *self.thermal.lock().expect("thermal mutex poisoned")
        }

        fn battery(&self) -> BatteryState {
            *self.battery.lock().expect("battery mutex poisoned")
        }

        fn resident_memory_bytes(&self) -> u64 {
            *self.resident.lock().expect("resident mutex poisoned")
        }

        fn memory_pressure(&self) -> MemoryPressure {
            *self.pressure.lock().expect("pressure mutex poisoned")
        }

        fn cpu_usage_percent(&self) -> f32 {
            *self.cpu.lock().expect("cpu mutex poisoned")
        }
    }

    #[test]
    fn thermal_states_map_to_levels_with_critical_short_circuit() {
        let signals = FakeSignals::nominal();
        let mut tracker = LevelTracker::new(PerformanceConfig::default());

        assert_eq!(tracker.observe(&signals), PerformanceLevel::Normal);

        *signals.thermal.lock().unwrap() = ThermalState::Fair;
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Reduced);

        *signals.thermal.lock().unwrap() = ThermalState::Serious;
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Minimal);

        *signals.thermal.lock().unwrap() = ThermalState::Critical;
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Paused);
    }

    #[test]
    fn low_battery_on_discharge_is_at_least_reduced() {
        let signals = FakeSignals::nominal();
        let mut tracker = LevelTracker::new(PerformanceConfig::default());

        *signals.battery.lock().unwrap() = BatteryState {
            level: 0.15,
            charging: false,
        };
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Reduced);

        // Same level while charging does not throttle.
        *signals.battery.lock().unwrap() = BatteryState {
            level: 0.15,
            charging: true,
        };
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Normal);
    }

    #[test]
    fn memory_signals_escalate() {
        let signals = FakeSignals::nominal();
        let mut tracker = LevelTracker::new(PerformanceConfig::default());

        *signals.resident.lock().unwrap() = 300 * 1024 * 1024;
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Reduced);

        *signals.pressure.lock().unwrap() = MemoryPressure::Warning;
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Minimal);

        *signals.pressure.lock().unwrap() = MemoryPressure::Critical;
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Paused);
    }

    #[test]
    fn cpu_promotion_needs_three_consecutive_high_samples() {
        let signals = FakeSignals::nominal();
        let mut tracker = LevelTracker::new(PerformanceConfig::default());

        *signals.cpu.lock().unwrap() = 75.0;
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Normal);
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Normal);
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Reduced);
    }

    #[test]
    fn an_interleaved_low_sample_resets_the_promotion_streak() {
        let signals = FakeSignals::nominal();
        let mut tracker = LevelTracker::new(PerformanceConfig::default());

        *signals.cpu.lock().unwrap() = 75.0;
        tracker.observe(&signals);
        tracker.observe(&signals);
        *signals.cpu.lock().unwrap() = 10.0;
        tracker.observe(&signals);
        *signals.cpu.lock().unwrap() = 75.0;
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Normal);
    }

    #[test]
    fn a_single_low_sample_never_demotes_two_levels() {
        let signals = FakeSignals::nominal();
        let mut tracker = LevelTracker::new(PerformanceConfig::default());

        // Drive the tracker to Minimal with sustained critical CPU.
        *signals.cpu.lock().unwrap() = 98.0;
        for _ in 0..6 {
            tracker.observe(&signals);
        }
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Minimal);

        // One idle sample: the EMA is still warm, and even once it cools the
        // level steps down through Reduced before reaching Normal.
        *signals.cpu.lock().unwrap() = 0.0;
        let first_low = tracker.observe(&signals);
        assert!(first_low >= PerformanceLevel::Reduced);

        let mut seen_reduced = false;
        for _ in 0..30 {
            let level = tracker.observe(&signals);
            if level == PerformanceLevel::Reduced {
                seen_reduced = true;
            }
            if level == PerformanceLevel::Normal {
                break;
            }
        }
        assert!(seen_reduced, "demotion must pass through Reduced");
        assert_eq!(tracker.observe(&signals), PerformanceLevel::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_publishes_transitions_only() {
        let signals = FakeSignals::nominal();
        let config = PerformanceConfig {
            sample_interval: Duration::from_millis(20),
            ..PerformanceConfig::default()
        };
        let (mut rx, handle) = spawn_performance_manager(Arc::new(signals.clone()), config);
        assert_eq!(*rx.borrow(), PerformanceLevel::Normal);

        *signals.thermal.lock().unwrap() = ThermalState::Serious;
        rx.changed().await.expect("level change");
        assert_eq!(*rx.borrow_and_update(), PerformanceLevel::Minimal);

        *signals.thermal.lock().unwrap() = ThermalState::Nominal;
        rx.changed().await.expect("level change");
        assert_eq!(*rx.borrow_and_update(), PerformanceLevel::Normal);

        handle.abort();
        let _ = handle.await;
    }
}
