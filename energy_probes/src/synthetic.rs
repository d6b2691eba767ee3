// Deterministic fake meter for tests and demonstrations. Zones produce
// an energy curve from elapsed wall-clock time, a nominal wattage, the
// current CPU load when /proc is readable, and a small seeded noise
// component, wrapping at their configured bound like real counters do.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{group_zones, pick_primary_zone, Energy, EnergyZone, Meter, Power, ProbeError, Result};

const PRIMARY_ZONE_PREFERENCE: &[&str] = &["psys", "package", "core", "dram", "uncore"];

/// One fake zone to synthesize.
#[derive(Debug, Clone)]
pub struct SyntheticZoneConfig {
    pub name: String,
    pub nominal_watts: f64,
    pub max_energy: Energy,
}

/// Configuration of the synthetic meter. The seed makes runs
/// reproducible: identical seeds replay identical noise sequences.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub zones: Vec<SyntheticZoneConfig>,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig {
            zones: vec![
                SyntheticZoneConfig {
                    name: "package".to_string(),
                    nominal_watts: 45.0,
                    max_energy: Energy::from_micro_joules(262_143_328_850),
                },
                SyntheticZoneConfig {
                    name: "dram".to_string(),
                    nominal_watts: 9.0,
                    max_energy: Energy::from_micro_joules(65_712_999_613),
                },
            ],
            seed: 0,
        }
    }
}

/// Busy fraction of the machine, from the one-minute load average.
/// `/proc` can be absent (containers with a masked procfs), in which
/// case the caller falls back to synthetic noise.
fn cpu_utilization() -> Option<f64> {
    let load = procfs::LoadAverage::new().ok()?;
    let cores = procfs::CpuInfo::new().ok()?.num_cores().max(1);
    Some((load.one as f64 / cores as f64).clamp(0.0, 1.0))
}

struct SyntheticState {
    rng: StdRng,
    last_update: Instant,
    accumulated: u64,
}

pub struct SyntheticZone {
    name: String,
    index: i32,
    path: String,
    nominal_watts: f64,
    max_energy: Energy,
    state: Mutex<SyntheticState>,
}

impl SyntheticZone {
    fn new(config: &SyntheticZoneConfig, seed: u64) -> SyntheticZone {
        SyntheticZone {
            name: config.name.to_ascii_lowercase(),
            index: 0,
            path: format!("synthetic-{}", config.name.to_ascii_lowercase()),
            nominal_watts: config.nominal_watts,
            max_energy: config.max_energy,
            state: Mutex::new(SyntheticState {
                rng: StdRng::seed_from_u64(seed),
                last_update: Instant::now(),
                accumulated: 0,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str, index: i32) -> SyntheticZone {
        let mut zone = SyntheticZone::new(
            &SyntheticZoneConfig {
                name: name.to_string(),
                nominal_watts: 10.0,
                max_energy: Energy::from_micro_joules(1_000_000_000),
            },
            42,
        );
        zone.name = name.to_string();
        zone.index = index;
        zone
    }
}

impl EnergyZone for SyntheticZone {
    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> i32 {
        self.index
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn max_energy(&self) -> Energy {
        self.max_energy
    }

    fn energy(&self) -> Result<Energy> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();

        let utilization = cpu_utilization().unwrap_or_else(|| state.rng.gen_range(0.3..0.7));
        let noise = state.rng.gen_range(0.95..1.05);
        // idle draw is half the nominal wattage, load adds the rest
        let watts = self.nominal_watts * (0.5 + 0.5 * utilization) * noise;

        let increment = (watts * elapsed * 1_000_000.0) as u64;
        state.accumulated = state.accumulated.wrapping_add(increment);
        let max = self.max_energy.micro_joules();
        if max > 0 {
            state.accumulated %= max;
        }
        state.last_update = now;
        Ok(Energy::from_micro_joules(state.accumulated))
    }

    fn power(&self) -> Result<Power> {
        Err(ProbeError::Unsupported(format!(
            "synthetic zone {} mimics an energy counter",
            self.name
        )))
    }
}

/// Fake meter producing realistic-looking energy curves.
pub struct SyntheticMeter {
    config: SyntheticConfig,
    zones: Vec<Arc<dyn EnergyZone>>,
    primary: RwLock<Option<Arc<dyn EnergyZone>>>,
}

impl SyntheticMeter {
    pub fn new(config: SyntheticConfig) -> SyntheticMeter {
        SyntheticMeter {
            config,
            zones: Vec::new(),
            primary: RwLock::new(None),
        }
    }
}

impl Meter for SyntheticMeter {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn init(&mut self) -> Result<()> {
        if self.config.zones.is_empty() {
            return Err(ProbeError::Empty("synthetic meter has no configured zones".into()));
        }
        let zones: Vec<Arc<dyn EnergyZone>> = self
            .config
            .zones
            .iter()
            .enumerate()
            .map(|(i, z)| {
                Arc::new(SyntheticZone::new(z, self.config.seed.wrapping_add(i as u64)))
                    as Arc<dyn EnergyZone>
            })
            .collect();
        self.zones = group_zones(zones)?;
        Ok(())
    }

    fn zones(&self) -> Result<Vec<Arc<dyn EnergyZone>>> {
        if self.zones.is_empty() {
            return Err(ProbeError::Init("synthetic meter is not initialized".into()));
        }
        Ok(self.zones.clone())
    }

    fn primary_energy_zone(&self) -> Result<Arc<dyn EnergyZone>> {
        if let Some(primary) = self.primary.read().unwrap().as_ref() {
            return Ok(primary.clone());
        }
        let zones = self.zones()?;
        let primary = pick_primary_zone(&zones, PRIMARY_ZONE_PREFERENCE)
            .ok_or_else(|| ProbeError::Empty("no zones to pick a primary from".into()))?;
        *self.primary.write().unwrap() = Some(primary.clone());
        Ok(primary)
    }

    fn close(&mut self) -> Result<()> {
        self.zones.clear();
        *self.primary.write().unwrap() = None;
        Ok(())
    }
}

/// Marker prefix of synthetic zone paths, so consumers can tell fake
/// output from real hardware.
pub const SYNTHETIC_PATH_PREFIX: &str = "synthetic-";

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn default_config_builds_zones() {
        let mut meter = SyntheticMeter::new(SyntheticConfig::default());
        meter.init().unwrap();
        let zones = meter.zones().unwrap();
        let names: Vec<&str> = zones.iter().map(|z| z.name()).collect();
        assert_eq!(names, vec!["package", "dram"]);
        assert!(zones.iter().all(|z| z.path().starts_with(SYNTHETIC_PATH_PREFIX)));
    }

    #[test]
    fn energy_is_monotonic_and_bounded() {
        let zone = SyntheticZone::new(
            &SyntheticZoneConfig {
                name: "package".to_string(),
                nominal_watts: 30.0,
                max_energy: Energy::from_micro_joules(u64::MAX),
            },
            7,
        );
        let mut previous = 0u64;
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(2));
            let e = zone.energy().unwrap().micro_joules();
            assert!(e >= previous, "energy went backwards: {previous} -> {e}");
            previous = e;
        }
    }

    #[test]
    fn energy_stays_below_the_wrap_bound() {
        let zone = SyntheticZone::new(
            &SyntheticZoneConfig {
                name: "package".to_string(),
                nominal_watts: 100_000.0,
                max_energy: Energy::from_micro_joules(1_000),
            },
            7,
        );
        for _ in 0..10 {
            thread::sleep(Duration::from_millis(1));
            assert!(zone.energy().unwrap().micro_joules() < 1_000);
        }
    }

    #[test]
    fn power_is_unsupported() {
        let zone = SyntheticZone::for_tests("package", 0);
        assert!(matches!(zone.power(), Err(ProbeError::Unsupported(_))));
    }

    #[test]
    fn empty_config_fails_init() {
        let mut meter = SyntheticMeter::new(SyntheticConfig {
            zones: Vec::new(),
            seed: 0,
        });
        assert!(matches!(meter.init(), Err(ProbeError::Empty(_))));
    }

    #[test]
    fn close_then_reinit() {
        let mut meter = SyntheticMeter::new(SyntheticConfig::default());
        meter.init().unwrap();
        meter.close().unwrap();
        assert!(meter.zones().is_err());
        meter.init().unwrap();
        assert_eq!(meter.zones().unwrap().len(), 2);
        assert_eq!(meter.primary_energy_zone().unwrap().name(), "package");
    }
}
