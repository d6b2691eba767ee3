// Top-level facade for CPU energy. Powercap is the preferred data
// source because it is world-readable on most distributions and the
// kernel has already decoded the RAPL register layout; the raw MSR
// devices are a fallback that requires elevated privileges.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::msr::{MsrBackend, DEFAULT_MSR_DEVICE_PATH};
use crate::powercap::PowercapBackend;
use crate::{filter_zones, group_zones, pick_primary_zone, EnergyZone, Meter, ProbeError, Result};

const PRIMARY_ZONE_PREFERENCE: &[&str] = &["psys", "package", "core", "dram", "uncore"];

/// Configuration of the RAPL meter.
#[derive(Debug, Clone)]
pub struct RaplMeterConfig {
    /// Root of the sysfs mount; the meter looks under `class/powercap`.
    pub sysfs_path: PathBuf,
    /// Allow falling back to the MSR devices when powercap is unusable.
    pub msr_enabled: bool,
    /// Skip powercap entirely and read the MSR devices.
    pub msr_force: bool,
    /// Template for the per-CPU MSR device, with a `%` placeholder for
    /// the CPU number.
    pub msr_device_path: String,
    /// Case-insensitive allow-list of zone names; empty accepts all.
    pub zone_filter: Vec<String>,
}

impl Default for RaplMeterConfig {
    fn default() -> Self {
        RaplMeterConfig {
            sysfs_path: PathBuf::from("/sys"),
            msr_enabled: false,
            msr_force: false,
            msr_device_path: DEFAULT_MSR_DEVICE_PATH.to_string(),
            zone_filter: Vec::new(),
        }
    }
}

enum RaplBackend {
    Powercap(PowercapBackend),
    Msr(MsrBackend),
}

impl RaplBackend {
    fn name(&self) -> &'static str {
        match self {
            RaplBackend::Powercap(b) => b.name(),
            RaplBackend::Msr(b) => b.name(),
        }
    }

    fn zones(&self) -> Result<Vec<Arc<dyn EnergyZone>>> {
        match self {
            RaplBackend::Powercap(b) => b.zones(),
            RaplBackend::Msr(b) => b.zones(),
        }
    }

    fn close(&mut self) {
        match self {
            RaplBackend::Powercap(b) => b.close(),
            RaplBackend::Msr(b) => b.close(),
        }
    }
}

fn warn_msr_security() {
    log::warn!(
        "using the raw MSR devices for RAPL: fine-grained energy counters \
         are a documented side channel, make sure the MSR devices are not \
         readable from unprivileged contexts"
    );
}

/// Paths in their canonical backend form win de-duplication: the
/// powercap form contains `/intel-rapl:`, the MSR form `/msr:`.
fn is_standard_path(path: &str) -> bool {
    path.contains("/intel-rapl:") || path.contains("/msr:")
}

/// Collapses zones sharing a (name, index) identity, keeping the one
/// with the canonical path.
fn dedup_zones(zones: Vec<Arc<dyn EnergyZone>>) -> Vec<Arc<dyn EnergyZone>> {
    let mut slots: HashMap<(String, i32), usize> = HashMap::new();
    let mut out: Vec<Arc<dyn EnergyZone>> = Vec::with_capacity(zones.len());
    for zone in zones {
        let key = (zone.name().to_ascii_lowercase(), zone.index());
        match slots.get(&key) {
            None => {
                slots.insert(key, out.len());
                out.push(zone);
            }
            Some(&slot) => {
                log::debug!(
                    "duplicate zone {}-{}: '{}' vs '{}'",
                    zone.name(),
                    zone.index(),
                    out[slot].path(),
                    zone.path()
                );
                if !is_standard_path(out[slot].path()) && is_standard_path(zone.path()) {
                    out[slot] = zone;
                }
            }
        }
    }
    out
}

/// CPU energy meter over RAPL counters, choosing between the powercap
/// sysfs tree and the raw MSR devices.
pub struct RaplMeter {
    config: RaplMeterConfig,
    backend: Option<RaplBackend>,
    zones: Vec<Arc<dyn EnergyZone>>,
    primary: RwLock<Option<Arc<dyn EnergyZone>>>,
}

impl RaplMeter {
    pub fn new(config: RaplMeterConfig) -> RaplMeter {
        RaplMeter {
            config,
            backend: None,
            zones: Vec::new(),
            primary: RwLock::new(None),
        }
    }

    /// The name of the backend selected by [`Meter::init`].
    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    fn select_backend(&self) -> Result<RaplBackend> {
        if self.config.msr_force {
            let mut msr = MsrBackend::new(self.config.msr_device_path.clone());
            msr.available()?;
            msr.init()?;
            warn_msr_security();
            return Ok(RaplBackend::Msr(msr));
        }

        let mut tried: Vec<String> = Vec::new();

        let powercap_root = self.config.sysfs_path.join("class/powercap");
        let mut powercap = PowercapBackend::new(&powercap_root);
        match powercap.available().and_then(|_| powercap.init()) {
            Ok(()) => return Ok(RaplBackend::Powercap(powercap)),
            Err(e) => tried.push(format!("powercap at {}: {e}", powercap_root.display())),
        }

        if self.config.msr_enabled {
            let mut msr = MsrBackend::new(self.config.msr_device_path.clone());
            match msr.available().and_then(|_| msr.init()) {
                Ok(()) => {
                    warn_msr_security();
                    return Ok(RaplBackend::Msr(msr));
                }
                Err(e) => tried.push(format!("msr at {}: {e}", self.config.msr_device_path)),
            }
        } else {
            tried.push("msr: disabled by configuration".to_string());
        }

        Err(ProbeError::NotAvailable(format!(
            "no usable RAPL backend; tried: {}",
            tried.join("; ")
        )))
    }
}

impl Meter for RaplMeter {
    fn name(&self) -> &str {
        "rapl"
    }

    fn init(&mut self) -> Result<()> {
        let backend = self.select_backend()?;

        // Validate the selected backend before committing to it.
        let raw = backend.zones()?;
        let first = raw
            .first()
            .ok_or_else(|| ProbeError::Empty(format!("{} discovered no zones", backend.name())))?;
        first
            .energy()
            .map_err(|e| ProbeError::Init(format!("{} read check failed: {e}", backend.name())))?;

        let filtered = filter_zones(raw, &self.config.zone_filter);
        if filtered.is_empty() {
            return Err(ProbeError::Empty(format!(
                "zone filter {:?} removed every zone of {}",
                self.config.zone_filter,
                backend.name()
            )));
        }
        let grouped = group_zones(dedup_zones(filtered))?;

        log::info!("rapl meter: {} zones via {}", grouped.len(), backend.name());
        self.zones = grouped;
        self.backend = Some(backend);
        Ok(())
    }

    fn zones(&self) -> Result<Vec<Arc<dyn EnergyZone>>> {
        if self.zones.is_empty() {
            return Err(ProbeError::Init("rapl meter is not initialized".into()));
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
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
        self.zones.clear();
        *self.primary.write().unwrap() = None;
        Ok(())
    }
}
