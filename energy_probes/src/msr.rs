// According to Intel 64 and IA-32 architectures software developer's
// manual, volume 3B, MSR_PKG_ENERGY_STATUS reports the measured energy
// usage of the package. The other RAPL status registers follow the same
// layout: a 32-bit counter in the low bits, scaled by the energy status
// unit of MSR_RAPL_POWER_UNIT.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::os::unix::prelude::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use enum_map::{enum_map, Enum, EnumMap};

use crate::{Energy, EnergyZone, Power, ProbeError, Result};

type Addr = u64;

/// MSR register addresses for the RAPL domains we read.
mod registers {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0x00000606;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0x00000611;
    pub const MSR_PP0_ENERGY_STATUS: Addr = 0x00000639;
    pub const MSR_DRAM_ENERGY_STATUS: Addr = 0x00000619;
}

/// Mask to apply when reading the energy values: the hardware counter
/// occupies the low 32 bits of the register.
const MSR_ENERGY_MASK: u64 = 0xffff_ffff;

/// Number of distinct counter values before a wrap (2^32).
const MSR_COUNTER_RANGE: f64 = 4_294_967_296.0;

pub const DEFAULT_MSR_DEVICE_PATH: &str = "/dev/cpu/%/msr";

/// The RAPL domains accessible through energy-status MSRs.
#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsrDomain {
    Package,
    /// Power plane 0. Reported under the display name `core`.
    Pp0,
    Dram,
}

impl MsrDomain {
    pub fn display_name(self) -> &'static str {
        match self {
            MsrDomain::Package => "package",
            MsrDomain::Pp0 => "core",
            MsrDomain::Dram => "dram",
        }
    }
}

fn domain_addresses() -> EnumMap<MsrDomain, Addr> {
    enum_map! {
        MsrDomain::Package => registers::MSR_PKG_ENERGY_STATUS,
        MsrDomain::Pp0 => registers::MSR_PP0_ENERGY_STATUS,
        MsrDomain::Dram => registers::MSR_DRAM_ENERGY_STATUS,
    }
}

fn read_msr(msr: &File, at: Addr) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    msr.read_exact_at(&mut buf, at)?;
    Ok(u64::from_le_bytes(buf))
}

/// Extracts the energy status unit from MSR_RAPL_POWER_UNIT: bits 12:8
/// hold the exponent `u`, and one counter tick is `1/2^u` joules, i.e.
/// `10^6 / 2^u` microjoules.
fn read_energy_unit(msr: &File) -> std::io::Result<f64> {
    let value = read_msr(msr, registers::MSR_RAPL_POWER_UNIT)?;
    let esu = (value & 0x1F00) >> 8;
    Ok(1_000_000.0 / (1u64 << esu) as f64)
}

/// Splits the device path template at its `%` placeholder.
fn split_template(template: &str) -> Result<(&str, &str)> {
    template.split_once('%').ok_or_else(|| {
        ProbeError::Init(format!(
            "MSR device path '{template}' must contain a '%' placeholder for the CPU number"
        ))
    })
}

/// Directory holding the per-CPU subdirectories, e.g. `/dev/cpu`.
fn cpu_root(template: &str) -> Result<PathBuf> {
    let (prefix, _) = split_template(template)?;
    Ok(PathBuf::from(prefix.trim_end_matches('/')))
}

fn msr_path(template: &str, cpu: u32) -> Result<PathBuf> {
    let (prefix, suffix) = split_template(template)?;
    Ok(PathBuf::from(format!("{prefix}{cpu}{suffix}")))
}

/// Lists the numeric CPU directories under the template root, sorted.
fn enumerate_cpus(template: &str) -> Result<Vec<u32>> {
    let root = cpu_root(template)?;
    let entries = fs::read_dir(&root)
        .map_err(|e| ProbeError::NotAvailable(format!("cannot enumerate {}: {e}", root.display())))?;
    let mut cpus = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ProbeError::read(format!("enumerating {}", root.display()), e))?;
        if let Ok(cpu) = entry.file_name().to_string_lossy().parse::<u32>() {
            if entry.path().is_dir() {
                cpus.push(cpu);
            }
        }
    }
    cpus.sort_unstable();
    Ok(cpus)
}

/// One RAPL domain of one CPU, read directly from its MSR device.
struct MsrZone {
    name: &'static str,
    index: i32,
    path: String,
    addr: Addr,
    file: Arc<File>,
    /// Microjoules per counter tick.
    energy_unit: f64,
    max_energy: Energy,
}

impl EnergyZone for MsrZone {
    fn name(&self) -> &str {
        self.name
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
        let value = read_msr(&self.file, self.addr)
            .map_err(|e| ProbeError::read(self.path.as_str(), e))?;
        let counter = value & MSR_ENERGY_MASK;
        let uj = (counter as f64 * self.energy_unit) as u64;
        Ok(Energy::from_micro_joules(uj))
    }

    fn power(&self) -> Result<Power> {
        Err(ProbeError::Unsupported(format!(
            "MSR zone {} reports energy only",
            self.name
        )))
    }
}

/// Reads RAPL energy counters from the per-CPU MSR character devices.
pub struct MsrBackend {
    template: String,
    files: BTreeMap<u32, Arc<File>>,
    zones: Vec<Arc<dyn EnergyZone>>,
}

impl MsrBackend {
    pub fn new(device_path: impl Into<String>) -> MsrBackend {
        MsrBackend {
            template: device_path.into(),
            files: BTreeMap::new(),
            zones: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        "rapl-msr"
    }

    /// The CPU directory must exist and at least one numeric
    /// subdirectory must contain an openable MSR device file.
    pub fn available(&self) -> Result<()> {
        let cpus = enumerate_cpus(&self.template)?;
        for cpu in &cpus {
            let path = msr_path(&self.template, *cpu)?;
            if File::open(&path).is_ok() {
                return Ok(());
            }
        }
        Err(ProbeError::NotAvailable(format!(
            "no readable MSR device matching {}",
            self.template
        )))
    }

    /// Opens every CPU's MSR device, reads the energy unit from the
    /// first one and probes which energy-status registers respond.
    /// Any failure drops the handles opened so far.
    pub fn init(&mut self) -> Result<()> {
        // Build into locals so an early return cannot leak half-open state.
        let mut files: BTreeMap<u32, Arc<File>> = BTreeMap::new();
        for cpu in enumerate_cpus(&self.template)? {
            let path = msr_path(&self.template, cpu)?;
            let file = File::open(&path)
                .map_err(|e| ProbeError::read(path.display().to_string(), e))?;
            files.insert(cpu, Arc::new(file));
        }
        let (_, first) = files
            .iter()
            .next()
            .ok_or_else(|| ProbeError::NotAvailable(format!("no MSR devices matching {}", self.template)))?;

        let energy_unit = read_energy_unit(first)
            .map_err(|e| ProbeError::Init(format!("reading MSR_RAPL_POWER_UNIT: {e}")))?;
        let max_energy = Energy::from_micro_joules((MSR_COUNTER_RANGE * energy_unit) as u64);

        let addresses = domain_addresses();
        let mut zones: Vec<Arc<dyn EnergyZone>> = Vec::new();
        for (cpu, file) in &files {
            for (domain, addr) in &addresses {
                // Only keep registers that actually respond on this CPU.
                let mut probe = [0u8; 8];
                if file.read_exact_at(&mut probe, *addr).is_err() {
                    log::debug!("cpu {cpu}: MSR {addr:#x} ({}) not readable", domain.display_name());
                    continue;
                }
                let path = msr_path(&self.template, *cpu)?;
                zones.push(Arc::new(MsrZone {
                    name: domain.display_name(),
                    index: *cpu as i32,
                    path: format!("{}:{addr:#x}", path.display()),
                    addr: *addr,
                    file: file.clone(),
                    energy_unit,
                    max_energy,
                }));
            }
        }
        if zones.is_empty() {
            return Err(ProbeError::Init(format!(
                "no readable RAPL energy-status registers via {}",
                self.template
            )));
        }

        log::debug!(
            "msr: {} zones across {} CPUs, energy unit {energy_unit} uJ/tick",
            zones.len(),
            files.len()
        );
        self.files = files;
        self.zones = crate::group_zones(zones)?;
        Ok(())
    }

    /// Grouped zones: domains present on several CPUs are collapsed
    /// into one aggregate per display name.
    pub fn zones(&self) -> Result<Vec<Arc<dyn EnergyZone>>> {
        if self.zones.is_empty() {
            return Err(ProbeError::Init("MSR backend is not initialized".into()));
        }
        Ok(self.zones.clone())
    }

    /// Drops every file handle and clears all state.
    pub fn close(&mut self) {
        self.zones.clear();
        self.files.clear();
    }
}
