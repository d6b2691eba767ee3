// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.
//
// Zones appear as `intel-rapl:<socket>[:<subzone>]` directories (or
// symlinks, under /sys/class/powercap) carrying a `name` file, an
// `energy_uj` counter and its wrap bound `max_energy_range_uj`.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{read_u64_once, Energy, EnergyZone, Power, ProbeError, Result};

pub const DEFAULT_POWERCAP_PATH: &str = "/sys/class/powercap";

const POWER_ZONE_PREFIX: &str = "intel-rapl:";

/// A RAPL zone found in the powercap tree, before its files are opened.
#[derive(Debug, Clone)]
struct DiscoveredZone {
    name: String,
    index: i32,
    dir: PathBuf,
}

/// Splits the powercap zone name and directory into the canonical
/// (name, index) identity: `package-0` becomes `("package", 0)`,
/// subzone names (`core`, `dram`, ...) keep the socket number from the
/// `intel-rapl:<socket>[:<sub>]` directory name.
fn zone_identity(raw_name: &str, dir_name: &str) -> (String, i32) {
    if let Some(id) = raw_name.strip_prefix("package-") {
        if let Ok(index) = id.parse::<i32>() {
            return ("package".to_string(), index);
        }
    }
    let index = dir_name
        .strip_prefix(POWER_ZONE_PREFIX)
        .and_then(|rest| rest.split(':').next())
        .and_then(|n| n.parse::<i32>().ok())
        .unwrap_or(0);
    (raw_name.to_ascii_lowercase(), index)
}

/// Walks `dir` for powercap zones, recursing into nested subzones.
/// The same subzone can be reachable both flattened (as a symlink in
/// /sys/class/powercap) and nested (inside its parent), so entries are
/// de-duplicated by directory basename.
fn explore(dir: &Path, seen: &mut HashSet<String>, found: &mut Vec<DiscoveredZone>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .map_err(|e| ProbeError::read(format!("enumerating {}", dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ProbeError::read(format!("enumerating {}", dir.display()), e))?;
        let path = entry.path();
        let file_name = match path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => continue,
        };
        if !file_name.starts_with(POWER_ZONE_PREFIX) || !path.is_dir() {
            continue;
        }
        if !seen.insert(file_name.clone()) {
            continue;
        }

        let name_path = path.join("name");
        let raw_name = fs::read_to_string(&name_path)
            .map_err(|e| ProbeError::read(name_path.display().to_string(), e))?;
        let (name, index) = zone_identity(raw_name.trim(), &file_name);
        explore(&path, seen, found)?;
        found.push(DiscoveredZone { name, index, dir: path });
    }
    Ok(())
}

fn discover(root: &Path) -> Result<Vec<DiscoveredZone>> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    explore(root, &mut seen, &mut found)?;
    found.sort_by_key(|z| z.dir.to_string_lossy().to_string());
    Ok(found)
}

/// One opened RAPL powercap zone.
struct PowercapZone {
    name: String,
    index: i32,
    /// The zone directory, e.g. `/sys/class/powercap/intel-rapl:0`.
    path: String,
    energy_path: String,
    energy_file: File,
    max_energy: Energy,
}

impl PowercapZone {
    fn open(zone: &DiscoveredZone) -> Result<PowercapZone> {
        let energy_path = zone.dir.join("energy_uj");
        let energy_file = File::open(&energy_path)
            .map_err(|e| ProbeError::read(energy_path.display().to_string(), e))?;

        let max_path = zone.dir.join("max_energy_range_uj");
        let max_raw = fs::read_to_string(&max_path)
            .map_err(|e| ProbeError::read(max_path.display().to_string(), e))?;
        let max_energy: u64 = max_raw
            .trim()
            .parse()
            .map_err(|e| ProbeError::Parse(format!("{}: '{}': {e}", max_path.display(), max_raw.trim())))?;

        Ok(PowercapZone {
            name: zone.name.clone(),
            index: zone.index,
            path: zone.dir.display().to_string(),
            energy_path: energy_path.display().to_string(),
            energy_file,
            max_energy: Energy::from_micro_joules(max_energy),
        })
    }
}

impl EnergyZone for PowercapZone {
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
        let uj = read_u64_once(&self.energy_file, &self.energy_path)?;
        Ok(Energy::from_micro_joules(uj))
    }

    fn power(&self) -> Result<Power> {
        Err(ProbeError::Unsupported(format!(
            "powercap zone {} reports energy only",
            self.name
        )))
    }
}

/// Reads RAPL energy counters through the power-capping sysfs tree.
pub struct PowercapBackend {
    root: PathBuf,
    zones: Vec<Arc<dyn EnergyZone>>,
}

impl PowercapBackend {
    pub fn new(root: impl Into<PathBuf>) -> PowercapBackend {
        PowercapBackend {
            root: root.into(),
            zones: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        "rapl-powercap"
    }

    /// The tree must enumerate successfully and contain at least one
    /// RAPL zone.
    pub fn available(&self) -> Result<()> {
        let found = discover(&self.root).map_err(|e| {
            ProbeError::NotAvailable(format!("cannot enumerate {}: {e}", self.root.display()))
        })?;
        if found.is_empty() {
            return Err(ProbeError::NotAvailable(format!(
                "no intel-rapl zones under {}",
                self.root.display()
            )));
        }
        Ok(())
    }

    /// Opens every zone and verifies a working read path on the first.
    pub fn init(&mut self) -> Result<()> {
        let found = discover(&self.root)?;
        if found.is_empty() {
            return Err(ProbeError::NotAvailable(format!(
                "no intel-rapl zones under {}",
                self.root.display()
            )));
        }

        let mut zones: Vec<Arc<dyn EnergyZone>> = Vec::with_capacity(found.len());
        for zone in &found {
            zones.push(Arc::new(PowercapZone::open(zone)?));
        }
        zones[0]
            .energy()
            .map_err(|e| ProbeError::Init(format!("powercap read check failed: {e}")))?;

        log::debug!("powercap: {} zones under {}", zones.len(), self.root.display());
        self.zones = zones;
        Ok(())
    }

    pub fn zones(&self) -> Result<Vec<Arc<dyn EnergyZone>>> {
        if self.zones.is_empty() {
            return Err(ProbeError::Init("powercap backend is not initialized".into()));
        }
        Ok(self.zones.clone())
    }

    pub fn close(&mut self) {
        self.zones.clear();
    }
}
