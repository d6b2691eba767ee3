// Hardware-monitoring sysfs backend. Each hwmon device either exposes
// direct power channels (`powerN_input` / `powerN_average`, in
// microwatts) or, failing that, voltage and current channels that can
// be multiplied into a computed power rail (millivolts times
// milliamperes is exactly microwatts).
//
// Values are read with one bounded pread(2) each; see
// `crate::read_u64_once` for why read-to-end helpers are off limits
// here.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::chips::{self, ChipRule};
use crate::{
    clean_name, filter_zones, group_zones, pick_primary_zone, read_u64_once, Energy, EnergyZone,
    Meter, Power, ProbeError, Result,
};

pub const DEFAULT_HWMON_PATH: &str = "/sys/class/hwmon";

/// Zone names tried, in order, when picking the representative zone.
const PRIMARY_ZONE_PREFERENCE: &[&str] = &[
    "package",
    "socket",
    "cpu",
    "core",
    "ppt",
    "ppt0",
    "ppt1",
    "core_power",
    "io_power",
    "soc",
    "platform",
    "gpu",
    "vddgfx",
];

static SENSOR_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(power|in|curr)(\d+)_(.+)$").unwrap());

/// Property-name to file-name map of one sensor channel.
#[derive(Debug, Default)]
struct SensorFiles {
    props: BTreeMap<String, String>,
}

/// All sensor channels of one hwmon device, classified by type.
#[derive(Debug, Default)]
struct DeviceSensors {
    power: BTreeMap<u32, SensorFiles>,
    voltage: BTreeMap<u32, SensorFiles>,
    current: BTreeMap<u32, SensorFiles>,
}

fn classify_sensor_files(dir: &Path) -> Result<DeviceSensors> {
    let mut sensors = DeviceSensors::default();
    let entries = fs::read_dir(dir)
        .map_err(|e| ProbeError::read(format!("enumerating {}", dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ProbeError::read(format!("enumerating {}", dir.display()), e))?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(caps) = SENSOR_FILE_RE.captures(&file_name) else {
            continue;
        };
        let Ok(index) = caps[2].parse::<u32>() else {
            continue;
        };
        let table = match &caps[1] {
            "power" => &mut sensors.power,
            "in" => &mut sensors.voltage,
            "curr" => &mut sensors.current,
            _ => unreachable!("regex only matches power|in|curr"),
        };
        table
            .entry(index)
            .or_default()
            .props
            .insert(caps[3].to_string(), file_name.clone());
    }
    Ok(sensors)
}

/// Derives the chip name of a hwmon device. Three strategies, first
/// non-empty normalized result wins: the resolved `device` symlink
/// (`<type>_<name>`), the `name` file, the directory basename.
fn chip_name(dir: &Path) -> String {
    if let Ok(target) = fs::canonicalize(dir.join("device")) {
        let device_name = target
            .file_name()
            .map(|n| clean_name(&n.to_string_lossy()))
            .unwrap_or_default();
        let device_type = target
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| clean_name(&n.to_string_lossy()))
            .unwrap_or_default();
        if !device_type.is_empty() && !device_name.is_empty() {
            return format!("{device_type}_{device_name}");
        }
        if !device_name.is_empty() {
            return device_name;
        }
    }
    if let Ok(raw) = fs::read_to_string(dir.join("name")) {
        let name = clean_name(&raw);
        if !name.is_empty() {
            return name;
        }
    }
    clean_name(&dir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default())
}

fn read_label(dir: &Path, files: &SensorFiles) -> Option<String> {
    let file_name = files.props.get("label")?;
    let raw = fs::read_to_string(dir.join(file_name)).ok()?;
    let label = clean_name(&raw);
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

/// Ephemeral description of one voltage or current channel, alive for
/// a single discovery pass.
#[derive(Debug)]
struct SensorInfo {
    index: u32,
    input_path: Option<PathBuf>,
    average_path: Option<PathBuf>,
    label: Option<String>,
}

fn sensor_infos(dir: &Path, table: &BTreeMap<u32, SensorFiles>) -> Vec<SensorInfo> {
    table
        .iter()
        .filter_map(|(index, files)| {
            let input_path = files.props.get("input").map(|f| dir.join(f));
            let average_path = files.props.get("average").map(|f| dir.join(f));
            if input_path.is_none() && average_path.is_none() {
                return None;
            }
            Some(SensorInfo {
                index: *index,
                input_path,
                average_path,
                label: read_label(dir, files),
            })
        })
        .collect()
}

/// A direct hwmon power channel. Power-only: `energy()` is unsupported
/// and the wrap bound is zero.
struct HwmonPowerZone {
    name: String,
    index: i32,
    path: String,
    file: File,
}

impl EnergyZone for HwmonPowerZone {
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
        Energy::ZERO
    }

    fn energy(&self) -> Result<Energy> {
        Err(ProbeError::Unsupported(format!(
            "hwmon power zone {} has no energy counter",
            self.name
        )))
    }

    fn power(&self) -> Result<Power> {
        let uw = read_u64_once(&self.file, &self.path)?;
        Ok(Power::from_micro_watts(uw as f64))
    }
}

/// A power rail computed from a voltage channel and a current channel.
struct HwmonCalculatedZone {
    name: String,
    index: i32,
    path: String,
    voltage_path: String,
    voltage_file: File,
    current_path: String,
    current_file: File,
}

impl EnergyZone for HwmonCalculatedZone {
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
        Energy::ZERO
    }

    fn energy(&self) -> Result<Energy> {
        Err(ProbeError::Unsupported(format!(
            "hwmon calculated zone {} has no energy counter",
            self.name
        )))
    }

    fn power(&self) -> Result<Power> {
        let millivolts = read_u64_once(&self.voltage_file, &self.voltage_path)?;
        let milliamps = read_u64_once(&self.current_file, &self.current_path)?;
        Ok(Power::from_micro_watts(millivolts as f64 * milliamps as f64))
    }
}

fn build_power_zones(dir: &Path, chip: &str, sensors: &BTreeMap<u32, SensorFiles>) -> Vec<Arc<dyn EnergyZone>> {
    let mut zones: Vec<Arc<dyn EnergyZone>> = Vec::new();
    for (index, files) in sensors {
        // The averaged reading is steadier than the instantaneous one,
        // so it wins when the driver provides both.
        let Some(file_name) = files.props.get("average").or_else(|| files.props.get("input")) else {
            continue;
        };
        let path = dir.join(file_name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("skipping unreadable power channel {}: {e}", path.display());
                continue;
            }
        };
        let name = read_label(dir, files).unwrap_or_else(|| format!("{chip}_power{index}"));
        zones.push(Arc::new(HwmonPowerZone {
            name,
            index: *index as i32,
            path: path.display().to_string(),
            file,
        }));
    }
    zones
}

fn pair_by_label<'a>(
    voltages: &'a [SensorInfo],
    currents: &'a [SensorInfo],
) -> Vec<(&'a SensorInfo, &'a SensorInfo)> {
    let mut pairs = Vec::new();
    for v in voltages {
        let Some(label) = &v.label else {
            continue;
        };
        for c in currents {
            if c.label.as_ref() == Some(label) {
                pairs.push((v, c));
            }
        }
    }
    pairs
}

fn pair_same_index<'a>(
    voltages: &'a [SensorInfo],
    currents: &'a [SensorInfo],
    skip_voltages: &[u32],
    skip_currents: &[u32],
) -> Vec<(&'a SensorInfo, &'a SensorInfo)> {
    voltages
        .iter()
        .filter(|v| !skip_voltages.contains(&v.index))
        .filter_map(|v| {
            currents
                .iter()
                .find(|c| c.index == v.index && !skip_currents.contains(&c.index))
                .map(|c| (v, c))
        })
        .collect()
}

fn pair_by_rule<'a>(
    rule: &ChipRule,
    voltages: &'a [SensorInfo],
    currents: &'a [SensorInfo],
) -> Vec<(&'a SensorInfo, &'a SensorInfo)> {
    if !rule.pairs.is_empty() {
        return rule
            .pairs
            .iter()
            .filter(|(vi, ci)| !rule.skip_voltages.contains(vi) && !rule.skip_currents.contains(ci))
            .filter_map(|(vi, ci)| {
                let v = voltages.iter().find(|s| s.index == *vi)?;
                let c = currents.iter().find(|s| s.index == *ci)?;
                Some((v, c))
            })
            .collect();
    }
    if rule.same_index {
        return pair_same_index(voltages, currents, rule.skip_voltages, rule.skip_currents);
    }
    Vec::new()
}

/// Opens the files of one voltage/current pair and builds the computed
/// zone. When both channels carry an `average` file both averages are
/// used; otherwise both `input` files. Mixing the two would compare an
/// averaged numerator against an instantaneous denominator.
fn calculated_zone(
    chip: &str,
    v: &SensorInfo,
    c: &SensorInfo,
    shared_label: Option<&str>,
) -> Option<HwmonCalculatedZone> {
    let (voltage_path, current_path) = if v.average_path.is_some() && c.average_path.is_some() {
        (v.average_path.clone().unwrap(), c.average_path.clone().unwrap())
    } else if v.input_path.is_some() && c.input_path.is_some() {
        (v.input_path.clone().unwrap(), c.input_path.clone().unwrap())
    } else {
        log::warn!(
            "voltage in{} / current curr{} on {chip} have no common reading kind, skipping",
            v.index,
            c.index
        );
        return None;
    };

    let voltage_file = match File::open(&voltage_path) {
        Ok(file) => file,
        Err(e) => {
            log::warn!("cannot open {}: {e}", voltage_path.display());
            return None;
        }
    };
    let current_file = match File::open(&current_path) {
        Ok(file) => file,
        Err(e) => {
            log::warn!("cannot open {}: {e}", current_path.display());
            return None;
        }
    };

    let name = shared_label
        .map(str::to_string)
        .or_else(|| v.label.clone())
        .unwrap_or_else(|| format!("{chip}_in{}_curr{}", v.index, c.index));

    Some(HwmonCalculatedZone {
        name,
        index: v.index as i32,
        path: format!("{}*{}", voltage_path.display(), current_path.display()),
        voltage_path: voltage_path.display().to_string(),
        voltage_file,
        current_path: current_path.display().to_string(),
        current_file,
    })
}

/// Discovers the zones of a single hwmon device directory.
///
/// Direct power channels win outright. Without them, voltage and
/// current channels are paired by matching labels, then by the chip
/// rule table, then index-for-index; the first strategy producing any
/// match is used. Voltage and current sensors that no strategy can
/// pair yield [`ProbeError::VoltageCurrentUnmatched`].
fn discover_device(dir: &Path) -> Result<Vec<Arc<dyn EnergyZone>>> {
    let chip = chip_name(dir);
    let sensors = classify_sensor_files(dir)?;

    let power_zones = build_power_zones(dir, &chip, &sensors.power);
    if !power_zones.is_empty() {
        return Ok(power_zones);
    }

    let voltages = sensor_infos(dir, &sensors.voltage);
    let currents = sensor_infos(dir, &sensors.current);
    if voltages.is_empty() || currents.is_empty() {
        return Ok(Vec::new());
    }

    let label_pairs = pair_by_label(&voltages, &currents);
    let (pairs, labeled) = if !label_pairs.is_empty() {
        (label_pairs, true)
    } else {
        let rule_pairs = chips::rule_for(&chip)
            .map(|rule| pair_by_rule(rule, &voltages, &currents))
            .unwrap_or_default();
        if !rule_pairs.is_empty() {
            (rule_pairs, false)
        } else {
            let same = pair_same_index(&voltages, &currents, &[], &[]);
            if same.is_empty() {
                return Err(ProbeError::VoltageCurrentUnmatched(dir.display().to_string()));
            }
            (same, false)
        }
    };

    let mut zones: Vec<Arc<dyn EnergyZone>> = Vec::new();
    for (v, c) in pairs {
        let shared = if labeled { v.label.as_deref() } else { None };
        if let Some(zone) = calculated_zone(&chip, v, c, shared) {
            zones.push(Arc::new(zone));
        }
    }
    Ok(zones)
}

/// Scans a hwmon class directory for devices and their power zones.
pub struct HwmonBackend {
    root: PathBuf,
}

impl HwmonBackend {
    pub fn new(root: impl Into<PathBuf>) -> HwmonBackend {
        HwmonBackend { root: root.into() }
    }

    pub fn available(&self) -> Result<()> {
        let devices = self.device_dirs()?;
        if devices.is_empty() {
            return Err(ProbeError::NotAvailable(format!(
                "no hwmon devices under {}",
                self.root.display()
            )));
        }
        Ok(())
    }

    fn device_dirs(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            ProbeError::NotAvailable(format!("cannot enumerate {}: {e}", self.root.display()))
        })?;
        let mut dirs = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| ProbeError::read(format!("enumerating {}", self.root.display()), e))?;
            let path = entry.path();
            // hwmon entries are symlinks under /sys/class; follow them
            if entry.file_name().to_string_lossy().starts_with("hwmon") && path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// All zones of all devices. A device that fails discovery is
    /// logged and skipped; the others still contribute.
    pub fn discover(&self) -> Result<Vec<Arc<dyn EnergyZone>>> {
        let mut zones: Vec<Arc<dyn EnergyZone>> = Vec::new();
        for dir in self.device_dirs()? {
            match discover_device(&dir) {
                Ok(mut found) => zones.append(&mut found),
                Err(e) => log::warn!("skipping hwmon device {}: {e}", dir.display()),
            }
        }
        Ok(zones)
    }
}

/// Configuration of the hwmon meter.
#[derive(Debug, Clone)]
pub struct HwmonMeterConfig {
    /// Root of the sysfs mount; the meter looks under `class/hwmon`.
    pub sysfs_path: PathBuf,
    /// Case-insensitive allow-list of zone names; empty accepts all.
    pub zone_filter: Vec<String>,
}

impl Default for HwmonMeterConfig {
    fn default() -> Self {
        HwmonMeterConfig {
            sysfs_path: PathBuf::from("/sys"),
            zone_filter: Vec::new(),
        }
    }
}

/// Facade over the hwmon backend: filter, group, cache, pick a primary.
pub struct HwmonMeter {
    config: HwmonMeterConfig,
    zones: Vec<Arc<dyn EnergyZone>>,
    primary: RwLock<Option<Arc<dyn EnergyZone>>>,
}

impl HwmonMeter {
    pub fn new(config: HwmonMeterConfig) -> HwmonMeter {
        HwmonMeter {
            config,
            zones: Vec::new(),
            primary: RwLock::new(None),
        }
    }

    fn hwmon_root(&self) -> PathBuf {
        self.config.sysfs_path.join("class/hwmon")
    }
}

/// Zones from different devices can carry the same label and end up in
/// one aggregate; that is sometimes wrong (unrelated rails that happen
/// to share a name) and operators should see it happening.
fn warn_cross_device_groups(zones: &[Arc<dyn EnergyZone>]) {
    let mut paths_by_name: HashMap<String, Vec<&str>> = HashMap::new();
    for zone in zones {
        paths_by_name
            .entry(zone.name().to_ascii_lowercase())
            .or_default()
            .push(zone.path());
    }
    for (name, paths) in paths_by_name {
        if paths.len() > 1 {
            log::warn!(
                "hwmon zones named '{name}' found in several places ({}); \
                 they will be aggregated into one zone",
                paths.join(", ")
            );
        }
    }
}

impl Meter for HwmonMeter {
    fn name(&self) -> &str {
        "hwmon"
    }

    fn init(&mut self) -> Result<()> {
        let backend = HwmonBackend::new(self.hwmon_root());
        let raw = backend.discover()?;
        let filtered = filter_zones(raw, &self.config.zone_filter);
        if filtered.is_empty() {
            return Err(ProbeError::Empty(format!(
                "no hwmon power zones under {} (filter: {:?})",
                self.hwmon_root().display(),
                self.config.zone_filter
            )));
        }
        warn_cross_device_groups(&filtered);
        let mut grouped = group_zones(filtered)?;
        grouped.sort_by(|a, b| a.name().cmp(b.name()));
        log::info!("hwmon meter: {} zones", grouped.len());
        self.zones = grouped;
        Ok(())
    }

    fn zones(&self) -> Result<Vec<Arc<dyn EnergyZone>>> {
        if self.zones.is_empty() {
            return Err(ProbeError::Init("hwmon meter is not initialized".into()));
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

#[cfg(test)]
mod tests {
    use super::*;

    fn hwmon_dir(root: &Path, n: u32) -> PathBuf {
        let dir = root.join("class/hwmon").join(format!("hwmon{n}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(dir: &Path, file: &str, content: &str) {
        fs::write(dir.join(file), content).unwrap();
    }

    #[test]
    fn chip_name_from_name_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "name", "Max20730\n");
        assert_eq!(chip_name(&dir), "max20730");
    }

    #[test]
    fn chip_name_from_device_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        let target = tmp.path().join("devices/platform/nct6775.656");
        fs::create_dir_all(&target).unwrap();
        std::os::unix::fs::symlink(&target, dir.join("device")).unwrap();
        // the name file must lose to the device symlink
        write(&dir, "name", "othername\n");
        assert_eq!(chip_name(&dir), "platform_nct6775_656");
    }

    #[test]
    fn chip_name_falls_back_to_basename() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 3);
        assert_eq!(chip_name(&dir), "hwmon3");
    }

    #[test]
    fn classifies_sensor_files_by_type_and_index() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "power1_input", "1000\n");
        write(&dir, "power1_label", "cpu\n");
        write(&dir, "in2_input", "12000\n");
        write(&dir, "curr1_average", "500\n");
        write(&dir, "temp1_input", "42000\n");
        write(&dir, "name", "chip\n");

        let sensors = classify_sensor_files(&dir).unwrap();
        assert_eq!(sensors.power.len(), 1);
        assert_eq!(sensors.voltage.len(), 1);
        assert_eq!(sensors.current.len(), 1);
        assert_eq!(sensors.power[&1].props["input"], "power1_input");
        assert_eq!(sensors.power[&1].props["label"], "power1_label");
        assert_eq!(sensors.current[&1].props["average"], "curr1_average");
    }

    #[test]
    fn direct_power_zone_prefers_average() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "name", "amdgpu\n");
        write(&dir, "power1_input", "36000000\n");
        write(&dir, "power1_average", "35000000\n");
        write(&dir, "power1_label", "PPT\n");

        let zones = discover_device(&dir).unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name(), "ppt");
        assert_eq!(zones[0].index(), 1);
        assert!(zones[0].path().ends_with("power1_average"));
        assert_eq!(zones[0].power().unwrap().watts(), 35.0);
        assert_eq!(zones[0].max_energy(), Energy::ZERO);
        assert!(matches!(zones[0].energy(), Err(ProbeError::Unsupported(_))));
    }

    #[test]
    fn unlabeled_power_zone_gets_chip_fallback_name() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "name", "amdgpu\n");
        write(&dir, "power2_input", "1000\n");

        let zones = discover_device(&dir).unwrap();
        assert_eq!(zones[0].name(), "amdgpu_power2");
    }

    #[test]
    fn direct_power_suppresses_calculated_zones() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "name", "ina226\n");
        write(&dir, "power1_input", "5000000\n");
        write(&dir, "in1_input", "12000\n");
        write(&dir, "curr1_input", "1000\n");

        let zones = discover_device(&dir).unwrap();
        assert_eq!(zones.len(), 1);
        assert!(zones[0].path().ends_with("power1_input"));
    }

    #[test]
    fn max20730_uses_vout_not_vin() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "name", "max20730\n");
        write(&dir, "in1_input", "48000\n");
        write(&dir, "in2_input", "12000\n");
        write(&dir, "curr1_input", "10000\n");

        let zones = discover_device(&dir).unwrap();
        assert_eq!(zones.len(), 1);
        // in2 (VOUT) x curr1: 12 V x 10 A = 120 W, never 48 V x 10 A
        assert_eq!(zones[0].power().unwrap().watts(), 120.0);
    }

    #[test]
    fn label_match_beats_chip_rule() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        // the max20730 rule would pair in2 with curr1; the labels pair in1
        write(&dir, "name", "max20730\n");
        write(&dir, "in1_input", "48000\n");
        write(&dir, "in1_label", "rail\n");
        write(&dir, "in2_input", "12000\n");
        write(&dir, "curr1_input", "10000\n");
        write(&dir, "curr1_label", "rail\n");

        let zones = discover_device(&dir).unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name(), "rail");
        assert_eq!(zones[0].power().unwrap().watts(), 480.0);
    }

    #[test]
    fn averages_only_used_when_both_sides_have_them() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "name", "somechip\n");
        write(&dir, "in1_input", "12000\n");
        write(&dir, "in1_average", "11800\n");
        write(&dir, "in1_label", "vdd\n");
        write(&dir, "curr1_input", "5000\n");
        write(&dir, "curr1_label", "vdd\n");

        let zones = discover_device(&dir).unwrap();
        assert_eq!(zones.len(), 1);
        // curr1 has no average, so both sides read their input files:
        // 12 V x 5 A = 60 W, not 11.8 V x 5 A
        assert_eq!(zones[0].power().unwrap().watts(), 60.0);
    }

    #[test]
    fn both_averages_preferred_over_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "name", "somechip\n");
        write(&dir, "in1_input", "99000\n");
        write(&dir, "in1_average", "10000\n");
        write(&dir, "curr1_input", "99000\n");
        write(&dir, "curr1_average", "2000\n");

        let zones = discover_device(&dir).unwrap();
        assert_eq!(zones[0].power().unwrap().watts(), 20.0);
    }

    #[test]
    fn ina3221_skips_shunt_voltages() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "name", "ina3221\n");
        for i in [1u32, 2, 4] {
            write(&dir, &format!("in{i}_input"), "12000\n");
            write(&dir, &format!("curr{i}_input"), "1000\n");
        }

        let zones = discover_device(&dir).unwrap();
        // in4 is a shunt voltage; only channels 1 and 2 become zones
        assert_eq!(zones.len(), 2);
        let mut indexes: Vec<i32> = zones.iter().map(|z| z.index()).collect();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![1, 2]);
    }

    #[test]
    fn same_index_fallback_without_rule() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "name", "unknownchip\n");
        write(&dir, "in3_input", "5000\n");
        write(&dir, "curr3_input", "2000\n");

        let zones = discover_device(&dir).unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name(), "unknownchip_in3_curr3");
        assert_eq!(zones[0].power().unwrap().watts(), 10.0);
    }

    #[test]
    fn unpairable_sensors_are_a_distinct_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "name", "unknownchip\n");
        write(&dir, "in1_input", "5000\n");
        write(&dir, "curr2_input", "2000\n");

        assert!(matches!(
            discover_device(&dir),
            Err(ProbeError::VoltageCurrentUnmatched(_))
        ));
    }

    #[test]
    fn device_without_power_sensors_yields_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "name", "drivetemp\n");
        write(&dir, "temp1_input", "35000\n");
        assert!(discover_device(&dir).unwrap().is_empty());
    }

    #[test]
    fn backend_skips_broken_devices() {
        let tmp = tempfile::tempdir().unwrap();
        let good = hwmon_dir(tmp.path(), 0);
        write(&good, "name", "amdgpu\n");
        write(&good, "power1_input", "1000\n");
        let broken = hwmon_dir(tmp.path(), 1);
        write(&broken, "name", "unknownchip\n");
        write(&broken, "in1_input", "5000\n");
        write(&broken, "curr2_input", "2000\n");

        let backend = HwmonBackend::new(tmp.path().join("class/hwmon"));
        let zones = backend.discover().unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name(), "amdgpu_power1");
    }

    #[test]
    fn meter_filters_groups_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        // two devices exposing the same label plus an extra rail
        for n in [0u32, 1] {
            let dir = hwmon_dir(tmp.path(), n);
            write(&dir, "name", "socketmon\n");
            write(&dir, "power1_input", "10000000\n");
            write(&dir, "power1_label", "Package\n");
        }
        let extra = hwmon_dir(tmp.path(), 2);
        write(&extra, "name", "boardmon\n");
        write(&extra, "power1_input", "2000000\n");
        write(&extra, "power1_label", "12v_rail\n");

        let mut meter = HwmonMeter::new(HwmonMeterConfig {
            sysfs_path: tmp.path().to_path_buf(),
            zone_filter: Vec::new(),
        });
        meter.init().unwrap();
        let zones = meter.zones().unwrap();
        assert_eq!(zones.len(), 2);
        // sorted by name
        assert_eq!(zones[0].name(), "12v_rail");
        assert_eq!(zones[1].name(), "package");
        // the two package rails collapsed into an aggregate that sums power
        assert_eq!(zones[1].index(), -1);
        assert_eq!(zones[1].power().unwrap().watts(), 20.0);

        // primary preference picks package over the free-form rail
        let primary = meter.primary_energy_zone().unwrap();
        assert_eq!(primary.name(), "package");

        meter.close().unwrap();
        assert!(meter.zones().is_err());
    }

    #[test]
    fn meter_filter_is_case_insensitive() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = hwmon_dir(tmp.path(), 0);
        write(&dir, "name", "amdgpu\n");
        write(&dir, "power1_input", "1000\n");
        write(&dir, "power1_label", "vddgfx\n");

        let mut meter = HwmonMeter::new(HwmonMeterConfig {
            sysfs_path: tmp.path().to_path_buf(),
            zone_filter: vec!["VDDGFX".to_string()],
        });
        meter.init().unwrap();
        assert_eq!(meter.zones().unwrap().len(), 1);

        let mut meter = HwmonMeter::new(HwmonMeterConfig {
            sysfs_path: tmp.path().to_path_buf(),
            zone_filter: vec!["nonexistent".to_string()],
        });
        assert!(matches!(meter.init(), Err(ProbeError::Empty(_))));
    }
}
