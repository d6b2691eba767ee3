use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::Arc;

pub mod aggregate;
pub mod chips;
pub mod hwmon;
pub mod msr;
pub mod powercap;
pub mod rapl;
pub mod synthetic;
pub mod units;

pub use units::{Energy, Power};

/// Errors produced by the probing layer.
///
/// The variants map to distinct failure semantics, so callers can make
/// decisions (try the next backend, skip a device, abort) without
/// matching on message strings.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The backend cannot be used on this host (missing directory or
    /// device). Callers may try the next backend.
    #[error("not available: {0}")]
    NotAvailable(String),

    /// The backend is present but could not verify a working read path.
    #[error("initialization failed: {0}")]
    Init(String),

    /// A file or register read failed.
    #[error("read failed: {context}: {source}")]
    Read {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A raw value could not be decoded.
    #[error("parse failed: {0}")]
    Parse(String),

    /// The operation is inapplicable to this zone kind.
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Discovery yielded no usable zones, or filtering removed them all.
    #[error("no usable zones: {0}")]
    Empty(String),

    /// A hwmon device has voltage and current sensors but no pairing
    /// strategy matched them.
    #[error("voltage/current sensors present but unmatched: {0}")]
    VoltageCurrentUnmatched(String),

    /// A failure attributed to a specific zone, e.g. one member of an
    /// aggregate.
    #[error("zone {zone}: {source}")]
    Zone {
        zone: String,
        #[source]
        source: Box<ProbeError>,
    },
}

impl ProbeError {
    pub(crate) fn read(context: impl Into<String>, source: io::Error) -> ProbeError {
        ProbeError::Read {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn for_zone(zone: impl Into<String>, source: ProbeError) -> ProbeError {
        ProbeError::Zone {
            zone: zone.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;

/// A logical energy domain exposed by some measurement instrument.
///
/// Implementations must be callable from any thread; zones that keep
/// mutable bookkeeping (see [`aggregate::AggregateZone`]) synchronize
/// internally.
pub trait EnergyZone: Send + Sync {
    /// Lowercased canonical domain label (`package`, `core`, `dram`, ...
    /// or a vendor tag like `vddgfx`). Equality is case-insensitive.
    fn name(&self) -> &str;

    /// Instance number of this zone among zones of the same name
    /// (e.g. socket id). Aggregates report `-1`.
    fn index(&self) -> i32;

    /// Human-meaningful identifier of the data source.
    fn path(&self) -> &str;

    /// The wrap bound in microjoules: the smallest energy value that
    /// cannot be observed. Zero means "no wrap" (power-only sensor).
    fn max_energy(&self) -> Energy;

    /// Current cumulative energy. `0 <= energy() < max_energy` when
    /// `max_energy > 0`.
    fn energy(&self) -> Result<Energy>;

    /// Instantaneous power, for zones that measure it directly.
    /// RAPL-family zones return [`ProbeError::Unsupported`].
    fn power(&self) -> Result<Power>;
}

impl fmt::Display for dyn EnergyZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (index {}, max {}) \t: {}",
            self.name(),
            self.index(),
            self.max_energy(),
            self.path()
        )
    }
}

/// A top-level meter: owns a backend, discovers zones once per init
/// cycle and serves them until closed.
pub trait Meter: Send {
    fn name(&self) -> &str;

    /// Selects and validates a backend, then discovers zones.
    /// Re-initialization after [`Meter::close`] repeats discovery fresh.
    fn init(&mut self) -> Result<()>;

    /// The discovered zone set. Stable between init and close.
    fn zones(&self) -> Result<Vec<Arc<dyn EnergyZone>>>;

    /// The representative total-energy zone for this host.
    fn primary_energy_zone(&self) -> Result<Arc<dyn EnergyZone>>;

    fn close(&mut self) -> Result<()>;
}

/// Normalizes a raw chip or label string: lowercase, every character
/// outside `[a-z0-9:_]` replaced by `_`, leading/trailing underscores
/// trimmed. Idempotent.
pub fn clean_name(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let replaced: String = lowered
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | ':' | '_' => c,
            _ => '_',
        })
        .collect();
    replaced.trim_matches('_').to_string()
}

/// Keeps only the zones whose name is in `allow` (case-insensitive).
/// An empty allow-list accepts everything.
pub(crate) fn filter_zones(zones: Vec<Arc<dyn EnergyZone>>, allow: &[String]) -> Vec<Arc<dyn EnergyZone>> {
    if allow.is_empty() {
        return zones;
    }
    let allowed: HashSet<String> = allow.iter().map(|n| n.to_ascii_lowercase()).collect();
    zones
        .into_iter()
        .filter(|z| allowed.contains(&z.name().to_ascii_lowercase()))
        .collect()
}

/// Groups zones by name (preserving discovery order of the names) and
/// collapses every multi-member group into an [`aggregate::AggregateZone`].
pub(crate) fn group_zones(zones: Vec<Arc<dyn EnergyZone>>) -> Result<Vec<Arc<dyn EnergyZone>>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Arc<dyn EnergyZone>>> = HashMap::new();
    for zone in zones {
        let key = zone.name().to_ascii_lowercase();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(zone);
    }

    let mut out: Vec<Arc<dyn EnergyZone>> = Vec::with_capacity(order.len());
    for name in order {
        let mut group = groups.remove(&name).unwrap();
        if group.len() == 1 {
            out.push(group.pop().unwrap());
        } else {
            log::debug!("collapsing {} zones named '{name}' into one aggregate", group.len());
            out.push(Arc::new(aggregate::AggregateZone::new(group)?));
        }
    }
    Ok(out)
}

/// Walks `preference` (case-insensitive) and returns the first zone
/// whose name matches; falls back to the first zone in discovery order.
pub(crate) fn pick_primary_zone(
    zones: &[Arc<dyn EnergyZone>],
    preference: &[&str],
) -> Option<Arc<dyn EnergyZone>> {
    for wanted in preference {
        if let Some(zone) = zones.iter().find(|z| z.name().eq_ignore_ascii_case(wanted)) {
            return Some(zone.clone());
        }
    }
    zones.first().cloned()
}

/// Reads at most 128 bytes from `file` with a single pread(2) call and
/// parses the content as a decimal `u64`.
///
/// Some hwmon drivers return EAGAIN on the second read of a value file,
/// which makes read-to-end helpers spin. One bounded read never hits
/// that path, and every sysfs value we consume fits well within 128
/// bytes.
pub(crate) fn read_u64_once(file: &std::fs::File, path: &str) -> Result<u64> {
    use std::os::unix::fs::FileExt;

    let mut buf = [0u8; 128];
    let n = file.read_at(&mut buf, 0).map_err(|e| ProbeError::read(path, e))?;
    let content = std::str::from_utf8(&buf[..n])
        .map_err(|e| ProbeError::Parse(format!("{path}: {e}")))?;
    content
        .trim()
        .parse()
        .map_err(|e| ProbeError::Parse(format!("{path}: '{}': {e}", content.trim())))
}
