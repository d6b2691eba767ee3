use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use log::warn;

use cli::{Cli, Commands, MeterKind, OutputType};
use energy_probes::hwmon::{HwmonMeter, HwmonMeterConfig};
use energy_probes::rapl::{RaplMeter, RaplMeterConfig};
use energy_probes::synthetic::{SyntheticConfig, SyntheticMeter};
use energy_probes::{EnergyZone, Meter, ProbeError};

mod cli;

fn main() -> anyhow::Result<()> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();

    match cli.command {
        Commands::Info => {
            show_info(&cli.sysfs);
            Ok(())
        }
        Commands::Poll {
            meter,
            zones,
            frequency,
            output,
            output_file,
            msr,
            msr_force,
        } => {
            let mut meter: Box<dyn Meter> = match meter {
                MeterKind::Rapl => Box::new(RaplMeter::new(RaplMeterConfig {
                    sysfs_path: cli.sysfs.clone(),
                    msr_enabled: msr,
                    msr_force,
                    zone_filter: zones,
                    ..Default::default()
                })),
                MeterKind::Hwmon => Box::new(HwmonMeter::new(HwmonMeterConfig {
                    sysfs_path: cli.sysfs.clone(),
                    zone_filter: zones,
                })),
                MeterKind::Synthetic => Box::new(SyntheticMeter::new(SyntheticConfig::default())),
            };
            meter.init().context("meter initialization failed")?;

            let polling_period = Duration::from_secs_f64({
                if frequency == 0 {
                    0.0
                } else {
                    1.0 / frequency as f64
                }
            });

            let writer: Option<Box<dyn Write>> = match output {
                OutputType::None => None,
                OutputType::Stdout => Some(Box::new(std::io::stdout())),
                OutputType::File => {
                    let path = output_file.context("--output-file is required with --output file")?;
                    let file = File::create(&path)
                        .with_context(|| format!("cannot create {}", path.display()))?;
                    Some(Box::new(BufWriter::new(file)))
                }
            };

            poll_meter(meter.as_ref(), polling_period, writer).context("meter error")
        }
    }
}

/// Initializes every meter against this host and prints what it sees.
fn show_info(sysfs: &Path) {
    let mut rapl = RaplMeter::new(RaplMeterConfig {
        sysfs_path: sysfs.to_path_buf(),
        ..Default::default()
    });
    match rapl.init() {
        Ok(()) => {
            println!(
                "\nRAPL zones (via {}):",
                rapl.backend_name().unwrap_or("unknown backend")
            );
            print_zones(&rapl);
        }
        Err(e) => warn!("RAPL meter unavailable: {e}"),
    }

    let mut hwmon = HwmonMeter::new(HwmonMeterConfig {
        sysfs_path: sysfs.to_path_buf(),
        ..Default::default()
    });
    match hwmon.init() {
        Ok(()) => {
            println!("\nHwmon zones:");
            print_zones(&hwmon);
        }
        Err(e) => warn!("hwmon meter unavailable: {e}"),
    }
}

fn print_zones(meter: &dyn Meter) {
    match meter.zones() {
        Ok(zones) => {
            for zone in zones {
                println!("- {zone}");
            }
            if let Ok(primary) = meter.primary_energy_zone() {
                println!("primary zone: {}", primary.name());
            }
        }
        Err(e) => warn!("cannot list zones of {}: {e}", meter.name()),
    }
}

/// Forward progress of a wrapping counter between two readings.
fn energy_delta(current: u64, previous: u64, max: u64) -> u64 {
    if current >= previous {
        current - previous
    } else if max > 0 {
        (max - previous) + current
    } else {
        current.wrapping_sub(previous)
    }
}

/// Polls every zone of `meter` at the given period, printing one CSV
/// line per zone and iteration. Average watts are derived from the
/// energy deltas; power-only zones report their instantaneous reading.
fn poll_meter(meter: &dyn Meter, period: Duration, mut writer: Option<Box<dyn Write>>) -> anyhow::Result<()> {
    if let Some(w) = &mut writer {
        w.write_all(b"zone;microjoules;watts\n")?;
    }

    let zones = meter.zones()?;
    let mut previous: HashMap<String, (u64, Instant)> = HashMap::new();

    loop {
        std::thread::sleep(period);

        for zone in &zones {
            let line = match zone.energy() {
                Ok(energy) => {
                    let now = Instant::now();
                    let uj = energy.micro_joules();
                    let watts = previous.get(zone.path()).map(|(prev, at)| {
                        let delta = energy_delta(uj, *prev, zone.max_energy().micro_joules());
                        delta as f64 / 1_000_000.0 / now.duration_since(*at).as_secs_f64()
                    });
                    previous.insert(zone.path().to_string(), (uj, now));
                    match watts {
                        Some(w) => format!("{};{uj};{w:.3}\n", zone.name()),
                        None => format!("{};{uj};\n", zone.name()),
                    }
                }
                // power-only zones (hwmon) have no energy counter
                Err(ProbeError::Unsupported(_)) => {
                    let power = zone
                        .power()
                        .with_context(|| format!("reading power of {}", zone.name()))?;
                    format!("{};;{:.3}\n", zone.name(), power.watts())
                }
                Err(e) => return Err(e).context("refreshing measurements"),
            };

            if let Some(w) = &mut writer {
                w.write_all(line.as_bytes())?;
            } else {
                // keep reading even without output, like a collector would
                std::hint::black_box(&line);
            }
        }

        if let Some(w) = &mut writer {
            w.flush()?;
        }
    }
}
