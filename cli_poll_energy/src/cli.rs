use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    /// Root of the sysfs mount.
    #[arg(long, default_value = "/sys")]
    pub sysfs: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Only show info about the available meters and their zones, then exit.
    Info,

    /// Poll one meter continuously.
    Poll {
        /// Which meter to read.
        #[arg(value_enum)]
        meter: MeterKind,

        /// The zone names to record (all zones when empty).
        #[arg(short, long, value_delimiter = ',')]
        zones: Vec<String>,

        /// Measurement frequency, in Hertz.
        #[arg(short, long, default_value_t = 1)]
        frequency: u32,

        /// Print energy measurements on each iteration.
        #[arg(short, long, value_enum, default_value = "stdout")]
        output: OutputType,

        /// Sets the output file, if output is set to file.
        #[arg(long)]
        output_file: Option<PathBuf>,

        /// Allow reading the raw MSR devices when powercap is unavailable.
        #[arg(long)]
        msr: bool,

        /// Skip powercap entirely and read the raw MSR devices.
        #[arg(long)]
        msr_force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum, Debug, PartialEq, Eq)]
pub enum MeterKind {
    Rapl,
    Hwmon,
    Synthetic,
}

#[derive(Clone, Copy, ValueEnum, Debug, PartialEq, Eq)]
pub enum OutputType {
    None,
    Stdout,
    File,
}
