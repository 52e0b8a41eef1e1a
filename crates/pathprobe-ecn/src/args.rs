use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Differential ECN path measurement")]
pub struct Args {
    /// File of measurement targets
    #[clap(value_name = "TARGETS")]
    pub targets: String,

    /// How the targets file is laid out
    #[clap(
        value_enum,
        short = 'f',
        long,
        value_name = "FORMAT",
        default_value_t = TargetFormat::Hostnames
    )]
    pub format: TargetFormat,

    /// Port used for targets given as bare hostnames
    #[clap(short = 'p', long, value_name = "PORT", default_value_t = 80)]
    pub port: u16,

    /// Number of probe workers running in parallel
    #[clap(
        short = 'w',
        long,
        value_name = "N",
        env = "PATHPROBE_WORKERS",
        default_value_t = 50
    )]
    pub workers: usize,

    /// Interface to observe traffic on
    #[clap(
        short = 'i',
        long,
        env = "PATHPROBE_INTERFACE",
        default_value = "eth0"
    )]
    pub interface: String,

    /// Seconds to wait for each connection attempt
    #[clap(long, value_name = "SECONDS", default_value_t = 10)]
    pub conn_timeout: u64,

    /// Accept flow records from an external meter over TCP instead of
    /// observing packets in-process
    #[clap(long, default_value_t = false)]
    pub listener: bool,

    /// Port the ingress listener accepts meter connections on
    #[clap(long, value_name = "PORT", default_value_t = 4739)]
    pub ipfix_port: u16,

    /// External meter executable to spawn (listener deployment only)
    #[clap(long, value_name = "PROGRAM", requires = "listener")]
    pub meter: Option<String>,

    /// Run (and kill) the meter under `sudo -n`
    #[clap(long, requires = "meter", default_value_t = false)]
    pub elevate_meter: bool,

    /// Keep quiet and only log errors
    #[clap(short, long, conflicts_with = "verbose", default_value_t = false)]
    pub quiet: bool,

    #[clap(
        short = 'v',
        long,
        conflicts_with = "quiet",
        action = clap::ArgAction::Count,
        help = "Log engine activity; specify multiple times for more detail"
    )]
    pub verbose: u8,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    /// Newline-separated hostnames, optionally `rank,hostname`
    #[value(name = "hostnames")]
    Hostnames,
    /// CSV with columns `ip,port,hostname`
    #[value(name = "csv")]
    Csv,
}

impl Args {
    pub fn conn_timeout(&self) -> Duration {
        Duration::from_secs(self.conn_timeout)
    }
}
