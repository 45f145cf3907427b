pub mod alerts;
pub mod archive;
pub mod backfill;
pub mod collect;
pub mod config;
pub mod daemon;
pub mod derive;
pub mod fetch;
pub mod mms;
pub mod normalize;
pub mod records;
pub mod registry;
pub mod status;
pub mod store;

use clap::{Args, ValueEnum};

/// Scheduler args
#[derive(Args, Debug, Clone, Default)]
pub struct CollectArgs {
    /// Run a single cycle and exit (suitable for cron/systemd timers)
    #[arg(long)]
    pub once: bool,

    /// Polling cadence in seconds (overrides AEMO_UPDATE_INTERVAL_SECONDS)
    #[arg(long)]
    pub interval_seconds: Option<u64>,
}

/// Dataset families the backfill driver can replay
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillTarget {
    Prices,
    Scada,
    Transmission,
    Rooftop,
    Curtailment,
    Demand,
    All,
}

/// Historical replay args
#[derive(Args, Debug, Clone)]
pub struct BackfillArgs {
    /// First day to replay (inclusive), format YYYY-MM-DD
    #[arg(long)]
    pub start: String,

    /// Last day to replay (inclusive), format YYYY-MM-DD
    #[arg(long)]
    pub end: String,

    /// Which dataset family to backfill
    #[arg(long, value_enum)]
    pub dataset: BackfillTarget,

    /// Probe stage only: download and validate one archive, no merge
    #[arg(long)]
    pub test: bool,

    /// Days between checkpoint writes during bulk download
    #[arg(long, default_value = "10")]
    pub checkpoint_every: u32,
}
