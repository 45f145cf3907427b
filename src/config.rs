use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// NEMWEB directory trees. Current holds roughly the last two days of
/// artifacts, Archive holds history (daily/weekly/monthly bundles).
pub mod urls {
    pub const DISPATCH_IS_CURRENT: &str =
        "https://nemweb.com.au/Reports/Current/DispatchIS_Reports/";
    pub const DISPATCH_IS_ARCHIVE: &str =
        "https://nemweb.com.au/Reports/ARCHIVE/DispatchIS_Reports/";
    pub const DISPATCH_SCADA_CURRENT: &str =
        "https://nemweb.com.au/Reports/Current/Dispatch_SCADA/";
    pub const DISPATCH_SCADA_ARCHIVE: &str =
        "https://nemweb.com.au/Reports/ARCHIVE/Dispatch_SCADA/";
    pub const TRADING_IS_CURRENT: &str =
        "https://nemweb.com.au/Reports/Current/TradingIS_Reports/";
    pub const ROOFTOP_PV_CURRENT: &str =
        "https://nemweb.com.au/Reports/Current/ROOFTOP_PV/ACTUAL/";
    pub const ROOFTOP_PV_ARCHIVE: &str =
        "https://nemweb.com.au/Reports/Archive/ROOFTOP_PV/ACTUAL/";
    pub const NEXT_DAY_DISPATCH_CURRENT: &str =
        "https://nemweb.com.au/Reports/Current/Next_Day_Dispatch/";
    pub const NEXT_DAY_DISPATCH_ARCHIVE: &str =
        "https://nemweb.com.au/Reports/Archive/Next_Day_Dispatch/";
    pub const OPERATIONAL_DEMAND_CURRENT: &str =
        "https://nemweb.com.au/Reports/Current/Operational_Demand/ACTUAL_HH/";
    pub const OPERATIONAL_DEMAND_ARCHIVE: &str =
        "https://nemweb.com.au/Reports/Archive/Operational_Demand/ACTUAL_HH/";
}

/// NEMWEB rejects requests with an empty User-Agent (406).
pub const USER_AGENT: &str = "AEMO Dashboard Data Collector";

/// The five mainland+Tasmania market regions; all region-keyed datasets are
/// restricted to this set.
pub const MAIN_REGIONS: [&str; 5] = ["NSW1", "QLD1", "SA1", "TAS1", "VIC1"];

/// Runtime configuration, sourced from the environment with defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for canonical table files
    pub data_path: PathBuf,
    /// Polling cadence of the scheduler
    pub update_interval_seconds: u64,
    pub max_retries: usize,
    pub retry_delay_seconds: u64,
    /// Body timeout for artifact downloads
    pub request_timeout_seconds: u64,
    /// Timeout for directory-index listings
    pub listing_timeout_seconds: u64,
    /// Timeout for weekly/monthly archive downloads
    pub archive_timeout_seconds: u64,
    pub enable_email_alerts: bool,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub alert_email: String,
    pub alert_password: String,
    pub recipient_email: String,
    pub known_duids_path: PathBuf,
    pub alert_throttle_minutes: i64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let data_path = PathBuf::from(env_or("AEMO_DATA_PATH", "./data".to_string()));
        let known_duids_path = env::var("AEMO_KNOWN_DUIDS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_path.join("known_duids.txt"));

        Self {
            data_path,
            update_interval_seconds: env_or("AEMO_UPDATE_INTERVAL_SECONDS", 270),
            max_retries: env_or("AEMO_MAX_RETRIES", 3),
            retry_delay_seconds: env_or("AEMO_RETRY_DELAY_SECONDS", 10),
            request_timeout_seconds: env_or("AEMO_REQUEST_TIMEOUT_SECONDS", 60),
            listing_timeout_seconds: env_or("AEMO_LISTING_TIMEOUT_SECONDS", 30),
            archive_timeout_seconds: env_or("AEMO_ARCHIVE_TIMEOUT_SECONDS", 300),
            enable_email_alerts: env_or("AEMO_ENABLE_EMAIL_ALERTS", false),
            smtp_server: env_or("AEMO_SMTP_SERVER", "smtp.gmail.com".to_string()),
            smtp_port: env_or("AEMO_SMTP_PORT", 587),
            alert_email: env_or("AEMO_ALERT_EMAIL", String::new()),
            alert_password: env_or("AEMO_ALERT_PASSWORD", String::new()),
            recipient_email: env_or("AEMO_RECIPIENT_EMAIL", String::new()),
            known_duids_path,
            alert_throttle_minutes: env_or("AEMO_ALERT_THROTTLE_MINUTES", 60),
        }
    }

    /// Canonical table file for a dataset.
    pub fn dataset_path(&self, dataset: &str) -> PathBuf {
        self.data_path.join(format!("{dataset}.csv"))
    }

    /// Optional retention window for a dataset, e.g. AEMO_RETENTION_DAYS_SCADA5=30.
    /// Unset means keep everything.
    pub fn retention_days(&self, dataset: &str) -> Option<i64> {
        let key = format!("AEMO_RETENTION_DAYS_{}", dataset.to_uppercase());
        env::var(key).ok().and_then(|v| v.parse::<i64>().ok())
    }

    /// Age in minutes beyond which a dataset file is considered stale.
    pub fn staleness_threshold_minutes(&self, dataset: &str) -> i64 {
        if dataset.ends_with("30") { 45 } else { 15 }
    }

    pub fn alert_history_path(&self) -> PathBuf {
        self.data_path.join("alert_history.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_path.join(".aemo-ingest.lock")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_path.join("backups")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
