use std::collections::{HashMap, HashSet};
use std::time::{Duration as StdDuration, Instant};

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDateTime};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertManager, AlertSeverity};
use crate::archive;
use crate::config::{Config, urls};
use crate::derive;
use crate::fetch::{FetchError, Fetcher};
use crate::mms;
use crate::normalize;
use crate::records::datasets::*;
use crate::records::{
    PriceRecord, Record, RegionalCurtailmentRecord, RooftopRecord, ScadaRecord,
    TransmissionRecord,
};
use crate::registry::DuidRegistry;
use crate::store;

/// Courtesy pause between per-file downloads inside one listing loop.
const DOWNLOAD_PAUSE: StdDuration = StdDuration::from_millis(100);

/// How many unseen files to consume per cycle, newest first.
const DISPATCH_TAKE: usize = 5;
const ROOFTOP_TAKE: usize = 3;
const DAILY_TAKE: usize = 2;

/// Outcome of one dataset within a cycle.
#[derive(Debug, Clone)]
pub struct DatasetResult {
    pub dataset: &'static str,
    pub success: bool,
    pub rows_added: i64,
}

/// Structured per-cycle summary.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub results: Vec<DatasetResult>,
    pub duration_secs: f64,
}

impl CycleSummary {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

/// Drives all upstream sources through one ingestion cycle each.
///
/// One seen-filename set per upstream directory; a DispatchIS file is
/// downloaded once and feeds prices, transmission and regional curtailment
/// together. Errors are scoped to a (source, file) pair; no dataset can abort
/// the cycle.
pub struct Collector {
    config: Config,
    fetcher: Fetcher,
    seen: HashMap<&'static str, HashSet<String>>,
    registry: DuidRegistry,
    alerts: AlertManager,
}

impl Collector {
    pub fn new(config: Config, alerts: AlertManager) -> Result<Self> {
        let fetcher = Fetcher::new(&config)?;
        let registry = DuidRegistry::load(&config.known_duids_path);
        Ok(Self {
            config,
            fetcher,
            seen: HashMap::new(),
            registry,
            alerts,
        })
    }

    /// Run one full cycle: the 5-minute dispatch family, the 30-minute
    /// trading family, then the derived series. SCADA-30 aggregation always
    /// runs after this cycle's SCADA-5 merge.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        let started = Instant::now();
        info!("=== starting update cycle ===");
        let mut results = Vec::new();

        match self.collect_dispatch_is().await {
            Ok(mut r) => results.append(&mut r),
            Err(e) => {
                error!("dispatch IS collection failed: {e:#}");
                results.extend(failed(&[PRICES5, TRANSMISSION5, REGIONAL_CURTAILMENT5]));
            }
        }
        match self.collect_dispatch_scada().await {
            Ok(r) => results.push(r),
            Err(e) => {
                error!("dispatch SCADA collection failed: {e:#}");
                results.extend(failed(&[SCADA5]));
            }
        }
        match self.collect_curtailment().await {
            Ok(r) => results.push(r),
            Err(e) => {
                error!("curtailment collection failed: {e:#}");
                results.extend(failed(&[CURTAILMENT5]));
            }
        }
        match self.collect_trading_is().await {
            Ok(mut r) => results.append(&mut r),
            Err(e) => {
                error!("trading IS collection failed: {e:#}");
                results.extend(failed(&[PRICES30, TRANSMISSION30]));
            }
        }
        match self.collect_rooftop().await {
            Ok(mut r) => results.append(&mut r),
            Err(e) => {
                error!("rooftop collection failed: {e:#}");
                results.extend(failed(&[ROOFTOP30, ROOFTOP5]));
            }
        }
        match self.collect_demand().await {
            Ok(r) => results.push(r),
            Err(e) => {
                error!("demand collection failed: {e:#}");
                results.extend(failed(&[DEMAND30]));
            }
        }
        // derived series: must observe this cycle's scada5 merge
        match self.aggregate_scada30() {
            Ok(r) => results.push(r),
            Err(e) => {
                error!("scada 30-minute aggregation failed: {e:#}");
                results.extend(failed(&[SCADA30]));
            }
        }

        let duration_secs = started.elapsed().as_secs_f64();
        let summary = CycleSummary {
            results,
            duration_secs,
        };
        info!(
            "=== cycle complete in {duration_secs:.1}s: {}/{} datasets ok ===",
            summary.success_count(),
            summary.results.len()
        );
        for r in &summary.results {
            info!(
                "  {}: {} ({:+} rows)",
                r.dataset,
                if r.success { "ok" } else { "failed" },
                r.rows_added
            );
        }
        summary
    }

    /// Compare canonical file ages against staleness thresholds and emit
    /// throttled alerts. Called by the daemon between cycles.
    pub fn check_freshness(&mut self) {
        for dataset in ALL {
            let path = self.config.dataset_path(dataset);
            if !path.exists() {
                self.alerts.send(&Alert::new(
                    AlertSeverity::Error,
                    dataset,
                    format!("{dataset} file missing"),
                    format!("{} does not exist; collection may be failing", path.display()),
                ));
                continue;
            }
            let Ok(meta) = path.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let age = modified.elapsed().unwrap_or_default();
            let threshold = self.config.staleness_threshold_minutes(dataset);
            let age_minutes = age.as_secs() as i64 / 60;
            if age_minutes > threshold {
                self.alerts.send(&Alert::new(
                    AlertSeverity::Warning,
                    dataset,
                    format!("{dataset} data is stale"),
                    format!(
                        "{dataset} was last written {age_minutes} minutes ago (threshold {threshold})"
                    ),
                ));
            }
        }
    }

    /// Unseen files for a source, oldest-to-newest, limited to the newest
    /// `take`. Skipped backlog beyond `take` is marked seen immediately;
    /// consumed files are marked seen by the caller on success so transient
    /// failures retry next cycle.
    async fn new_files(
        &mut self,
        source: &'static str,
        url: &str,
        prefix: &str,
        take: usize,
    ) -> Result<Vec<String>, FetchError> {
        let listing = match self.fetcher.list(url).await {
            Ok(listing) => listing,
            // a missing current directory means no data published yet
            Err(FetchError::NotFound(_)) => {
                debug!("{source}: directory not found, no new data");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let seen = self.seen.entry(source).or_default();
        let mut fresh: Vec<String> = listing
            .into_iter()
            .filter(|f| f.starts_with(prefix) && f.to_ascii_lowercase().ends_with(".zip"))
            .filter(|f| !seen.contains(f))
            .collect();
        fresh.sort();
        let consume_from = fresh.len().saturating_sub(take);
        for skipped in &fresh[..consume_from] {
            seen.insert(skipped.clone());
        }
        let tail = fresh.split_off(consume_from);
        if !tail.is_empty() {
            info!("{source}: {} new files", tail.len());
        }
        Ok(tail)
    }

    fn mark_seen(&mut self, source: &'static str, filename: &str) {
        self.seen
            .entry(source)
            .or_default()
            .insert(filename.to_string());
    }

    /// Download one report and return its extracted CSV payloads.
    async fn download(&self, base_url: &str, filename: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let url = format!("{base_url}{filename}");
        let bytes = self.fetcher.get(&url).await?;
        archive::extract_csv_entries(&bytes).with_context(|| format!("extract {filename}"))
    }

    fn retention_cutoff(&self, dataset: &str) -> Option<NaiveDateTime> {
        self.config
            .retention_days(dataset)
            .map(|days| Local::now().naive_local() - Duration::days(days))
    }

    /// Merge a slice, scoping any failure to this one dataset.
    fn merge_dataset<R: Record>(&self, dataset: &'static str, slice: Vec<R>) -> DatasetResult {
        match store::merge(
            &self.config.dataset_path(dataset),
            slice,
            self.retention_cutoff(dataset),
        ) {
            Ok(outcome) => DatasetResult {
                dataset,
                success: true,
                rows_added: outcome.rows_added(),
            },
            Err(e) => {
                error!("merge failed for {dataset}: {e:#}");
                DatasetResult {
                    dataset,
                    success: false,
                    rows_added: 0,
                }
            }
        }
    }

    /// DispatchIS: 5-minute prices, interconnector flows and the region
    /// summary, all from the same files.
    async fn collect_dispatch_is(&mut self) -> Result<Vec<DatasetResult>> {
        let files = self
            .new_files(
                "dispatch_is",
                urls::DISPATCH_IS_CURRENT,
                "PUBLIC_DISPATCHIS_",
                DISPATCH_TAKE,
            )
            .await?;

        let mut prices: Vec<PriceRecord> = Vec::new();
        let mut transmission: Vec<TransmissionRecord> = Vec::new();
        let mut regional: Vec<RegionalCurtailmentRecord> = Vec::new();

        for filename in &files {
            sleep(DOWNLOAD_PAUSE).await;
            let entries = match self.download(urls::DISPATCH_IS_CURRENT, filename).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("skipping {filename}: {e:#}");
                    continue;
                }
            };
            for (_, csv_bytes) in &entries {
                prices.extend(normalize::prices(&mms::parse(csv_bytes, "PRICE")));
                transmission.extend(normalize::transmission(&mms::parse(
                    csv_bytes,
                    "INTERCONNECTORRES",
                )));
                regional.extend(normalize::regional_curtailment(&mms::parse(
                    csv_bytes,
                    "REGIONSUM",
                )));
            }
            self.mark_seen("dispatch_is", filename);
        }

        Ok(vec![
            self.merge_dataset(PRICES5, prices),
            self.merge_dataset(TRANSMISSION5, transmission),
            self.merge_dataset(REGIONAL_CURTAILMENT5, regional),
        ])
    }

    /// Dispatch SCADA: 5-minute unit readings plus new-DUID detection.
    async fn collect_dispatch_scada(&mut self) -> Result<DatasetResult> {
        let files = self
            .new_files(
                "dispatch_scada",
                urls::DISPATCH_SCADA_CURRENT,
                "PUBLIC_DISPATCHSCADA_",
                DISPATCH_TAKE,
            )
            .await?;

        let mut slice: Vec<ScadaRecord> = Vec::new();
        let mut observed = std::collections::BTreeSet::new();
        for filename in &files {
            sleep(DOWNLOAD_PAUSE).await;
            let entries = match self.download(urls::DISPATCH_SCADA_CURRENT, filename).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("skipping {filename}: {e:#}");
                    continue;
                }
            };
            for (_, csv_bytes) in &entries {
                let (rows, duids) = normalize::scada(&mms::parse(csv_bytes, "UNIT_SCADA"));
                slice.extend(rows);
                observed.extend(duids);
            }
            self.mark_seen("dispatch_scada", filename);
        }

        let result = self.merge_dataset(SCADA5, slice);

        // one notification per cycle listing every new unit
        if !observed.is_empty() {
            match self.registry.register(&observed) {
                Ok(new) if !new.is_empty() => {
                    self.alerts.send(&Alert::new(
                        AlertSeverity::Info,
                        "scada-collector",
                        format!("new DUIDs discovered: {} units", new.len()),
                        new.join(", "),
                    ));
                }
                Ok(_) => {}
                Err(e) => warn!("could not persist DUID registry: {e:#}"),
            }
        }
        Ok(result)
    }

    /// Next-day dispatch: per-unit curtailment from the unit solution.
    async fn collect_curtailment(&mut self) -> Result<DatasetResult> {
        let files = self
            .new_files(
                "next_day_dispatch",
                urls::NEXT_DAY_DISPATCH_CURRENT,
                "PUBLIC_NEXT_DAY_DISPATCH_",
                1,
            )
            .await?;

        let mut slice = Vec::new();
        for filename in &files {
            sleep(DOWNLOAD_PAUSE).await;
            let entries = match self.download(urls::NEXT_DAY_DISPATCH_CURRENT, filename).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("skipping {filename}: {e:#}");
                    continue;
                }
            };
            for (_, csv_bytes) in &entries {
                slice.extend(normalize::curtailment(&mms::parse(
                    csv_bytes,
                    "DISPATCH.UNIT_SOLUTION",
                )));
            }
            self.mark_seen("next_day_dispatch", filename);
        }
        Ok(self.merge_dataset(CURTAILMENT5, slice))
    }

    /// TradingIS: the 30-minute price and transmission family.
    async fn collect_trading_is(&mut self) -> Result<Vec<DatasetResult>> {
        let files = self
            .new_files(
                "trading_is",
                urls::TRADING_IS_CURRENT,
                "PUBLIC_TRADINGIS_",
                DISPATCH_TAKE,
            )
            .await?;

        let mut prices: Vec<PriceRecord> = Vec::new();
        let mut transmission: Vec<TransmissionRecord> = Vec::new();
        for filename in &files {
            sleep(DOWNLOAD_PAUSE).await;
            let entries = match self.download(urls::TRADING_IS_CURRENT, filename).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("skipping {filename}: {e:#}");
                    continue;
                }
            };
            for (_, csv_bytes) in &entries {
                prices.extend(normalize::prices(&mms::parse(csv_bytes, "PRICE")));
                transmission.extend(normalize::transmission(&mms::parse(
                    csv_bytes,
                    "INTERCONNECTORRES",
                )));
            }
            self.mark_seen("trading_is", filename);
        }

        Ok(vec![
            self.merge_dataset(PRICES30, prices),
            self.merge_dataset(TRANSMISSION30, transmission),
        ])
    }

    /// Rooftop PV: 30-minute actuals, then the interpolated 5-minute series.
    async fn collect_rooftop(&mut self) -> Result<Vec<DatasetResult>> {
        let files = self
            .new_files(
                "rooftop",
                urls::ROOFTOP_PV_CURRENT,
                "PUBLIC_ROOFTOP_PV_ACTUAL_MEASUREMENT_",
                ROOFTOP_TAKE,
            )
            .await?;

        let mut slice: Vec<RooftopRecord> = Vec::new();
        for filename in &files {
            sleep(DOWNLOAD_PAUSE).await;
            let entries = match self.download(urls::ROOFTOP_PV_CURRENT, filename).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("skipping {filename}: {e:#}");
                    continue;
                }
            };
            for (_, csv_bytes) in &entries {
                slice.extend(normalize::rooftop(&mms::parse(csv_bytes, "ROOFTOP.ACTUAL")));
            }
            self.mark_seen("rooftop", filename);
        }

        let r30 = self.merge_dataset(ROOFTOP30, slice);
        let r5 = match self.derive_rooftop5() {
            Ok(r) => r,
            Err(e) => {
                error!("rooftop 5-minute derivation failed: {e:#}");
                DatasetResult {
                    dataset: ROOFTOP5,
                    success: false,
                    rows_added: 0,
                }
            }
        };
        Ok(vec![r30, r5])
    }

    /// Interpolate the recent tail of the merged 30-minute series onto the
    /// 5-minute grid.
    fn derive_rooftop5(&self) -> Result<DatasetResult> {
        let rooftop30: Vec<RooftopRecord> =
            store::load(&self.config.dataset_path(ROOFTOP30))?;
        let Some(latest) = rooftop30.iter().map(|r| r.settlementdate).max() else {
            debug!("no rooftop 30-minute data yet");
            return Ok(DatasetResult {
                dataset: ROOFTOP5,
                success: true,
                rows_added: 0,
            });
        };
        let horizon = latest - Duration::days(1);
        let recent: Vec<RooftopRecord> = rooftop30
            .into_iter()
            .filter(|r| r.settlementdate >= horizon)
            .collect();
        let slice = derive::interpolate_rooftop5(&recent);
        Ok(self.merge_dataset(ROOFTOP5, slice))
    }

    /// Operational demand: 30-minute actuals from daily files.
    async fn collect_demand(&mut self) -> Result<DatasetResult> {
        let files = self
            .new_files(
                "operational_demand",
                urls::OPERATIONAL_DEMAND_CURRENT,
                "PUBLIC_ACTUAL_OPERATIONAL_DEMAND_HH_",
                DAILY_TAKE,
            )
            .await?;

        let mut slice = Vec::new();
        for filename in &files {
            sleep(DOWNLOAD_PAUSE).await;
            let entries = match self
                .download(urls::OPERATIONAL_DEMAND_CURRENT, filename)
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("skipping {filename}: {e:#}");
                    continue;
                }
            };
            for (_, csv_bytes) in &entries {
                slice.extend(normalize::demand(&mms::parse(
                    csv_bytes,
                    "OPERATIONAL_DEMAND.ACTUAL",
                )));
            }
            self.mark_seen("operational_demand", filename);
        }
        Ok(self.merge_dataset(DEMAND30, slice))
    }

    /// Derive 30-minute SCADA means for endpoints newer than the 30-minute
    /// table's watermark.
    fn aggregate_scada30(&self) -> Result<DatasetResult> {
        let scada5: Vec<ScadaRecord> = store::load(&self.config.dataset_path(SCADA5))?;
        if scada5.is_empty() {
            return Ok(DatasetResult {
                dataset: SCADA30,
                success: true,
                rows_added: 0,
            });
        }
        let scada30: Vec<ScadaRecord> = match store::load(&self.config.dataset_path(SCADA30)) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("could not read scada30, rebuilding from scratch: {e:#}");
                Vec::new()
            }
        };
        let watermark = scada30.iter().map(|r| r.settlementdate).max();
        let slice = derive::aggregate_scada30(&scada5, watermark);
        Ok(self.merge_dataset(SCADA30, slice))
    }
}

fn failed(datasets: &[&'static str]) -> Vec<DatasetResult> {
    datasets
        .iter()
        .map(|d| DatasetResult {
            dataset: *d,
            success: false,
            rows_added: 0,
        })
        .collect()
}
