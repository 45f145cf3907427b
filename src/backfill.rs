use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, bail};
use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::archive;
use crate::config::{Config, urls};
use crate::fetch::{FetchError, Fetcher};
use crate::mms;
use crate::normalize;
use crate::records::datasets::*;
use crate::records::{
    CurtailmentRecord, DemandRecord, PriceRecord, Record, RooftopRecord, ScadaRecord,
    TransmissionRecord,
};
use crate::store;
use crate::{BackfillArgs, BackfillTarget};

const DOWNLOAD_PAUSE: StdDuration = StdDuration::from_millis(100);

/// Days after which a report moves from the current tree to the archive tree.
const ARCHIVE_CUTOFF_DAYS: i64 = 30;

/// How one dataset family locates a day's worth of raw files.
#[derive(Debug, Clone, Copy)]
enum DayLayout {
    /// Archive holds `PREFIX<YYYYMMDD>.zip` bundles of nested interval zips;
    /// the current tree holds per-interval `PREFIX<YYYYMMDDHHMM>_*.zip`.
    DailyBundle,
    /// Archive holds Thursday-anchored weekly `PREFIX<YYYYMMDD>.zip` bundles.
    WeeklyBundle,
    /// Archive holds monthly `PREFIX<YYYYMM01>.zip` bundles of daily zips;
    /// the current tree holds daily `PREFIX<YYYYMMDD>_*.zip` files.
    MonthlyBundle,
    /// Both trees hold one `PREFIX<YYYYMMDD>.zip` per day.
    DailyFile,
}

/// Static description of a backfillable dataset family.
struct Plan<R: Record> {
    dataset: &'static str,
    current_url: &'static str,
    archive_url: &'static str,
    prefix: &'static str,
    layout: DayLayout,
    /// Interval length on the settlement grid, minutes.
    cadence: i64,
    /// Smallest plausible number of distinct key dimensions in a valid slice.
    min_entities: usize,
    normalize: fn(&[u8]) -> Vec<R>,
    /// Dataset-specific per-row invariant, e.g. non-negative curtailment.
    row_check: fn(&R) -> Result<()>,
}

fn no_row_check<R>(_: &R) -> Result<()> {
    Ok(())
}

fn curtailment_row_check(r: &CurtailmentRecord) -> Result<()> {
    if r.curtailment < 0.0 {
        bail!("negative curtailment {} for {} at {}", r.curtailment, r.duid, r.settlementdate);
    }
    Ok(())
}

fn normalize_prices(bytes: &[u8]) -> Vec<PriceRecord> {
    normalize::prices(&mms::parse(bytes, "PRICE"))
}

fn normalize_scada(bytes: &[u8]) -> Vec<ScadaRecord> {
    normalize::scada(&mms::parse(bytes, "UNIT_SCADA")).0
}

fn normalize_transmission(bytes: &[u8]) -> Vec<TransmissionRecord> {
    normalize::transmission(&mms::parse(bytes, "INTERCONNECTORRES"))
}

fn normalize_rooftop(bytes: &[u8]) -> Vec<RooftopRecord> {
    normalize::rooftop(&mms::parse(bytes, "ROOFTOP.ACTUAL"))
}

fn normalize_curtailment(bytes: &[u8]) -> Vec<CurtailmentRecord> {
    normalize::curtailment(&mms::parse(bytes, "DISPATCH.UNIT_SOLUTION"))
}

fn normalize_demand(bytes: &[u8]) -> Vec<DemandRecord> {
    normalize::demand(&mms::parse(bytes, "OPERATIONAL_DEMAND.ACTUAL"))
}

/// Operator entrypoint: replay `[start, end]` for the selected dataset
/// families through the five validated stages. Any stage failure aborts with
/// production untouched.
pub async fn execute(config: Config, args: &BackfillArgs) -> Result<()> {
    let start = NaiveDate::parse_from_str(&args.start, "%Y-%m-%d").context("invalid --start")?;
    let end = NaiveDate::parse_from_str(&args.end, "%Y-%m-%d").context("invalid --end")?;
    if end < start {
        bail!("--end must not precede --start");
    }

    let fetcher = Fetcher::new(&config)?;
    let targets: Vec<BackfillTarget> = match args.dataset {
        BackfillTarget::All => vec![
            BackfillTarget::Prices,
            BackfillTarget::Scada,
            BackfillTarget::Transmission,
            BackfillTarget::Rooftop,
            BackfillTarget::Curtailment,
            BackfillTarget::Demand,
        ],
        single => vec![single],
    };

    for target in targets {
        match target {
            BackfillTarget::Prices => {
                run_dataset(
                    &config,
                    &fetcher,
                    Plan {
                        dataset: PRICES5,
                        current_url: urls::DISPATCH_IS_CURRENT,
                        archive_url: urls::DISPATCH_IS_ARCHIVE,
                        prefix: "PUBLIC_DISPATCHIS_",
                        layout: DayLayout::DailyBundle,
                        cadence: 5,
                        min_entities: 5,
                        normalize: normalize_prices,
                        row_check: no_row_check,
                    },
                    args,
                    start,
                    end,
                )
                .await?
            }
            BackfillTarget::Scada => {
                run_dataset(
                    &config,
                    &fetcher,
                    Plan {
                        dataset: SCADA5,
                        current_url: urls::DISPATCH_SCADA_CURRENT,
                        archive_url: urls::DISPATCH_SCADA_ARCHIVE,
                        prefix: "PUBLIC_DISPATCHSCADA_",
                        layout: DayLayout::DailyBundle,
                        cadence: 5,
                        min_entities: 50,
                        normalize: normalize_scada,
                        row_check: no_row_check,
                    },
                    args,
                    start,
                    end,
                )
                .await?;
                if !args.test {
                    rebuild_scada30(&config, start, end)?;
                }
            }
            BackfillTarget::Transmission => {
                run_dataset(
                    &config,
                    &fetcher,
                    Plan {
                        dataset: TRANSMISSION5,
                        current_url: urls::DISPATCH_IS_CURRENT,
                        archive_url: urls::DISPATCH_IS_ARCHIVE,
                        prefix: "PUBLIC_DISPATCHIS_",
                        layout: DayLayout::DailyBundle,
                        cadence: 5,
                        min_entities: 5,
                        normalize: normalize_transmission,
                        row_check: no_row_check,
                    },
                    args,
                    start,
                    end,
                )
                .await?
            }
            BackfillTarget::Rooftop => {
                run_dataset(
                    &config,
                    &fetcher,
                    Plan {
                        dataset: ROOFTOP30,
                        current_url: urls::ROOFTOP_PV_CURRENT,
                        archive_url: urls::ROOFTOP_PV_ARCHIVE,
                        prefix: "PUBLIC_ROOFTOP_PV_ACTUAL_MEASUREMENT_",
                        layout: DayLayout::WeeklyBundle,
                        cadence: 30,
                        min_entities: 5,
                        normalize: normalize_rooftop,
                        row_check: no_row_check,
                    },
                    args,
                    start,
                    end,
                )
                .await?;
                if !args.test {
                    rebuild_rooftop5(&config, start, end)?;
                }
            }
            BackfillTarget::Curtailment => {
                run_dataset(
                    &config,
                    &fetcher,
                    Plan {
                        dataset: CURTAILMENT5,
                        current_url: urls::NEXT_DAY_DISPATCH_CURRENT,
                        archive_url: urls::NEXT_DAY_DISPATCH_ARCHIVE,
                        prefix: "PUBLIC_NEXT_DAY_DISPATCH_",
                        layout: DayLayout::MonthlyBundle,
                        cadence: 5,
                        min_entities: 30,
                        normalize: normalize_curtailment,
                        row_check: curtailment_row_check,
                    },
                    args,
                    start,
                    end,
                )
                .await?
            }
            BackfillTarget::Demand => {
                run_dataset(
                    &config,
                    &fetcher,
                    Plan {
                        dataset: DEMAND30,
                        current_url: urls::OPERATIONAL_DEMAND_CURRENT,
                        archive_url: urls::OPERATIONAL_DEMAND_ARCHIVE,
                        prefix: "PUBLIC_ACTUAL_OPERATIONAL_DEMAND_HH_",
                        layout: DayLayout::DailyFile,
                        cadence: 30,
                        min_entities: 5,
                        normalize: normalize_demand,
                        row_check: no_row_check,
                    },
                    args,
                    start,
                    end,
                )
                .await?
            }
            BackfillTarget::All => unreachable!(),
        }
    }
    Ok(())
}

/// Bulk-download resume point, persisted alongside a sidecar table of the
/// rows normalized so far.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    current_date: NaiveDate,
    counts: CheckpointCounts,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointCounts {
    rows: usize,
    days_done: u32,
}

async fn run_dataset<R: Record>(
    config: &Config,
    fetcher: &Fetcher,
    plan: Plan<R>,
    args: &BackfillArgs,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<()> {
    info!(
        "backfilling {} from {start} to {end}{}",
        plan.dataset,
        if args.test { " (probe only)" } else { "" }
    );
    let scratch = config
        .data_path
        .join(format!("backfill_scratch_{}", plan.dataset));
    let mut driver = Driver {
        fetcher,
        plan,
        scratch,
        bundle_cache: HashMap::new(),
    };

    // stage 1: probe exactly one archive at the range start
    let probe_rows = driver.probe_and_normalize(start).await?;
    validate_slice(&probe_rows, &driver.plan)
        .with_context(|| format!("probe validation failed for {start}"))?;
    info!(
        "probe ok: {} rows, {} entities",
        probe_rows.len(),
        distinct_entities(&probe_rows)
    );
    if args.test {
        return Ok(());
    }

    fs::create_dir_all(driver.scratch.join("raw"))?;

    // stage 2: bulk download with periodic checkpoints
    let mut rows: Vec<R> = Vec::new();
    let mut days_done: u32 = 0;
    let mut resume_after: Option<NaiveDate> = None;
    if let Some(cp) = driver.load_checkpoint()? {
        rows = store::load(&driver.sidecar_path())?;
        resume_after = Some(cp.current_date);
        days_done = cp.counts.days_done;
        info!(
            "resuming after {} with {} rows already collected",
            cp.current_date,
            rows.len()
        );
    }

    let mut day = start;
    while day <= end {
        if resume_after.is_some_and(|r| day <= r) {
            day += Duration::days(1);
            continue;
        }
        match driver.fetch_and_normalize_day(day).await {
            Ok(day_rows) => {
                if day_rows.is_empty() {
                    warn!("{}: no rows for {day}", driver.plan.dataset);
                } else {
                    rows.extend(day_rows);
                }
            }
            Err(e) => warn!("{}: {day} unavailable, skipping: {e:#}", driver.plan.dataset),
        }
        days_done += 1;
        if days_done % args.checkpoint_every.max(1) == 0 {
            driver.write_checkpoint(day, &rows, days_done)?;
        }
        day += Duration::days(1);
    }

    // only keep rows inside the replayed range (weekly/monthly bundles span
    // beyond it); end-of-interval timestamps put a day's first interval just
    // after midnight
    let range_start = start.and_hms_opt(0, 0, 0).unwrap();
    let range_end = (end + Duration::days(1)).and_hms_opt(0, 0, 0).unwrap();
    rows.retain(|r| {
        let t = r.settlement();
        t > range_start && t <= range_end
    });

    // stage 3: staging artifact, deduped and sorted
    let mut staged: BTreeMap<(NaiveDateTime, String), R> = BTreeMap::new();
    for row in rows {
        staged.insert(row.key(), row);
    }
    let staged: Vec<R> = staged.into_values().collect();
    let staging_path = driver.scratch.join("staging.csv");
    store::write_atomic(&staging_path, &staged)?;
    info!("staged {} rows to {}", staged.len(), staging_path.display());

    // stages 4 and 5 run from the persisted staging artifact
    let reloaded: Vec<R> = store::load(&staging_path)?;
    publish_validated(config, &driver.plan, reloaded)?;

    fs::remove_dir_all(&driver.scratch).ok();
    info!("{} backfill complete", driver.plan.dataset);
    Ok(())
}

/// Stage 4 (full staging validation) and stage 5 (backup, merge, re-validate).
/// Returns with production untouched, or restored from backup, on any
/// validation failure.
fn publish_validated<R: Record>(config: &Config, plan: &Plan<R>, staged: Vec<R>) -> Result<()> {
    validate_slice(&staged, plan).context("staging validation failed")?;

    let production = config.dataset_path(plan.dataset);
    let backup = backup_production(config, &production)?;

    let outcome = store::merge(&production, staged, None)?;
    info!(
        "merged into {}: {} -> {} rows",
        production.display(),
        outcome.rows_before,
        outcome.rows_after
    );

    let merged: Vec<R> = store::load(&production)?;
    if let Err(e) = validate_slice(&merged, plan) {
        if let Some(backup) = &backup {
            fs::copy(backup, &production).context("restore production from backup")?;
            warn!("restored {} from {}", production.display(), backup.display());
        }
        return Err(e).context("post-merge validation failed, production restored");
    }
    Ok(())
}

/// Copy the production file into a timestamped backup directory. Returns the
/// backup path, or None when there is no production file yet.
fn backup_production(config: &Config, production: &Path) -> Result<Option<PathBuf>> {
    if !production.exists() {
        return Ok(None);
    }
    let stamp = Local::now().format("%Y%m%d%H%M%S").to_string();
    let dir = config.backup_dir().join(stamp);
    fs::create_dir_all(&dir)?;
    let dest = dir.join(production.file_name().unwrap_or_default());
    fs::copy(production, &dest)
        .with_context(|| format!("back up {} to {}", production.display(), dest.display()))?;
    info!("backed up production to {}", dest.display());
    Ok(Some(dest))
}

/// The stage-4 contract: every check must pass before anything touches
/// production.
fn validate_slice<R: Record>(rows: &[R], plan: &Plan<R>) -> Result<()> {
    if rows.is_empty() {
        bail!("slice is empty");
    }
    let mut keys = BTreeSet::new();
    for row in rows {
        let (t, dim) = row.key();
        if dim.trim().is_empty() {
            bail!("empty key dimension at {t}");
        }
        if t.second() != 0 || i64::from(t.minute()) % plan.cadence != 0 {
            bail!("settlement {t} is off the {}-minute grid", plan.cadence);
        }
        if !keys.insert(row.key()) {
            bail!("duplicate key ({t}, {dim})");
        }
        (plan.row_check)(row)?;
    }
    let entities = distinct_entities(rows);
    if entities < plan.min_entities {
        bail!(
            "only {entities} distinct entities, expected at least {}",
            plan.min_entities
        );
    }
    let span_start = rows.iter().map(|r| r.settlement()).min().unwrap();
    let span_end = rows.iter().map(|r| r.settlement()).max().unwrap();
    if span_end < span_start {
        bail!("invalid date span");
    }
    Ok(())
}

fn distinct_entities<R: Record>(rows: &[R]) -> usize {
    rows.iter().map(|r| r.key().1).collect::<BTreeSet<_>>().len()
}

/// Per-run download state: the HTTP client plus a cache of weekly/monthly
/// bundles so consecutive days reuse one download.
struct Driver<'a, R: Record> {
    fetcher: &'a Fetcher,
    plan: Plan<R>,
    scratch: PathBuf,
    bundle_cache: HashMap<String, Vec<u8>>,
}

impl<R: Record> Driver<'_, R> {
    fn sidecar_path(&self) -> PathBuf {
        self.scratch.join("checkpoint_rows.csv")
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.scratch.join("checkpoint.json")
    }

    fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let path = self.checkpoint_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw).context("parse checkpoint")?))
    }

    fn write_checkpoint(&self, day: NaiveDate, rows: &[R], days_done: u32) -> Result<()> {
        store::write_atomic(&self.sidecar_path(), rows)?;
        let cp = Checkpoint {
            current_date: day,
            counts: CheckpointCounts {
                rows: rows.len(),
                days_done,
            },
        };
        fs::write(self.checkpoint_path(), serde_json::to_string_pretty(&cp)?)?;
        info!("checkpoint at {day}: {} rows", rows.len());
        Ok(())
    }

    /// Stage-1 probe: download one file for the range start and normalize it.
    /// Cheap by contract, so `--test` stays fast.
    async fn probe_and_normalize(&mut self, day: NaiveDate) -> Result<Vec<R>> {
        let entries = self.fetch_probe(day).await?;
        let mut rows = Vec::new();
        for (_, bytes) in &entries {
            rows.extend((self.plan.normalize)(bytes));
        }
        Ok(rows)
    }

    /// Exactly one download for the probe. Archive bundles are a single
    /// download already; in the current tree only the earliest matching file
    /// is taken, even when the day has many interval files.
    async fn fetch_probe(&mut self, day: NaiveDate) -> Result<Vec<(String, Vec<u8>)>> {
        let historical =
            (Local::now().date_naive() - day).num_days() > ARCHIVE_CUTOFF_DAYS;
        if historical || matches!(self.plan.layout, DayLayout::DailyFile) {
            return self.fetch_day(day).await;
        }
        let names = match self.plan.layout {
            DayLayout::MonthlyBundle => self.current_day_file_names(day).await?,
            _ => self.current_interval_names(day).await?,
        };
        let Some(first) = names.first() else {
            return Ok(Vec::new());
        };
        let url = format!("{}{}", self.plan.current_url, first);
        let bytes = self.fetcher.get(&url).await?;
        archive::extract_csv_entries(&bytes)
    }

    /// Fetch every raw file for one day, stash the extracted CSVs in the
    /// scratch directory, and normalize them.
    async fn fetch_and_normalize_day(&mut self, day: NaiveDate) -> Result<Vec<R>> {
        let entries = self.fetch_day(day).await?;
        let raw_dir = self.scratch.join("raw");
        if raw_dir.exists() {
            for (name, bytes) in &entries {
                let dest = raw_dir.join(format!("{}_{name}", day.format("%Y%m%d")));
                fs::write(dest, bytes).ok();
            }
        }
        let mut rows = Vec::new();
        for (_, bytes) in &entries {
            rows.extend((self.plan.normalize)(bytes));
        }
        Ok(rows)
    }

    async fn fetch_day(&mut self, day: NaiveDate) -> Result<Vec<(String, Vec<u8>)>> {
        let historical =
            (Local::now().date_naive() - day).num_days() > ARCHIVE_CUTOFF_DAYS;
        match (self.plan.layout, historical) {
            (DayLayout::DailyBundle, true) => {
                let name = format!("{}{}.zip", self.plan.prefix, day.format("%Y%m%d"));
                let bytes = self.fetch_bundle(self.plan.archive_url, &name).await?;
                archive::extract_csv_entries(&bytes)
            }
            (DayLayout::DailyBundle, false) => self.fetch_current_intervals(day).await,
            (DayLayout::WeeklyBundle, true) => {
                let thursday = enclosing_thursday(day);
                let name = format!("{}{}.zip", self.plan.prefix, thursday.format("%Y%m%d"));
                let bytes = self.fetch_bundle(self.plan.archive_url, &name).await?;
                archive::extract_csv_entries(&bytes)
            }
            (DayLayout::WeeklyBundle, false) => self.fetch_current_intervals(day).await,
            (DayLayout::MonthlyBundle, true) => {
                let month_name = format!(
                    "{}{}01.zip",
                    self.plan.prefix,
                    day.format("%Y%m")
                );
                let bytes = self.fetch_bundle(self.plan.archive_url, &month_name).await?;
                // pull only the nested daily zip for this day
                let date_str = day.format("%Y%m%d").to_string();
                let mut out = Vec::new();
                for nested in archive::nested_zip_names(&bytes)? {
                    if nested.contains(&date_str) {
                        out.extend(archive::extract_nested_entry(&bytes, &nested)?);
                    }
                }
                Ok(out)
            }
            (DayLayout::MonthlyBundle, false) => self.fetch_current_day_files(day).await,
            (DayLayout::DailyFile, _) => {
                let base = if historical {
                    self.plan.archive_url
                } else {
                    self.plan.current_url
                };
                let name = format!("{}{}.zip", self.plan.prefix, day.format("%Y%m%d"));
                let url = format!("{base}{name}");
                let bytes = self.fetcher.get(&url).await?;
                archive::extract_csv_entries(&bytes)
            }
        }
    }

    /// Download a large bundle once per run.
    async fn fetch_bundle(&mut self, base: &str, name: &str) -> Result<Vec<u8>> {
        let url = format!("{base}{name}");
        if let Some(bytes) = self.bundle_cache.get(&url) {
            return Ok(bytes.clone());
        }
        let bytes = self.fetcher.get_archive(&url).await?;
        self.bundle_cache.insert(url, bytes.clone());
        Ok(bytes)
    }

    /// Interval filenames in the current tree whose embedded timestamp falls
    /// on `day`, sorted oldest first.
    async fn current_interval_names(&self, day: NaiveDate) -> Result<Vec<String>> {
        let window_start = day.and_hms_opt(0, 0, 0).unwrap();
        let window_end = (day + Duration::days(1)).and_hms_opt(0, 0, 0).unwrap();
        let listing = self.fetcher.list(self.plan.current_url).await?;
        let mut names: Vec<String> = listing
            .into_iter()
            .filter(|f| f.starts_with(self.plan.prefix))
            .filter(|f| {
                archive::filename_timestamp(f)
                    .is_some_and(|t| t > window_start && t <= window_end)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Daily-named filenames in the current tree carrying `day`'s date stamp,
    /// sorted.
    async fn current_day_file_names(&self, day: NaiveDate) -> Result<Vec<String>> {
        let stamp = format!("{}{}", self.plan.prefix, day.format("%Y%m%d"));
        let listing = self.fetcher.list(self.plan.current_url).await?;
        let mut names: Vec<String> = listing
            .into_iter()
            .filter(|f| f.starts_with(&stamp))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Recent days: pick the per-interval files for `day` out of the current
    /// directory listing by their embedded timestamp. A day holds up to 288
    /// interval files, so downloads run with bounded concurrency.
    async fn fetch_current_intervals(&mut self, day: NaiveDate) -> Result<Vec<(String, Vec<u8>)>> {
        use futures::stream::{self, StreamExt};

        let names = self.current_interval_names(day).await?;
        let fetcher = self.fetcher;
        let base = self.plan.current_url;
        let results: Vec<Result<Vec<(String, Vec<u8>)>>> = stream::iter(names)
            .map(|name| async move {
                let url = format!("{base}{name}");
                match fetcher.get(&url).await {
                    Ok(bytes) => archive::extract_csv_entries(&bytes),
                    Err(FetchError::NotFound(_)) => Ok(Vec::new()),
                    Err(e) => Err(e.into()),
                }
            })
            .buffered(4)
            .collect()
            .await;

        let mut out = Vec::new();
        for r in results {
            out.extend(r?);
        }
        Ok(out)
    }

    /// Recent days for daily-named reports: every current file carrying the
    /// day's date stamp.
    async fn fetch_current_day_files(&mut self, day: NaiveDate) -> Result<Vec<(String, Vec<u8>)>> {
        let names = self.current_day_file_names(day).await?;

        let mut out = Vec::new();
        for name in names {
            sleep(DOWNLOAD_PAUSE).await;
            let url = format!("{}{}", self.plan.current_url, name);
            match self.fetcher.get(&url).await {
                Ok(bytes) => out.extend(archive::extract_csv_entries(&bytes)?),
                Err(FetchError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }
}

/// Recompute the derived 30-minute SCADA means across a replayed range so the
/// backfilled history and its aggregate stay consistent.
fn rebuild_scada30(config: &Config, start: NaiveDate, end: NaiveDate) -> Result<()> {
    let scada5: Vec<ScadaRecord> = store::load(&config.dataset_path(SCADA5))?;
    if scada5.is_empty() {
        return Ok(());
    }
    let range_start = start.and_hms_opt(0, 0, 0).unwrap();
    let range_end = (end + Duration::days(1)).and_hms_opt(0, 0, 0).unwrap();
    let mut slice = crate::derive::aggregate_scada30(&scada5, Some(range_start));
    slice.retain(|r| r.settlementdate <= range_end);
    let outcome = store::merge(&config.dataset_path(SCADA30), slice, None)?;
    info!(
        "rebuilt scada30 over the range: {} -> {} rows",
        outcome.rows_before, outcome.rows_after
    );
    Ok(())
}

/// Re-fan the replayed 30-minute rooftop anchors onto the 5-minute grid.
fn rebuild_rooftop5(config: &Config, start: NaiveDate, end: NaiveDate) -> Result<()> {
    let rooftop30: Vec<RooftopRecord> = store::load(&config.dataset_path(ROOFTOP30))?;
    if rooftop30.is_empty() {
        return Ok(());
    }
    let range_start = start.and_hms_opt(0, 0, 0).unwrap();
    // include the successor anchor just past the range so the last block
    // interpolates instead of nowcasting
    let range_end = (end + Duration::days(1)).and_hms_opt(0, 30, 0).unwrap();
    let anchors: Vec<RooftopRecord> = rooftop30
        .into_iter()
        .filter(|r| r.settlementdate > range_start && r.settlementdate <= range_end)
        .collect();
    let slice = crate::derive::interpolate_rooftop5(&anchors);
    let outcome = store::merge(&config.dataset_path(ROOFTOP5), slice, None)?;
    info!(
        "rebuilt rooftop5 over the range: {} -> {} rows",
        outcome.rows_before, outcome.rows_after
    );
    Ok(())
}

/// Weekly rooftop archives are anchored on the Thursday at or before `day`.
fn enclosing_thursday(day: NaiveDate) -> NaiveDate {
    let days_since = (day.weekday().num_days_from_monday() + 7 - 3) % 7;
    day - Duration::days(i64::from(days_since))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn curtailment_plan() -> Plan<CurtailmentRecord> {
        Plan {
            dataset: CURTAILMENT5,
            current_url: urls::NEXT_DAY_DISPATCH_CURRENT,
            archive_url: urls::NEXT_DAY_DISPATCH_ARCHIVE,
            prefix: "PUBLIC_NEXT_DAY_DISPATCH_",
            layout: DayLayout::MonthlyBundle,
            cadence: 5,
            min_entities: 2,
            normalize: normalize_curtailment,
            row_check: curtailment_row_check,
        }
    }

    fn curtailment_rows(n: usize) -> Vec<CurtailmentRecord> {
        (0..n)
            .map(|i| CurtailmentRecord {
                settlementdate: ts("2025-01-01 10:00") + Duration::minutes(5 * i as i64),
                duid: if i % 2 == 0 { "WF1".into() } else { "SF1".into() },
                availability: 100.0,
                totalcleared: 90.0,
                semidispatchcap: 1,
                curtailment: 10.0,
            })
            .collect()
    }

    #[test]
    fn enclosing_thursday_is_at_or_before_the_day() {
        // 2025-01-02 is a Thursday
        let thu = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        assert_eq!(enclosing_thursday(thu), thu);
        let sun = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
        assert_eq!(enclosing_thursday(sun), thu);
        let wed = NaiveDate::from_ymd_opt(2025, 1, 8).unwrap();
        assert_eq!(enclosing_thursday(wed), thu);
    }

    #[test]
    fn validation_passes_a_clean_slice() {
        let plan = curtailment_plan();
        assert!(validate_slice(&curtailment_rows(10), &plan).is_ok());
    }

    #[test]
    fn validation_rejects_empty_slices() {
        let plan = curtailment_plan();
        assert!(validate_slice::<CurtailmentRecord>(&[], &plan).is_err());
    }

    #[test]
    fn validation_rejects_negative_curtailment() {
        let plan = curtailment_plan();
        let mut rows = curtailment_rows(10);
        rows[3].curtailment = -1.0;
        let err = validate_slice(&rows, &plan).unwrap_err();
        assert!(err.to_string().contains("negative curtailment"));
    }

    #[test]
    fn validation_rejects_duplicate_keys() {
        let plan = curtailment_plan();
        let mut rows = curtailment_rows(4);
        rows[1] = rows[0].clone();
        assert!(validate_slice(&rows, &plan).is_err());
    }

    #[test]
    fn validation_rejects_off_grid_timestamps() {
        let plan = curtailment_plan();
        let mut rows = curtailment_rows(4);
        rows[0].settlementdate = ts("2025-01-01 10:03");
        assert!(validate_slice(&rows, &plan).is_err());
    }

    #[test]
    fn validation_rejects_too_few_entities() {
        let mut plan = curtailment_plan();
        plan.min_entities = 10;
        assert!(validate_slice(&curtailment_rows(6), &plan).is_err());
    }

    #[test]
    fn failed_staging_validation_leaves_production_untouched() {
        // stage-4 abort: a negative curtailment row in an otherwise valid
        // staging slice must not change production in any way
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let plan = curtailment_plan();

        let production = config.dataset_path(plan.dataset);
        store::write_atomic(&production, &curtailment_rows(5)).unwrap();
        let before = fs::read(&production).unwrap();

        let mut bad = curtailment_rows(10);
        bad[7].curtailment = -1.0;
        assert!(publish_validated(&config, &plan, bad).is_err());

        let after = fs::read(&production).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn successful_publish_merges_and_keeps_a_backup() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let plan = curtailment_plan();

        let production = config.dataset_path(plan.dataset);
        store::write_atomic(&production, &curtailment_rows(5)).unwrap();

        let mut extra = curtailment_rows(10);
        for r in &mut extra {
            r.settlementdate += Duration::hours(2);
        }
        publish_validated(&config, &plan, extra).unwrap();

        let merged: Vec<CurtailmentRecord> = store::load(&production).unwrap();
        assert_eq!(merged.len(), 15);
        assert!(config.backup_dir().exists());
    }

    fn test_config(data_path: &Path) -> Config {
        let mut config = Config::from_env();
        config.data_path = data_path.to_path_buf();
        config
    }
}
