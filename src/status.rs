use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use itertools::Itertools;

use crate::config::Config;
use crate::records::datasets::*;
use crate::records::{
    CurtailmentRecord, DemandRecord, PriceRecord, Record, RegionalCurtailmentRecord,
    RooftopRecord, ScadaRecord, TransmissionRecord,
};
use crate::store;

/// Read-only health report for one canonical table.
#[derive(Debug, Clone)]
pub struct DatasetStatus {
    pub dataset: &'static str,
    pub exists: bool,
    pub rows: usize,
    pub duplicate_keys: usize,
    pub span: Option<(NaiveDateTime, NaiveDateTime)>,
    pub gaps: usize,
}

/// Print a status/integrity report for every dataset. Never writes.
pub fn execute(config: &Config) -> Result<()> {
    println!("dataset                 rows        span                                      dups  gaps");
    for dataset in ALL {
        let status = summarize_dataset(config, dataset)?;
        if !status.exists {
            println!("{dataset:<22}  (missing)");
            continue;
        }
        let span = status
            .span
            .map(|(a, b)| format!("{a} .. {b}"))
            .unwrap_or_else(|| "empty".to_string());
        println!(
            "{:<22}  {:<10}  {:<40}  {:<4}  {}",
            status.dataset, status.rows, span, status.duplicate_keys, status.gaps
        );
    }
    Ok(())
}

fn summarize_dataset(config: &Config, dataset: &'static str) -> Result<DatasetStatus> {
    let path = config.dataset_path(dataset);
    match dataset {
        PRICES5 | PRICES30 => summarize::<PriceRecord>(&path, dataset),
        SCADA5 | SCADA30 => summarize::<ScadaRecord>(&path, dataset),
        TRANSMISSION5 | TRANSMISSION30 => summarize::<TransmissionRecord>(&path, dataset),
        ROOFTOP30 | ROOFTOP5 => summarize::<RooftopRecord>(&path, dataset),
        DEMAND30 => summarize::<DemandRecord>(&path, dataset),
        CURTAILMENT5 => summarize::<CurtailmentRecord>(&path, dataset),
        REGIONAL_CURTAILMENT5 => summarize::<RegionalCurtailmentRecord>(&path, dataset),
        other => anyhow::bail!("unknown dataset {other}"),
    }
}

fn summarize<R: Record>(path: &Path, dataset: &'static str) -> Result<DatasetStatus> {
    if !path.exists() {
        return Ok(DatasetStatus {
            dataset,
            exists: false,
            rows: 0,
            duplicate_keys: 0,
            span: None,
            gaps: 0,
        });
    }
    let rows: Vec<R> = store::load(path)?;
    let keys: BTreeSet<_> = rows.iter().map(Record::key).collect();
    let times: BTreeSet<NaiveDateTime> = rows.iter().map(|r| r.settlement()).collect();
    let cadence = if dataset.ends_with("30") { 30 } else { 5 };
    let tolerated = Duration::minutes(cadence * 3 / 2);
    let gaps = times
        .iter()
        .tuple_windows()
        .filter(|(a, b)| **b - **a > tolerated)
        .count();
    Ok(DatasetStatus {
        dataset,
        exists: true,
        rows: rows.len(),
        duplicate_keys: rows.len() - keys.len(),
        span: times
            .iter()
            .next()
            .copied()
            .zip(times.iter().next_back().copied()),
        gaps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::PriceRecord;
    use tempfile::tempdir;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn summary_counts_rows_span_and_gaps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prices5.csv");
        let rows = vec![
            PriceRecord {
                settlementdate: ts("2025-01-01 10:00"),
                regionid: "NSW1".into(),
                rrp: 1.0,
            },
            PriceRecord {
                settlementdate: ts("2025-01-01 10:05"),
                regionid: "NSW1".into(),
                rrp: 2.0,
            },
            // a 25-minute hole before the next sample
            PriceRecord {
                settlementdate: ts("2025-01-01 10:30"),
                regionid: "NSW1".into(),
                rrp: 3.0,
            },
        ];
        store::write_atomic(&path, &rows).unwrap();
        let status = summarize::<PriceRecord>(&path, PRICES5).unwrap();
        assert!(status.exists);
        assert_eq!(status.rows, 3);
        assert_eq!(status.duplicate_keys, 0);
        assert_eq!(status.gaps, 1);
        assert_eq!(
            status.span,
            Some((ts("2025-01-01 10:00"), ts("2025-01-01 10:30")))
        );
    }

    #[test]
    fn missing_file_reports_missing() {
        let dir = tempdir().unwrap();
        let status =
            summarize::<PriceRecord>(&dir.path().join("scada5.csv"), SCADA5).unwrap();
        assert!(!status.exists);
    }
}
