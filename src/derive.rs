use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Included};

use chrono::{Duration, NaiveDateTime, Timelike};
use statrs::statistics::Statistics;
use tracing::debug;

use crate::records::{Record, RooftopRecord, ScadaRecord};

/// Derive 30-minute SCADA means from 5-minute readings.
///
/// `watermark` is the newest settlement already present in the 30-minute
/// table; only endpoints after it are produced. An endpoint is any on-grid
/// half-hour timestamp observed in the fresh rows, and each DUID seen at that
/// endpoint is averaged over `(t-30min, t]` using the full 5-minute history
/// (partial windows use the mean of whatever samples exist). Means of
/// negative readings stay negative.
pub fn aggregate_scada30(
    scada5: &[ScadaRecord],
    watermark: Option<NaiveDateTime>,
) -> Vec<ScadaRecord> {
    let fresh: Vec<&ScadaRecord> = match watermark {
        Some(w) => scada5.iter().filter(|r| r.settlementdate > w).collect(),
        None => scada5.iter().collect(),
    };
    if fresh.is_empty() {
        return Vec::new();
    }

    // time-indexed view of the whole 5-minute series for window lookups
    let mut by_time: BTreeMap<NaiveDateTime, Vec<&ScadaRecord>> = BTreeMap::new();
    for r in scada5 {
        by_time.entry(r.settlementdate).or_default().push(r);
    }

    let endpoints: BTreeSet<NaiveDateTime> = fresh
        .iter()
        .map(|r| r.settlementdate)
        .filter(|t| t.minute() % 30 == 0 && t.second() == 0)
        .collect();
    debug!("aggregating {} half-hour endpoints", endpoints.len());

    let mut out: BTreeMap<(NaiveDateTime, String), ScadaRecord> = BTreeMap::new();
    for t in endpoints {
        let duids_at_t: BTreeSet<&str> = by_time
            .get(&t)
            .map(|rows| rows.iter().map(|r| r.duid.as_str()).collect())
            .unwrap_or_default();
        if duids_at_t.is_empty() {
            continue;
        }

        let window_start = t - Duration::minutes(30);
        let mut samples: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for (_, rows) in by_time.range((Excluded(window_start), Included(t))) {
            for r in rows {
                if duids_at_t.contains(r.duid.as_str()) {
                    samples.entry(r.duid.as_str()).or_default().push(r.scadavalue);
                }
            }
        }

        for (duid, values) in samples {
            let mean = values.as_slice().mean();
            let rec = ScadaRecord {
                settlementdate: t,
                duid: duid.to_string(),
                scadavalue: mean,
            };
            out.insert(rec.key(), rec);
        }
    }
    out.into_values().collect()
}

/// Fan 30-minute rooftop anchors out to the 5-minute grid.
///
/// Between consecutive anchors `a` at `t` and `b` at `t+30min` the six samples
/// at `t, t+5, .., t+25` take the value `((6-j)*a + j*b)/6`. When the
/// successor anchor is missing (end of data, or a gap in the series) the
/// anchor value is replicated across all six slots as a nowcast; the next
/// cycle's merge overwrites the nowcast once the successor arrives.
pub fn interpolate_rooftop5(rooftop30: &[RooftopRecord]) -> Vec<RooftopRecord> {
    let mut by_region: BTreeMap<&str, Vec<&RooftopRecord>> = BTreeMap::new();
    for r in rooftop30 {
        by_region.entry(r.regionid.as_str()).or_default().push(r);
    }

    let mut out: BTreeMap<(NaiveDateTime, String), RooftopRecord> = BTreeMap::new();
    for (region, mut anchors) in by_region {
        anchors.sort_by_key(|r| r.settlementdate);
        for (i, cur) in anchors.iter().enumerate() {
            let t = cur.settlementdate;
            let next = anchors
                .get(i + 1)
                .filter(|n| n.settlementdate == t + Duration::minutes(30));
            for j in 0..6i64 {
                let value = match next {
                    Some(n) => ((6 - j) as f64 * cur.power + j as f64 * n.power) / 6.0,
                    None => cur.power,
                };
                let rec = RooftopRecord {
                    settlementdate: t + Duration::minutes(5 * j),
                    regionid: region.to_string(),
                    power: value,
                    quality_indicator: None,
                    kind: None,
                };
                out.insert(rec.key(), rec);
            }
        }
    }
    out.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn scada(t: &str, duid: &str, mw: f64) -> ScadaRecord {
        ScadaRecord {
            settlementdate: ts(t),
            duid: duid.into(),
            scadavalue: mw,
        }
    }

    fn rooftop(t: &str, region: &str, mw: f64) -> RooftopRecord {
        RooftopRecord {
            settlementdate: ts(t),
            regionid: region.into(),
            power: mw,
            quality_indicator: None,
            kind: None,
        }
    }

    #[test]
    fn mean_over_full_window_of_negatives() {
        // battery charging across the half hour ending 10:30
        let series = vec![
            scada("2025-01-01 10:05", "BATT1", -12.5),
            scada("2025-01-01 10:10", "BATT1", -10.0),
            scada("2025-01-01 10:15", "BATT1", -9.0),
            scada("2025-01-01 10:20", "BATT1", -8.0),
            scada("2025-01-01 10:25", "BATT1", -7.0),
            scada("2025-01-01 10:30", "BATT1", -5.0),
        ];
        let agg = aggregate_scada30(&series, None);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].settlementdate, ts("2025-01-01 10:30"));
        assert!((agg[0].scadavalue - (-8.583333333333334)).abs() < 1e-9);
    }

    #[test]
    fn window_excludes_the_previous_endpoint() {
        // the 10:00 reading belongs to the interval ending 10:00, not 10:30
        let series = vec![
            scada("2025-01-01 10:00", "G1", 600.0),
            scada("2025-01-01 10:15", "G1", 30.0),
            scada("2025-01-01 10:30", "G1", 60.0),
        ];
        let agg = aggregate_scada30(&series, Some(ts("2025-01-01 10:00")));
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].scadavalue, 45.0);
    }

    #[test]
    fn partial_windows_average_whatever_exists() {
        let series = vec![
            scada("2025-01-01 10:25", "G1", 10.0),
            scada("2025-01-01 10:30", "G1", 20.0),
        ];
        let agg = aggregate_scada30(&series, None);
        assert_eq!(agg[0].scadavalue, 15.0);
    }

    #[test]
    fn watermark_limits_new_endpoints_but_not_window_lookback() {
        let mut series = Vec::new();
        for (i, t) in ["10:35", "10:40", "10:45", "10:50", "10:55", "11:00"]
            .iter()
            .enumerate()
        {
            series.push(scada(&format!("2025-01-01 {t}"), "G1", (i + 1) as f64));
        }
        // 10:30 already aggregated; only the 11:00 endpoint is fresh, and its
        // window reaches back across rows older than the watermark
        let agg = aggregate_scada30(&series, Some(ts("2025-01-01 10:30")));
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].settlementdate, ts("2025-01-01 11:00"));
        assert_eq!(agg[0].scadavalue, 3.5);
    }

    #[test]
    fn only_duids_observed_at_the_endpoint_are_emitted() {
        let series = vec![
            scada("2025-01-01 10:25", "GONE", 99.0),
            scada("2025-01-01 10:30", "G1", 10.0),
        ];
        let agg = aggregate_scada30(&series, None);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].duid, "G1");
    }

    #[test]
    fn off_grid_timestamps_are_not_endpoints() {
        let series = vec![scada("2025-01-01 10:25", "G1", 10.0)];
        assert!(aggregate_scada30(&series, None).is_empty());
    }

    #[test]
    fn interpolation_between_anchors() {
        // anchors 600 -> 720 fan to 600,620,...,700; the next block starts at 720
        let anchors = vec![
            rooftop("2025-01-01 10:00", "NSW1", 600.0),
            rooftop("2025-01-01 10:30", "NSW1", 720.0),
        ];
        let out = interpolate_rooftop5(&anchors);
        let nsw: Vec<f64> = out.iter().map(|r| r.power).collect();
        assert_eq!(
            &nsw[..6],
            &[600.0, 620.0, 640.0, 660.0, 680.0, 700.0]
        );
        assert_eq!(nsw[6], 720.0);
        assert_eq!(out[0].settlementdate, ts("2025-01-01 10:00"));
        assert_eq!(out[5].settlementdate, ts("2025-01-01 10:25"));
    }

    #[test]
    fn trailing_anchor_replicates_as_nowcast() {
        let anchors = vec![rooftop("2025-01-01 10:00", "VIC1", 300.0)];
        let out = interpolate_rooftop5(&anchors);
        assert_eq!(out.len(), 6);
        assert!(out.iter().all(|r| r.power == 300.0));
    }

    #[test]
    fn gaps_in_the_anchor_series_do_not_interpolate_across() {
        let anchors = vec![
            rooftop("2025-01-01 10:00", "SA1", 100.0),
            rooftop("2025-01-01 11:30", "SA1", 400.0),
        ];
        let out = interpolate_rooftop5(&anchors);
        let first_block: Vec<f64> = out.iter().take(6).map(|r| r.power).collect();
        assert_eq!(first_block, vec![100.0; 6]);
    }

    #[test]
    fn regions_interpolate_independently() {
        let anchors = vec![
            rooftop("2025-01-01 10:00", "NSW1", 600.0),
            rooftop("2025-01-01 10:30", "NSW1", 720.0),
            rooftop("2025-01-01 10:00", "QLD1", 0.0),
        ];
        let out = interpolate_rooftop5(&anchors);
        let qld: Vec<&RooftopRecord> = out.iter().filter(|r| r.regionid == "QLD1").collect();
        assert_eq!(qld.len(), 6);
        assert!(qld.iter().all(|r| r.power == 0.0));
    }
}
