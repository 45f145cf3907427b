use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDateTime, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::MAIN_REGIONS;
use crate::mms::MmsTable;
use crate::records::{
    CurtailmentRecord, DemandRecord, PriceRecord, Record, RegionalCurtailmentRecord,
    RooftopRecord, ScadaRecord, TransmissionRecord, parse_mms_datetime,
};

/// Wind/solar unit identifier shapes in the dispatch unit solution.
static WIND_SOLAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(WF|SF|SOLAR|WIND|PV)").unwrap());

/// Positional offsets of the unit-solution fields within a `D` row's value
/// slice, for legacy archives whose `I` row is missing.
mod unit_solution_fallback {
    pub const SETTLEMENTDATE: usize = 0;
    pub const DUID: usize = 2;
    pub const TOTALCLEARED: usize = 10;
    pub const AVAILABILITY: usize = 32;
    pub const SEMIDISPATCHCAP: usize = 55;
}

fn is_main_region(region: &str) -> bool {
    MAIN_REGIONS.contains(&region)
}

fn is_solar(duid: &str) -> bool {
    duid.contains("SF") || duid.to_ascii_uppercase().contains("SOLAR")
}

fn parse_f64(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|v| {
        let v = v.trim();
        if v.is_empty() { None } else { v.parse::<f64>().ok() }
    })
}

/// Keep-last dedup on the primary key, returning key-sorted rows.
fn dedup_sorted<R: Record>(rows: Vec<R>) -> Vec<R> {
    let mut map: BTreeMap<(NaiveDateTime, String), R> = BTreeMap::new();
    for row in rows {
        map.insert(row.key(), row);
    }
    map.into_values().collect()
}

/// Regional reference prices from a PRICE table, restricted to the five main
/// regions.
pub fn prices(table: &MmsTable) -> Vec<PriceRecord> {
    let mut out = Vec::new();
    for row in &table.rows {
        let Some(settlementdate) =
            table.value(row, "SETTLEMENTDATE").and_then(parse_mms_datetime)
        else {
            continue;
        };
        let Some(regionid) = table.value(row, "REGIONID").map(str::trim) else {
            continue;
        };
        if !is_main_region(regionid) {
            continue;
        }
        let Some(rrp) = parse_f64(table.value(row, "RRP")) else {
            continue;
        };
        out.push(PriceRecord {
            settlementdate,
            regionid: regionid.to_string(),
            rrp,
        });
    }
    dedup_sorted(out)
}

/// Unit SCADA readings. Negative values are battery charging and are kept;
/// only rows whose value fails to parse are dropped. Also reports the set of
/// DUIDs observed so the registry can detect new entrants.
pub fn scada(table: &MmsTable) -> (Vec<ScadaRecord>, BTreeSet<String>) {
    let mut out = Vec::new();
    let mut observed = BTreeSet::new();
    for row in &table.rows {
        let Some(settlementdate) =
            table.value(row, "SETTLEMENTDATE").and_then(parse_mms_datetime)
        else {
            continue;
        };
        let Some(duid) = table.value(row, "DUID").map(str::trim) else {
            continue;
        };
        let Some(scadavalue) = parse_f64(table.value(row, "SCADAVALUE")) else {
            continue;
        };
        observed.insert(duid.to_string());
        out.push(ScadaRecord {
            settlementdate,
            duid: duid.to_string(),
            scadavalue,
        });
    }
    (dedup_sorted(out), observed)
}

/// Interconnector flows from an INTERCONNECTORRES table. All payload columns
/// are carried even when a source field is absent.
pub fn transmission(table: &MmsTable) -> Vec<TransmissionRecord> {
    let mut out = Vec::new();
    for row in &table.rows {
        let Some(settlementdate) =
            table.value(row, "SETTLEMENTDATE").and_then(parse_mms_datetime)
        else {
            continue;
        };
        let Some(interconnectorid) = table.value(row, "INTERCONNECTORID").map(str::trim)
        else {
            continue;
        };
        if interconnectorid.is_empty() {
            continue;
        }
        out.push(TransmissionRecord {
            settlementdate,
            interconnectorid: interconnectorid.to_string(),
            meteredmwflow: parse_f64(table.value(row, "METEREDMWFLOW")),
            mwflow: parse_f64(table.value(row, "MWFLOW")),
            mwlosses: parse_f64(table.value(row, "MWLOSSES")),
            exportlimit: parse_f64(table.value(row, "EXPORTLIMIT")),
            importlimit: parse_f64(table.value(row, "IMPORTLIMIT")),
        });
    }
    dedup_sorted(out)
}

/// Rooftop PV actuals at the 30-minute source cadence. Missing or negative
/// power readings are dropped.
pub fn rooftop(table: &MmsTable) -> Vec<RooftopRecord> {
    let mut out = Vec::new();
    for row in &table.rows {
        let Some(settlementdate) =
            table.value(row, "INTERVAL_DATETIME").and_then(parse_mms_datetime)
        else {
            continue;
        };
        let Some(regionid) = table.value(row, "REGIONID").map(str::trim) else {
            continue;
        };
        if !is_main_region(regionid) {
            continue;
        }
        let Some(power) = parse_f64(table.value(row, "POWER")) else {
            continue;
        };
        if power < 0.0 {
            continue;
        }
        out.push(RooftopRecord {
            settlementdate,
            regionid: regionid.to_string(),
            power,
            quality_indicator: table
                .value(row, "QI")
                .or_else(|| table.value(row, "QUALITY_INDICATOR"))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from),
            kind: table
                .value(row, "TYPE")
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from),
        });
    }
    dedup_sorted(out)
}

/// Operational demand at the 30-minute cadence. Rows off the half-hour grid
/// are dropped.
pub fn demand(table: &MmsTable) -> Vec<DemandRecord> {
    let mut out = Vec::new();
    for row in &table.rows {
        let Some(settlementdate) =
            table.value(row, "INTERVAL_DATETIME").and_then(parse_mms_datetime)
        else {
            continue;
        };
        if settlementdate.minute() % 30 != 0 || settlementdate.second() != 0 {
            debug!("dropping off-grid demand row at {settlementdate}");
            continue;
        }
        let Some(regionid) = table.value(row, "REGIONID").map(str::trim) else {
            continue;
        };
        if !is_main_region(regionid) {
            continue;
        }
        let Some(demand) = parse_f64(table.value(row, "OPERATIONAL_DEMAND")) else {
            continue;
        };
        out.push(DemandRecord {
            settlementdate,
            regionid: regionid.to_string(),
            demand,
            demand_less_snsg: parse_f64(table.value(row, "DEMAND_LESS_SNSG")),
        });
    }
    dedup_sorted(out)
}

/// Per-unit curtailment from the dispatch unit solution, restricted to
/// wind/solar units.
///
/// Curtailment is only measured while the semi-dispatch cap is set, and solar
/// units below 1 MW availability are treated as night (zero curtailment
/// regardless of cleared level). The result is clamped non-negative.
pub fn curtailment(table: &MmsTable) -> Vec<CurtailmentRecord> {
    let named = table.column("DUID").is_some();
    let mut out = Vec::new();
    for row in &table.rows {
        let (raw_date, raw_duid, raw_cleared, raw_avail, raw_cap) = if named {
            (
                table.value(row, "SETTLEMENTDATE"),
                table.value(row, "DUID"),
                table.value(row, "TOTALCLEARED"),
                table.value(row, "AVAILABILITY"),
                table.value(row, "SEMIDISPATCHCAP"),
            )
        } else {
            use unit_solution_fallback as pos;
            // rows too short to hold every field are dropped, not zero-filled
            if row.len() <= pos::SEMIDISPATCHCAP {
                continue;
            }
            (
                row.get(pos::SETTLEMENTDATE).map(String::as_str),
                row.get(pos::DUID).map(String::as_str),
                row.get(pos::TOTALCLEARED).map(String::as_str),
                row.get(pos::AVAILABILITY).map(String::as_str),
                row.get(pos::SEMIDISPATCHCAP).map(String::as_str),
            )
        };

        let Some(duid) = raw_duid.map(str::trim) else {
            continue;
        };
        if !WIND_SOLAR_RE.is_match(duid) {
            continue;
        }
        let Some(settlementdate) = raw_date.and_then(parse_mms_datetime) else {
            continue;
        };
        let availability = parse_f64(raw_avail).unwrap_or(0.0);
        let totalcleared = parse_f64(raw_cleared).unwrap_or(0.0);
        let semidispatchcap = parse_f64(raw_cap).unwrap_or(0.0) as i64;

        let curtailment = if semidispatchcap == 0 {
            0.0
        } else if is_solar(duid) && availability <= 1.0 {
            0.0
        } else {
            (availability - totalcleared).max(0.0)
        };

        out.push(CurtailmentRecord {
            settlementdate,
            duid: duid.to_string(),
            availability,
            totalcleared,
            semidispatchcap,
            curtailment,
        });
    }
    dedup_sorted(out)
}

/// Region-level wind/solar curtailment from the dispatch region summary.
/// Missing semi-scheduled columns default to zero.
pub fn regional_curtailment(table: &MmsTable) -> Vec<RegionalCurtailmentRecord> {
    let mut out = Vec::new();
    for row in &table.rows {
        let Some(settlementdate) =
            table.value(row, "SETTLEMENTDATE").and_then(parse_mms_datetime)
        else {
            continue;
        };
        let Some(regionid) = table.value(row, "REGIONID").map(str::trim) else {
            continue;
        };
        if !is_main_region(regionid) {
            continue;
        }
        let solar_uigf = parse_f64(table.value(row, "SS_SOLAR_UIGF")).unwrap_or(0.0);
        let solar_cleared = parse_f64(table.value(row, "SS_SOLAR_CLEAREDMW")).unwrap_or(0.0);
        let wind_uigf = parse_f64(table.value(row, "SS_WIND_UIGF")).unwrap_or(0.0);
        let wind_cleared = parse_f64(table.value(row, "SS_WIND_CLEAREDMW")).unwrap_or(0.0);

        let solar_curtailment = (solar_uigf - solar_cleared).max(0.0);
        let wind_curtailment = (wind_uigf - wind_cleared).max(0.0);
        out.push(RegionalCurtailmentRecord {
            settlementdate,
            regionid: regionid.to_string(),
            solar_curtailment,
            wind_curtailment,
            total_curtailment: solar_curtailment + wind_curtailment,
        });
    }
    dedup_sorted(out)
}
