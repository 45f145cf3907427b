use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Canonical dataset names; one table file per name under the data directory.
pub mod datasets {
    pub const PRICES5: &str = "prices5";
    pub const PRICES30: &str = "prices30";
    pub const SCADA5: &str = "scada5";
    pub const SCADA30: &str = "scada30";
    pub const TRANSMISSION5: &str = "transmission5";
    pub const TRANSMISSION30: &str = "transmission30";
    pub const ROOFTOP30: &str = "rooftop30";
    pub const ROOFTOP5: &str = "rooftop5";
    pub const DEMAND30: &str = "demand30";
    pub const CURTAILMENT5: &str = "curtailment5";
    pub const REGIONAL_CURTAILMENT5: &str = "regional_curtailment5";

    pub const ALL: [&str; 11] = [
        PRICES5,
        PRICES30,
        SCADA5,
        SCADA30,
        TRANSMISSION5,
        TRANSMISSION30,
        ROOFTOP30,
        ROOFTOP5,
        DEMAND30,
        CURTAILMENT5,
        REGIONAL_CURTAILMENT5,
    ];
}

/// A row of a canonical dataset. The key is (settlement, dimension); merge,
/// dedup and sort all operate on it. Settlement timestamps are naive market
/// local time and serialize in ISO-8601 text form, so key order is
/// chronological.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + 'static {
    fn key(&self) -> (NaiveDateTime, String);

    fn settlement(&self) -> NaiveDateTime {
        self.key().0
    }
}

/// Regional reference price, 5-minute or 30-minute cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub settlementdate: NaiveDateTime,
    pub regionid: String,
    pub rrp: f64,
}

impl Record for PriceRecord {
    fn key(&self) -> (NaiveDateTime, String) {
        (self.settlementdate, self.regionid.clone())
    }
}

/// Metered generation per dispatchable unit. Negative values are meaningful
/// (storage charging) and must survive every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScadaRecord {
    pub settlementdate: NaiveDateTime,
    pub duid: String,
    pub scadavalue: f64,
}

impl Record for ScadaRecord {
    fn key(&self) -> (NaiveDateTime, String) {
        (self.settlementdate, self.duid.clone())
    }
}

/// Interconnector flows and limits. Source fields can be absent in older
/// reports; all seven payload columns are always present in the table file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionRecord {
    pub settlementdate: NaiveDateTime,
    pub interconnectorid: String,
    pub meteredmwflow: Option<f64>,
    pub mwflow: Option<f64>,
    pub mwlosses: Option<f64>,
    pub exportlimit: Option<f64>,
    pub importlimit: Option<f64>,
}

impl Record for TransmissionRecord {
    fn key(&self) -> (NaiveDateTime, String) {
        (self.settlementdate, self.interconnectorid.clone())
    }
}

/// Distributed PV estimate per region. 30-minute at the source; the 5-minute
/// variant is derived by interpolation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RooftopRecord {
    pub settlementdate: NaiveDateTime,
    pub regionid: String,
    pub power: f64,
    pub quality_indicator: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl Record for RooftopRecord {
    fn key(&self) -> (NaiveDateTime, String) {
        (self.settlementdate, self.regionid.clone())
    }
}

/// Operational demand per region, 30-minute cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandRecord {
    pub settlementdate: NaiveDateTime,
    pub regionid: String,
    pub demand: f64,
    pub demand_less_snsg: Option<f64>,
}

impl Record for DemandRecord {
    fn key(&self) -> (NaiveDateTime, String) {
        (self.settlementdate, self.regionid.clone())
    }
}

/// Per-unit wind/solar curtailment derived from the dispatch unit solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurtailmentRecord {
    pub settlementdate: NaiveDateTime,
    pub duid: String,
    pub availability: f64,
    pub totalcleared: f64,
    pub semidispatchcap: i64,
    pub curtailment: f64,
}

impl Record for CurtailmentRecord {
    fn key(&self) -> (NaiveDateTime, String) {
        (self.settlementdate, self.duid.clone())
    }
}

/// Region-level curtailment from the dispatch region summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalCurtailmentRecord {
    pub settlementdate: NaiveDateTime,
    pub regionid: String,
    pub solar_curtailment: f64,
    pub wind_curtailment: f64,
    pub total_curtailment: f64,
}

impl Record for RegionalCurtailmentRecord {
    fn key(&self) -> (NaiveDateTime, String) {
        (self.settlementdate, self.regionid.clone())
    }
}

/// Parse an MMS timestamp (`YYYY/MM/DD HH:MM:SS`).
pub fn parse_mms_datetime(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim().trim_matches('"'), "%Y/%m/%d %H:%M:%S").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mms_datetime_parses_quoted_and_bare() {
        let want = NaiveDateTime::parse_from_str("2025-01-01 10:05:00", "%Y-%m-%d %H:%M:%S")
            .unwrap();
        assert_eq!(parse_mms_datetime("2025/01/01 10:05:00"), Some(want));
        assert_eq!(parse_mms_datetime("\"2025/01/01 10:05:00\""), Some(want));
        assert_eq!(parse_mms_datetime("not a date"), None);
    }

    #[test]
    fn key_orders_by_settlement_then_dimension() {
        let a = PriceRecord {
            settlementdate: parse_mms_datetime("2025/01/01 10:00:00").unwrap(),
            regionid: "VIC1".into(),
            rrp: 50.0,
        };
        let b = PriceRecord {
            settlementdate: parse_mms_datetime("2025/01/01 10:05:00").unwrap(),
            regionid: "NSW1".into(),
            rrp: 60.0,
        };
        assert!(a.key() < b.key());
    }
}
