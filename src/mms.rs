use std::collections::HashMap;

use tracing::debug;

/// One table extracted from an MMS report file.
///
/// MMS files are line-oriented CSV carrying several tables per file. Each line
/// opens with a row-type marker: `C` comment, `I` column header for a table,
/// `D` data for a table. The table identifier sits at offset 2 (offset 1 holds
/// the owning system, e.g. `DISPATCH`); column names and data values begin at
/// offset 4.
#[derive(Debug, Clone, Default)]
pub struct MmsTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    index: HashMap<String, usize>,
}

impl MmsTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column position by case-insensitive name.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.index.get(&name.to_ascii_uppercase()).copied()
    }

    /// Cell value for `name` in `row`, None when the column is absent.
    pub fn value<'a>(&self, row: &'a [String], name: &str) -> Option<&'a str> {
        self.column(name).and_then(|i| row.get(i)).map(String::as_str)
    }
}

/// Extract the named table from MMS CSV bytes.
///
/// `target` is either a bare table identifier (`PRICE`, `UNIT_SCADA`) or a
/// `SYSTEM.TABLE` pair (`DISPATCH.UNIT_SOLUTION`) when the bare identifier is
/// ambiguous across report families. The first matching `I` row defines the
/// schema; every later matching `D` row contributes a data row. A missing
/// target yields an empty table, not an error. Malformed lines are dropped.
///
/// Legacy archives sometimes omit the `I` row entirely; matching `D` rows are
/// then collected with an empty schema and callers fall back to positional
/// access.
pub fn parse(content: &[u8], target: &str) -> MmsTable {
    let text = String::from_utf8_lossy(content);
    let (want_system, want_table) = match target.split_once('.') {
        Some((sys, tab)) => (Some(sys), tab),
        None => (None, target),
    };

    let lines: Vec<Vec<String>> = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .map(split_line)
        .collect();

    let matches = |parts: &[String]| {
        parts.len() >= 3
            && parts[2] == want_table
            && want_system.is_none_or(|sys| parts[1] == sys)
    };

    let mut table = MmsTable::default();

    // first pass: locate the schema row
    let schema_at = lines
        .iter()
        .position(|parts| parts[0] == "I" && matches(parts));
    if let Some(i) = schema_at {
        table.columns = lines[i].get(4..).unwrap_or_default().to_vec();
        table.index = table
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.to_ascii_uppercase(), i))
            .collect();
    }

    // second pass: data rows after the schema row, or the whole file when the
    // schema row is absent
    let from = schema_at.map(|i| i + 1).unwrap_or(0);
    for parts in &lines[from..] {
        if parts[0] != "D" || !matches(parts) {
            continue;
        }
        if parts.len() < 5 {
            debug!("dropping short mms data row");
            continue;
        }
        let mut row = parts[4..].to_vec();
        if !table.columns.is_empty() {
            row.resize(table.columns.len(), String::new());
        }
        table.rows.push(row);
    }
    table
}

/// Split one MMS line on commas, honouring double-quoted fields. Quotes are
/// stripped and fields trimmed.
fn split_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    for ch in line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut cur).trim().to_string());
            }
            _ => cur.push(ch),
        }
    }
    fields.push(cur.trim().to_string());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
C,NEMP.WORLD,DISPATCHIS,AEMO,PUBLIC,2025/01/01,10:05:00\n\
I,DISPATCH,PRICE,4,SETTLEMENTDATE,RUNNO,REGIONID,RRP\n\
D,DISPATCH,PRICE,4,\"2025/01/01 10:05:00\",1,NSW1,85.50\n\
D,DISPATCH,PRICE,4,\"2025/01/01 10:05:00\",1,VIC1,79.10\n\
I,DISPATCH,INTERCONNECTORRES,3,SETTLEMENTDATE,INTERCONNECTORID,METEREDMWFLOW\n\
D,DISPATCH,INTERCONNECTORRES,3,\"2025/01/01 10:05:00\",VIC1-NSW1,120.0\n\
D,DISPATCH,PRICE,4,\"2025/01/01 10:05:00\",1,QLD1,92.00\n";

    #[test]
    fn extracts_only_the_requested_table() {
        let t = parse(SAMPLE.as_bytes(), "PRICE");
        assert_eq!(t.columns, ["SETTLEMENTDATE", "RUNNO", "REGIONID", "RRP"]);
        assert_eq!(t.rows.len(), 3);
        assert_eq!(t.value(&t.rows[0], "REGIONID"), Some("NSW1"));
        assert_eq!(t.value(&t.rows[2], "RRP"), Some("92.00"));
    }

    #[test]
    fn qualified_target_matches_system_and_table() {
        let t = parse(SAMPLE.as_bytes(), "DISPATCH.INTERCONNECTORRES");
        assert_eq!(t.rows.len(), 1);
        let t = parse(SAMPLE.as_bytes(), "TRADING.INTERCONNECTORRES");
        assert!(t.is_empty());
    }

    #[test]
    fn missing_table_yields_empty_result() {
        let t = parse(SAMPLE.as_bytes(), "UNIT_SCADA");
        assert!(t.is_empty());
        assert!(t.columns.is_empty());
    }

    #[test]
    fn quoted_timestamps_are_unwrapped() {
        let t = parse(SAMPLE.as_bytes(), "PRICE");
        assert_eq!(
            t.value(&t.rows[0], "SETTLEMENTDATE"),
            Some("2025/01/01 10:05:00")
        );
    }

    #[test]
    fn malformed_and_short_lines_are_dropped() {
        let sample = "I,DISPATCH,PRICE,4,SETTLEMENTDATE,REGIONID,RRP\nD\nD,DISPATCH\nD,DISPATCH,PRICE,4,\"2025/01/01 10:05:00\",NSW1,85.5\n";
        let t = parse(sample.as_bytes(), "PRICE");
        assert_eq!(t.rows.len(), 1);
    }

    #[test]
    fn data_rows_without_a_schema_row_are_still_collected() {
        let sample = "C,NEMP.WORLD\nD,DISPATCH,UNIT_SOLUTION,2,\"2025/01/01 10:00:00\",1,WF1,0\n";
        let t = parse(sample.as_bytes(), "DISPATCH.UNIT_SOLUTION");
        assert!(t.columns.is_empty());
        assert_eq!(t.rows.len(), 1);
        assert_eq!(t.rows[0][0], "2025/01/01 10:00:00");
        assert_eq!(t.value(&t.rows[0], "DUID"), None);
    }

    #[test]
    fn short_data_rows_are_padded_to_schema_width() {
        let sample = "I,DISPATCH,PRICE,4,SETTLEMENTDATE,REGIONID,RRP\nD,DISPATCH,PRICE,4,\"2025/01/01 10:05:00\",NSW1\n";
        let t = parse(sample.as_bytes(), "PRICE");
        assert_eq!(t.rows[0].len(), 3);
        assert_eq!(t.value(&t.rows[0], "RRP"), Some(""));
    }
}
