use std::io::{Cursor, Read};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tracing::debug;
use zip::ZipArchive;

/// Extract every CSV payload from a NEMWEB ZIP.
///
/// Two shapes exist upstream: a flat ZIP holding one or more CSVs
/// (per-interval reports), and a daily/weekly/monthly bundle holding nested
/// ZIPs that each wrap a single CSV. Nesting is descended exactly one level;
/// entries that are neither `.csv` nor `.zip` are ignored.
pub fn extract_csv_entries(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).context("open outer zip archive")?;
    let mut out = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("read zip entry")?;
        let name = entry.name().to_string();

        if has_extension(&name, "csv") {
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            out.push((basename(&name), buf));
        } else if has_extension(&name, "zip") {
            let mut inner_bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut inner_bytes)?;
            drop(entry);
            match extract_inner_csvs(&inner_bytes) {
                Ok(mut inner) => out.append(&mut inner),
                Err(e) => debug!("skipping unreadable nested zip {name}: {e}"),
            }
        } else {
            debug!("ignoring non-csv non-zip entry {name}");
        }
    }
    Ok(out)
}

/// CSVs of a nested ZIP. No further descent.
fn extract_inner_csvs(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("open nested zip")?;
    let mut out = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        if has_extension(&name, "csv") {
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            out.push((basename(&name), buf));
        }
    }
    Ok(out)
}

/// List the nested ZIP entry names of a bundle without extracting payloads.
/// Callers use the filename timestamp for range selection before paying the
/// decompression cost.
pub fn nested_zip_names(bytes: &[u8]) -> Result<Vec<String>> {
    let archive = ZipArchive::new(Cursor::new(bytes)).context("open zip archive")?;
    Ok(archive
        .file_names()
        .filter(|n| has_extension(n, "zip"))
        .map(|n| n.to_string())
        .collect())
}

/// Extract the CSVs of one named nested ZIP entry from a bundle.
pub fn extract_nested_entry(bytes: &[u8], entry_name: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("open zip archive")?;
    let mut entry = archive
        .by_name(entry_name)
        .with_context(|| format!("nested entry {entry_name}"))?;
    let mut inner_bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut inner_bytes)?;
    extract_inner_csvs(&inner_bytes)
}

/// Parse the 12-digit interval timestamp NEMWEB embeds in report filenames,
/// e.g. `PUBLIC_DISPATCHSCADA_202501011005_0000000123.zip` -> 2025-01-01 10:05.
/// The slot is positional: the third underscore-separated part, first 12 digits.
pub fn filename_timestamp(name: &str) -> Option<NaiveDateTime> {
    let base = basename(name);
    let parts: Vec<&str> = base.split('_').collect();
    for part in parts.get(2..)? {
        if part.len() >= 12 && part.as_bytes()[..12].iter().all(u8::is_ascii_digit) {
            return NaiveDateTime::parse_from_str(&part[..12], "%Y%m%d%H%M").ok();
        }
    }
    None
}

fn has_extension(name: &str, ext: &str) -> bool {
    name.rsplit('.')
        .next()
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn basename(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::{SimpleFileOptions, ZipWriter};

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = ZipWriter::new(&mut cursor);
        for (name, data) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn flat_zip_yields_csv_entries() {
        let zip = build_zip(&[
            ("PUBLIC_DISPATCHIS_202501011005_1.CSV", b"C,hello".as_slice()),
            ("README.txt", b"ignored".as_slice()),
        ]);
        let entries = extract_csv_entries(&zip).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "PUBLIC_DISPATCHIS_202501011005_1.CSV");
        assert_eq!(entries[0].1, b"C,hello");
    }

    #[test]
    fn nested_zip_descends_one_level() {
        let inner = build_zip(&[("PUBLIC_DISPATCHIS_202501011005_1.CSV", b"D,data".as_slice())]);
        let outer = build_zip(&[
            ("PUBLIC_DISPATCHIS_202501011005_1.zip", inner.as_slice()),
            ("notes.txt", b"x".as_slice()),
        ]);
        let entries = extract_csv_entries(&outer).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, b"D,data");
    }

    #[test]
    fn nested_names_listed_without_extraction() {
        let inner = build_zip(&[("a.csv", b"x".as_slice())]);
        let outer = build_zip(&[
            ("PUBLIC_DISPATCHIS_20250101.zip", inner.as_slice()),
            ("PUBLIC_DISPATCHIS_20250102.zip", inner.as_slice()),
        ]);
        let names = nested_zip_names(&outer).unwrap();
        assert_eq!(names.len(), 2);
        let picked = extract_nested_entry(&outer, "PUBLIC_DISPATCHIS_20250102.zip").unwrap();
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn filename_timestamp_uses_positional_slot() {
        let ts =
            filename_timestamp("PUBLIC_DISPATCHSCADA_202501011005_0000000123.zip").unwrap();
        assert_eq!(
            ts,
            NaiveDateTime::parse_from_str("2025-01-01 10:05", "%Y-%m-%d %H:%M").unwrap()
        );
        // rooftop names carry a 14-digit stamp; the first 12 digits are the interval
        let ts = filename_timestamp(
            "PUBLIC_ROOFTOP_PV_ACTUAL_MEASUREMENT_20250101103000_0000000001.zip",
        );
        assert!(ts.is_some());
        assert!(filename_timestamp("no_digits_here.zip").is_none());
    }
}
