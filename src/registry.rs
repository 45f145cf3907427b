use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Persistent set of dispatchable unit identifiers seen so far.
///
/// The artifact is a plain text file, one DUID per line, rewritten whole
/// whenever new units appear. The set only grows.
pub struct DuidRegistry {
    path: PathBuf,
    known: BTreeSet<String>,
}

impl DuidRegistry {
    pub fn load(path: &Path) -> Self {
        let known: BTreeSet<String> = fs::read_to_string(path)
            .map(|text| {
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        debug!("loaded {} known DUIDs from {}", known.len(), path.display());
        Self {
            path: path.to_path_buf(),
            known,
        }
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn contains(&self, duid: &str) -> bool {
        self.known.contains(duid)
    }

    /// Union the observed DUIDs into the set. Newly seen identifiers are
    /// returned sorted, and the artifact is rewritten when there are any.
    pub fn register(&mut self, observed: &BTreeSet<String>) -> Result<Vec<String>> {
        let new: Vec<String> = observed
            .iter()
            .filter(|d| !self.known.contains(*d))
            .cloned()
            .collect();
        if new.is_empty() {
            return Ok(new);
        }
        self.known.extend(new.iter().cloned());
        self.save()?;
        info!("registered {} new DUIDs ({} known)", new.len(), self.known.len());
        Ok(new)
    }

    fn save(&self) -> Result<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent).ok();
        let mut tmp = NamedTempFile::new_in(parent)
            .with_context(|| format!("create temp file beside {}", self.path.display()))?;
        for duid in &self.known {
            writeln!(tmp, "{duid}")?;
        }
        tmp.persist(&self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn observed(duids: &[&str]) -> BTreeSet<String> {
        duids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn missing_artifact_starts_empty() {
        let dir = tempdir().unwrap();
        let reg = DuidRegistry::load(&dir.path().join("known_duids.txt"));
        assert!(reg.is_empty());
    }

    #[test]
    fn new_duids_are_returned_and_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_duids.txt");
        let mut reg = DuidRegistry::load(&path);
        let new = reg.register(&observed(&["BATT1", "GEN1"])).unwrap();
        assert_eq!(new, vec!["BATT1", "GEN1"]);

        let reloaded = DuidRegistry::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("GEN1"));
    }

    #[test]
    fn already_known_duids_are_not_reported_again() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_duids.txt");
        let mut reg = DuidRegistry::load(&path);
        reg.register(&observed(&["GEN1"])).unwrap();
        let new = reg.register(&observed(&["GEN1", "GEN2"])).unwrap();
        assert_eq!(new, vec!["GEN2"]);
    }

    #[test]
    fn artifact_is_sorted_one_per_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_duids.txt");
        let mut reg = DuidRegistry::load(&path);
        reg.register(&observed(&["ZEBRA1", "ALPHA1"])).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "ALPHA1\nZEBRA1\n");
    }
}
