use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::record::ContentKind;

/// Highest CMS id seen per region (news) and per category (tools).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUpdateRecord {
    #[serde(default)]
    pub news: BTreeMap<String, u64>,
    #[serde(default)]
    pub tools: BTreeMap<String, u64>,
}

impl LastUpdateRecord {
    pub fn last_seen(&self, kind: ContentKind, key: &str) -> u64 {
        self.map(kind)
            .and_then(|map| map.get(key).copied())
            .unwrap_or(0)
    }

    /// Raise the stored id for `key`; never lowers it.
    pub fn advance(&mut self, kind: ContentKind, key: &str, latest: u64) -> Result<bool> {
        let map = self.map_mut(kind)?;
        let entry = map.entry(key.to_string()).or_insert(0);
        if latest > *entry {
            *entry = latest;
            return Ok(true);
        }
        Ok(false)
    }

    /// Set the stored id for `key` unconditionally. Returns the previous value.
    pub fn set(&mut self, kind: ContentKind, key: &str, id: u64) -> Result<Option<u64>> {
        Ok(self.map_mut(kind)?.insert(key.to_string(), id))
    }

    fn map(&self, kind: ContentKind) -> Option<&BTreeMap<String, u64>> {
        match kind {
            ContentKind::News => Some(&self.news),
            ContentKind::Tools => Some(&self.tools),
            ContentKind::Guides => None,
        }
    }

    fn map_mut(&mut self, kind: ContentKind) -> Result<&mut BTreeMap<String, u64>> {
        match kind {
            ContentKind::News => Ok(&mut self.news),
            ContentKind::Tools => Ok(&mut self.tools),
            ContentKind::Guides => bail!("guides are built from local sources and have no last-seen ids"),
        }
    }
}

/// Strictly greater: an unchanged or older id is never an update.
pub fn has_updates(last_seen: u64, latest: u64) -> bool {
    latest > last_seen
}

/// Read the record; a missing file is a fresh start, an unparsable one is
/// reported and replaced by an empty record.
pub fn load_last_update(path: &Path) -> Result<LastUpdateRecord> {
    if !path.exists() {
        return Ok(LastUpdateRecord::default());
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    match serde_json::from_str(&raw) {
        Ok(record) => Ok(record),
        Err(error) => {
            warn!(path = %path.display(), %error, "last-update record is unparsable; starting empty");
            Ok(LastUpdateRecord::default())
        }
    }
}

/// Whole-file rewrite through a sibling temp file and rename.
pub fn save_last_update(path: &Path, record: &LastUpdateRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(record).context("failed to encode last-update record")?;
    let temp_path = temp_path_for(path);
    fs::write(&temp_path, format!("{json}\n"))
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_updates_is_strict() {
        assert!(has_updates(10, 15));
        assert!(!has_updates(15, 15));
        assert!(!has_updates(15, 10));
    }

    #[test]
    fn missing_or_corrupt_file_loads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("last-update.json");
        assert_eq!(load_last_update(&path).expect("load"), LastUpdateRecord::default());

        fs::write(&path, "{oops").expect("write");
        assert_eq!(load_last_update(&path).expect("load"), LastUpdateRecord::default());
    }

    #[test]
    fn save_then_load_preserves_values_and_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/last-update.json");
        let mut record = LastUpdateRecord::default();
        record.advance(ContentKind::News, "europe", 120).expect("advance");
        record.advance(ContentKind::Tools, "calculators", 9).expect("advance");

        save_last_update(&path, &record).expect("save");
        assert_eq!(load_last_update(&path).expect("load"), record);
        assert!(!temp.path().join("state/last-update.json.tmp").exists());
    }

    #[test]
    fn advance_never_lowers_but_set_may() {
        let mut record = LastUpdateRecord::default();
        assert!(record.advance(ContentKind::News, "asia-pacific", 50).expect("advance"));
        assert!(!record.advance(ContentKind::News, "asia-pacific", 40).expect("advance"));
        assert_eq!(record.last_seen(ContentKind::News, "asia-pacific"), 50);

        let previous = record.set(ContentKind::News, "asia-pacific", 10).expect("set");
        assert_eq!(previous, Some(50));
        assert_eq!(record.last_seen(ContentKind::News, "asia-pacific"), 10);
        assert!(record.set(ContentKind::Guides, "x", 1).is_err());
    }

    #[test]
    fn partial_file_fills_missing_maps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("last-update.json");
        fs::write(&path, r#"{"news": {"europe": 7}}"#).expect("write");
        let record = load_last_update(&path).expect("load");
        assert_eq!(record.last_seen(ContentKind::News, "europe"), 7);
        assert!(record.tools.is_empty());
    }
}
