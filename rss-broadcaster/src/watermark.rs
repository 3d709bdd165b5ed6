use crate::types::{BroadcastError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Per-source last-seen publish time.
///
/// Every fan-out task of a run reads and writes through the same store, so all
/// access goes through one mutex. The guard is never held across an `.await`.
#[derive(Debug, Default)]
pub struct WatermarkStore {
    marks: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl WatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_marks(marks: HashMap<String, DateTime<Utc>>) -> Self {
        Self {
            marks: Mutex::new(marks),
        }
    }

    /// `None` means nothing has been seen yet for this source.
    pub fn get(&self, source: &str) -> Option<DateTime<Utc>> {
        self.lock().get(source).copied()
    }

    /// Record `at` for `source`. Never moves a watermark backward; returns
    /// whether the stored value changed.
    pub fn set(&self, source: &str, at: DateTime<Utc>) -> bool {
        let mut marks = self.lock();
        match marks.get(source) {
            Some(current) if *current >= at => {
                debug!("Watermark for {} stays at {} (offered {})", source, current, at);
                false
            }
            _ => {
                marks.insert(source.to_string(), at);
                true
            }
        }
    }

    pub fn snapshot(&self) -> HashMap<String, DateTime<Utc>> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mark {
    #[serde(default)]
    pub date: String,
}

/// On-disk layout of the watermark file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkFile {
    #[serde(default)]
    pub items: BTreeMap<String, Mark>,
}

impl MarkFile {
    pub fn from_store(store: &WatermarkStore) -> Self {
        let items = store
            .snapshot()
            .into_iter()
            .map(|(name, at)| {
                (
                    name,
                    Mark {
                        date: at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    },
                )
            })
            .collect();
        Self { items }
    }

    pub fn into_store(self) -> Result<WatermarkStore> {
        let mut marks = HashMap::with_capacity(self.items.len());
        for (name, mark) in self.items {
            if mark.date.trim().is_empty() {
                continue;
            }
            let at = DateTime::parse_from_rfc3339(mark.date.trim()).map_err(|e| {
                BroadcastError::Parse(format!("watermark for '{}' has invalid date '{}': {}", name, mark.date, e))
            })?;
            marks.insert(name, at.with_timezone(&Utc));
        }
        Ok(WatermarkStore::from_marks(marks))
    }
}

/// Load watermarks from `path`. A missing file yields an empty store.
pub fn load_marks(path: &Path) -> Result<WatermarkStore> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No watermark file at {}, starting fresh", path.display());
            return Ok(WatermarkStore::new());
        }
        Err(e) => return Err(e.into()),
    };
    let file: MarkFile = serde_json::from_slice(&bytes)?;
    let store = file.into_store()?;
    info!("Loaded {} watermarks from {}", store.len(), path.display());
    Ok(store)
}

/// Write watermarks to `path` via a sibling temp file and rename.
pub fn save_marks(path: &Path, store: &WatermarkStore) -> Result<()> {
    let file = MarkFile::from_store(store);
    let bytes = serde_json::to_vec_pretty(&file)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;

    debug!("Saved {} watermarks to {}", file.items.len(), path.display());
    Ok(())
}
