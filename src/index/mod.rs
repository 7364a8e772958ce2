//! Filename-keyed metadata snapshot of the remote collection.
//!
//! Records are created on first sighting and filled in by later refresh
//! passes. They are never removed when the remote item disappears: the
//! index is a historical record, and the cleanup selector works from it
//! without touching the service.

pub mod builder;
pub mod local;
pub mod query;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::remote::{Asset, AssetKind, GeoLocation};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
pub const DAYS_PER_YEAR: f64 = 365.25;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Failed to access index file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Index file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Persisted metadata of one asset.
///
/// `None` means "unknown, pending refresh". Fields are only ever filled in,
/// never cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub filename: String,
    #[serde(default, deserialize_with = "lenient")]
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "lenient_date")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_date")]
    pub asset_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_date")]
    pub added_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub dimensions: Option<(u32, u32)>,
    #[serde(rename = "item_type", default, deserialize_with = "lenient")]
    pub kind: Option<AssetKind>,
    #[serde(default, deserialize_with = "lenient")]
    pub duration_secs: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub location: Option<GeoLocation>,
}

impl IndexRecord {
    /// A record with nothing known but the filename.
    pub fn unknown(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            size: None,
            created: None,
            asset_date: None,
            added_date: None,
            dimensions: None,
            kind: None,
            duration_secs: None,
            id: None,
            location: None,
        }
    }

    pub fn from_asset(asset: &Asset) -> Self {
        Self {
            filename: asset.filename.clone(),
            size: Some(asset.size),
            created: asset.created,
            asset_date: asset.asset_date,
            added_date: asset.added_date,
            dimensions: asset.dimensions,
            kind: Some(asset.kind),
            duration_secs: asset.duration_secs,
            id: Some(asset.id.clone()),
            location: asset.location,
        }
    }

    /// Records rebuilt from local files lack the remote-only fields.
    pub fn needs_refresh(&self) -> bool {
        self.asset_date.is_none() || self.created.is_none() || self.id.is_none()
    }

    /// Fill every unknown field from `other`. Known fields are kept.
    /// Returns whether anything changed.
    pub fn fill_from(&mut self, other: &IndexRecord) -> bool {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) -> bool {
            if slot.is_none() && value.is_some() {
                *slot = value.clone();
                true
            } else {
                false
            }
        }
        let mut changed = false;
        changed |= fill(&mut self.size, &other.size);
        changed |= fill(&mut self.created, &other.created);
        changed |= fill(&mut self.asset_date, &other.asset_date);
        changed |= fill(&mut self.added_date, &other.added_date);
        changed |= fill(&mut self.dimensions, &other.dimensions);
        changed |= fill(&mut self.kind, &other.kind);
        changed |= fill(&mut self.duration_secs, &other.duration_secs);
        changed |= fill(&mut self.id, &other.id);
        changed |= fill(&mut self.location, &other.location);
        changed
    }

    pub fn is_video(&self) -> bool {
        self.kind == Some(AssetKind::Video)
    }

    /// Age in years of the creation timestamp. `None` when unknown.
    pub fn age_years(&self, now: DateTime<Utc>) -> Option<f64> {
        let created = self.created?;
        let days = (now - created).num_seconds() as f64 / 86_400.0;
        Some(days / DAYS_PER_YEAR)
    }

    pub fn size_mb(&self) -> Option<f64> {
        self.size.map(|s| s as f64 / BYTES_PER_MB)
    }
}

/// Aggregates recomputed on every save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStatistics {
    #[serde(default)]
    pub total_items: u64,
    #[serde(default)]
    pub photos: u64,
    #[serde(default)]
    pub videos: u64,
    #[serde(default)]
    pub total_size_gb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    #[serde(default, deserialize_with = "lenient_date")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_date")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "photo_count", alias = "item_count", default)]
    pub item_count: u64,
    #[serde(default)]
    pub statistics: IndexStatistics,
    #[serde(default)]
    pub filenames: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, IndexRecord>,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            created_at: Some(Utc::now()),
            updated_at: None,
            item_count: 0,
            statistics: IndexStatistics::default(),
            filenames: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }
}

impl Index {
    /// Load the index at `path`, or start an empty one when it does not exist.
    pub async fn load(path: &Path) -> Result<Self, IndexError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No index at {}, starting empty", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(IndexError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let mut index: Index =
            serde_json::from_str(&contents).map_err(|source| IndexError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        // Older files list names that never got metadata.
        for name in index.metadata.keys() {
            index.filenames.insert(name.clone());
        }
        Ok(index)
    }

    /// Recompute aggregates and write atomically (temp file, then rename).
    pub async fn save(&mut self, path: &Path) -> Result<(), IndexError> {
        self.recompute_statistics();
        self.updated_at = Some(Utc::now());
        let io_err = |source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        };

        let json = serde_json::to_vec_pretty(self).map_err(|source| IndexError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        tracing::debug!(items = self.item_count, "Saved index to {}", path.display());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.filenames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filenames.is_empty()
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.filenames.contains(filename)
    }

    pub fn get(&self, filename: &str) -> Option<&IndexRecord> {
        self.metadata.get(filename)
    }

    pub fn records(&self) -> impl Iterator<Item = &IndexRecord> {
        self.metadata.values()
    }

    /// Insert a record for a filename seen for the first time. Existing
    /// records are left untouched. Returns whether it was inserted.
    pub fn insert_new(&mut self, record: IndexRecord) -> bool {
        if self.metadata.contains_key(&record.filename) {
            return false;
        }
        self.filenames.insert(record.filename.clone());
        self.metadata.insert(record.filename.clone(), record);
        true
    }

    /// Fill unknown fields of an existing record, or insert a new one.
    /// Returns whether anything changed.
    pub fn merge(&mut self, record: IndexRecord) -> bool {
        match self.metadata.get_mut(&record.filename) {
            Some(existing) => existing.fill_from(&record),
            None => self.insert_new(record),
        }
    }

    pub fn needs_refresh_count(&self) -> usize {
        self.metadata.values().filter(|r| r.needs_refresh()).count()
    }

    pub fn recompute_statistics(&mut self) {
        let videos = self.metadata.values().filter(|r| r.is_video()).count() as u64;
        let total_bytes: u64 = self.metadata.values().filter_map(|r| r.size).sum();
        let total = self.filenames.len() as u64;
        self.item_count = total;
        self.statistics = IndexStatistics {
            total_items: total,
            photos: total.saturating_sub(videos),
            videos,
            total_size_gb: total_bytes as f64 / BYTES_PER_GB,
        };
    }
}

/// Accept any JSON for an optional field, mapping values of an unexpected
/// shape to `None` so one odd record can't make the whole index unreadable.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Accept RFC 3339 timestamps as well as offset-less ISO datetimes, which
/// are read as local time.
fn lenient_date<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer).unwrap_or(None);
    Ok(value.as_deref().and_then(parse_iso_datetime))
}

pub(crate) fn parse_iso_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }
    None
}
