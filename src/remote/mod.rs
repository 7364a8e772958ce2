//! Capability interface over the remote photo collection.
//!
//! The engine never talks to a concrete service directly. It consumes an
//! ordered, lazily fetched stream of [`AssetHandle`]s plus an authentication
//! probe. The listing has no total count and no stable cursor, and a fresh
//! call to [`RemoteCollection::assets`] starts again from the most recent item.

pub mod cloudkit;
pub mod error;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

pub use error::{FieldError, RemoteError};

/// Image or video. Serialized with the index's historical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetKind {
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "movie", alias = "video")]
    Video,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    /// Guess the kind from a filename extension.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = filename.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "mov" | "mp4" | "m4v" => Some(Self::Video),
            "heic" | "heif" | "jpg" | "jpeg" | "png" | "gif" | "dng" | "tif" | "tiff" => {
                Some(Self::Image)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Metadata of one remote item.
///
/// Optional fields stay `None` when the service does not report them; they
/// are never filled with placeholder values.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub id: String,
    /// Dedup key. Not guaranteed globally unique.
    pub filename: String,
    pub kind: AssetKind,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub asset_date: Option<DateTime<Utc>>,
    pub added_date: Option<DateTime<Utc>>,
    pub dimensions: Option<(u32, u32)>,
    pub duration_secs: Option<f64>,
    pub location: Option<GeoLocation>,
}

impl Asset {
    /// Date used by windowed scans: when the item entered the library,
    /// falling back to when it was taken.
    pub fn recency_date(&self) -> Option<DateTime<Utc>> {
        self.added_date.or(self.asset_date).or(self.created)
    }

    /// Date used to place the item on disk.
    pub fn placement_date(&self) -> Option<DateTime<Utc>> {
        self.created.or(self.asset_date).or(self.added_date)
    }
}

/// Result of probing the persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationState {
    Valid,
    Expired,
    Required,
}

impl std::fmt::Display for AuthenticationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Valid => "Valid",
            Self::Expired => "Expired",
            Self::Required => "Required",
        };
        f.write_str(s)
    }
}

pub type AssetStream<'a> = BoxStream<'a, Result<Box<dyn AssetHandle>, RemoteError>>;

/// The remote collection as the engine sees it.
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    /// Check whether the persisted session can be used.
    async fn probe(&self) -> Result<AuthenticationState, RemoteError>;

    /// Start a new enumeration pass from the most recent item.
    fn assets(&self) -> AssetStream<'_>;
}

/// Transient handle to one remote item, valid for a single enumeration pass.
#[async_trait]
pub trait AssetHandle: Send + Sync {
    /// Read the item's metadata.
    fn describe(&self) -> Result<Asset, FieldError>;

    /// Stream the original bytes into `sink`, returning the byte count.
    async fn download(&self, sink: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64, RemoteError>;

    /// Remove the item from the remote collection.
    async fn delete(&self) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn asset() -> Asset {
        Asset {
            id: "A1".into(),
            filename: "IMG_0001.HEIC".into(),
            kind: AssetKind::Image,
            size: 10,
            created: None,
            asset_date: None,
            added_date: None,
            dimensions: None,
            duration_secs: None,
            location: None,
        }
    }

    #[test]
    fn test_kind_from_filename() {
        assert_eq!(AssetKind::from_filename("a.MOV"), Some(AssetKind::Video));
        assert_eq!(AssetKind::from_filename("a.mp4"), Some(AssetKind::Video));
        assert_eq!(AssetKind::from_filename("a.m4v"), Some(AssetKind::Video));
        assert_eq!(AssetKind::from_filename("a.jpeg"), Some(AssetKind::Image));
        assert_eq!(AssetKind::from_filename("a.HEIC"), Some(AssetKind::Image));
        assert_eq!(AssetKind::from_filename("noext"), None);
        assert_eq!(AssetKind::from_filename("a.txt"), None);
    }

    #[test]
    fn test_kind_serializes_with_index_names() {
        assert_eq!(serde_json::to_string(&AssetKind::Video).unwrap(), "\"movie\"");
        assert_eq!(serde_json::to_string(&AssetKind::Image).unwrap(), "\"image\"");
        let k: AssetKind = serde_json::from_str("\"video\"").unwrap();
        assert_eq!(k, AssetKind::Video);
    }

    #[test]
    fn test_recency_date_fallback_order() {
        let added = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let taken = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut a = asset();
        assert_eq!(a.recency_date(), None);
        a.asset_date = Some(taken);
        assert_eq!(a.recency_date(), Some(taken));
        a.added_date = Some(added);
        assert_eq!(a.recency_date(), Some(added));
    }

    #[test]
    fn test_placement_date_prefers_created() {
        let created = Utc.with_ymd_and_hms(2019, 5, 1, 0, 0, 0).unwrap();
        let added = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut a = asset();
        a.added_date = Some(added);
        assert_eq!(a.placement_date(), Some(added));
        a.created = Some(created);
        assert_eq!(a.placement_date(), Some(created));
    }

    #[tokio::test]
    async fn test_probe_reports_session_state() {
        use crate::remote::fake::FakeCollection;

        let remote = FakeCollection::new(Vec::new());
        assert_eq!(remote.probe().await.unwrap(), AuthenticationState::Valid);
        let remote = FakeCollection::new(Vec::new()).with_auth(AuthenticationState::Expired);
        let state = remote.probe().await.unwrap();
        assert_eq!(state, AuthenticationState::Expired);
        assert_eq!(state.to_string(), "Expired");
    }
}
