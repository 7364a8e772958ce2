//! Scripted in-memory collection used by the engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures_util::stream;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{
    Asset, AssetHandle, AssetKind, AssetStream, AuthenticationState, FieldError,
    RemoteCollection, RemoteError,
};

/// How a scripted operation behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    /// Fail with a transient error on every attempt.
    AlwaysTransient,
    /// Fail transiently for the first `n` attempts, then succeed.
    TransientTimes(u32),
    NotFound,
    Permanent,
    Unauthenticated,
}

#[derive(Debug, Clone)]
pub struct FakeItem {
    pub asset: Asset,
    pub bytes: Vec<u8>,
    pub broken_fields: bool,
    pub download: Behavior,
    pub delete: Behavior,
}

impl FakeItem {
    pub fn new(asset: Asset) -> Self {
        let bytes = vec![7u8; asset.size as usize];
        Self {
            asset,
            bytes,
            broken_fields: false,
            download: Behavior::Succeed,
            delete: Behavior::Succeed,
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    deleted: HashSet<String>,
    download_attempts: HashMap<String, u32>,
    delete_attempts: HashMap<String, u32>,
    successful_downloads: u32,
    successful_deletes: u32,
    listings: u32,
}

/// In-memory collection with scripted behavior.
pub struct FakeCollection {
    items: Vec<FakeItem>,
    cycle: bool,
    transport_failure_at: Option<usize>,
    auth: AuthenticationState,
    cancel_after: Option<(u32, CancellationToken)>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeCollection {
    pub fn new(items: Vec<FakeItem>) -> Self {
        Self {
            items,
            cycle: false,
            transport_failure_at: None,
            auth: AuthenticationState::Valid,
            cancel_after: None,
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    /// Re-yield the same items forever once exhausted.
    pub fn cycling(mut self) -> Self {
        self.cycle = true;
        self
    }

    /// Yield a transport error in place of the item at index `k`.
    pub fn failing_at(mut self, k: usize) -> Self {
        self.transport_failure_at = Some(k);
        self
    }

    pub fn with_auth(mut self, auth: AuthenticationState) -> Self {
        self.auth = auth;
        self
    }

    /// Cancel `token` once `n` mutations (downloads or deletes) have succeeded.
    pub fn cancel_after(mut self, n: u32, token: CancellationToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    pub fn stop_cancelling(&mut self) {
        self.cancel_after = None;
    }

    pub fn download_attempts(&self, filename: &str) -> u32 {
        self.lock().download_attempts.get(filename).copied().unwrap_or(0)
    }

    pub fn total_download_attempts(&self) -> u32 {
        self.lock().download_attempts.values().sum()
    }

    pub fn delete_attempts(&self, filename: &str) -> u32 {
        self.lock().delete_attempts.get(filename).copied().unwrap_or(0)
    }

    pub fn total_delete_attempts(&self) -> u32 {
        self.lock().delete_attempts.values().sum()
    }

    pub fn is_deleted(&self, filename: &str) -> bool {
        self.lock().deleted.contains(filename)
    }

    pub fn listings(&self) -> u32 {
        self.lock().listings
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl RemoteCollection for FakeCollection {
    async fn probe(&self) -> Result<AuthenticationState, RemoteError> {
        Ok(self.auth)
    }

    fn assets(&self) -> AssetStream<'_> {
        let live: Vec<FakeItem> = {
            let mut state = self.lock();
            state.listings += 1;
            self.items
                .iter()
                .filter(|i| !state.deleted.contains(&i.asset.filename))
                .cloned()
                .collect()
        };
        let failure_at = self.transport_failure_at;
        let shared = self.state.clone();
        let cancel_after = self.cancel_after.clone();

        let make = move |(idx, item): (usize, FakeItem)| -> Result<Box<dyn AssetHandle>, RemoteError> {
            if Some(idx) == failure_at {
                return Err(RemoteError::Transient("connection reset".into()));
            }
            Ok(Box::new(FakeHandle {
                item,
                state: shared.clone(),
                cancel_after: cancel_after.clone(),
            }))
        };

        if self.cycle {
            let iter = live.into_iter().cycle().enumerate().map(make);
            Box::pin(stream::iter(iter))
        } else {
            let iter = live.into_iter().enumerate().map(make);
            Box::pin(stream::iter(iter))
        }
    }
}

struct FakeHandle {
    item: FakeItem,
    state: Arc<Mutex<FakeState>>,
    cancel_after: Option<(u32, CancellationToken)>,
}

impl FakeHandle {
    fn outcome(&self, behavior: Behavior, attempt: u32) -> Result<(), RemoteError> {
        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::AlwaysTransient => Err(RemoteError::Transient("timed out".into())),
            Behavior::TransientTimes(n) if attempt <= n => {
                Err(RemoteError::Transient("timed out".into()))
            }
            Behavior::TransientTimes(_) => Ok(()),
            Behavior::NotFound => Err(RemoteError::NotFound(self.item.asset.filename.clone())),
            Behavior::Permanent => Err(RemoteError::Permanent("rejected".into())),
            Behavior::Unauthenticated => Err(RemoteError::Unauthenticated { status: 401 }),
        }
    }

    fn maybe_cancel(&self, successes: u32) {
        if let Some((n, token)) = &self.cancel_after {
            if successes >= *n {
                token.cancel();
            }
        }
    }
}

#[async_trait]
impl AssetHandle for FakeHandle {
    fn describe(&self) -> Result<Asset, FieldError> {
        if self.item.broken_fields {
            return Err(FieldError::Missing("filenameEnc"));
        }
        Ok(self.item.asset.clone())
    }

    async fn download(&self, sink: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64, RemoteError> {
        let attempt = {
            let mut state = self.state.lock().unwrap();
            let n = state
                .download_attempts
                .entry(self.item.asset.filename.clone())
                .or_insert(0);
            *n += 1;
            *n
        };
        self.outcome(self.item.download, attempt)?;
        sink.write_all(&self.item.bytes).await?;
        let successes = {
            let mut state = self.state.lock().unwrap();
            state.successful_downloads += 1;
            state.successful_downloads
        };
        self.maybe_cancel(successes);
        Ok(self.item.bytes.len() as u64)
    }

    async fn delete(&self) -> Result<(), RemoteError> {
        let attempt = {
            let mut state = self.state.lock().unwrap();
            let n = state
                .delete_attempts
                .entry(self.item.asset.filename.clone())
                .or_insert(0);
            *n += 1;
            *n
        };
        self.outcome(self.item.delete, attempt)?;
        let successes = {
            let mut state = self.state.lock().unwrap();
            state.deleted.insert(self.item.asset.filename.clone());
            state.successful_deletes += 1;
            state.successful_deletes
        };
        self.maybe_cancel(successes);
        Ok(())
    }
}

/// Fixed reference instant for deterministic tests.
pub fn reference_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

/// An image added `days_ago` days before [`reference_now`].
pub fn photo(filename: &str, days_ago: i64) -> Asset {
    let when = reference_now() - Duration::days(days_ago);
    Asset {
        id: format!("id-{filename}"),
        filename: filename.to_string(),
        kind: AssetKind::Image,
        size: 16,
        created: Some(when),
        asset_date: Some(when),
        added_date: Some(when),
        dimensions: Some((4032, 3024)),
        duration_secs: None,
        location: None,
    }
}

pub fn video(filename: &str, days_ago: i64, size: u64, duration_secs: f64) -> Asset {
    Asset {
        kind: AssetKind::Video,
        size,
        duration_secs: Some(duration_secs),
        dimensions: Some((1920, 1080)),
        ..photo(filename, days_ago)
    }
}

/// `n` images named `IMG_0000.HEIC`, `IMG_0001.HEIC`, ..., newest first.
pub fn photos(n: usize) -> Vec<FakeItem> {
    (0..n)
        .map(|i| FakeItem::new(photo(&format!("IMG_{i:04}.HEIC"), i as i64)))
        .collect()
}
