//! iCloud Photos through the CloudKit web API.
//!
//! The listing pages through `records/query` newest first. Every page
//! holds CPLMaster and CPLAsset records that are paired into one
//! [`PhotoRecord`] per item; `startRank` advances by the number of masters.

pub mod records;
pub mod session;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{stream, StreamExt};
use reqwest::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::OnceCell;

use self::records::{PhotoRecord, QueryResponse};
use self::session::{ServiceInfo, Session, Validation};
use super::{
    Asset, AssetHandle, AssetStream, AuthenticationState, FieldError, RemoteCollection,
    RemoteError,
};
use crate::types::Domain;

const PAGE_SIZE: usize = 100;

/// Everything a request against the photos database needs.
struct Context {
    client: Client,
    endpoint: String,
    query: String,
}

impl Context {
    fn new(client: Client, info: ServiceInfo) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/database/1/com.apple.photos.cloud/production/private",
                info.ckdatabasews_url
            ),
            query: records::encode_params(&info.params),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<QueryResponse, RemoteError> {
        let url = format!("{}/{}?{}", self.endpoint, path, self.query);
        let response = self
            .client
            .post(&url)
            .header("Content-type", "text/plain")
            .body(body.to_string())
            .send()
            .await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(RemoteError::from_status(status, path));
        }
        Ok(response.json().await?)
    }
}

pub struct CloudKitCollection {
    session: Session,
    context: OnceCell<Arc<Context>>,
}

impl CloudKitCollection {
    pub async fn connect(cookie_dir: &Path, username: &str, domain: Domain) -> anyhow::Result<Self> {
        let session = Session::load(cookie_dir, username, domain).await?;
        Ok(Self {
            session,
            context: OnceCell::new(),
        })
    }

    async fn context(&self) -> Result<Arc<Context>, RemoteError> {
        self.context
            .get_or_try_init(|| async {
                match self.session.validate().await? {
                    Validation::Valid(info) => {
                        Ok(Arc::new(Context::new(self.session.client().clone(), info)))
                    }
                    Validation::Expired | Validation::Required => {
                        Err(RemoteError::Unauthenticated { status: 401 })
                    }
                }
            })
            .await
            .cloned()
    }
}

#[derive(Default)]
struct Pages {
    ctx: Option<Arc<Context>>,
    start_rank: u64,
    buffer: VecDeque<PhotoRecord>,
    finished: bool,
}

#[async_trait]
impl RemoteCollection for CloudKitCollection {
    async fn probe(&self) -> Result<AuthenticationState, RemoteError> {
        match self.session.validate().await? {
            Validation::Valid(info) => {
                let _ = self
                    .context
                    .set(Arc::new(Context::new(self.session.client().clone(), info)));
                Ok(AuthenticationState::Valid)
            }
            Validation::Expired => Ok(AuthenticationState::Expired),
            Validation::Required => Ok(AuthenticationState::Required),
        }
    }

    fn assets(&self) -> AssetStream<'_> {
        stream::unfold(Pages::default(), move |mut pages| async move {
            loop {
                if let (Some(record), Some(ctx)) = (pages.buffer.pop_front(), &pages.ctx) {
                    let handle: Box<dyn AssetHandle> = Box::new(CloudKitHandle {
                        record,
                        ctx: Arc::clone(ctx),
                    });
                    return Some((Ok(handle), pages));
                }
                if pages.finished {
                    return None;
                }
                let ctx = match &pages.ctx {
                    Some(ctx) => Arc::clone(ctx),
                    None => match self.context().await {
                        Ok(ctx) => {
                            pages.ctx = Some(Arc::clone(&ctx));
                            ctx
                        }
                        Err(e) => {
                            pages.finished = true;
                            return Some((Err(e), pages));
                        }
                    },
                };
                let body = records::list_query(pages.start_rank, PAGE_SIZE);
                match ctx.post("records/query", &body).await {
                    Ok(response) => {
                        let (pairs, masters) = records::pair_records(response.records);
                        tracing::debug!(start_rank = pages.start_rank, masters, "Fetched page");
                        if masters == 0 {
                            pages.finished = true;
                        }
                        pages.start_rank += masters;
                        pages.buffer.extend(pairs);
                    }
                    Err(e) => {
                        pages.finished = true;
                        return Some((Err(e), pages));
                    }
                }
            }
        })
        .boxed()
    }
}

struct CloudKitHandle {
    record: PhotoRecord,
    ctx: Arc<Context>,
}

/// Compare a CloudKit `fileChecksum` with a SHA-256 digest. Apple sends
/// either the raw 32-byte digest or 33 bytes with a one-byte type prefix;
/// other forms cannot be checked and are accepted.
pub(crate) fn checksum_matches(expected_b64: &str, digest: &[u8]) -> bool {
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(expected_b64) else {
        return true;
    };
    match expected.len() {
        32 => digest == expected.as_slice(),
        33 => digest == &expected[1..],
        _ => true,
    }
}

fn download_status_error(status: u16, url: &str) -> RemoteError {
    match status {
        404 => RemoteError::NotFound(url.to_string()),
        401 | 403 => RemoteError::Unauthenticated { status },
        429 | 500..=599 => RemoteError::Transient(format!("HTTP {status}")),
        _ => RemoteError::Permanent(format!("HTTP {status}")),
    }
}

#[async_trait]
impl AssetHandle for CloudKitHandle {
    fn describe(&self) -> Result<Asset, FieldError> {
        self.record.describe()
    }

    async fn download(&self, sink: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64, RemoteError> {
        let resource = self
            .record
            .original()
            .map_err(|e| RemoteError::Permanent(e.to_string()))?;
        let response = self
            .ctx
            .client
            .get(&resource.url)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(download_status_error(status, &resource.url));
        }

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RemoteError::Transient(e.to_string()))?;
            hasher.update(&chunk);
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        if let Some(expected) = &resource.checksum {
            if !checksum_matches(expected, hasher.finalize().as_slice()) {
                return Err(RemoteError::Transient("checksum mismatch".into()));
            }
        }
        Ok(written)
    }

    async fn delete(&self) -> Result<(), RemoteError> {
        let name = self
            .record
            .record_name()
            .ok_or_else(|| RemoteError::Permanent("record has no name".into()))?;
        let op = records::delete_operation(name, self.record.change_tag());
        let response = self.ctx.post("records/modify", &op).await?;
        match records::modify_error(&response) {
            None => Ok(()),
            Some("NOT_FOUND") => Err(RemoteError::NotFound(name.to_string())),
            Some(code) => Err(RemoteError::Permanent(format!("records/modify: {code}"))),
        }
    }
}
