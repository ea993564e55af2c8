//! Snapshot source contracts, fixture-first and HTTP JSON sources.

pub mod aliases;
pub mod records;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lobbysync_storage::{FetchError, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub use aliases::{AliasEntry, AliasMap};
pub use records::{parse_meeting_rows, parse_register_rows, ParsedBatch, RecordError, RejectedRow};

pub const CRATE_NAME: &str = "lobbysync-adapters";

/// Which reconciled entity kind a snapshot feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Register,
    Meetings,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Meetings => "meetings",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Representative,
    Person,
    FinancialData,
    Turnover,
    Organisation,
    CountryOfMember,
    Interest,
    ActionField,
    Meeting,
}

impl RowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Representative => "representative",
            Self::Person => "person",
            Self::FinancialData => "financial_data",
            Self::Turnover => "turnover",
            Self::Organisation => "organisation",
            Self::CountryOfMember => "country_of_member",
            Self::Interest => "interest",
            Self::ActionField => "action_field",
            Self::Meeting => "meeting",
        }
    }
}

impl fmt::Display for RowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One flat row per logical (entity, association) pair, as produced by the
/// upstream extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub kind: RowKind,
    #[serde(default)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl RawRow {
    pub fn new(kind: RowKind) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    pub index: usize,
    pub url: String,
}

/// Root listing of a snapshot: the pages that together make it up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub pages: Vec<PageRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {url}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("decoding {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("page {index} is not part of the listing")]
    UnknownPage { index: usize },
    #[error("page {url} is unavailable")]
    PageUnavailable { url: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SnapshotKind;

    /// Fetch the listing of pages. Failure here means no snapshot at all.
    async fn fetch_root(&self, ctx: &AdapterContext) -> Result<Listing, AdapterError>;

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        page: &PageRef,
    ) -> Result<Vec<RawRow>, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub kind: SnapshotKind,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    pub pages: Vec<FixturePage>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePage {
    pub url: String,
    /// Simulates a page that fails to download.
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub rows: Vec<RawRow>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
enum BundleOrigin {
    Path(PathBuf),
    Inline(Arc<FixtureBundle>),
}

/// Serves a snapshot from a JSON fixture bundle. Path-backed sources read the
/// bundle on every call, so a missing file fails the root listing.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    source_id: String,
    kind: SnapshotKind,
    origin: BundleOrigin,
}

impl FixtureSource {
    pub fn from_path(source_id: impl Into<String>, kind: SnapshotKind, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            origin: BundleOrigin::Path(path.into()),
        }
    }

    pub fn from_bundle(bundle: FixtureBundle) -> Self {
        Self {
            source_id: bundle.source_id.clone(),
            kind: bundle.kind,
            origin: BundleOrigin::Inline(Arc::new(bundle)),
        }
    }

    fn bundle(&self) -> Result<Arc<FixtureBundle>> {
        match &self.origin {
            BundleOrigin::Path(path) => load_fixture_bundle(path).map(Arc::new),
            BundleOrigin::Inline(bundle) => Ok(bundle.clone()),
        }
    }
}

#[async_trait]
impl SnapshotSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SnapshotKind {
        self.kind
    }

    async fn fetch_root(&self, _ctx: &AdapterContext) -> Result<Listing, AdapterError> {
        let bundle = self.bundle()?;
        Ok(Listing {
            pages: bundle
                .pages
                .iter()
                .enumerate()
                .map(|(index, page)| PageRef {
                    index,
                    url: page.url.clone(),
                })
                .collect(),
        })
    }

    async fn fetch_page(
        &self,
        _ctx: &AdapterContext,
        page: &PageRef,
    ) -> Result<Vec<RawRow>, AdapterError> {
        let bundle = self.bundle()?;
        let fixture = bundle
            .pages
            .get(page.index)
            .ok_or(AdapterError::UnknownPage { index: page.index })?;
        if fixture.unavailable {
            return Err(AdapterError::PageUnavailable {
                url: fixture.url.clone(),
            });
        }
        Ok(fixture.rows.clone())
    }
}

#[derive(Debug, Deserialize)]
struct RootPayload {
    pages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PagePayload {
    rows: Vec<RawRow>,
}

/// Reads `{"pages": [url, ...]}` from the root URL and `{"rows": [...]}` from
/// each page URL through the shared retrying fetcher. Page URLs must be
/// absolute.
#[derive(Debug, Clone)]
pub struct HttpJsonSource {
    source_id: String,
    kind: SnapshotKind,
    root_url: String,
    http: Arc<HttpFetcher>,
}

impl HttpJsonSource {
    pub fn new(
        source_id: impl Into<String>,
        kind: SnapshotKind,
        root_url: impl Into<String>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            root_url: root_url.into(),
            http,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, ctx: &AdapterContext, url: &str) -> Result<T, AdapterError> {
        let response = self
            .http
            .fetch_bytes(ctx.run_id, &self.source_id, url)
            .await
            .map_err(|source| AdapterError::Fetch {
                url: url.to_string(),
                source,
            })?;
        serde_json::from_slice(&response.body).map_err(|source| AdapterError::Decode {
            url: response.final_url,
            source,
        })
    }
}

#[async_trait]
impl SnapshotSource for HttpJsonSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SnapshotKind {
        self.kind
    }

    async fn fetch_root(&self, ctx: &AdapterContext) -> Result<Listing, AdapterError> {
        let root: RootPayload = self.get_json(ctx, &self.root_url).await?;
        Ok(Listing {
            pages: root
                .pages
                .into_iter()
                .enumerate()
                .map(|(index, url)| PageRef { index, url })
                .collect(),
        })
    }

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        page: &PageRef,
    ) -> Result<Vec<RawRow>, AdapterError> {
        let payload: PagePayload = self.get_json(ctx, &page.url).await?;
        Ok(payload.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobbysync_storage::{FetcherConfig, RetryPolicy};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn fixture_bundle_path(source_id: &str) -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join(source_id)
            .join("sample/bundle.json")
    }

    #[tokio::test]
    async fn fixture_source_lists_and_serves_pages() {
        let source = FixtureSource::from_path(
            "register",
            SnapshotKind::Register,
            fixture_bundle_path("register"),
        );
        let ctx = AdapterContext::new();
        let listing = source.fetch_root(&ctx).await.expect("root");
        assert!(!listing.pages.is_empty());

        let rows = source.fetch_page(&ctx, &listing.pages[0]).await.expect("page");
        assert!(rows.iter().any(|row| row.kind == RowKind::Representative));
    }

    #[tokio::test]
    async fn missing_bundle_fails_the_root_listing() {
        let source = FixtureSource::from_path(
            "register",
            SnapshotKind::Register,
            workspace_root().join("fixtures/register/absent/bundle.json"),
        );
        let err = source.fetch_root(&AdapterContext::new()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Anyhow(_)));
    }

    #[tokio::test]
    async fn unavailable_fixture_pages_fail_individually() {
        let bundle = FixtureBundle {
            fixture_id: "inline".into(),
            source_id: "meetings".into(),
            kind: SnapshotKind::Meetings,
            captured_from_url: "fixture://meetings".into(),
            fetched_at: Utc::now(),
            pages: vec![
                FixturePage {
                    url: "fixture://meetings/0".into(),
                    unavailable: false,
                    rows: vec![RawRow::new(RowKind::Meeting).with("host", "Someone")],
                },
                FixturePage {
                    url: "fixture://meetings/1".into(),
                    unavailable: true,
                    rows: Vec::new(),
                },
            ],
            notes: None,
        };
        let source = FixtureSource::from_bundle(bundle);
        let ctx = AdapterContext::new();
        let listing = source.fetch_root(&ctx).await.expect("root");
        assert_eq!(listing.pages.len(), 2);
        assert_eq!(source.fetch_page(&ctx, &listing.pages[0]).await.unwrap().len(), 1);
        assert!(matches!(
            source.fetch_page(&ctx, &listing.pages[1]).await,
            Err(AdapterError::PageUnavailable { .. })
        ));
        assert!(matches!(
            source
                .fetch_page(&ctx, &PageRef { index: 7, url: String::new() })
                .await,
            Err(AdapterError::UnknownPage { index: 7 })
        ));
    }

    /// Answers every connection with the body registered for the request path.
    async fn serve_json(routes: impl FnOnce(&str) -> Vec<(&'static str, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let routes = routes(&base);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let (status, body) = routes
                    .iter()
                    .find(|(p, _)| *p == path)
                    .map(|(_, body)| ("200 OK", body.clone()))
                    .unwrap_or(("404 Not Found", "{}".to_string()));
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        base
    }

    #[tokio::test]
    async fn http_source_reads_root_and_pages() {
        let base = serve_json(|base| {
            vec![
                (
                    "/root.json",
                    format!(r#"{{"pages": ["{base}/page/0", "{base}/page/1"]}}"#),
                ),
                (
                    "/page/0",
                    r#"{"rows": [{"kind": "interest", "fields": {"identification_code": "123456789-01", "name": "Energy"}}]}"#
                        .to_string(),
                ),
            ]
        })
        .await;

        let http = Arc::new(
            HttpFetcher::new(FetcherConfig {
                timeout: Duration::from_secs(5),
                retry: RetryPolicy {
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                },
                ..FetcherConfig::default()
            })
            .expect("fetcher"),
        );
        let source = HttpJsonSource::new(
            "register-http",
            SnapshotKind::Register,
            format!("{base}/root.json"),
            http,
        );
        let ctx = AdapterContext::new();
        let listing = source.fetch_root(&ctx).await.expect("root");
        assert_eq!(listing.pages.len(), 2);

        let rows = source.fetch_page(&ctx, &listing.pages[0]).await.expect("page 0");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, RowKind::Interest);

        let err = source.fetch_page(&ctx, &listing.pages[1]).await.unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Fetch {
                source: FetchError::HttpStatus { status: 404, .. },
                ..
            }
        ));
    }
}
