//! Read-only JSON query layer over the synchronized store.
//!
//! Shallow projections carry an entity's scalar fields plus resolved
//! reference names; deep projections add the nested collections.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use lobbysync_core::{
    ActionField, CountryMembership, EntityData, EntityKind, FinancialPeriod, Interest, Meeting,
    MeetingParticipant, NaturalKey, OrganisationMembership, PersonRole, Representative, Status,
    Turnover, UnmatchedParty,
};
use lobbysync_storage::{Persisted, StateFile, Store, Stored};
use lobbysync_sync::{load_run_summaries, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lobbysync-web";

/// Reference tables from `references.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct References {
    #[serde(default)]
    pub countries: BTreeMap<String, String>,
}

impl References {
    /// A missing file yields empty tables.
    pub fn load(workspace_root: &Path) -> anyhow::Result<Self> {
        let path = workspace_root.join("references.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let yaml = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn country_name(&self, code: &str) -> Option<&str> {
        self.countries
            .get(&code.trim().to_ascii_uppercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

/// State file written by another process. The store is reloaded from it
/// whenever its modification time or size moves.
struct FollowedFile {
    file: StateFile,
    stamp: Mutex<Option<FileStamp>>,
}

async fn file_stamp(path: &Path) -> anyhow::Result<Option<FileStamp>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(FileStamp {
            modified: meta
                .modified()
                .with_context(|| format!("reading mtime of {}", path.display()))?,
            len: meta.len(),
        })),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("inspecting {}", path.display())),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RwLock<Store>>,
    pub references: Arc<References>,
    pub reports_dir: PathBuf,
    followed: Option<Arc<FollowedFile>>,
}

impl AppState {
    pub fn new(store: Arc<RwLock<Store>>, references: References, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            references: Arc::new(references),
            reports_dir: reports_dir.into(),
            followed: None,
        }
    }

    /// Serve a store shared with an in-process runner.
    pub fn from_config(config: &SyncConfig, store: Arc<RwLock<Store>>) -> anyhow::Result<Self> {
        let references = References::load(&config.workspace_root)?;
        Ok(Self::new(store, references, config.reports_dir.clone()))
    }

    /// Serve the state file at `config.state_path`, picking up saves made by
    /// other processes before answering each request.
    pub async fn following_state_file(config: &SyncConfig) -> anyhow::Result<Self> {
        let file = StateFile::new(config.state_path.clone());
        let stamp = file_stamp(file.path()).await?;
        let store = file.load().await?;
        let mut state = Self::from_config(config, Arc::new(RwLock::new(store)))?;
        state.followed = Some(Arc::new(FollowedFile {
            file,
            stamp: Mutex::new(stamp),
        }));
        Ok(state)
    }

    /// Reload the store if the followed state file changed on disk.
    pub async fn refresh(&self) -> anyhow::Result<bool> {
        let Some(followed) = &self.followed else {
            return Ok(false);
        };
        let mut stamp = followed.stamp.lock().await;
        let current = file_stamp(followed.file.path()).await?;
        if current.is_none() || current == *stamp {
            return Ok(false);
        }
        let store = followed.file.load().await?;
        *self.store.write().await = store;
        *stamp = current;
        info!(path = %followed.file.path().display(), "state file changed, store reloaded");
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    #[default]
    Shallow,
    Deep,
}

#[derive(Debug, Default, Deserialize)]
struct DetailQuery {
    #[serde(default)]
    depth: Depth,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    status: Option<Status>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Page {
    page: usize,
    per_page: usize,
    total: usize,
    total_pages: usize,
    items: Vec<Value>,
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/", get(index_handler))
        .route("/representatives", get(representatives_handler))
        .route("/representatives/{code}", get(representative_detail_handler))
        .route("/meetings", get(meetings_handler))
        .route("/meetings/{key}", get(meeting_detail_handler))
        .route("/audit/{kind}/{id}", get(audit_handler))
        .route("/unmatched", get(unmatched_handler))
        .route("/reports", get(reports_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), reload_state))
        .with_state(state)
}

async fn reload_state(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Err(err) = state.refresh().await {
        warn!(error = %format!("{err:#}"), "state file reload failed");
        return server_error(err);
    }
    next.run(request).await
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "query api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let state = AppState::following_state_file(&config).await?;
    serve(state, config.web_port).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = state.store.read().await;
    let counts = json!({
        "representatives": kind_counts::<Representative>(&store),
        "meetings": kind_counts::<Meeting>(&store),
        "meeting_participants": kind_counts::<MeetingParticipant>(&store),
        "unmatched_parties": kind_counts::<UnmatchedParty>(&store),
    });
    Json(json!({
        "service": CRATE_NAME,
        "counts": counts,
        "audit_records": store.state().audit.len(),
    }))
    .into_response()
}

async fn representatives_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let store = state.store.read().await;
    let mut rows = store
        .table::<Representative>()
        .live()
        .filter(|row| query.status.map_or(true, |status| row.data.status == status))
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| a.data.identification_code.cmp(&b.data.identification_code));

    let page = paginate(rows, &query, |row| {
        representative_projection(&store, &state.references, row, Depth::Shallow)
    });
    match page {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err),
    }
}

async fn representative_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(code): AxumPath<String>,
    Query(query): Query<DetailQuery>,
) -> Response {
    let store = state.store.read().await;
    let Some(row) = store.find_live::<Representative>(&NaturalKey::registration(code.trim())) else {
        return not_found(format!("representative {code} not found"));
    };
    match representative_projection(&store, &state.references, row, query.depth) {
        Ok(value) => Json(value).into_response(),
        Err(err) => server_error(err),
    }
}

async fn meetings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let store = state.store.read().await;
    let mut rows = store
        .table::<Meeting>()
        .live()
        .filter(|row| query.status.map_or(true, |status| row.data.status == status))
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        b.data
            .details
            .date
            .cmp(&a.data.details.date)
            .then_with(|| a.data.meeting_key.cmp(&b.data.meeting_key))
    });

    let page = paginate(rows, &query, |row| meeting_projection(&store, row, Depth::Shallow));
    match page {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err),
    }
}

async fn meeting_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(key): AxumPath<String>,
    Query(query): Query<DetailQuery>,
) -> Response {
    let store = state.store.read().await;
    let Some(row) = store.find_live::<Meeting>(&NaturalKey::new(key.as_str())) else {
        return not_found(format!("meeting {key} not found"));
    };
    match meeting_projection(&store, row, query.depth) {
        Ok(value) => Json(value).into_response(),
        Err(err) => server_error(err),
    }
}

async fn audit_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((kind, id)): AxumPath<(String, String)>,
) -> Response {
    let Some(kind) = EntityKind::parse(&kind) else {
        return bad_request(format!("unknown entity kind {kind:?}"));
    };
    let Ok(id) = Uuid::parse_str(&id) else {
        return bad_request(format!("invalid entity id {id:?}"));
    };
    let store = state.store.read().await;
    let trail = store.trail(kind, id);
    if trail.is_empty() {
        return not_found(format!("no audit records for {kind} {id}"));
    }
    Json(trail).into_response()
}

async fn unmatched_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let store = state.store.read().await;
    let mut rows = store
        .table::<UnmatchedParty>()
        .live()
        .filter(|row| query.status.map_or(true, |status| row.data.status == status))
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        a.data
            .owning_id
            .cmp(&b.data.owning_id)
            .then_with(|| a.data.claimed_key.cmp(&b.data.claimed_key))
    });

    match paginate(rows, &query, unmatched_projection) {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err),
    }
}

async fn reports_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_run_summaries(&state.reports_dir, 20) {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

fn kind_counts<T: Persisted>(store: &Store) -> Value {
    let mut counts = BTreeMap::<&'static str, usize>::new();
    for row in store.table::<T>().live() {
        let status = match row.data.status() {
            Status::Active => "active",
            Status::Inactive => "inactive",
            Status::Resolved => "resolved",
        };
        *counts.entry(status).or_default() += 1;
        *counts.entry("live").or_default() += 1;
    }
    json!(counts)
}

fn paginate<T>(
    rows: Vec<T>,
    query: &ListQuery,
    project: impl Fn(T) -> anyhow::Result<Value>,
) -> anyhow::Result<Page> {
    let per_page = query.per_page.unwrap_or(50).clamp(1, 500);
    let total = rows.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let items = rows
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(project)
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Page {
        page,
        per_page,
        total,
        total_pages,
        items,
    })
}

/// Entity values with storage id and revision timestamps folded in.
fn stored_object<T: Serialize>(row: &Stored<T>) -> anyhow::Result<Map<String, Value>> {
    let Value::Object(mut object) = serde_json::to_value(&row.data)? else {
        anyhow::bail!("entity {} did not serialize to an object", row.id);
    };
    object.insert("id".into(), json!(row.id));
    object.insert("created_at".into(), json!(row.created_at));
    object.insert("updated_at".into(), json!(row.updated_at));
    Ok(object)
}

fn sorted_children<'a, T: Persisted>(store: &'a Store, parent: &NaturalKey) -> Vec<&'a Stored<T>> {
    let mut rows = store.table::<T>().children_of(parent);
    rows.sort_by_key(|row| row.data.natural_key());
    rows
}

fn child_objects<T: Persisted>(store: &Store, parent: &NaturalKey) -> anyhow::Result<Vec<Value>> {
    sorted_children::<T>(store, parent)
        .into_iter()
        .map(|row| stored_object(row).map(Value::Object))
        .collect()
}

fn representative_projection(
    store: &Store,
    references: &References,
    row: &Stored<Representative>,
    depth: Depth,
) -> anyhow::Result<Value> {
    let mut object = stored_object(row)?;
    let country_name = row
        .data
        .profile
        .contact_country
        .as_deref()
        .and_then(|code| references.country_name(code));
    object.insert("contact_country_name".into(), json!(country_name));
    if depth == Depth::Shallow {
        return Ok(Value::Object(object));
    }

    let key = row.data.natural_key();
    let mut periods = Vec::new();
    for period in sorted_children::<FinancialPeriod>(store, &key) {
        let mut value = stored_object(period)?;
        value.insert(
            "turnovers".into(),
            json!(child_objects::<Turnover>(store, &period.data.natural_key())?),
        );
        periods.push(Value::Object(value));
    }

    let mut countries = Vec::new();
    for country in sorted_children::<CountryMembership>(store, &key) {
        let mut value = stored_object(country)?;
        value.insert(
            "country_name".into(),
            json!(references.country_name(&country.data.country_code)),
        );
        countries.push(Value::Object(value));
    }

    let mut meetings = store
        .table::<MeetingParticipant>()
        .live()
        .filter(|link| link.data.representative_id == row.id)
        .filter_map(|link| store.find_live::<Meeting>(&link.data.meeting_key))
        .map(|meeting| {
            json!({
                "meeting_key": meeting.data.meeting_key,
                "date": meeting.data.details.date,
                "host": meeting.data.details.host,
                "subject": meeting.data.details.subject,
                "status": meeting.data.status,
            })
        })
        .collect::<Vec<_>>();
    meetings.sort_by(|a, b| a["meeting_key"].as_str().cmp(&b["meeting_key"].as_str()));

    object.insert("persons".into(), json!(child_objects::<PersonRole>(store, &key)?));
    object.insert("financial_periods".into(), json!(periods));
    object.insert(
        "organisations".into(),
        json!(child_objects::<OrganisationMembership>(store, &key)?),
    );
    object.insert("countries".into(), json!(countries));
    object.insert("interests".into(), json!(child_objects::<Interest>(store, &key)?));
    object.insert("action_fields".into(), json!(child_objects::<ActionField>(store, &key)?));
    object.insert("meetings".into(), json!(meetings));
    Ok(Value::Object(object))
}

fn meeting_projection(store: &Store, row: &Stored<Meeting>, depth: Depth) -> anyhow::Result<Value> {
    let mut object = stored_object(row)?;
    if depth == Depth::Shallow {
        return Ok(Value::Object(object));
    }

    let participants = sorted_children::<MeetingParticipant>(store, &row.data.meeting_key)
        .into_iter()
        .map(|link| {
            let name = store
                .table::<Representative>()
                .get(link.data.representative_id)
                .map(|rep| rep.data.profile.name.clone());
            let mut value = stored_object(link)?;
            value.insert("name".into(), json!(name));
            Ok(Value::Object(value))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut unmatched = store
        .table::<UnmatchedParty>()
        .live()
        .filter(|ledger| ledger.data.owning_kind == EntityKind::Meeting && ledger.data.owning_id == row.id)
        .collect::<Vec<_>>();
    unmatched.sort_by(|a, b| a.data.claimed_key.cmp(&b.data.claimed_key));
    let unmatched = unmatched
        .into_iter()
        .map(unmatched_projection)
        .collect::<anyhow::Result<Vec<_>>>()?;

    object.insert("participants".into(), json!(participants));
    object.insert("unmatched".into(), json!(unmatched));
    Ok(Value::Object(object))
}

fn unmatched_projection(row: &Stored<UnmatchedParty>) -> anyhow::Result<Value> {
    let mut object = stored_object(row)?;
    object.insert("names".into(), json!(row.data.observed_names()));
    Ok(Value::Object(object))
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
