//! In-memory `issues` API used as the remote end in integration tests.
//!
//! Besides CRUD on issues it provides what a caching, retrying client needs
//! to be exercised against:
//! - `ETag` and `Cache-Control: max-age` on reads, `304` on a matching
//!   `If-None-Match`.
//! - `GET /unstable/{name}?fail=N&status=S` fails the first `N` hits for
//!   `name` with status `S` (default 503), then succeeds.
//! - `GET /slow/{ms}` answers after a delay.
//! - `GET /private` requires a bearer token.
//! - `GET /_hits` reports how many requests each path received.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{net::TcpListener, sync::RwLock};
use tracing::debug;
use uuid::Uuid;

/// `max-age` advertised on issue reads.
pub const ISSUE_MAX_AGE_SECS: u64 = 60;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    pub id: u64,
    pub title: String,
    pub state: String,
}

#[derive(Deserialize)]
pub struct CreateIssue {
    pub title: String,
}

#[derive(Deserialize)]
pub struct UpdateIssue {
    pub title: Option<String>,
    pub state: Option<String>,
}

#[derive(Deserialize)]
pub struct FaultQuery {
    #[serde(default)]
    pub fail: u32,
    #[serde(default = "default_fault_status")]
    pub status: u16,
}

fn default_fault_status() -> u16 {
    503
}

#[derive(Clone, Debug)]
struct StoredIssue {
    issue: Issue,
    etag: String,
}

#[derive(Default)]
pub struct Db {
    next_id: u64,
    issues: HashMap<u64, StoredIssue>,
    faults: HashMap<String, u32>,
    hits: HashMap<String, u64>,
}

pub type SharedDb = Arc<RwLock<Db>>;

pub fn app() -> Router {
    let db: SharedDb = Arc::new(RwLock::new(Db::default()));
    Router::new()
        .route("/issues", get(list_issues).post(create_issue))
        .route(
            "/issues/{id}",
            get(get_issue)
                .put(update_issue)
                .patch(update_issue)
                .delete(delete_issue),
        )
        .route("/unstable/{name}", get(unstable))
        .route("/slow/{ms}", get(slow))
        .route("/private", get(private))
        .route("/_hits", get(hits))
        .layer(middleware::from_fn_with_state(db.clone(), count_hits))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn count_hits(State(db): State<SharedDb>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    debug!(method = %request.method(), path = %path, "request");
    *db.write().await.hits.entry(path).or_default() += 1;
    next.run(request).await
}

fn new_etag() -> String {
    format!("\"{}\"", Uuid::new_v4().simple())
}

fn if_none_match(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::IF_NONE_MATCH)?.to_str().ok()
}

fn cached_json(etag: &str, body: serde_json::Value) -> Response {
    (
        [
            (header::ETAG, etag.to_string()),
            (
                header::CACHE_CONTROL,
                format!("max-age={ISSUE_MAX_AGE_SECS}"),
            ),
        ],
        Json(body),
    )
        .into_response()
}

fn error(status: StatusCode, field: &str, message: &str) -> Response {
    (status, Json(json!({ field: message }))).into_response()
}

async fn list_issues(State(db): State<SharedDb>) -> Json<Vec<Issue>> {
    let db = db.read().await;
    let mut issues: Vec<Issue> = db.issues.values().map(|s| s.issue.clone()).collect();
    issues.sort_by_key(|i| i.id);
    Json(issues)
}

async fn create_issue(State(db): State<SharedDb>, Json(input): Json<CreateIssue>) -> Response {
    if input.title.trim().is_empty() {
        return error(StatusCode::UNPROCESSABLE_ENTITY, "detail", "title must not be empty");
    }
    let mut db = db.write().await;
    db.next_id += 1;
    let issue = Issue {
        id: db.next_id,
        title: input.title,
        state: "open".to_string(),
    };
    let stored = StoredIssue {
        issue: issue.clone(),
        etag: new_etag(),
    };
    db.issues.insert(issue.id, stored);
    (StatusCode::CREATED, Json(issue)).into_response()
}

async fn get_issue(State(db): State<SharedDb>, Path(id): Path<u64>, headers: HeaderMap) -> Response {
    let db = db.read().await;
    let Some(stored) = db.issues.get(&id) else {
        return error(StatusCode::NOT_FOUND, "error", "no such issue");
    };
    if if_none_match(&headers) == Some(stored.etag.as_str()) {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, stored.etag.clone())]).into_response();
    }
    cached_json(&stored.etag, json!(stored.issue))
}

async fn update_issue(
    State(db): State<SharedDb>,
    Path(id): Path<u64>,
    Json(input): Json<UpdateIssue>,
) -> Response {
    let mut db = db.write().await;
    let Some(stored) = db.issues.get_mut(&id) else {
        return error(StatusCode::NOT_FOUND, "error", "no such issue");
    };
    if let Some(title) = input.title {
        if title.trim().is_empty() {
            return error(StatusCode::UNPROCESSABLE_ENTITY, "detail", "title must not be empty");
        }
        stored.issue.title = title;
    }
    if let Some(state) = input.state {
        stored.issue.state = state;
    }
    stored.etag = new_etag();
    Json(stored.issue.clone()).into_response()
}

async fn delete_issue(State(db): State<SharedDb>, Path(id): Path<u64>) -> Response {
    let mut db = db.write().await;
    match db.issues.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => error(StatusCode::NOT_FOUND, "error", "no such issue"),
    }
}

async fn unstable(
    State(db): State<SharedDb>,
    Path(name): Path<String>,
    Query(fault): Query<FaultQuery>,
) -> Response {
    let mut db = db.write().await;
    let seen = db.faults.entry(name.clone()).or_default();
    *seen += 1;
    if *seen <= fault.fail {
        let status = StatusCode::from_u16(fault.status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        return error(status, "message", &format!("{name} is unavailable"));
    }
    Json(json!({ "name": name, "attempts": *seen })).into_response()
}

async fn slow(Path(ms): Path<u64>) -> Json<serde_json::Value> {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Json(json!({ "sleptMs": ms }))
}

async fn private(headers: HeaderMap) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer "));
    if !authorized {
        return error(StatusCode::UNAUTHORIZED, "error", "unauthorized");
    }
    Json(json!({ "secret": true })).into_response()
}

async fn hits(State(db): State<SharedDb>) -> Json<HashMap<String, u64>> {
    Json(db.read().await.hits.clone())
}
