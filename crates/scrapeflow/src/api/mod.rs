use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderName, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::models::{
    EnrichJobRequest, ErrorBody, JobDataResponse, JobListItem, JobListResponse, JobLogsResponse,
    JobStatusResponse, ListJobsQuery, SubmitJobRequest, SubmitJobResponse,
};
use crate::jobs::model::{Job, JobStatus, NewJob, OutputFormat};
use crate::jobs::queue::{JobQueue, QueueStats};
use crate::jobs::store::{JobStore, ListFilter, DEFAULT_LIST_LIMIT};
use crate::scrape::adapter::AdapterRegistry;
use crate::scrape::export::ResultWriter;

pub mod models;

pub const MAX_LIST_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn JobStore>,
    pub queue: JobQueue,
    pub adapters: AdapterRegistry,
    pub results: ResultWriter,
    pub default_headless: bool,
    /// Accepted `X-API-Key` values. Empty disables the check.
    pub api_keys: Arc<Vec<String>>,
}

pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        // Submission
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/scrape", post(submit_job))
        .route("/enrich", post(submit_enrich))
        // Status
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/logs", get(get_job_logs))
        .route("/jobs/:id/data", get(get_job_data))
        .route("/queue/stats", get(queue_stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .merge(protected)
        // Health stays open for probes.
        .route("/health", get(health))
        .with_state(state)
}

const API_KEY_HEADER: &str = "x-api-key";

async fn require_api_key(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    if state.api_keys.is_empty() {
        return next.run(req).await;
    }

    let rejection = match req.headers().get(API_KEY_HEADER).map(|v| v.to_str()) {
        None => Some("API key is required"),
        Some(Ok(key)) if state.api_keys.iter().any(|k| k == key) => None,
        Some(_) => Some("Invalid API key"),
    };
    let Some(message) = rejection else {
        return next.run(req).await;
    };

    tracing::warn!(path = %req.uri().path(), message, "rejected api request");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized", "message": message })),
    )
        .into_response()
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn internal_err(e: anyhow::Error) -> ApiError {
    tracing::error!(error = %e, "api request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody::new(format!("internal error: {e}"))),
    )
}

fn bad_request(error: &str, details: Vec<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody::with_details(error, details)),
    )
}

fn not_found(error: &str) -> ApiError {
    (StatusCode::NOT_FOUND, Json(ErrorBody::new(error)))
}

/// Progress is polled; a cached read is a stale read.
fn no_cache() -> [(HeaderName, &'static str); 3] {
    [
        (
            header::CACHE_CONTROL,
            "no-store, no-cache, must-revalidate, proxy-revalidate",
        ),
        (header::PRAGMA, "no-cache"),
        (header::EXPIRES, "0"),
    ]
}

async fn create_and_enqueue(
    state: &ApiState,
    new_job: NewJob,
) -> Result<Job, ApiError> {
    let job = state.store.create_job(new_job).await.map_err(internal_err)?;

    if !state.queue.enqueue(job.to_queue_job()) {
        tracing::debug!(job_id = %job.id, "job already known to the queue");
    }
    tracing::info!(
        job_id = %job.id,
        site = %job.site,
        job_type = job.job_type.as_str(),
        "job submitted"
    );
    Ok(job)
}

pub async fn submit_job(
    State(state): State<ApiState>,
    body: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let Json(req) = body.map_err(|e| bad_request("Validation failed", vec![e.body_text()]))?;

    let new_job = req
        .validate(&state.adapters, state.default_headless)
        .map_err(|errors| bad_request("Validation failed", errors))?;

    let job = create_and_enqueue(&state, new_job).await?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            job_id: job.id,
            status: job.status,
            created_at: job.created_at,
            message: "Job queued successfully".to_string(),
        }),
    ))
}

pub async fn submit_enrich(
    State(state): State<ApiState>,
    body: Result<Json<EnrichJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let Json(req) = body.map_err(|e| bad_request("Invalid request", vec![e.body_text()]))?;
    let count = req.item_urls.len();

    let new_job = req
        .validate(&state.adapters, state.default_headless)
        .map_err(|errors| bad_request("Invalid request", errors))?;

    let job = create_and_enqueue(&state, new_job).await?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            job_id: job.id,
            status: job.status,
            created_at: job.created_at,
            message: format!("Enrichment job queued for {count} items"),
        }),
    ))
}

pub async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state
        .store
        .get_job(id)
        .await
        .map_err(internal_err)?
        .ok_or_else(|| not_found("Job not found"))?;

    Ok((no_cache(), Json(JobStatusResponse::from(job))).into_response())
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Response, ApiError> {
    let status = match q.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            raw.parse::<JobStatus>()
                .map_err(|e| bad_request("Invalid request", vec![e.to_string()]))?,
        ),
        None => None,
    };

    let limit = q.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let offset = q.offset.unwrap_or(0).max(0);

    let jobs = state
        .store
        .list_jobs(&ListFilter {
            status,
            site: q.site.filter(|s| !s.is_empty()),
            limit,
            offset,
            oldest_first: false,
        })
        .await
        .map_err(internal_err)?;

    let body = JobListResponse {
        total: jobs.len(),
        jobs: jobs.into_iter().map(JobListItem::from).collect(),
        limit,
        offset,
    };
    Ok((no_cache(), Json(body)).into_response())
}

pub async fn get_job_logs(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobLogsResponse>, ApiError> {
    if state.store.get_job(id).await.map_err(internal_err)?.is_none() {
        return Err(not_found("Job not found"));
    }

    let logs = state.store.list_logs(id).await.map_err(internal_err)?;
    let screenshots = state.store.list_screenshots(id).await.map_err(internal_err)?;

    Ok(Json(JobLogsResponse {
        job_id: id,
        logs,
        screenshots,
    }))
}

pub async fn get_job_data(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobDataResponse>, ApiError> {
    let job = state
        .store
        .get_job(id)
        .await
        .map_err(internal_err)?
        .ok_or_else(|| not_found("Job not found"))?;

    if job.status != JobStatus::Completed {
        return Err(bad_request(
            "Job not completed yet",
            vec![format!("status is {}", job.status)],
        ));
    }

    let path = state.results.path_for(id, OutputFormat::Json);
    let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
        tracing::warn!(job_id = %id, path = %path.display(), error = %e, "result file unreadable");
        not_found("Result file not found or cannot be read")
    })?;
    let data: Value = serde_json::from_str(&raw).map_err(|e| internal_err(e.into()))?;

    Ok(Json(JobDataResponse {
        job_id: id,
        format: job.format,
        items_count: job.items_extracted,
        data,
    }))
}

pub async fn queue_stats(State(state): State<ApiState>) -> Json<QueueStats> {
    Json(state.queue.stats())
}

pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "timestamp": Utc::now() })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory::MemoryJobStore;
    use crate::jobs::model::JobPatch;
    use crate::jobs::queue::QueueConfig;
    use crate::jobs::runner::{JobExecutor, JobRunner};
    use crate::scrape::fakes::FakeAdapter;
    use crate::scrape::item::ScrapedItem;
    use crate::scrape::worker::{ScrapeError, WorkerResult};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct IdleExecutor;

    #[async_trait]
    impl JobExecutor for IdleExecutor {
        async fn execute(
            &self,
            _job: &crate::jobs::model::QueueJob,
        ) -> Result<WorkerResult, ScrapeError> {
            Err(ScrapeError::Panicked("not started in api tests".into()))
        }
    }

    struct Harness {
        app: Router,
        state: ApiState,
        store: Arc<MemoryJobStore>,
        queue: JobQueue,
        results: ResultWriter,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let runner = JobRunner::new(store.clone(), Arc::new(IdleExecutor));
        let queue = JobQueue::new(QueueConfig::default(), store.clone(), runner);
        let results = ResultWriter::new(dir.path());

        let state = ApiState {
            store: store.clone(),
            queue: queue.clone(),
            adapters: AdapterRegistry::new().with("theknot", Arc::new(FakeAdapter::new(1, 1))),
            results: results.clone(),
            default_headless: true,
            api_keys: Arc::new(Vec::new()),
        };

        Harness {
            app: router(state.clone()),
            state,
            store,
            queue,
            results,
            _dir: dir,
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn submit_creates_and_enqueues() {
        let h = harness();
        let (status, _, body) = send(
            &h.app,
            post(
                "/jobs",
                json!({"site": "theknot", "parameters": {"maxPages": 3}, "format": "json"}),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["status"], "queued");
        let id: Uuid = serde_json::from_value(body["job_id"].clone()).unwrap();

        let job = h.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.headless);
        assert_eq!(h.queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn scrape_alias_and_validation_errors() {
        let h = harness();
        let (status, _, body) = send(
            &h.app,
            post("/scrape", json!({"site": "theknot", "parameters": {}, "format": "xml"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Validation failed");
        assert_eq!(body["details"].as_array().unwrap().len(), 1);
        assert_eq!(h.queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let h = harness();
        let req = Request::builder()
            .method("POST")
            .uri("/jobs")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _, body) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["details"].is_array());
    }

    #[tokio::test]
    async fn enrich_route_stores_canonical_parameters() {
        let h = harness();
        let (status, _, body) = send(
            &h.app,
            post(
                "/enrich",
                json!({
                    "site": "theknot",
                    "venueUrls": ["https://a", "https://b"],
                    "format": "csv"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["message"], "Enrichment job queued for 2 items");

        let id: Uuid = serde_json::from_value(body["job_id"].clone()).unwrap();
        let job = h.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.parameters["item_urls"], json!(["https://a", "https://b"]));

        let (status, _, _) = send(
            &h.app,
            post("/enrich", json!({"site": "theknot", "item_urls": [], "format": "csv"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_read_disables_caching() {
        let h = harness();
        let job = h
            .store
            .create_job(NewJob {
                site: "theknot".into(),
                job_type: crate::jobs::model::JobType::Scrape,
                parameters: json!({}),
                format: OutputFormat::Json,
                headless: true,
                webhook_url: None,
            })
            .await
            .unwrap();
        h.store
            .update_job_status(job.id, JobStatus::Running, JobPatch::progress(Some(2), 20))
            .await
            .unwrap();

        let (status, headers, body) = send(&h.app, get(&format!("/jobs/{}", job.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers[header::CACHE_CONTROL],
            "no-store, no-cache, must-revalidate, proxy-revalidate"
        );
        assert_eq!(headers[header::PRAGMA], "no-cache");
        assert_eq!(headers[header::EXPIRES], "0");
        assert_eq!(body["status"], "running");
        assert_eq!(body["progress"]["pages_scraped"], 2);
        assert_eq!(body["progress"]["items_extracted"], 20);
        assert!(body.get("error_message").is_none());

        let (status, _, _) = send(&h.app, get(&format!("/jobs/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_clamps_limit_and_filters() {
        let h = harness();
        for _ in 0..3 {
            send(
                &h.app,
                post("/jobs", json!({"site": "theknot", "parameters": {}, "format": "json"})),
            )
            .await;
        }

        let (status, headers, body) = send(&h.app, get("/jobs?limit=500&status=queued")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::PRAGMA], "no-cache");
        assert_eq!(body["limit"], MAX_LIST_LIMIT);
        assert_eq!(body["total"], 3);

        let (_, _, body) = send(&h.app, get("/jobs?status=failed")).await;
        assert_eq!(body["total"], 0);

        let (status, _, _) = send(&h.app, get("/jobs?status=bogus")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn data_is_served_only_for_completed_jobs() {
        let h = harness();
        let job = h
            .store
            .create_job(NewJob {
                site: "theknot".into(),
                job_type: crate::jobs::model::JobType::Scrape,
                parameters: json!({}),
                format: OutputFormat::Csv,
                headless: true,
                webhook_url: None,
            })
            .await
            .unwrap();

        let (status, _, _) = send(&h.app, get(&format!("/jobs/{}/data", job.id))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let items = vec![ScrapedItem::new().with("name", "Hall")];
        h.results
            .write_both(job.id, &items, OutputFormat::Csv)
            .await
            .unwrap();
        h.store
            .update_job_status(
                job.id,
                JobStatus::Completed,
                JobPatch::progress(Some(1), 1),
            )
            .await
            .unwrap();

        let (status, _, body) = send(&h.app, get(&format!("/jobs/{}/data", job.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["format"], "csv");
        assert_eq!(body["items_count"], 1);
        assert_eq!(body["data"][0]["name"], "Hall");
    }

    #[tokio::test]
    async fn logs_stats_and_health() {
        let h = harness();
        let (_, _, body) = send(
            &h.app,
            post("/jobs", json!({"site": "theknot", "parameters": {}, "format": "json"})),
        )
        .await;
        let id: Uuid = serde_json::from_value(body["job_id"].clone()).unwrap();
        h.store
            .append_log(id, crate::jobs::model::LogLevel::Info, "hello")
            .await
            .unwrap();

        let (status, _, body) = send(&h.app, get(&format!("/jobs/{id}/logs"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logs"][0]["message"], "hello");

        let (_, _, body) = send(&h.app, get("/queue/stats")).await;
        assert_eq!(body["queued"], 1);
        assert_eq!(body["started"], false);

        let (status, _, body) = send(&h.app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn configured_api_keys_guard_everything_but_health() {
        let h = harness();
        let app = router(ApiState {
            api_keys: Arc::new(vec!["k1".to_string(), "k2".to_string()]),
            ..h.state.clone()
        });

        let (status, _, body) = send(&app, get("/queue/stats")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");
        assert_eq!(body["message"], "API key is required");

        let req = Request::builder()
            .uri("/jobs")
            .header("x-api-key", "nope")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid API key");

        let mut req = post(
            "/jobs",
            json!({"site": "theknot", "parameters": {}, "format": "json"}),
        );
        req.headers_mut()
            .insert("x-api-key", axum::http::HeaderValue::from_static("k2"));
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");

        let (status, _, _) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
    }
}
