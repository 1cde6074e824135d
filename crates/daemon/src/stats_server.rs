//! HTTP API for statistics and job control.
//!
//! Read side: `/stats`, `/queue`, `/jobs`, `/jobs/:id`. Write side: manual
//! enqueue and cancel/reprocess requests, which go through the same
//! scheduler operations as everything else.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::intake::{Intake, IntakeError, SubmitOutcome};
use crate::job::{Job, JobState};
use crate::profile::ProfileError;
use crate::scheduler::{AdmissionError, CancelOutcome, JobControlError, QueueStatus, Scheduler};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::store::{JobFilter, StoreError};

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Shared handles for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub intake: Arc<Intake>,
    pub stats: StatsAggregator,
}

/// Request failure, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Intake(#[from] IntakeError),

    #[error(transparent)]
    Control(#[from] JobControlError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Intake(IntakeError::Profile(ProfileError::NotFound(_))) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Intake(IntakeError::NotWatched(_)) => StatusCode::BAD_REQUEST,
            ApiError::Intake(IntakeError::Admission(e))
            | ApiError::Control(JobControlError::Admission(e)) => admission_status(e),
            ApiError::Control(JobControlError::NotCancellable { .. })
            | ApiError::Control(JobControlError::NotReprocessable { .. }) => StatusCode::CONFLICT,
            ApiError::Control(JobControlError::Store(e)) | ApiError::Store(e) => store_status(e),
        }
    }
}

fn admission_status(e: &AdmissionError) -> StatusCode {
    match e {
        AdmissionError::Duplicate { .. } => StatusCode::CONFLICT,
        AdmissionError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AdmissionError::Skipped(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AdmissionError::Store(e) => store_status(e),
    }
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    /// Comma-separated list of states.
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    path: PathBuf,
    profile: String,
    #[serde(default)]
    output: Option<PathBuf>,
    #[serde(default)]
    dry_run: bool,
}

/// Handler for GET /stats
async fn get_stats(State(api): State<ApiState>) -> Result<Json<StatsSnapshot>, ApiError> {
    Ok(Json(api.stats.snapshot()?))
}

/// Handler for GET /queue
async fn get_queue(State(api): State<ApiState>) -> Json<QueueStatus> {
    Json(api.scheduler.queue_status())
}

/// Handler for GET /jobs?state=pending,failed
async fn list_jobs(
    State(api): State<ApiState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let filter = match query.state.as_deref() {
        None | Some("") => JobFilter::all(),
        Some(states) => {
            let states = states
                .split(',')
                .map(str::parse::<JobState>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(ApiError::BadRequest)?;
            JobFilter::states(&states)
        }
    };
    Ok(Json(api.scheduler.store().list(&filter)?))
}

/// Handler for GET /jobs/:id
async fn get_job(
    State(api): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(api.scheduler.store().get(&id)?))
}

/// Handler for POST /jobs
async fn submit_job(
    State(api): State<ApiState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitOutcome>), ApiError> {
    let outcome = api
        .intake
        .submit(&req.path, &req.profile, req.output.as_deref(), req.dry_run)
        .await?;
    let status = match outcome {
        SubmitOutcome::Queued { .. } => StatusCode::CREATED,
        SubmitOutcome::Skipped { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// Handler for POST /jobs/:id/cancel
async fn cancel_job(
    State(api): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<CancelOutcome>, ApiError> {
    Ok(Json(api.scheduler.cancel(&id)?))
}

/// Handler for POST /jobs/:id/reprocess
async fn reprocess_job(
    State(api): State<ApiState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<SubmitOutcome>), ApiError> {
    let job_id = api.scheduler.reprocess(&id)?;
    Ok((StatusCode::CREATED, Json(SubmitOutcome::Queued { job_id })))
}

/// Creates the axum Router with all API endpoints
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/queue", get(get_queue))
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/reprocess", post(reprocess_job))
        .with_state(state)
}

/// Runs the HTTP server on `bind` until `shutdown` fires.
pub async fn run_stats_server(
    bind: &str,
    state: ApiState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Decision;
    use crate::intake::tests::{media, test_intake, TableProber};
    use crate::job::tests::sample_plan;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app_with(prober: TableProber) -> (Router, Arc<Scheduler>) {
        let (intake, store, scheduler) = test_intake(prober, Vec::new());
        let state = ApiState {
            scheduler: Arc::clone(&scheduler),
            intake: Arc::new(intake),
            stats: StatsAggregator::new(store),
        };
        (create_router(state), scheduler)
    }

    async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn enqueue(scheduler: &Scheduler, source: &str) -> String {
        scheduler
            .enqueue(
                std::path::Path::new(source),
                Decision::Transcode(sample_plan(source)),
                false,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_stats_empty() {
        let (app, _) = app_with(TableProber::default());
        let (status, body) = send(app, Method::GET, "/stats", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["completed"], 0);
        assert_eq!(body["space_saved_percent"], 0.0);
    }

    #[tokio::test]
    async fn test_stats_after_completion() {
        let (app, scheduler) = app_with(TableProber::default());
        let id = enqueue(&scheduler, "/m/a.mkv");
        scheduler.try_next(0).unwrap().unwrap();
        scheduler.complete(&id, Some(100), Some(60), false).unwrap();

        let (_, body) = send(app, Method::GET, "/stats", None).await;
        assert_eq!(body["completed"], 1);
        assert_eq!(body["bytes_saved"], 40);
        assert_eq!(body["space_saved_percent"], 40.0);
        assert_eq!(body["codecs"]["h264"]["completed"], 1);
        assert_eq!(body["top_space_savers"][0]["job_id"], id.as_str());
        assert_eq!(body["top_space_savers"][0]["bytes_saved"], 40);
    }

    #[tokio::test]
    async fn test_queue_status() {
        let (app, scheduler) = app_with(TableProber::default());
        enqueue(&scheduler, "/m/a.mkv");
        enqueue(&scheduler, "/m/b.mkv");

        let (status, body) = send(app, Method::GET, "/queue", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pending"], 2);
        assert_eq!(body["running"], 0);
        assert_eq!(body["capacity"], 64);
    }

    #[tokio::test]
    async fn test_list_jobs_by_state() {
        let (app, scheduler) = app_with(TableProber::default());
        let a = enqueue(&scheduler, "/m/a.mkv");
        enqueue(&scheduler, "/m/b.mkv");
        scheduler.cancel(&a).unwrap();

        let (status, body) = send(app.clone(), Method::GET, "/jobs?state=cancelled", None).await;
        assert_eq!(status, StatusCode::OK);
        let jobs = body.as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["id"], a.as_str());

        let (_, body) = send(app.clone(), Method::GET, "/jobs", None).await;
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, _) = send(app, Method::GET, "/jobs?state=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_unknown_job() {
        let (app, _) = app_with(TableProber::default());
        let (status, body) = send(app, Method::GET, "/jobs/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_submit_and_duplicate() {
        let prober = TableProber::default().with("/m/a.mkv", media("hevc", "opus", "matroska"));
        let (app, _) = app_with(prober);
        let request = json!({ "path": "/m/a.mkv", "profile": "balanced", "dry_run": true });

        let (status, body) = send(app.clone(), Method::POST, "/jobs", Some(request.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "queued");
        let id = body["job_id"].as_str().unwrap().to_string();

        let (status, body) = send(app.clone(), Method::GET, &format!("/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dry_run"], true);
        assert_eq!(body["state"], "pending");

        let (status, _) = send(app, Method::POST, "/jobs", Some(request)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_submit_unknown_profile() {
        let (app, _) = app_with(TableProber::default());
        let request = json!({ "path": "/m/a.mkv", "profile": "nope" });
        let (status, _) = send(app, Method::POST, "/jobs", Some(request)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_submit_skipped() {
        let prober = TableProber::default().with("/m/a.mp4", media("h264", "aac", "mov,mp4,m4a"));
        let (app, _) = app_with(prober);
        let request = json!({ "path": "/m/a.mp4", "profile": "balanced" });
        let (status, body) = send(app, Method::POST, "/jobs", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "skipped");
        assert_eq!(body["reason"], "already matches target");
    }

    #[tokio::test]
    async fn test_cancel_and_reprocess() {
        let (app, scheduler) = app_with(TableProber::default());
        let id = enqueue(&scheduler, "/m/a.mkv");

        let (status, body) =
            send(app.clone(), Method::POST, &format!("/jobs/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("cancelled"));

        // Already terminal
        let (status, _) =
            send(app.clone(), Method::POST, &format!("/jobs/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) =
            send(app.clone(), Method::POST, &format!("/jobs/{}/reprocess", id), None).await;
        assert_eq!(status, StatusCode::CREATED);
        let fresh = body["job_id"].as_str().unwrap();
        assert_ne!(fresh, id);

        // A pending job cannot be reprocessed
        let (status, _) =
            send(app, Method::POST, &format!("/jobs/{}/reprocess", fresh), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_cancel_running_job_is_requested() {
        let (app, scheduler) = app_with(TableProber::default());
        let id = enqueue(&scheduler, "/m/a.mkv");
        let claimed = scheduler.try_next(0).unwrap().unwrap();

        let (status, body) = send(app, Method::POST, &format!("/jobs/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("requested"));
        assert!(claimed.cancel.is_cancelled());
        assert_eq!(
            scheduler.store().get(&id).unwrap().state,
            JobState::Running
        );
    }

    #[tokio::test]
    async fn test_reprocess_unknown_job() {
        let (app, _) = app_with(TableProber::default());
        let (status, _) = send(app, Method::POST, "/jobs/missing/reprocess", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_status_mapping() {
        let full = ApiError::Intake(IntakeError::Admission(AdmissionError::QueueFull {
            capacity: 1,
        }));
        assert_eq!(full.status(), StatusCode::SERVICE_UNAVAILABLE);

        let conflict = ApiError::Store(StoreError::Conflict {
            id: "x".to_string(),
            expected: JobState::Pending,
            actual: JobState::Running,
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
    }
}
