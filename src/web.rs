use crate::{
    app::App,
    errors::PipelineError,
    jobs::{Job, JobId, JobRecord, JobRunner, JobStatus},
    search::{SearchEngine, SearchHit, SearchRequest},
};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
pub struct SharedState {
    search: Arc<SearchEngine>,
    jobs: Arc<JobRunner>,
    default_batch_size: usize,
}

impl SharedState {
    pub fn new(app: &App) -> Self {
        Self {
            search: app.search.clone(),
            jobs: app.jobs.clone(),
            default_batch_size: app.config.default_batch_size,
        }
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/search", post(search))
        .route("/process-folder", post(process_folder))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/cancel", post(cancel_job))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(Arc::new(state))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {e}");
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutting down");
}

pub async fn start_daemon(app: App, listen: &str) -> anyhow::Result<()> {
    let router = router(SharedState::new(&app));

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("listening on {listen}");
    log::info!("remote images cached under {}", app.cache.root().display());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[derive(Debug)]
pub enum HttpError {
    Pipeline(PipelineError),
    UnknownJob(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            HttpError::UnknownJob(id) => (
                axum::http::StatusCode::NOT_FOUND,
                format!("job {id} not found"),
            ),
            HttpError::Pipeline(PipelineError::NotFound(_)) => {
                (axum::http::StatusCode::NOT_FOUND, self.to_string())
            }
            HttpError::Pipeline(PipelineError::InvalidReference(_)) => {
                (axum::http::StatusCode::BAD_REQUEST, self.to_string())
            }
            HttpError::Pipeline(_) => {
                log::error!("{self:?}");
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    self.to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::Pipeline(e) => write!(f, "{e}"),
            HttpError::UnknownJob(id) => write!(f, "job {id} not found"),
        }
    }
}

impl<E> From<E> for HttpError
where
    E: Into<PipelineError>,
{
    fn from(err: E) -> Self {
        Self::Pipeline(err.into())
    }
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<Vec<SearchHit>>, HttpError> {
    log::debug!("payload: {payload:?}");
    let hits = state.search.search_request(&payload).await?;
    Ok(Json(hits))
}

#[derive(Debug, Deserialize)]
pub struct ProcessFolderRequest {
    pub folder_path: String,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ProcessFolderResponse {
    pub status: String,
    pub job_id: String,
}

async fn process_folder(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ProcessFolderRequest>,
) -> Result<Json<ProcessFolderResponse>, HttpError> {
    let job = Job::IndexFolder {
        folder: payload.folder_path,
        batch_size: payload.batch_size.unwrap_or(state.default_batch_size),
    };
    let id = state.jobs.submit(job)?;

    Ok(Json(ProcessFolderResponse {
        status: "Processing started".to_string(),
        job_id: id.to_string(),
    }))
}

async fn list_jobs(State(state): State<Arc<SharedState>>) -> Json<Vec<JobRecord>> {
    Json(state.jobs.list())
}

async fn job_status(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, HttpError> {
    state
        .jobs
        .status(&JobId::from(id.as_str()))
        .map(Json)
        .ok_or(HttpError::UnknownJob(id))
}

async fn cancel_job(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, HttpError> {
    state
        .jobs
        .cancel(&JobId::from(id.as_str()))
        .map(Json)
        .ok_or(HttpError::UnknownJob(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::create_app;
    use crate::tests::fakes::touch_all;
    use axum::http::StatusCode;

    fn state(app: &App) -> State<Arc<SharedState>> {
        State(Arc::new(SharedState::new(app)))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_process_folder_then_search() {
        let t = create_app().await;
        touch_all(&t.data(), &["harbour.jpg", "forest.jpg"]);

        let Json(started) = process_folder(
            state(&t.app),
            Json(ProcessFolderRequest {
                folder_path: t.data().to_string_lossy().to_string(),
                batch_size: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(started.status, "Processing started");

        let mut finished = None;
        for _ in 0..200 {
            let Json(record) = job_status(state(&t.app), Path(started.job_id.clone()))
                .await
                .unwrap();
            if record.status.is_finished() {
                finished = Some(record.status);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(matches!(finished, Some(JobStatus::Done { .. })));

        let Json(jobs) = list_jobs(state(&t.app)).await;
        assert_eq!(jobs.len(), 1);

        let request: SearchRequest =
            serde_json::from_value(json!({"query": "harbour", "top_k": 1})).unwrap();
        let Json(hits) = search(state(&t.app), Json(request)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].display_url, "data/harbour.jpg");
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let t = create_app().await;

        let err = job_status(state(&t.app), Path("01HZZZZZZZZZZZZZZZZZZZZZZZ".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = cancel_job(state(&t.app), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn test_bad_folder_reference_is_400() {
        let t = create_app().await;

        let err = process_folder(
            state(&t.app),
            Json(ProcessFolderRequest {
                folder_path: "s3://".to_string(),
                batch_size: Some(4),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_pipeline_errors_map_to_status() {
        let not_found = HttpError::from(PipelineError::NotFound("x.jpg".into()));
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let timeout = HttpError::from(PipelineError::Timeout {
            operation: "vector search",
            secs: 60,
        });
        assert_eq!(
            timeout.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
