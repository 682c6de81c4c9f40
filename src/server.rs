use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bail_runner;
use crate::error::{RunnerError, RunnerResult};
use crate::inference::context::Predictor;
use crate::inference::model::ModelBase;
use crate::inference::params::{PredictOptions, PredictRequest};
use crate::inference::pcm_decode::InvalidAudio;

#[derive(Clone)]
pub struct AppState {
    predictor: Arc<dyn Predictor>,
    // Generation is blocking and shares one device, requests take turns
    permits: Arc<Semaphore>,
    upload_dir: PathBuf,
}

impl AppState {
    pub fn new(predictor: Arc<dyn Predictor>, upload_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&upload_dir).with_context(|| {
            format!("Failed to create upload directory {}", upload_dir.display())
        })?;
        Ok(Self {
            predictor,
            permits: Arc::new(Semaphore::new(1)),
            upload_dir,
        })
    }
}

#[derive(Deserialize, Serialize, Debug)]
pub struct PredictResponse {
    pub output: String,
    pub inference_time: f64,
}

pub fn router(state: AppState, max_body_size: usize) -> Router {
    let predict_router = Router::new()
        .route("/predict", post(handle_predict_request))
        .layer(DefaultBodyLimit::max(max_body_size));

    Router::new()
        .route("/health", get(handle_health_request))
        .route("/models", get(handle_models_request))
        .merge(predict_router)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_health_request() -> &'static str {
    "OK"
}

async fn handle_models_request(State(state): State<AppState>) -> Json<Vec<ModelBase>> {
    Json(state.predictor.models())
}

#[axum_macros::debug_handler]
async fn handle_predict_request(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> RunnerResult<(StatusCode, Json<PredictResponse>)> {
    let mut opt_options = None;
    let mut opt_audio = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(name) = field.name() else {
            continue;
        };
        match name {
            "request_content" => {
                if field
                    .content_type()
                    .map_or(false, |content| content != "application/json")
                {
                    bail_runner!(
                        StatusCode::BAD_REQUEST,
                        "Invalid mime type in content-type header for request_content field"
                    );
                }
                let bytes = field.bytes().await.map_err(multipart_error)?;
                let options: PredictOptions =
                    serde_json::from_slice(&bytes).map_err(RunnerError::bad_request)?;
                opt_options = Some(options);
            }
            "audio_content" => {
                if field.content_type().map_or(false, |content| {
                    !content.starts_with("audio/") && content != "application/octet-stream"
                }) {
                    bail_runner!(
                        StatusCode::BAD_REQUEST,
                        "Invalid mime type in content-type header for audio_content field"
                    );
                }
                opt_audio = Some(stage_upload(field, &state.upload_dir).await?);
            }
            _ => bail_runner!(StatusCode::BAD_REQUEST, "Unknown field {}", name),
        }
    }

    let Some(audio) = opt_audio else {
        bail_runner!(
            StatusCode::BAD_REQUEST,
            "Missing field audio_content in multipart form"
        );
    };
    let request = PredictRequest::new(audio.path(), opt_options.unwrap_or_default());

    let _permit = state.permits.clone().acquire_owned().await?;
    let predictor = state.predictor.clone();
    let start = Instant::now();
    let output = tokio::task::spawn_blocking(move || {
        let output = predictor.predict(&request);
        drop(audio);
        output
    })
    .await?
    .map_err(|err| match err.downcast_ref::<InvalidAudio>() {
        Some(_) => RunnerError::bad_request(err),
        None => RunnerError::from(err),
    })?;
    let inference_time = start.elapsed().as_secs_f64();
    info!("Prediction finished in {inference_time:.2}s");

    Ok((
        StatusCode::OK,
        Json(PredictResponse {
            output,
            inference_time,
        }),
    ))
}

/// Writes the uploaded audio to a temporary file that is removed when dropped.
async fn stage_upload(field: Field<'_>, upload_dir: &Path) -> RunnerResult<NamedTempFile> {
    let suffix = field
        .file_name()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, extension)| format!(".{extension}"))
        .unwrap_or_default();
    let bytes = field.bytes().await.map_err(multipart_error)?;

    let mut file = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(&suffix)
        .tempfile_in(upload_dir)?;
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(file)
}

fn multipart_error(err: MultipartError) -> RunnerError {
    RunnerError::new(err.status(), err.body_text())
}
