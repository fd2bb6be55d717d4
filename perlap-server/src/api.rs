//! REST API and SSE routes

use crate::error::ControlError;
use crate::manager::{CarRegistration, Command, StatusReport};
use crate::state::{AppState, Mode};
use crate::store::RaceSummary;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use image::ImageFormat;
use perlap_core::color::{ColorSample, SensitivityPreset};
use perlap_core::config::AppConfig;
use perlap_core::geometry::FinishLine;
use perlap_core::model::{CarProfile, Source, Standing};
use perlap_core::ranking::{Placement, Ranking, RankingEntry};
use perlap_core::record::RaceRecord;
use perlap_core::timing::TimeTrialStatus;
use perlap_sources::link::{list_ports, PortInfo};
use perlap_sources::SensorCommand;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::io::Cursor;
use tokio_stream::wrappers::BroadcastStream;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/config", get(config))
        .route("/api/events/stream", get(event_stream))
        // Race
        .route("/api/standings", get(standings))
        .route("/api/race/start", post(start_race))
        .route("/api/race/stop", post(stop_race))
        .route("/api/race/reset", post(reset_race))
        .route("/api/mode", post(set_mode))
        // Cars and calibration
        .route("/api/cars", get(list_cars).post(register_car))
        .route("/api/cars/sample", post(sample_color))
        .route("/api/cars/:slot", delete(unregister_car))
        .route("/api/camera/frame.png", get(camera_frame))
        // Configuration
        .route("/api/config/finish-line", get(get_finish_line).put(set_finish_line))
        .route("/api/config/sensitivity", put(set_sensitivity))
        .route("/api/config/min-pixels", put(set_min_pixels))
        .route("/api/config/source", put(set_source))
        .route("/api/config/camera", put(set_camera))
        // Laser sensor
        .route("/api/sensor/command", post(sensor_command))
        .route("/api/sensor/port", put(set_sensor_port))
        .route("/api/sensor/ports", get(sensor_ports))
        // Time trial and ranking
        .route("/api/time-trial", get(time_trial))
        .route("/api/time-trial/reset", post(reset_time_trial))
        .route("/api/time-trial/submit", post(submit_time_trial))
        .route("/api/ranking", get(ranking).delete(clear_ranking))
        .route("/api/ranking/:index", delete(remove_ranking_entry))
        // Archive
        .route("/api/races", get(list_races))
        .route("/api/races/:id", get(get_race))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

type ApiResult<T> = Result<Json<T>, ControlError>;

// === Status Endpoints ===

async fn status(State(state): State<AppState>) -> ApiResult<StatusReport> {
    state.request(Command::Status).await.map(Json)
}

async fn config(State(state): State<AppState>) -> ApiResult<AppConfig> {
    state.request(Command::Config).await.map(Json)
}

async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(notification) => match serde_json::to_string(&notification) {
                Ok(json) => Some(Ok(Event::default().data(json))),
                Err(e) => {
                    tracing::error!("Failed to serialize notification: {}", e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("Broadcast stream error: {}", e);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// === Race Endpoints ===

#[derive(Serialize)]
struct RaceIdResponse {
    race_id: Option<String>,
}

async fn standings(State(state): State<AppState>) -> ApiResult<Vec<Standing>> {
    state.request(Command::Standings).await.map(Json)
}

async fn start_race(State(state): State<AppState>) -> ApiResult<RaceIdResponse> {
    let race_id = state.request(Command::StartRace).await?;
    Ok(Json(RaceIdResponse {
        race_id: Some(race_id),
    }))
}

async fn stop_race(State(state): State<AppState>) -> ApiResult<RaceIdResponse> {
    let race_id = state.request(Command::StopRace).await?;
    Ok(Json(RaceIdResponse { race_id }))
}

async fn reset_race(State(state): State<AppState>) -> ApiResult<Vec<Standing>> {
    state.request(Command::ResetRace).await.map(Json)
}

#[derive(Deserialize, Serialize)]
struct ModeBody {
    mode: Mode,
}

async fn set_mode(
    State(state): State<AppState>,
    Json(body): Json<ModeBody>,
) -> ApiResult<ModeBody> {
    let mode = state
        .request(|reply| Command::SetMode {
            mode: body.mode,
            reply,
        })
        .await?;
    Ok(Json(ModeBody { mode }))
}

// === Car Endpoints ===

async fn list_cars(State(state): State<AppState>) -> ApiResult<Vec<CarProfile>> {
    state.request(Command::ListCars).await.map(Json)
}

async fn register_car(
    State(state): State<AppState>,
    Json(car): Json<CarRegistration>,
) -> Result<impl IntoResponse, ControlError> {
    let profile = state
        .request(|reply| Command::RegisterCar { car, reply })
        .await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

async fn unregister_car(
    State(state): State<AppState>,
    Path(slot): Path<usize>,
) -> Result<StatusCode, ControlError> {
    state
        .request(|reply| Command::UnregisterCar { slot, reply })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SampleRequest {
    x: u32,
    y: u32,
    patch_size: Option<u32>,
}

async fn sample_color(
    State(state): State<AppState>,
    Json(request): Json<SampleRequest>,
) -> ApiResult<ColorSample> {
    state
        .request(|reply| Command::SampleColor {
            x: request.x,
            y: request.y,
            patch_size: request.patch_size,
            reply,
        })
        .await
        .map(Json)
}

async fn camera_frame(State(state): State<AppState>) -> Result<impl IntoResponse, ControlError> {
    let frame = state
        .frames
        .borrow()
        .clone()
        .ok_or_else(|| ControlError::NotFound("no camera frame available".into()))?;

    let png = tokio::task::spawn_blocking(move || {
        let mut png = Cursor::new(Vec::new());
        frame.annotated.write_to(&mut png, ImageFormat::Png)?;
        Ok::<_, image::ImageError>(png.into_inner())
    })
    .await
    .map_err(|e| ControlError::Internal(format!("frame encoder failed: {}", e)))?
    .map_err(|e| ControlError::Internal(format!("failed to encode frame: {}", e)))?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        png,
    ))
}

// === Configuration Endpoints ===

async fn get_finish_line(State(state): State<AppState>) -> ApiResult<Option<FinishLine>> {
    state.request(Command::GetFinishLine).await.map(Json)
}

async fn set_finish_line(
    State(state): State<AppState>,
    Json(line): Json<FinishLine>,
) -> ApiResult<FinishLine> {
    state
        .request(|reply| Command::SetFinishLine { line, reply })
        .await
        .map(Json)
}

#[derive(Deserialize, Serialize)]
struct SensitivityBody {
    sensitivity: SensitivityPreset,
}

async fn set_sensitivity(
    State(state): State<AppState>,
    Json(body): Json<SensitivityBody>,
) -> ApiResult<SensitivityBody> {
    let sensitivity = state
        .request(|reply| Command::SetSensitivity {
            preset: body.sensitivity,
            reply,
        })
        .await?;
    Ok(Json(SensitivityBody { sensitivity }))
}

#[derive(Deserialize, Serialize)]
struct MinPixelsBody {
    min_pixel_count: u32,
}

async fn set_min_pixels(
    State(state): State<AppState>,
    Json(body): Json<MinPixelsBody>,
) -> ApiResult<MinPixelsBody> {
    let min_pixel_count = state
        .request(|reply| Command::SetMinPixels {
            count: body.min_pixel_count,
            reply,
        })
        .await?;
    Ok(Json(MinPixelsBody { min_pixel_count }))
}

#[derive(Deserialize, Serialize)]
struct SourceBody {
    source: Source,
}

async fn set_source(
    State(state): State<AppState>,
    Json(body): Json<SourceBody>,
) -> ApiResult<SourceBody> {
    let source = state
        .request(|reply| Command::SetSource {
            source: body.source,
            reply,
        })
        .await?;
    Ok(Json(SourceBody { source }))
}

#[derive(Deserialize, Serialize)]
struct CameraBody {
    camera_index: u32,
}

async fn set_camera(
    State(state): State<AppState>,
    Json(body): Json<CameraBody>,
) -> ApiResult<CameraBody> {
    let camera_index = state
        .request(|reply| Command::SetCamera {
            index: body.camera_index,
            reply,
        })
        .await?;
    Ok(Json(CameraBody { camera_index }))
}

// === Sensor Endpoints ===

async fn sensor_command(
    State(state): State<AppState>,
    Json(command): Json<SensorCommand>,
) -> Result<StatusCode, ControlError> {
    state
        .request(|reply| Command::Sensor { command, reply })
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize, Serialize)]
struct PortBody {
    port: Option<String>,
}

async fn set_sensor_port(
    State(state): State<AppState>,
    Json(body): Json<PortBody>,
) -> ApiResult<PortBody> {
    let port = state
        .request(|reply| Command::SetSensorPort {
            port: body.port,
            reply,
        })
        .await?;
    Ok(Json(PortBody { port }))
}

async fn sensor_ports() -> ApiResult<Vec<PortInfo>> {
    let ports = tokio::task::spawn_blocking(list_ports)
        .await
        .map_err(|e| ControlError::Internal(format!("port enumeration failed: {}", e)))??;
    Ok(Json(ports))
}

// === Time Trial Endpoints ===

async fn time_trial(State(state): State<AppState>) -> ApiResult<TimeTrialStatus> {
    state.request(Command::TimeTrial).await.map(Json)
}

#[derive(Deserialize, Default)]
struct TimeTrialResetRequest {
    total_laps: Option<u32>,
}

async fn reset_time_trial(
    State(state): State<AppState>,
    body: Option<Json<TimeTrialResetRequest>>,
) -> ApiResult<TimeTrialStatus> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    state
        .request(|reply| Command::ResetTimeTrial {
            total_laps: request.total_laps,
            reply,
        })
        .await
        .map(Json)
}

#[derive(Deserialize)]
struct SubmitRequest {
    player: String,
}

async fn submit_time_trial(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ControlError> {
    let placement: Placement = state
        .request(|reply| Command::SubmitTimeTrial {
            player: request.player,
            reply,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(placement)))
}

async fn ranking(State(state): State<AppState>) -> ApiResult<Ranking> {
    state.request(Command::Ranking).await.map(Json)
}

async fn remove_ranking_entry(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> ApiResult<RankingEntry> {
    state
        .request(|reply| Command::RemoveRankingEntry { index, reply })
        .await
        .map(Json)
}

async fn clear_ranking(State(state): State<AppState>) -> Result<StatusCode, ControlError> {
    state.request(Command::ClearRanking).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Race Archive Endpoints ===

async fn list_races(State(state): State<AppState>) -> ApiResult<Vec<RaceSummary>> {
    let archive = state.archive.clone();
    let races = tokio::task::spawn_blocking(move || archive.list())
        .await
        .map_err(|e| ControlError::Internal(format!("race listing failed: {}", e)))??;
    Ok(Json(races))
}

async fn get_race(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<RaceRecord> {
    let archive = state.archive.clone();
    let lookup = id.clone();
    tokio::task::spawn_blocking(move || archive.load(&lookup))
        .await
        .map_err(|e| ControlError::Internal(format!("race lookup failed: {}", e)))??
        .map(Json)
        .ok_or_else(|| ControlError::NotFound(format!("no race {}", id)))
}
