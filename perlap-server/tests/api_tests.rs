//! Integration tests for the perlap-server HTTP API
//!
//! Uses tower::ServiceExt::oneshot to test routes directly without binding a port.
//! The manager runs against a solid-color frame source and an in-memory
//! sensor link, with all files under a temporary directory.

use anyhow::{bail, Result};
use axum::body::Body;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use image::{Rgb, RgbImage};
use perlap_core::source::FrameSource;
use perlap_server::{
    api::create_router,
    manager::{Command, Manager, ManagerOptions},
    state::AppState,
    store::{DataDirs, RaceArchive},
};
use perlap_sources::{LaserTimings, PortOpener, SerialLink};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{oneshot, watch};
use tower::ServiceExt;

const FRAME_W: u32 = 64;
const FRAME_H: u32 = 48;
const RED: [u8; 3] = [220, 30, 30];

/// Always shows the same solid color
struct SolidFrameSource {
    open: bool,
}

impl FrameSource for SolidFrameSource {
    fn name(&self) -> &str {
        "Solid"
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        if !self.open {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(10));
        Ok(Some(RgbImage::from_pixel(FRAME_W, FRAME_H, Rgb(RED))))
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Both ends of the fake sensor wire
#[derive(Default)]
struct Wire {
    inbound: VecDeque<String>,
    written: Vec<String>,
}

type SharedWire = Arc<Mutex<Wire>>;

struct WireLink(SharedWire);

impl SerialLink for WireLink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.0.lock().unwrap().written.push(line.to_string());
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        Ok(self.0.lock().unwrap().inbound.pop_front())
    }
}

struct WireOpener(SharedWire);

impl PortOpener for WireOpener {
    fn open(&mut self, port: &str) -> Result<Box<dyn SerialLink>> {
        if port.is_empty() {
            bail!("no port");
        }
        Ok(Box::new(WireLink(Arc::clone(&self.0))))
    }
}

struct TestServer {
    app: axum::Router,
    state: AppState,
    wire: SharedWire,
    /// Camera index of every frame source the manager asked for
    cameras: Arc<Mutex<Vec<u32>>>,
    dir: TempDir,
}

impl TestServer {
    fn start() -> Self {
        Self::start_in(TempDir::new().unwrap())
    }

    /// Start a manager over an existing data directory
    fn start_in(dir: TempDir) -> Self {
        let dirs = DataDirs::at(dir.path());
        let wire = SharedWire::default();

        let (frames_tx, frames_rx) = watch::channel(None);
        let (state, commands) = AppState::new(frames_rx, RaceArchive::new(dirs.races_dir()));

        let cameras = Arc::new(Mutex::new(Vec::new()));
        let source_cameras = Arc::clone(&cameras);
        let opener_wire = Arc::clone(&wire);
        let options = ManagerOptions {
            frame_sources: Box::new(move |index| -> Box<dyn FrameSource> {
                source_cameras.lock().unwrap().push(index);
                Box::new(SolidFrameSource { open: false })
            }),
            port_opener: Box::new(move || -> Box<dyn PortOpener> {
                Box::new(WireOpener(Arc::clone(&opener_wire)))
            }),
            discover_port: Box::new(|| None),
            laser_timings: LaserTimings {
                ready_timeout: Duration::from_millis(50),
                retry_interval: Duration::from_millis(20),
                tick: Duration::from_millis(1),
            },
        };
        let manager = Manager::new(&dirs, state.notifications.clone(), frames_tx, options);
        tokio::spawn(manager.run(commands));

        Self {
            app: create_router(state.clone()),
            state,
            wire,
            cameras,
            dir,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> Response<Body> {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    async fn get_json(&self, uri: &str) -> Value {
        let response = self.get(uri).await;
        assert_eq!(response.status(), 200, "GET {}", uri);
        body_json(response.into_body()).await
    }

    async fn wait_for_frame(&self) {
        for _ in 0..200 {
            if self.state.frames.borrow().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no frame was captured");
    }

    /// Poll a JSON endpoint until `cond` holds
    async fn wait_for(&self, uri: &str, cond: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..400 {
            let value = self.get_json(uri).await;
            if cond(&value) {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition on {} never held", uri);
    }

    async fn register_red_car(&self) -> Response<Body> {
        self.call(
            "POST",
            "/api/cars",
            Some(json!({
                "name": "Rojo",
                "hsv_lower": [0, 150, 150],
                "hsv_upper": [10, 255, 255],
                "display_color": RED,
            })),
        )
        .await
    }

    async fn set_finish_line(&self) -> Response<Body> {
        self.call(
            "PUT",
            "/api/config/finish-line",
            Some(json!({"p1": [4, 24], "p2": [60, 24]})),
        )
        .await
    }

    async fn shutdown(self) -> TempDir {
        let (done, stopped) = oneshot::channel();
        self.state
            .commands
            .send(Command::Shutdown(done))
            .await
            .unwrap();
        stopped.await.unwrap();
        self.dir
    }
}

/// Helper: collect response body into bytes
async fn body_bytes(body: Body) -> Vec<u8> {
    let collected = body.collect().await.unwrap();
    collected.to_bytes().to_vec()
}

/// Helper: collect response body into JSON
async fn body_json(body: Body) -> Value {
    serde_json::from_slice(&body_bytes(body).await).unwrap()
}

// ==================== GET /api/status ====================

#[tokio::test]
async fn test_status_defaults() {
    let server = TestServer::start();

    let status = server.get_json("/api/status").await;
    assert_eq!(status["mode"], "race");
    assert_eq!(status["source"], "CAMERA");
    assert_eq!(status["racing"], false);
    assert_eq!(status["active_cars"], 0);
    assert_eq!(status["finish_line_defined"], false);
    assert_eq!(status["sensor"]["running"], false);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let server = TestServer::start();
    let response = server.get("/api/nope").await;
    assert_eq!(response.status(), 404);
}

// ==================== /api/cars ====================

#[tokio::test]
async fn test_register_and_list_cars() {
    let server = TestServer::start();

    let response = server.register_red_car().await;
    assert_eq!(response.status(), 201);
    let car = body_json(response.into_body()).await;
    assert_eq!(car["slot"], 0);
    assert_eq!(car["name"], "Rojo");
    assert_eq!(car["active"], true);

    let cars = server.get_json("/api/cars").await;
    assert_eq!(cars.as_array().unwrap().len(), 1);

    let config = server.get_json("/api/config").await;
    assert_eq!(config["cars"][0]["name"], "Rojo");
    assert!(server.dir.path().join("config.json").exists());

    server.shutdown().await;
}

#[tokio::test]
async fn test_register_car_rejects_bad_input() {
    let server = TestServer::start();

    let response = server
        .call(
            "POST",
            "/api/cars",
            Some(json!({
                "slot": 9,
                "name": "Azul",
                "hsv_lower": [100, 150, 150],
                "hsv_upper": [130, 255, 255],
                "display_color": [30, 60, 220],
            })),
        )
        .await;
    assert_eq!(response.status(), 400);

    let response = server
        .call(
            "POST",
            "/api/cars",
            Some(json!({
                "name": "   ",
                "hsv_lower": [100, 150, 150],
                "hsv_upper": [130, 255, 255],
                "display_color": [30, 60, 220],
            })),
        )
        .await;
    assert_eq!(response.status(), 400);

    // Not JSON at all
    let response = server
        .send(
            Request::builder()
                .method("POST")
                .uri("/api/cars")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_register_fills_every_slot_then_conflicts() {
    let server = TestServer::start();

    for _ in 0..6 {
        assert_eq!(server.register_red_car().await.status(), 201);
    }
    let response = server.register_red_car().await;
    assert_eq!(response.status(), 409);

    let slots: Vec<u64> = server
        .get_json("/api/cars")
        .await
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["slot"].as_u64().unwrap())
        .collect();
    assert_eq!(slots, [0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_unregister_car() {
    let server = TestServer::start();
    server.register_red_car().await;

    let response = server.call("DELETE", "/api/cars/3", None).await;
    assert_eq!(response.status(), 404);

    let response = server.call("DELETE", "/api/cars/0", None).await;
    assert_eq!(response.status(), 204);

    let cars = server.get_json("/api/cars").await;
    assert!(cars.as_array().unwrap().is_empty());
    let config = server.get_json("/api/config").await;
    assert!(config["cars"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_cars_survive_restart() {
    let server = TestServer::start();
    server.register_red_car().await;
    server.set_finish_line().await;
    let dir = server.shutdown().await;

    let server = TestServer::start_in(dir);
    let cars = server.get_json("/api/cars").await;
    assert_eq!(cars[0]["name"], "Rojo");
    let line = server.get_json("/api/config/finish-line").await;
    assert_eq!(line, json!({"p1": [4, 24], "p2": [60, 24]}));
}

// ==================== Calibration ====================

#[tokio::test]
async fn test_sample_color_from_latest_frame() {
    let server = TestServer::start();
    server.wait_for_frame().await;

    let response = server
        .call(
            "POST",
            "/api/cars/sample",
            Some(json!({"x": 32, "y": 24, "patch_size": 10})),
        )
        .await;
    assert_eq!(response.status(), 200);
    let sample = body_json(response.into_body()).await;
    assert_eq!(sample["display_color"], json!(RED));
    assert_eq!(sample["mean_hsv"][0], 0.0);

    let response = server
        .call(
            "POST",
            "/api/cars/sample",
            Some(json!({"x": 32, "y": 24, "patch_size": 1})),
        )
        .await;
    assert_eq!(response.status(), 200);
    let sample = body_json(response.into_body()).await;
    assert_eq!(sample["display_color"], json!(RED));

    let response = server
        .call("POST", "/api/cars/sample", Some(json!({"x": 1000, "y": 1000})))
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_camera_frame_is_png() {
    let server = TestServer::start();
    server.wait_for_frame().await;

    let response = server.get("/api/camera/frame.png").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "image/png");

    let bytes = body_bytes(response.into_body()).await;
    assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
}

#[tokio::test]
async fn test_camera_index_selects_frame_source() {
    let server = TestServer::start();
    server.wait_for_frame().await;
    assert_eq!(*server.cameras.lock().unwrap(), [0u32]);

    let response = server
        .call("PUT", "/api/config/camera", Some(json!({"camera_index": 2})))
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(body_json(response.into_body()).await, json!({"camera_index": 2}));

    assert_eq!(*server.cameras.lock().unwrap(), [0u32, 2]);
    let config = server.get_json("/api/config").await;
    assert_eq!(config["camera_index"], 2);
}

// ==================== /api/config ====================

#[tokio::test]
async fn test_finish_line_validation() {
    let server = TestServer::start();

    let line = server.get_json("/api/config/finish-line").await;
    assert!(line.is_null());

    let response = server
        .call(
            "PUT",
            "/api/config/finish-line",
            Some(json!({"p1": [10, 10], "p2": [10, 10]})),
        )
        .await;
    assert_eq!(response.status(), 400);

    assert_eq!(server.set_finish_line().await.status(), 200);
    let status = server.get_json("/api/status").await;
    assert_eq!(status["finish_line_defined"], true);
}

#[tokio::test]
async fn test_sensitivity_and_min_pixels() {
    let server = TestServer::start();

    let response = server
        .call(
            "PUT",
            "/api/config/sensitivity",
            Some(json!({"sensitivity": "Estricto"})),
        )
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        body_json(response.into_body()).await["sensitivity"],
        "Strict"
    );

    let response = server
        .call(
            "PUT",
            "/api/config/min-pixels",
            Some(json!({"min_pixel_count": 0})),
        )
        .await;
    assert_eq!(response.status(), 400);

    let response = server
        .call(
            "PUT",
            "/api/config/min-pixels",
            Some(json!({"min_pixel_count": 150})),
        )
        .await;
    assert_eq!(response.status(), 200);

    let config = server.get_json("/api/config").await;
    assert_eq!(config["sensitivity"], "Strict");
    assert_eq!(config["min_pixel_count"], 150);
}

// ==================== Race flow ====================

#[tokio::test]
async fn test_start_race_requires_cars_and_finish_line() {
    let server = TestServer::start();

    let response = server.call("POST", "/api/race/start", None).await;
    assert_eq!(response.status(), 400);

    server.register_red_car().await;
    let response = server.call("POST", "/api/race/start", None).await;
    assert_eq!(response.status(), 400);

    let response = server.call("POST", "/api/race/stop", None).await;
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn test_race_is_timed_and_archived() {
    let server = TestServer::start();
    server.register_red_car().await;
    server.set_finish_line().await;

    let response = server.call("POST", "/api/race/start", None).await;
    assert_eq!(response.status(), 200);
    let race_id = body_json(response.into_body()).await["race_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = server.call("POST", "/api/race/start", None).await;
    assert_eq!(response.status(), 409);

    // The solid red frame puts the car on the line right away
    let standings = server
        .wait_for("/api/standings", |s| s[0]["started"] == true)
        .await;
    assert_eq!(standings[0]["name"], "Rojo");
    assert_eq!(standings[0]["laps"], 0);

    let response = server.call("POST", "/api/race/stop", None).await;
    assert_eq!(response.status(), 200);
    assert_eq!(body_json(response.into_body()).await["race_id"], race_id);

    let races = server.get_json("/api/races").await;
    assert_eq!(races[0]["id"], race_id);
    assert_eq!(races[0]["cars"], 1);

    let race = server.get_json(&format!("/api/races/{}", race_id)).await;
    assert_eq!(race["cars"][0]["name"], "Rojo");
    assert_eq!(race["events"][0]["event"], "START");

    let response = server.get("/api/races/does-not-exist").await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_reset_race_clears_standings() {
    let server = TestServer::start();
    server.register_red_car().await;
    server.set_finish_line().await;
    server
        .wait_for("/api/standings", |s| s[0]["started"] == true)
        .await;

    let response = server.call("POST", "/api/race/reset", None).await;
    assert_eq!(response.status(), 200);
    let standings = body_json(response.into_body()).await;
    assert_eq!(standings[0]["started"], false);
}

#[tokio::test]
async fn test_switching_to_time_trial_ends_the_race() {
    let server = TestServer::start();
    server.register_red_car().await;
    server.set_finish_line().await;
    server.call("POST", "/api/race/start", None).await;

    let response = server
        .call("POST", "/api/mode", Some(json!({"mode": "time_trial"})))
        .await;
    assert_eq!(response.status(), 200);

    let status = server.get_json("/api/status").await;
    assert_eq!(status["mode"], "time_trial");
    assert_eq!(status["racing"], false);
    assert_eq!(server.get_json("/api/races").await.as_array().unwrap().len(), 1);

    let response = server.call("POST", "/api/race/start", None).await;
    assert_eq!(response.status(), 409);
}

// ==================== Time trial and ranking ====================

#[tokio::test]
async fn test_time_trial_reset_and_submit_rules() {
    let server = TestServer::start();

    let response = server
        .call("POST", "/api/time-trial/reset", Some(json!({"total_laps": 0})))
        .await;
    assert_eq!(response.status(), 400);

    let response = server
        .call("POST", "/api/time-trial/reset", Some(json!({"total_laps": 3})))
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(body_json(response.into_body()).await["total_laps"], 3);

    // No body keeps the lap count
    let response = server.call("POST", "/api/time-trial/reset", None).await;
    assert_eq!(response.status(), 200);
    let status = server.get_json("/api/time-trial").await;
    assert_eq!(status["total_laps"], 3);
    assert_eq!(status["finished"], false);

    let response = server
        .call("POST", "/api/time-trial/submit", Some(json!({"player": "Ana"})))
        .await;
    assert_eq!(response.status(), 409);

    let response = server
        .call("POST", "/api/time-trial/submit", Some(json!({"player": " "})))
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_ranking_remove_and_clear() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("ranking.json"),
        json!([
            {"player": "Ana", "total_ms": 9000, "laps": 3, "lap_times_ms": [3000, 3000, 3000],
             "best_lap_ms": 3000, "date": "2024-05-01T10:00:00"},
            {"player": "Luis", "total_ms": 7500, "laps": 3, "lap_times_ms": [2500, 2500, 2500],
             "best_lap_ms": 2500, "date": "2024-05-01T10:05:00"},
        ])
        .to_string(),
    )
    .unwrap();
    let server = TestServer::start_in(dir);

    let ranking = server.get_json("/api/ranking").await;
    assert_eq!(ranking[0]["player"], "Luis");
    assert_eq!(ranking[1]["player"], "Ana");

    let response = server.call("DELETE", "/api/ranking/5", None).await;
    assert_eq!(response.status(), 404);

    let response = server.call("DELETE", "/api/ranking/0", None).await;
    assert_eq!(response.status(), 200);
    assert_eq!(body_json(response.into_body()).await["player"], "Luis");
    assert_eq!(server.get_json("/api/ranking").await.as_array().unwrap().len(), 1);

    let response = server.call("DELETE", "/api/ranking", None).await;
    assert_eq!(response.status(), 204);
    assert!(server.get_json("/api/ranking").await.as_array().unwrap().is_empty());
}

// ==================== Laser sensor ====================

#[tokio::test]
async fn test_sensor_command_needs_laser_source() {
    let server = TestServer::start();

    let response = server
        .call(
            "POST",
            "/api/sensor/command",
            Some(json!({"command": "laser", "value": true})),
        )
        .await;
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn test_switching_to_laser_connects_and_forwards_commands() {
    let server = TestServer::start();
    server.wire.lock().unwrap().inbound.push_back(
        r#"{"event":"READY","data":{"baseline":812,"threshold":400}}"#.into(),
    );

    let response = server
        .call("PUT", "/api/sensor/port", Some(json!({"port": "/dev/ttyUSB0"})))
        .await;
    assert_eq!(response.status(), 200);

    let response = server
        .call("PUT", "/api/config/source", Some(json!({"source": "ARDUINO"})))
        .await;
    assert_eq!(response.status(), 200);

    let status = server
        .wait_for("/api/status", |s| s["sensor"]["connected"] == true)
        .await;
    assert_eq!(status["source"], "ARDUINO");
    assert_eq!(status["camera_running"], false);
    assert_eq!(status["sensor"]["port"], "/dev/ttyUSB0");

    // The threshold from READY is remembered
    server
        .wait_for("/api/config", |c| c["arduino_threshold"] == 400)
        .await;

    let response = server
        .call(
            "POST",
            "/api/sensor/command",
            Some(json!({"command": "threshold", "value": 350})),
        )
        .await;
    assert_eq!(response.status(), 202);
    let response = server
        .call("POST", "/api/sensor/command", Some(json!({"command": "test"})))
        .await;
    assert_eq!(response.status(), 202);

    for _ in 0..200 {
        if server.wire.lock().unwrap().written.len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let written = server.wire.lock().unwrap().written.clone();
    assert_eq!(written[..3], ["STREAM ON", "THRESHOLD 350", "TEST"]);

    // Back to the camera stops the sensor worker, which turns streaming off
    let response = server
        .call("PUT", "/api/config/source", Some(json!({"source": "CAMERA"})))
        .await;
    assert_eq!(response.status(), 200);
    let wire = Arc::clone(&server.wire);
    server.shutdown().await;
    assert_eq!(
        wire.lock().unwrap().written.last().map(String::as_str),
        Some("STREAM OFF")
    );
}
