use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use heating_common::{
    topics, zone::DeviceEntry, Collaborators, ControllerConfig, CycleReport, GlobalSettings,
    HeatingError, HeatingSystem, RuntimeConfig, Schedule, Zone, ZoneCommand, ZoneStatus,
};

use crate::{
    learning::{LearningData, RateLearning},
    mqtt::{MqttEventSink, MqttStateStore},
};

#[derive(Clone)]
struct AppState {
    system: Arc<Mutex<HeatingSystem>>,
    timezone: Arc<Mutex<String>>,
    time_synced: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    states: Arc<MqttStateStore>,
    events: Arc<MqttEventSink>,
    learning: Arc<RateLearning>,
    mqtt: AsyncClient,
    prefix: Arc<String>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    zones_path: Arc<PathBuf>,
    learning_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TimezoneUpdate {
    timezone: String,
}

#[derive(Debug, Deserialize)]
struct ZoneCreate {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct ControllerStatus {
    timezone: String,
    #[serde(rename = "timeSynced")]
    time_synced: bool,
    #[serde(rename = "knownEntities")]
    known_entities: usize,
    #[serde(flatten)]
    summary: CycleSummary,
    zones: Vec<ZoneStatus>,
}

#[derive(Debug, Default, Serialize)]
struct CycleSummary {
    #[serde(rename = "heatingZones")]
    heating_zones: Vec<String>,
    #[serde(rename = "boilerSetpoint")]
    boiler_setpoint: Option<f32>,
    #[serde(rename = "actuationFailures")]
    actuation_failures: usize,
}

impl CycleSummary {
    fn from_report(report: &CycleReport) -> Self {
        Self {
            heating_zones: report
                .heating_zones()
                .map(|outcome| outcome.zone_id.clone())
                .collect(),
            boiler_setpoint: report.boiler_setpoint,
            actuation_failures: report
                .zones
                .iter()
                .map(|outcome| outcome.actuation_failures)
                .sum::<usize>()
                + report.boiler_failures,
        }
    }
}

#[derive(Debug, Serialize)]
struct HeatingCurveView {
    enabled: bool,
    system: heating_common::types::HeatingSystemType,
    coefficient: f32,
    #[serde(rename = "optimalCoefficient")]
    optimal_coefficient: Option<f32>,
    derivative: Option<f32>,
    value: Option<f32>,
}

/// JSON entity states with attributes can be a few kilobytes; anything larger is not ours.
const MAX_MQTT_PAYLOAD_BYTES: usize = 16 * 1024;
/// Gives retained entity states time to arrive before the first cycle.
const STARTUP_GRACE: Duration = Duration::from_secs(5);
const MIN_CYCLE_INTERVAL_MS: u64 = 1_000;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    if runtime.timezone.parse::<Tz>().is_err() {
        warn!("invalid stored timezone {:?}, using default", runtime.timezone);
        runtime.timezone = RuntimeConfig::default().timezone;
    }

    let zones = store.load_zones().await.unwrap_or_else(|err| {
        warn!("failed to load zones from store: {err:#}");
        Vec::new()
    });
    let learning = store.load_learning().await.unwrap_or_else(|err| {
        warn!("failed to load learning data from store: {err:#}");
        LearningData::default()
    });

    let system = HeatingSystem::new(
        runtime.controller.clone(),
        runtime.settings.clone(),
        zones,
        &runtime.curve,
    )
    .context("stored zones are inconsistent")?;
    info!(zones = system.registry().len(), "heating system loaded");

    let network = runtime.network.clone();
    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("heating-controller", mqtt_host, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 256);
    let prefix = network.topic_prefix.clone();
    let http_port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(network.http_port);

    let app_state = AppState {
        system: Arc::new(Mutex::new(system)),
        timezone: Arc::new(Mutex::new(runtime.timezone)),
        time_synced: Arc::new(AtomicBool::new(false)),
        shutdown: Arc::new(AtomicBool::new(false)),
        states: Arc::new(MqttStateStore::new(mqtt.clone(), prefix.clone())),
        events: Arc::new(MqttEventSink::new(mqtt.clone(), &prefix)),
        learning: Arc::new(RateLearning::from_data(learning)),
        mqtt,
        prefix: Arc::new(prefix),
        store,
    };

    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone());
    spawn_state_publish_loop(app_state.clone());

    let mut app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/cycle", post(handle_run_cycle))
        .route("/api/zones", get(handle_list_zones).post(handle_create_zone))
        .route(
            "/api/zones/{zone_id}",
            get(handle_get_zone).delete(handle_delete_zone),
        )
        .route("/api/zones/{zone_id}/commands", post(handle_zone_command))
        .route("/api/zones/{zone_id}/target", post(handle_set_target))
        .route(
            "/api/zones/{zone_id}/boost",
            post(handle_start_boost).delete(handle_cancel_boost),
        )
        .route(
            "/api/zones/{zone_id}/schedules",
            put(handle_put_schedules).post(handle_add_schedule),
        )
        .route(
            "/api/zones/{zone_id}/schedules/{schedule_id}",
            axum::routing::delete(handle_delete_schedule),
        )
        .route(
            "/api/zones/{zone_id}/devices/{device_id}",
            put(handle_assign_device).delete(handle_remove_device),
        )
        .route(
            "/api/settings",
            get(handle_get_settings).put(handle_put_settings),
        )
        .route("/api/config", get(handle_get_config).put(handle_put_config))
        .route("/api/heating-curve", get(handle_get_heating_curve))
        .route(
            "/api/heating-curve/confirm",
            post(handle_confirm_boiler_setpoint),
        )
        .route("/api/timezone", put(handle_put_timezone));
    if let Ok(web_root) = std::env::var("HEATING_WEB_DIR") {
        info!("serving static files from {web_root}");
        app = app.fallback_service(ServeDir::new(web_root));
    }
    let app = app.with_state(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(app_state.shutdown.clone()))
        .await?;

    // Taking the lock waits out a cycle that is still running.
    drop(app_state.system.lock().await);
    persist_all(&app_state).await?;
    if let Err(err) = app_state.mqtt.disconnect().await {
        debug!("mqtt disconnect failed: {err}");
    }
    info!("controller stopped");
    Ok(())
}

async fn shutdown_signal(flag: Arc<AtomicBool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    flag.store(true, Ordering::Relaxed);
}

fn subscribe_topics(mqtt: &AsyncClient, prefix: &str) {
    let topics = [
        topics::entity_state_filter(prefix),
        topics::zone_command_filter(prefix),
    ];

    for topic in topics {
        if let Err(err) = mqtt.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
            warn!("failed to subscribe to {topic}: {err}");
        }
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload).await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    subscribe_topics(&app_state.mqtt, &app_state.prefix);
                }
                Ok(_) => {}
                Err(err) => {
                    if app_state.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        tokio::time::sleep(STARTUP_GRACE).await;

        loop {
            if app_state.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if let Err(err) = run_cycle(&app_state).await {
                warn!("control cycle failed: {err:#}");
            }

            let interval_ms = app_state.system.lock().await.config().cycle_interval_ms;
            tokio::time::sleep(Duration::from_millis(interval_ms.max(MIN_CYCLE_INTERVAL_MS)))
                .await;
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        loop {
            let interval_ms = app_state
                .system
                .lock()
                .await
                .config()
                .state_publish_interval_ms;
            tokio::time::sleep(Duration::from_millis(interval_ms.max(MIN_CYCLE_INTERVAL_MS)))
                .await;
            if app_state.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let status = controller_status(&app_state).await;
            for zone in &status.zones {
                publish_retained(
                    &app_state.mqtt,
                    topics::zone_state(&app_state.prefix, &zone.id),
                    zone,
                )
                .await;
            }
            publish_retained(
                &app_state.mqtt,
                topics::controller_state(&app_state.prefix),
                &status.summary,
            )
            .await;
        }
    });
}

async fn publish_retained<T: Serialize>(mqtt: &AsyncClient, topic: String, value: &T) {
    match serde_json::to_vec(value) {
        Ok(body) => {
            if let Err(err) = mqtt.publish(topic.as_str(), QoS::AtLeastOnce, true, body).await {
                warn!("state publish to {topic} failed: {err}");
            }
        }
        Err(err) => warn!("state serialization for {topic} failed: {err}"),
    }
}

/// Runs one cycle and persists its effects. Returns `None` once shutdown has begun.
async fn run_cycle(state: &AppState) -> anyhow::Result<Option<CycleReport>> {
    let now = current_time(state).await;
    let report = {
        let mut system = state.system.lock().await;
        // Shutdown may have been requested while waiting for the lock.
        if state.shutdown.load(Ordering::Relaxed) {
            return Ok(None);
        }
        system.tick(
            now,
            Collaborators {
                store: state.states.as_ref(),
                learning: state.learning.as_ref(),
                events: state.events.as_ref(),
            },
        )
    };
    persist_all(state).await?;
    Ok(Some(report))
}

async fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;

    if app_state.states.ingest(topic, message, Utc::now()).is_some() {
        return Ok(());
    }

    if let Some(zone_id) = topics::zone_from_command_topic(&app_state.prefix, topic) {
        let command: ZoneCommand =
            serde_json::from_str(message).context("invalid zone command payload")?;
        debug!(zone = zone_id, ?command, "zone command received over mqtt");
        apply_command(app_state, zone_id, command)
            .await
            .map_err(|err| anyhow::anyhow!("zone command for {zone_id} rejected: {err}"))?;
    }
    Ok(())
}

/// Applies a command, persists the zones and runs a cycle so devices follow right away.
/// The error is already a client-facing response.
async fn apply_command(
    state: &AppState,
    zone_id: &str,
    command: ZoneCommand,
) -> Result<(), CommandError> {
    {
        let mut system = state.system.lock().await;
        system
            .apply(zone_id, command, Utc::now())
            .map_err(CommandError::Rejected)?;
    }
    persist_zones(state).await.map_err(|err| {
        warn!("failed to persist zone update: {err:#}");
        CommandError::Persist
    })?;
    if let Err(err) = run_cycle(state).await {
        warn!(zone = zone_id, "cycle after command failed: {err:#}");
    }
    Ok(())
}

#[derive(Debug)]
enum CommandError {
    Rejected(HeatingError),
    Persist,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(err) => write!(f, "{err}"),
            Self::Persist => f.write_str("Failed to persist zones"),
        }
    }
}

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        match self {
            Self::Rejected(err) => heating_error_response(&err),
            Self::Persist => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist zones"),
        }
    }
}

async fn command_then_status(state: AppState, zone_id: String, command: ZoneCommand) -> Response {
    if let Err(err) = apply_command(&state, &zone_id, command).await {
        return err.into_response();
    }
    zone_status_response(&state, &zone_id).await
}

async fn zone_status_response(state: &AppState, zone_id: &str) -> Response {
    let now = current_time(state).await;
    let status = state.system.lock().await.status(zone_id, now);
    match status {
        Ok(status) => Json(status).into_response(),
        Err(err) => heating_error_response(&err),
    }
}

async fn controller_status(state: &AppState) -> ControllerStatus {
    let now = current_time(state).await;
    let timezone = state.timezone.lock().await.clone();
    let system = state.system.lock().await;
    ControllerStatus {
        timezone,
        time_synced: state.time_synced.load(Ordering::Relaxed),
        known_entities: state.states.entity_count(),
        summary: system
            .last_report()
            .map(CycleSummary::from_report)
            .unwrap_or_default(),
        zones: system.statuses(now),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(controller_status(&state).await)
}

async fn handle_run_cycle(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(err) = run_cycle(&state).await {
        warn!("manual cycle failed: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Control cycle failed");
    }
    handle_get_status(State(state)).await.into_response()
}

async fn handle_list_zones(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.system.lock().await.zones())
}

async fn handle_create_zone(
    State(state): State<AppState>,
    Json(request): Json<ZoneCreate>,
) -> impl IntoResponse {
    let name = request.name.unwrap_or_else(|| request.id.clone());
    let response = command_then_status(state, request.id, ZoneCommand::Create { name }).await;
    if response.status() == StatusCode::OK {
        return (StatusCode::CREATED, response).into_response();
    }
    response
}

async fn handle_get_zone(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
) -> impl IntoResponse {
    zone_status_response(&state, &zone_id).await
}

async fn handle_delete_zone(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
) -> impl IntoResponse {
    match apply_command(&state, &zone_id, ZoneCommand::Delete).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle_zone_command(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Json(command): Json<ZoneCommand>,
) -> impl IntoResponse {
    if command == ZoneCommand::Delete {
        return handle_delete_zone(State(state), Path(zone_id)).await.into_response();
    }
    command_then_status(state, zone_id, command).await
}

async fn handle_set_target(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let temperature = match required_param::<f32>(&params, "value") {
        Ok(value) => value,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    command_then_status(state, zone_id, ZoneCommand::SetTarget { temperature }).await
}

async fn handle_start_boost(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let temperature = match optional_param::<f32>(&params, "temperature") {
        Ok(value) => value,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    let duration_minutes = match optional_param::<u32>(&params, "minutes") {
        Ok(value) => value,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    command_then_status(
        state,
        zone_id,
        ZoneCommand::StartBoost {
            temperature,
            duration_minutes,
        },
    )
    .await
}

async fn handle_cancel_boost(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
) -> impl IntoResponse {
    command_then_status(state, zone_id, ZoneCommand::CancelBoost).await
}

async fn handle_put_schedules(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Json(schedules): Json<Vec<Schedule>>,
) -> impl IntoResponse {
    command_then_status(state, zone_id, ZoneCommand::ReplaceSchedules { schedules }).await
}

async fn handle_add_schedule(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Json(schedule): Json<Schedule>,
) -> impl IntoResponse {
    command_then_status(state, zone_id, ZoneCommand::AddSchedule { schedule }).await
}

async fn handle_delete_schedule(
    State(state): State<AppState>,
    Path((zone_id, schedule_id)): Path<(String, String)>,
) -> impl IntoResponse {
    command_then_status(state, zone_id, ZoneCommand::RemoveSchedule { schedule_id }).await
}

async fn handle_assign_device(
    State(state): State<AppState>,
    Path((zone_id, device_id)): Path<(String, String)>,
    Json(entry): Json<DeviceEntry>,
) -> impl IntoResponse {
    command_then_status(state, zone_id, ZoneCommand::AssignDevice { device_id, entry }).await
}

async fn handle_remove_device(
    State(state): State<AppState>,
    Path((zone_id, device_id)): Path<(String, String)>,
) -> impl IntoResponse {
    command_then_status(state, zone_id, ZoneCommand::RemoveDevice { device_id }).await
}

async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.system.lock().await.settings().clone())
}

async fn handle_put_settings(
    State(state): State<AppState>,
    Json(settings): Json<GlobalSettings>,
) -> impl IntoResponse {
    state.system.lock().await.update_settings(settings);
    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist settings update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }
    handle_get_settings(State(state)).await.into_response()
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.system.lock().await.config().clone())
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(config): Json<ControllerConfig>,
) -> impl IntoResponse {
    if let Err(message) = validate_controller_config(&config) {
        return error_response(StatusCode::BAD_REQUEST, message);
    }
    state.system.lock().await.update_config(config);
    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist controller config update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }
    handle_get_config(State(state)).await.into_response()
}

async fn handle_get_heating_curve(State(state): State<AppState>) -> impl IntoResponse {
    let system = state.system.lock().await;
    let curve = system.curve();
    Json(HeatingCurveView {
        enabled: system.settings().boiler.heating_curve.enabled,
        system: curve.system(),
        coefficient: curve.coefficient(),
        optimal_coefficient: curve.optimal_coefficient(),
        derivative: curve.derivative(),
        value: curve.value(),
    })
}

async fn handle_confirm_boiler_setpoint(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let setpoint = match required_param::<f32>(&params, "setpoint") {
        Ok(value) => value,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    let result = state.system.lock().await.confirm_boiler_setpoint(setpoint);
    if let Err(err) = result {
        return heating_error_response(&err);
    }
    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist heating curve: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }
    handle_get_heating_curve(State(state)).await.into_response()
}

async fn handle_put_timezone(
    State(state): State<AppState>,
    Json(update): Json<TimezoneUpdate>,
) -> impl IntoResponse {
    if update.timezone.parse::<Tz>().is_err() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid timezone value");
    }

    {
        let mut timezone = state.timezone.lock().await;
        *timezone = update.timezone;
    }

    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist timezone update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    handle_get_status(State(state)).await.into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("HEATING_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heating"));
        Self::at(&data_dir)
    }

    fn at(data_dir: &FsPath) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            zones_path: Arc::new(data_dir.join("zones.json")),
            learning_path: Arc::new(data_dir.join("learning.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        self.load(&self.runtime_path).await
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        self.save(&self.runtime_path, runtime).await
    }

    async fn load_zones(&self) -> anyhow::Result<Vec<Zone>> {
        self.load(&self.zones_path).await
    }

    async fn save_zones(&self, zones: &[Zone]) -> anyhow::Result<()> {
        self.save(&self.zones_path, &zones).await
    }

    async fn load_learning(&self) -> anyhow::Result<LearningData> {
        self.load(&self.learning_path).await
    }

    async fn save_learning(&self, data: &LearningData) -> anyhow::Result<()> {
        self.save(&self.learning_path, data).await
    }

    async fn load<T: DeserializeOwned + Default>(&self, path: &FsPath) -> anyhow::Result<T> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice::<T>(&raw)
                .with_context(|| format!("failed to parse {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Skips the write when the file already holds the same bytes.
    async fn save<T: Serialize + ?Sized>(&self, path: &FsPath, value: &T) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let payload = serde_json::to_vec_pretty(value)?;
        if matches!(tokio::fs::read(path).await, Ok(existing) if existing == payload) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

async fn persist_zones(state: &AppState) -> anyhow::Result<()> {
    let zones = state.system.lock().await.zones();
    state.store.save_zones(&zones).await
}

async fn persist_runtime_from_state(state: &AppState) -> anyhow::Result<()> {
    let (controller, settings, curve) = {
        let system = state.system.lock().await;
        (
            system.config().clone(),
            system.settings().clone(),
            system.curve_state(),
        )
    };
    let timezone = state.timezone.lock().await.clone();
    let mut runtime = state.store.load_runtime_config().await?;
    runtime.controller = controller;
    runtime.settings = settings;
    runtime.curve = curve;
    runtime.timezone = timezone;
    state.store.save_runtime_config(&runtime).await
}

async fn persist_all(state: &AppState) -> anyhow::Result<()> {
    persist_zones(state).await?;
    persist_runtime_from_state(state).await?;
    if let Some(data) = state.learning.take_dirty() {
        state.store.save_learning(&data).await?;
    }
    Ok(())
}

async fn current_time(state: &AppState) -> DateTime<FixedOffset> {
    let timezone = state.timezone.lock().await.clone();
    let now = now_in_timezone(&timezone);
    state.time_synced.store(now.is_some(), Ordering::Relaxed);
    now.unwrap_or_else(|| Utc::now().fixed_offset())
}

fn now_in_timezone(timezone: &str) -> Option<DateTime<FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

fn validate_controller_config(config: &ControllerConfig) -> Result<(), &'static str> {
    if config.cycle_interval_ms < MIN_CYCLE_INTERVAL_MS {
        return Err("cycle_interval_ms must be at least 1000");
    }
    if config.state_publish_interval_ms < MIN_CYCLE_INTERVAL_MS {
        return Err("state_publish_interval_ms must be at least 1000");
    }
    if config.min_valid_temp_c >= config.max_valid_temp_c {
        return Err("min_valid_temp_c must be below max_valid_temp_c");
    }
    if !(0.0..=2.0).contains(&config.thermostat_setpoint_deadband_c) {
        return Err("thermostat_setpoint_deadband_c must be between 0 and 2");
    }
    if !(1..=1440).contains(&config.boost_default_minutes) {
        return Err("boost_default_minutes must be between 1 and 1440");
    }
    Ok(())
}

fn optional_param<T: FromStr>(
    params: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, String> {
    match params.get(key).map(|raw| raw.trim()) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("Invalid '{key}' parameter")),
    }
}

fn required_param<T: FromStr>(params: &HashMap<String, String>, key: &str) -> Result<T, String> {
    optional_param(params, key)?.ok_or_else(|| format!("Missing '{key}' parameter"))
}

fn status_for(err: &HeatingError) -> StatusCode {
    match err {
        err if err.is_configuration() => StatusCode::NOT_FOUND,
        HeatingError::Validation(_) => StatusCode::BAD_REQUEST,
        HeatingError::SensorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        HeatingError::Actuation { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn heating_error_response(err: &HeatingError) -> Response {
    error_response(status_for(err), &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
