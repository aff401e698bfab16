use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use powerclimate_common::{
    config::EntityBinding, entity_from_state_topic, parse_device_command_topic,
    set_hvac_mode_topic, set_temperature_topic, ControlError, ControllerConfig, ControllerStatus,
    DeviceCommand, HvacMode, ManualToggle, Observation, Preset, RuntimeConfig, ThermostatEngine,
    TOPIC_CMD_DEVICE_FILTER, TOPIC_CMD_MODE, TOPIC_CMD_PRESET, TOPIC_CMD_TARGET,
    TOPIC_CONTROLLER_STATE, TOPIC_STATE_FILTER,
};

use crate::store::JsonTimerStore;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<ThermostatEngine>>,
    events: mpsc::Sender<ControlEvent>,
    status: watch::Receiver<ControllerStatus>,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    data_dir: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug)]
enum ControlEvent {
    EntityState { entity_id: String, payload: String },
    /// Settings changed outside the control task; tick without waiting.
    Kick,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClimatePayload {
    hvac_mode: Option<String>,
    current_temperature: Option<f64>,
    temperature: Option<f64>,
}

/// Climate payloads carry the entity's attribute blob, so this is looser than
/// a plain sensor reading would need.
const MAX_MQTT_PAYLOAD_BYTES: usize = 4096;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.settings.sanitize();

    let mut engine = ThermostatEngine::new(runtime.controller.clone(), runtime.settings.clone())
        .with_context(|| {
            format!(
                "invalid controller configuration in {}",
                store.runtime_path().display()
            )
        })?;
    engine.attach_store(Box::new(JsonTimerStore::open(store.timers_path()).await));

    let global = &runtime.controller.global;
    let tick_period = Duration::from_millis(global.tick_interval_ms);
    let publish_period = Duration::from_millis(global.state_publish_interval_ms.max(1_000));

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("powerclimate-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    let (events, pending_events) = mpsc::channel(256);
    let (status_tx, status) = watch::channel(engine.status(now_ms()));

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        events,
        status,
        mqtt,
        store,
    };

    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone(), pending_events, status_tx, tick_period);
    spawn_state_publish_loop(app_state.clone(), publish_period);

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/target", post(handle_set_target))
        .route("/api/mode", post(handle_set_mode))
        .route("/api/preset", post(handle_set_preset))
        .route("/api/devices/{id}/mode", post(handle_set_device_mode))
        .route(
            "/api/devices/{id}/power-budget",
            post(handle_set_power_budget).delete(handle_clear_power_budget),
        )
        .route("/api/config", get(handle_get_config).put(handle_put_config))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.http_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// Subscriptions are re-issued on every connect since the session is clean.
fn subscribe_topics(mqtt: &AsyncClient) {
    let topics = [
        TOPIC_STATE_FILTER,
        TOPIC_CMD_TARGET,
        TOPIC_CMD_MODE,
        TOPIC_CMD_PRESET,
        TOPIC_CMD_DEVICE_FILTER,
    ];

    for topic in topics {
        if let Err(err) = mqtt.try_subscribe(topic, QoS::AtMostOnce) {
            warn!(topic, "mqtt subscribe failed: {err}");
        }
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    subscribe_topics(&app_state.mqtt);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// The only task that ticks the engine. Entity updates and control changes
/// are funnelled through `events` so every tick sees a consistent input set.
fn spawn_control_loop(
    app_state: AppState,
    mut events: mpsc::Receiver<ControlEvent>,
    status: watch::Sender<ControllerStatus>,
    period: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                Some(event) = events.recv() => {
                    if let ControlEvent::EntityState { entity_id, payload } = event {
                        apply_entity_state(&app_state, &entity_id, &payload).await;
                    }
                }
            }

            let now_ms = now_ms();
            let (commands, snapshot) = {
                let mut engine = app_state.engine.lock().await;
                let commands = engine.tick(now_ms);
                (commands, engine.status(now_ms))
            };

            dispatch_commands(&app_state.mqtt, &commands);
            status.send_replace(snapshot);
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;

            let payload = {
                let status = app_state.status.borrow();
                serde_json::to_vec(&*status)
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    });
}

async fn apply_entity_state(app_state: &AppState, entity_id: &str, payload: &str) {
    let now_ms = now_ms();
    let target_changed = {
        let mut engine = app_state.engine.lock().await;

        let observation = match engine.config().binding(entity_id) {
            Some(EntityBinding::DeviceClimate(_)) => parse_climate_payload(payload),
            Some(_) => parse_numeric_payload(payload),
            None => {
                debug!(entity = entity_id, "ignoring state of unwatched entity");
                return;
            }
        };
        let Some(observation) = observation else {
            debug!(entity = entity_id, payload, "unparseable entity state");
            return;
        };
        let before = engine.settings().target_temperature;
        engine.observe(entity_id, observation, now_ms);
        (engine.settings().target_temperature - before).abs() > f64::EPSILON
    };

    // A setpoint copied from a device is a settings change like any other.
    if target_changed {
        if let Err(err) = persist_runtime_from_state(app_state).await {
            warn!("failed to persist copied target: {err:#}");
        }
    }
}

/// Commands are fire-and-forget; a dropped one is re-derived on a later tick
/// once the device reports a state that disagrees with the plan.
fn dispatch_commands(mqtt: &AsyncClient, commands: &[DeviceCommand]) {
    for command in commands {
        let (topic, payload) = command_message(command);
        match mqtt.try_publish(topic.as_str(), QoS::AtLeastOnce, false, payload) {
            Ok(()) => debug!(topic = %topic, "device command sent"),
            Err(err) => warn!(
                entity = command.entity_id(),
                "device command publish failed: {err}"
            ),
        }
    }
}

fn command_message(command: &DeviceCommand) -> (String, String) {
    match command {
        DeviceCommand::SetHvacMode { entity_id, mode } => (
            set_hvac_mode_topic(entity_id),
            mode.as_command().to_string(),
        ),
        DeviceCommand::SetTemperature {
            entity_id,
            temperature,
        } => (set_temperature_topic(entity_id), format!("{temperature:.1}")),
    }
}

/// Numeric sensor state such as `20.5`, `812 W` or `-1.4 kW`. Returns `None`
/// for payloads that should be dropped rather than treated as unavailable.
fn parse_numeric_payload(payload: &str) -> Option<Observation> {
    let trimmed = payload.trim();
    if matches!(
        trimmed.to_ascii_lowercase().as_str(),
        "" | "unavailable" | "unknown" | "none"
    ) {
        return Some(Observation::Numeric(None));
    }

    let (number, unit) = match trimmed.split_once(char::is_whitespace) {
        Some((number, unit)) => (number, unit.trim()),
        None => (trimmed, ""),
    };
    let value = number.parse::<f64>().ok().filter(|value| value.is_finite())?;
    let scale = if unit.eq_ignore_ascii_case("kw") {
        1_000.0
    } else if unit.is_empty() || unit.eq_ignore_ascii_case("w") || unit == "°C" {
        1.0
    } else {
        return None;
    };
    Some(Observation::Numeric(Some(value * scale)))
}

/// Climate state as JSON (`{"hvac_mode": "heat", "current_temperature": 20.5,
/// "temperature": 21}`) or a bare HVAC mode string.
fn parse_climate_payload(payload: &str) -> Option<Observation> {
    let trimmed = payload.trim();
    if !trimmed.starts_with('{') {
        return Some(Observation::Climate {
            hvac_mode: HvacMode::from_reported(trimmed),
            current_temperature: None,
            target_temperature: None,
        });
    }

    let climate = serde_json::from_str::<ClimatePayload>(trimmed).ok()?;
    Some(Observation::Climate {
        hvac_mode: climate
            .hvac_mode
            .as_deref()
            .and_then(HvacMode::from_reported),
        current_temperature: climate
            .current_temperature
            .filter(|value| value.is_finite()),
        target_temperature: climate.temperature.filter(|value| value.is_finite()),
    })
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let message = message.trim();

    if let Some(entity_id) = entity_from_state_topic(topic) {
        app_state
            .events
            .send(ControlEvent::EntityState {
                entity_id: entity_id.to_string(),
                payload: message.to_string(),
            })
            .await
            .context("control loop stopped")?;
        return Ok(());
    }

    let now_ms = now_ms();
    let settings_changed = match topic {
        TOPIC_CMD_TARGET => match message.parse::<f64>() {
            Ok(target) => app_state.engine.lock().await.set_target_temperature(target),
            Err(_) => {
                warn!(payload = message, "invalid target temperature");
                false
            }
        },
        TOPIC_CMD_MODE => match HvacMode::parse(message) {
            Some(mode) => app_state.engine.lock().await.set_hvac_mode(mode),
            None => {
                warn!(payload = message, "invalid thermostat mode");
                false
            }
        },
        TOPIC_CMD_PRESET => match Preset::parse(message) {
            Some(preset) => app_state.engine.lock().await.set_preset(preset),
            None => {
                warn!(payload = message, "invalid preset");
                false
            }
        },
        _ => {
            if let Some((device_id, command)) = parse_device_command_topic(topic) {
                if let Err(err) =
                    handle_device_command(app_state, device_id, command, message, now_ms).await
                {
                    warn!(device = device_id, command, "device command rejected: {err}");
                }
            }
            false
        }
    };

    if settings_changed {
        persist_runtime_from_state(app_state).await?;
        kick(app_state).await;
    }
    Ok(())
}

async fn handle_device_command(
    app_state: &AppState,
    device_id: &str,
    command: &str,
    message: &str,
    now_ms: u64,
) -> anyhow::Result<()> {
    match command {
        "mode" => {
            let mode = HvacMode::parse(message).context("mode must be HEAT or OFF")?;
            let outcome = app_state
                .engine
                .lock()
                .await
                .request_device_mode(device_id, mode, now_ms)?;
            match outcome {
                ManualToggle::Applied(commands) => dispatch_commands(&app_state.mqtt, &commands),
                ManualToggle::Unchanged => return Ok(()),
                ManualToggle::Blocked(block) => anyhow::bail!("blocked by {}", block.describe()),
            }
        }
        "power_budget" => {
            let mut engine = app_state.engine.lock().await;
            if message.is_empty() || message.eq_ignore_ascii_case("clear") {
                engine.clear_power_budget(device_id)?;
            } else {
                let watts = message.parse::<f64>().context("budget must be watts")?;
                engine.set_power_budget(device_id, watts)?;
            }
        }
        other => anyhow::bail!("unknown device command {other}"),
    }

    kick(app_state).await;
    Ok(())
}

async fn kick(app_state: &AppState) {
    if app_state.events.send(ControlEvent::Kick).await.is_err() {
        warn!("control loop stopped, change applies on restart");
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    Json(status)
}

/// Status computed on the spot so a response reflects the change it answers.
async fn respond_with_status(state: &AppState) -> axum::response::Response {
    let status = state.engine.lock().await.status(now_ms());
    Json(status).into_response()
}

async fn handle_set_target(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(target) = value.parse::<f64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };

    let changed = {
        let mut engine = state.engine.lock().await;
        engine.set_target_temperature(target)
    };
    settings_updated(&state, changed, "target").await
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(mode) = HvacMode::parse(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid mode. Use 'HEAT' or 'OFF'");
    };

    let changed = state.engine.lock().await.set_hvac_mode(mode);
    settings_updated(&state, changed, "mode").await
}

async fn handle_set_preset(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(preset) = Preset::parse(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid preset. Use 'none', 'boost', 'away' or 'solar'",
        );
    };

    let changed = state.engine.lock().await.set_preset(preset);
    settings_updated(&state, changed, "preset").await
}

async fn settings_updated(
    state: &AppState,
    changed: bool,
    what: &'static str,
) -> axum::response::Response {
    if changed {
        if let Err(err) = persist_runtime_from_state(state).await {
            warn!("failed to persist {what} update: {err:#}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist runtime settings",
            );
        }
        kick(state).await;
    }
    respond_with_status(state).await
}

async fn handle_set_device_mode(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(mode) = HvacMode::parse(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid mode. Use 'HEAT' or 'OFF'");
    };

    let outcome = state
        .engine
        .lock()
        .await
        .request_device_mode(&device_id, mode, now_ms());
    match outcome {
        Ok(ManualToggle::Applied(commands)) => {
            dispatch_commands(&state.mqtt, &commands);
            kick(&state).await;
        }
        Ok(ManualToggle::Unchanged) => {}
        Ok(ManualToggle::Blocked(block)) => {
            return error_response(
                StatusCode::CONFLICT,
                &format!("Blocked by {}", block.describe()),
            );
        }
        Err(err) => return control_error_response(&err),
    }
    respond_with_status(&state).await
}

async fn handle_set_power_budget(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(watts) = value.parse::<f64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid power budget");
    };

    let result = state
        .engine
        .lock()
        .await
        .set_power_budget(&device_id, watts);
    if let Err(err) = result {
        return control_error_response(&err);
    }
    kick(&state).await;
    respond_with_status(&state).await
}

async fn handle_clear_power_budget(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    let result = state.engine.lock().await.clear_power_budget(&device_id);
    match result {
        Ok(true) => kick(&state).await,
        Ok(false) => {}
        Err(err) => return control_error_response(&err),
    }
    respond_with_status(&state).await
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.engine.lock().await.config().clone();
    Json(config)
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(config): Json<ControllerConfig>,
) -> impl IntoResponse {
    let result = state.engine.lock().await.reconfigure(config.clone());
    if let Err(err) = result {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }

    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist controller config: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist controller config",
        );
    }
    kick(&state).await;
    Json(config).into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("POWERCLIMATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.powerclimate"));

        Self {
            data_dir: Arc::new(data_dir),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn runtime_path(&self) -> PathBuf {
        self.data_dir.join("runtime.json")
    }

    fn timers_path(&self) -> PathBuf {
        self.data_dir.join("timers.json")
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(self.data_dir.as_ref()).await?;
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(self.runtime_path(), payload).await?;
        Ok(())
    }
}

async fn persist_runtime_from_state(state: &AppState) -> anyhow::Result<()> {
    let (settings, controller) = {
        let engine = state.engine.lock().await;
        (engine.settings().clone(), engine.config().clone())
    };

    let mut runtime = state.store.load_runtime_config().await?;
    runtime.settings = settings;
    runtime.controller = controller;
    state.store.save_runtime_config(&runtime).await
}

fn control_error_response(err: &ControlError) -> axum::response::Response {
    let status = match err {
        ControlError::UnknownDevice(_) => StatusCode::NOT_FOUND,
        ControlError::DeviceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ControlError::PrimaryModeForced | ControlError::NotInSolar => StatusCode::CONFLICT,
        ControlError::NoNetPowerSensor | ControlError::InvalidBudget(_) => StatusCode::BAD_REQUEST,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Milliseconds on a monotonic clock anchored to the wall clock at first use.
/// Persisted dwell timestamps stay comparable across restarts, and an NTP
/// step while running cannot move time backwards.
fn now_ms() -> u64 {
    static ANCHOR: OnceLock<(u64, Instant)> = OnceLock::new();
    let (wall_ms, started) = ANCHOR.get_or_init(|| {
        (
            Utc::now().timestamp_millis().try_into().unwrap_or(0),
            Instant::now(),
        )
    });
    let elapsed_ms: u64 = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
    wall_ms.saturating_add(elapsed_ms)
}
