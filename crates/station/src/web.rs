use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, RawQuery, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::ambient::{AmbientSensor, Climate};
use crate::bus::Wuc;
use crate::config::{self, HttpConfig, LoginConfig, PlantConfig};
use crate::station::{PlantId, SharedState, Station};

const INDEX_HTML: &str = include_str!("ui/index.html");

const REALM: &str = r#"Basic realm="plant""#;

#[derive(Clone)]
pub struct AppState {
    pub station: SharedState,
    pub wuc: Arc<Wuc>,
    pub ambient: Arc<dyn AmbientSensor>,
    pub login: Arc<LoginConfig>,
    /// Where accepted plant config changes are written.
    pub config_path: Arc<PathBuf>,
}

type ApiError = (StatusCode, String);

fn internal(e: impl Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/config", get(get_config).put(put_config))
        .route("/water", get(water))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_login));

    Router::new()
        .route("/", get(index))
        .route("/data", get(data))
        .route("/weight", get(weight))
        .route("/limit", get(limit))
        .route("/ht", get(ht))
        .route("/calc", get(calc))
        .route("/echo", get(echo))
        .merge(protected)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct PlantQuery {
    i: Option<String>,
}

impl PlantQuery {
    fn plant(&self) -> PlantId {
        PlantId::from_query(self.i.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct WaterQuery {
    i: Option<String>,
    t: Option<i32>,
}

#[derive(Debug, Serialize)]
struct WaterResponse {
    index: PlantId,
    ms: i32,
}

#[derive(Debug, Serialize)]
struct CalcResponse {
    dryout: i32,
    scale: i32,
    offset: i32,
}

#[derive(Debug, Serialize)]
struct EchoResponse {
    sent: Vec<u8>,
    received: Vec<u8>,
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn data(State(app): State<AppState>) -> Json<Station> {
    let st = app.station.read().await;
    Json(st.clone())
}

// -- Authenticated ----------------------------------------------------------

async fn require_login(State(app): State<AppState>, req: Request, next: Next) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| check_basic_auth(v, &app.login));

    if !authorized {
        warn!(path = %req.uri().path(), "unauthorized request");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, REALM)],
            "unauthorized",
        )
            .into_response();
    }
    next.run(req).await
}

/// Check an `Authorization: Basic ...` header value against the login.
fn check_basic_auth(value: &str, login: &LoginConfig) -> bool {
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    credentials
        .split_once(':')
        .is_some_and(|(user, pass)| user == login.user && pass == login.pass)
}

async fn get_config(
    State(app): State<AppState>,
    Query(q): Query<PlantQuery>,
) -> Json<PlantConfig> {
    let st = app.station.read().await;
    Json(st.plant(q.plant()).config)
}

/// Merge the body into one plant's config, persist both plants, and only
/// then commit in memory.
async fn put_config(
    State(app): State<AppState>,
    Query(q): Query<PlantQuery>,
    body: Bytes,
) -> Result<&'static str, ApiError> {
    let id = q.plant();
    let mut st = app.station.write().await;

    let updated = config::merge_plant_config(&st.plant(id).config, &body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{e:#}")))?;

    let mut configs = st.plants.each_ref().map(|p| p.config);
    configs[id.index()] = updated;
    config::save_plant_configs(&app.config_path, &configs).map_err(|e| {
        warn!(plant = %id, "failed to save plant config: {e:#}");
        internal(format!("{e:#}"))
    })?;

    st.plants[id.index()].config = updated;
    info!(plant = %id, config = ?updated, "config saved");
    Ok("config saved")
}

async fn water(State(app): State<AppState>, Query(q): Query<WaterQuery>) -> Json<WaterResponse> {
    let id = PlantId::from_query(q.i.as_deref());

    let ms = match q.t {
        Some(requested) => {
            info!(plant = %id, requested, "manual watering");
            app.wuc.do_watering(id, requested).await
        }
        None => app.wuc.read_last_watering(id).await.unwrap_or_else(|e| {
            warn!(plant = %id, "failed to read last watering time: {e}");
            0
        }),
    };

    Json(WaterResponse { index: id, ms })
}

// -- Live sensor reads ------------------------------------------------------

async fn weight(State(app): State<AppState>) -> Result<Json<Vec<Option<i32>>>, ApiError> {
    let readings = app.wuc.read_weights().await.map_err(|e| {
        warn!("failed to read weights: {e}");
        internal(e)
    })?;
    Ok(Json(readings.iter().map(|r| r.clone().ok()).collect()))
}

async fn limit(
    State(app): State<AppState>,
    Query(q): Query<PlantQuery>,
) -> Result<Json<u8>, ApiError> {
    let id = q.plant();
    let value = app.wuc.read_watering_limit(id).await.map_err(|e| {
        warn!(plant = %id, "failed to read watering limit: {e}");
        internal(e)
    })?;
    Ok(Json(value))
}

async fn ht(State(app): State<AppState>) -> Result<Json<Climate>, ApiError> {
    let climate = app.ambient.sample().await.map_err(|e| {
        warn!("failed to read humidity and temperature: {e:#}");
        internal(format!("{e:#}"))
    })?;
    Ok(Json(climate))
}

// -- Diagnostics ------------------------------------------------------------

async fn calc(State(app): State<AppState>, Query(q): Query<PlantQuery>) -> Json<CalcResponse> {
    let st = app.station.read().await;
    let fit = st.calculate_dryout_and_watering_time(q.plant());
    Json(CalcResponse {
        dryout: fit.dryout,
        scale: fit.calibration.scale,
        offset: fit.calibration.offset,
    })
}

/// Collect every `d=<byte>` query parameter in order.
fn parse_echo_bytes(query: Option<&str>) -> Result<Vec<u8>, String> {
    query
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| *key == "d")
        .map(|(_, value)| {
            value
                .parse::<u8>()
                .map_err(|e| format!("invalid byte {value:?}: {e}"))
        })
        .collect()
}

async fn echo(
    State(app): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Json<EchoResponse>, ApiError> {
    let sent =
        parse_echo_bytes(query.as_deref()).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    let received = app.wuc.echo(&sent).await.map_err(|e| {
        warn!("echo failed: {e}");
        internal(e)
    })?;
    Ok(Json(EchoResponse { sent, received }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Serve until the listener fails. TLS is used when cert and key are set.
pub async fn serve(app: Router, http: &HttpConfig) -> Result<()> {
    let addr: SocketAddr = http
        .addr
        .parse()
        .with_context(|| format!("invalid http address: {}", http.addr))?;

    match (&http.cert, &http.key) {
        (Some(cert), Some(key)) => serve_tls(app, addr, cert, key).await,
        _ => serve_plain(app, addr).await,
    }
}

async fn serve_plain(app: Router, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "web ui listening on http");
    axum::serve(listener, app).await.context("web server error")
}

#[cfg(feature = "tls")]
async fn serve_tls(
    app: Router,
    addr: SocketAddr,
    cert: &std::path::Path,
    key: &std::path::Path,
) -> Result<()> {
    let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
        .await
        .with_context(|| format!("failed to load tls key pair {}", cert.display()))?;
    info!(%addr, "web ui listening on https");
    axum_server::bind_rustls(addr, tls)
        .serve(app.into_make_service())
        .await
        .context("web server error")
}

#[cfg(not(feature = "tls"))]
async fn serve_tls(
    app: Router,
    addr: SocketAddr,
    _cert: &std::path::Path,
    _key: &std::path::Path,
) -> Result<()> {
    warn!("tls support not compiled in, serving plain http");
    serve_plain(app, addr).await
}

// ===========================================================================
// Tests
// ===========================================================================
