//! Presentation API: serves the reconciled snapshot and dispatches user
//! intents (create/delete zone, mode change, pump command, manual refresh,
//! profile) back through the reconciler.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::warn;

use crate::reconcile::{CycleKind, DeleteOutcome, Reconciler};
use crate::state::SharedState;
use crate::zone::{DisplayZone, Mode};

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub reconciler: Arc<Reconciler>,
    pub triggers: mpsc::Sender<CycleKind>,
    pub critical_moisture: u8,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateZoneBody {
    name: String,
    #[serde(default)]
    image: Option<String>,
}

#[derive(Deserialize)]
struct SetModeBody {
    mode: Mode,
}

#[derive(Deserialize)]
struct PumpBody {
    order: u8,
}

#[derive(Deserialize)]
struct AutoBody {
    enabled: bool,
}

#[derive(Deserialize)]
struct HistoryParams {
    #[serde(default = "default_history_minutes")]
    minutes: u32,
}

fn default_history_minutes() -> u32 {
    60
}

#[derive(Deserialize)]
struct ProfileBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    image: Option<String>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/zones", get(list_zones).post(create_zone))
        .route("/api/zones/{id}", get(zone_detail).delete(delete_zone))
        .route("/api/zones/{id}/history", get(zone_history))
        .route("/api/zones/{id}/mode", post(set_mode))
        .route("/api/zones/{id}/pump", post(pump))
        .route("/api/refresh", post(refresh))
        .route("/api/auto", post(set_auto))
        .route("/api/profile", get(get_profile).put(put_profile))
        .with_state(state)
}

fn error_body(message: &str) -> Json<serde_json::Value> {
    Json(json!({"ok": false, "error": message}))
}

async fn list_zones(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status(state.critical_moisture))
}

async fn zone_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DisplayZone>, (StatusCode, Json<serde_json::Value>)> {
    let st = state.shared.read().await;
    st.zones
        .iter()
        .find(|z| z.id == id)
        .cloned()
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, error_body("unknown zone")))
}

async fn zone_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    match state.reconciler.api().history(&id, params.minutes).await {
        Ok(rows) => (StatusCode::OK, Json(json!({"ok": true, "data": rows}))),
        Err(e) => {
            warn!(zone = %id, "history fetch failed: {e:#}");
            (StatusCode::BAD_GATEWAY, error_body("history unavailable"))
        }
    }
}

async fn create_zone(
    State(state): State<AppState>,
    Json(body): Json<CreateZoneBody>,
) -> impl IntoResponse {
    match state.reconciler.create_zone(&body.name, body.image).await {
        Ok(zone) => {
            {
                let mut st = state.shared.write().await;
                st.record_command(format!("zone '{}' created", zone.id));
            }
            // The next cycle folds the new record into the snapshot.
            let _ = state.triggers.try_send(CycleKind::Refresh);
            (StatusCode::CREATED, Json(json!({"ok": true, "zone": zone})))
        }
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            error_body(&format!("{e:#}")),
        ),
    }
}

async fn delete_zone(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let zones = {
        let st = state.shared.read().await;
        st.zones.clone()
    };

    match state.reconciler.delete_zone(&zones, &id).await {
        DeleteOutcome::Protected => (
            StatusCode::CONFLICT,
            error_body("the connected zone cannot be deleted"),
        ),
        DeleteOutcome::NotFound => (StatusCode::NOT_FOUND, error_body("unknown zone")),
        DeleteOutcome::Deleted(next) => {
            let mut st = state.shared.write().await;
            st.zones = next;
            st.record_command(format!("zone '{id}' deleted"));
            (StatusCode::OK, Json(json!({"ok": true})))
        }
    }
}

async fn set_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SetModeBody>,
) -> impl IntoResponse {
    match state.reconciler.set_mode(&id, body.mode).await {
        Ok(applied) => {
            let mut st = state.shared.write().await;
            if let Some(zone) = st.zones.iter_mut().find(|z| z.id == id) {
                zone.mode = applied;
            }
            st.record_command(format!("zone '{id}' mode set to {applied}"));
            (
                StatusCode::OK,
                Json(json!({"ok": true, "id": id, "mode": applied})),
            )
        }
        Err(e) => {
            warn!(zone = %id, "mode change failed: {e:#}");
            let mut st = state.shared.write().await;
            st.record_error(format!("mode change for zone '{id}' failed"));
            (StatusCode::BAD_GATEWAY, error_body("mode change failed"))
        }
    }
}

async fn pump(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PumpBody>,
) -> impl IntoResponse {
    let mode = {
        let st = state.shared.read().await;
        st.zones.iter().find(|z| z.id == id).map(|z| z.mode)
    };
    let Some(mode) = mode else {
        return (StatusCode::NOT_FOUND, error_body("unknown zone"));
    };
    if mode == Mode::Auto {
        return (
            StatusCode::CONFLICT,
            error_body("zone is in auto mode; switch to manual for direct pump control"),
        );
    }

    let on = body.order == 1;
    match state.reconciler.pump(&id, on).await {
        Ok(()) => {
            {
                let mut st = state.shared.write().await;
                st.record_command(format!(
                    "pump {} for zone '{id}'",
                    if on { "started" } else { "stopped" }
                ));
            }
            // Nudge a silent cycle so the pump state shows up quickly.
            let _ = state.triggers.try_send(CycleKind::Silent);
            (StatusCode::OK, Json(json!({"ok": true})))
        }
        Err(e) => {
            warn!(zone = %id, "pump command failed: {e:#}");
            let mut st = state.shared.write().await;
            st.record_error(format!("pump command for zone '{id}' failed"));
            (StatusCode::BAD_GATEWAY, error_body("pump command failed"))
        }
    }
}

async fn set_auto(
    State(state): State<AppState>,
    Json(body): Json<AutoBody>,
) -> impl IntoResponse {
    match state.reconciler.api().set_auto(body.enabled).await {
        Ok(applied) => {
            {
                let mut st = state.shared.write().await;
                st.record_command(format!(
                    "auto watering {}",
                    if applied { "enabled" } else { "disabled" }
                ));
            }
            let _ = state.triggers.try_send(CycleKind::Silent);
            (StatusCode::OK, Json(json!({"ok": true, "auto": applied})))
        }
        Err(e) => {
            warn!("auto toggle failed: {e:#}");
            (StatusCode::BAD_GATEWAY, error_body("auto toggle failed"))
        }
    }
}

async fn refresh(State(state): State<AppState>) -> impl IntoResponse {
    // A full channel means a cycle is already pending; that one covers us.
    let _ = state.triggers.try_send(CycleKind::Refresh);
    (StatusCode::ACCEPTED, Json(json!({"ok": true})))
}

async fn get_profile(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.reconciler.store();
    Json(json!({
        "name": store.profile_name().await,
        "image": store.profile_image().await,
    }))
}

async fn put_profile(
    State(state): State<AppState>,
    Json(body): Json<ProfileBody>,
) -> impl IntoResponse {
    let store = state.reconciler.store();
    if let Some(name) = &body.name {
        if let Err(e) = store.set_profile_name(name).await {
            warn!("profile name write failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("profile write failed"),
            );
        }
    }
    if let Some(image) = &body.image {
        if let Err(e) = store.set_profile_image(image).await {
            warn!("profile image write failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("profile write failed"),
            );
        }
    }
    (StatusCode::OK, Json(json!({"ok": true})))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.expect("failed to bind web port");

    tracing::info!("presentation api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================
