//! Zone reconciliation: merges locally persisted zone metadata with polled
//! backend telemetry into one display snapshot, and keeps the local store
//! consistent with the backend under periodic polling.
//!
//! ## Cycle shape
//!
//! ```text
//! read store ──▶ ping ──ok──▶ union ids ──▶ fetch latest (joint) ──▶ merge ──▶ persist
//!     │            │
//!     │          fail
//!     └────────────┴──▶ degraded snapshot from stored metadata only
//! ```
//!
//! One task owns the cycle. Interval ticks produce silent cycles, manual
//! refreshes arrive over a trigger channel, and triggers that pile up while
//! a cycle is in flight coalesce into at most one follow-up cycle.

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::state::SharedState;
use crate::store::Store;
use crate::zone::{
    build_display_zone, is_connected_zone, palette_color, DisplayZone, Mode, StoredZone,
};

// ---------------------------------------------------------------------------
// Cycle types
// ---------------------------------------------------------------------------

/// Who asked for this cycle. `Initial` and `Refresh` toggle the snapshot's
/// visibility indicators; `Silent` interval ticks never touch them and never
/// surface errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Initial,
    Refresh,
    Silent,
}

impl CycleKind {
    fn rank(self) -> u8 {
        match self {
            Self::Silent => 0,
            Self::Refresh => 1,
            Self::Initial => 2,
        }
    }

    /// The more user-visible of two queued cycle requests.
    pub fn coalesce(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Refresh => write!(f, "refresh"),
            Self::Silent => write!(f, "silent"),
        }
    }
}

/// Immutable result of one reconciliation cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub kind: CycleKind,
    /// True when the backend was unreachable and the snapshot was rebuilt
    /// from stored metadata alone.
    pub degraded: bool,
    pub zones: Vec<DisplayZone>,
}

#[derive(Debug, PartialEq)]
pub enum DeleteOutcome {
    Deleted(Vec<DisplayZone>),
    Protected,
    NotFound,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    api: ApiClient,
    store: Store,
    connected_zone_id: String,
    seed: StoredZone,
}

impl Reconciler {
    pub fn new(api: ApiClient, store: Store, connected_zone_id: String, seed: StoredZone) -> Self {
        Self {
            api,
            store,
            connected_zone_id,
            seed,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Run one full reconciliation cycle and return the new snapshot.
    ///
    /// Never fails: backend errors degrade to cached state, store write
    /// errors are logged and swallowed.
    pub async fn run_cycle(&self, kind: CycleKind) -> CycleOutcome {
        // 1. Stored metadata, seeding the default zone on first run.
        let mut stored = self.store.read_zones().await;
        if stored.is_empty() {
            stored = vec![self.seed.clone()];
            if let Err(e) = self.store.write_zones(&stored).await {
                warn!("store: failed to write seed zone: {e:#}");
            }
        }

        // 2. Authoritative roster. Unreachable backend → degraded snapshot.
        let ping = match self.api.ping().await {
            Ok(ping) => ping,
            Err(e) => {
                if kind == CycleKind::Silent {
                    debug!(kind = %kind, "ping failed, serving cached state: {e:#}");
                } else {
                    warn!(kind = %kind, "ping failed, serving cached state: {e:#}");
                }
                return self.degraded_outcome(&stored, kind);
            }
        };

        // 3. Remote ids first, then stored-only ids; first occurrence wins.
        let mut ids: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for id in ping.zones.iter().chain(stored.iter().map(|z| &z.id)) {
            if seen.insert(id.clone()) {
                ids.push(id.clone());
            }
        }

        // 4. Metadata precedence: stored record wins wholesale; zones the
        // store has never seen get the backend-announced mode and a palette
        // color by position.
        let stored_by_id: HashMap<&str, &StoredZone> =
            stored.iter().map(|z| (z.id.as_str(), z)).collect();
        let metas: Vec<StoredZone> = ids
            .iter()
            .enumerate()
            .map(|(idx, id)| match stored_by_id.get(id.as_str()) {
                Some(&existing) => {
                    let mut meta = existing.clone();
                    if meta.color.is_none() {
                        meta.color = Some(palette_color(idx).to_string());
                    }
                    meta
                }
                None => StoredZone {
                    color: Some(palette_color(idx).to_string()),
                    mode: ping.modes.get(id).copied().unwrap_or_default(),
                    ..StoredZone::bare(id)
                },
            })
            .collect();

        // 5. Latest telemetry for every id, dispatched jointly. A zone whose
        // fetch fails simply merges without telemetry; the batch survives.
        let mut fetches = JoinSet::new();
        for id in ids.clone() {
            let api = self.api.clone();
            fetches.spawn(async move {
                let telemetry = match api.latest(&id).await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(zone = %id, "latest fetch failed: {e:#}");
                        None
                    }
                };
                (id, telemetry)
            });
        }
        let mut telemetry_by_id = HashMap::new();
        while let Some(joined) = fetches.join_next().await {
            if let Ok((id, Some(telemetry))) = joined {
                telemetry_by_id.insert(id, telemetry);
            }
        }

        let zones: Vec<DisplayZone> = metas
            .iter()
            .map(|meta| build_display_zone(meta, telemetry_by_id.remove(&meta.id)))
            .collect();

        // 6. Persist the merged set, best-effort.
        let to_persist: Vec<StoredZone> = zones.iter().map(DisplayZone::to_stored).collect();
        if let Err(e) = self.store.write_zones(&to_persist).await {
            warn!("store: failed to persist reconciled zones: {e:#}");
        }

        if kind == CycleKind::Silent {
            debug!(kind = %kind, zones = zones.len(), "cycle reconciled");
        } else {
            info!(kind = %kind, zones = zones.len(), "cycle reconciled");
        }

        CycleOutcome {
            kind,
            degraded: false,
            zones,
        }
    }

    /// Snapshot built purely from stored metadata. Not persisted: there is
    /// nothing new to write back.
    fn degraded_outcome(&self, stored: &[StoredZone], kind: CycleKind) -> CycleOutcome {
        let zones = stored
            .iter()
            .enumerate()
            .map(|(idx, meta)| {
                let mut meta = meta.clone();
                if meta.color.is_none() {
                    meta.color = Some(palette_color(idx).to_string());
                }
                build_display_zone(&meta, None)
            })
            .collect();
        CycleOutcome {
            kind,
            degraded: true,
            zones,
        }
    }

    // ----------------------------
    // User intents
    // ----------------------------

    /// Remove a zone from the given snapshot and persist the reduced set.
    /// The connected zone is protected regardless of what the UI asks for;
    /// a persist failure is logged but the in-memory removal stands.
    pub async fn delete_zone(&self, zones: &[DisplayZone], id: &str) -> DeleteOutcome {
        if is_connected_zone(id, &self.connected_zone_id) {
            return DeleteOutcome::Protected;
        }
        if !zones.iter().any(|z| z.id == id) {
            return DeleteOutcome::NotFound;
        }

        let next: Vec<DisplayZone> = zones.iter().filter(|z| z.id != id).cloned().collect();
        let to_persist: Vec<StoredZone> = next.iter().map(DisplayZone::to_stored).collect();
        if let Err(e) = self.store.write_zones(&to_persist).await {
            warn!(zone = %id, "store: failed to persist deletion: {e:#}");
        }
        info!(zone = %id, remaining = next.len(), "zone deleted");
        DeleteOutcome::Deleted(next)
    }

    /// Append a user-created zone to the store and return its record.
    pub async fn create_zone(&self, name: &str, image: Option<String>) -> Result<StoredZone> {
        let name = name.trim();
        if name.is_empty() {
            bail!("zone name is empty");
        }

        let mut zones = self.store.read_zones().await;
        let zone = StoredZone {
            id: now_unix_millis().to_string(),
            name: Some(name.to_string()),
            color: Some(palette_color(zones.len()).to_string()),
            image,
            water_level: 80,
            last_update: Some(now_rfc3339()),
            mode: Mode::Auto,
        };
        zones.push(zone.clone());
        self.store
            .write_zones(&zones)
            .await
            .context("failed to persist new zone")?;
        info!(zone = %zone.id, "zone created");
        Ok(zone)
    }

    /// Optimistically apply a mode change locally, then ask the backend.
    /// On backend failure the local mode is rolled back and the error
    /// propagates for the caller to surface.
    pub async fn set_mode(&self, id: &str, next: Mode) -> Result<Mode> {
        let previous = self.apply_mode_locally(id, next).await;
        match self.api.set_mode(id, next).await {
            Ok(applied) => {
                info!(zone = %id, mode = %applied, "mode changed");
                Ok(applied)
            }
            Err(e) => {
                self.apply_mode_locally(id, previous.unwrap_or_default())
                    .await;
                Err(e).with_context(|| format!("mode change for zone '{id}' failed"))
            }
        }
    }

    /// Fire a pump command and return once the backend acknowledged it.
    pub async fn pump(&self, id: &str, on: bool) -> Result<()> {
        self.api
            .send_command(id, on)
            .await
            .with_context(|| format!("pump command for zone '{id}' failed"))?;
        info!(zone = %id, on, "pump command sent");
        Ok(())
    }

    /// Update one zone's stored mode, seeding a bare record if the store has
    /// never seen the id. Returns the prior mode when the record existed.
    async fn apply_mode_locally(&self, id: &str, mode: Mode) -> Option<Mode> {
        let mut zones = self.store.read_zones().await;
        let mut previous = None;
        match zones.iter_mut().find(|z| z.id == id) {
            Some(zone) => {
                previous = Some(zone.mode);
                zone.mode = mode;
            }
            None => zones.push(StoredZone {
                mode,
                ..StoredZone::bare(id)
            }),
        }
        if let Err(e) = self.store.write_zones(&zones).await {
            warn!(zone = %id, "store: failed to persist mode: {e:#}");
        }
        previous
    }
}

// ---------------------------------------------------------------------------
// Polling task
// ---------------------------------------------------------------------------

/// Run the reconciliation loop. Intended to be `tokio::spawn`-ed from main.
///
/// One `initial` cycle at startup, then interval ticks (silent) interleaved
/// with channel triggers (refresh). The loop ends when every trigger sender
/// is gone.
pub async fn run(
    reconciler: Arc<Reconciler>,
    shared: SharedState,
    mut triggers: mpsc::Receiver<CycleKind>,
    poll_interval: Duration,
    critical_moisture: u8,
) {
    info!(
        poll_sec = poll_interval.as_secs(),
        "reconciliation loop started"
    );

    execute_cycle(&reconciler, &shared, CycleKind::Initial, critical_moisture).await;

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick is immediate; the initial cycle covered it

    loop {
        let kind = tokio::select! {
            _ = ticker.tick() => CycleKind::Silent,
            trigger = triggers.recv() => match trigger {
                Some(kind) => kind,
                None => break,
            },
        };
        // Anything queued while the previous cycle ran collapses into this
        // one cycle instead of running back-to-back.
        let kind = drain_triggers(&mut triggers, kind);
        execute_cycle(&reconciler, &shared, kind, critical_moisture).await;
    }

    info!("reconciliation loop stopped");
}

fn drain_triggers(triggers: &mut mpsc::Receiver<CycleKind>, first: CycleKind) -> CycleKind {
    let mut kind = first;
    while let Ok(queued) = triggers.try_recv() {
        kind = kind.coalesce(queued);
    }
    kind
}

async fn execute_cycle(
    reconciler: &Reconciler,
    shared: &SharedState,
    kind: CycleKind,
    critical_moisture: u8,
) {
    {
        let mut st = shared.write().await;
        st.begin_cycle(kind);
    }
    let outcome = reconciler.run_cycle(kind).await;
    let mut st = shared.write().await;
    st.apply_cycle(outcome, critical_moisture);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    fn temp_store(tag: &str) -> Store {
        let root: PathBuf = std::env::temp_dir().join(format!(
            "irrigation-agent-reconcile-{}-{tag}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        Store::open(root).unwrap()
    }

    async fn spawn_backend(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn reconciler_for(addr: SocketAddr, store: Store) -> Reconciler {
        let api = ApiClient::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        Reconciler::new(api, store, "area-main".into(), StoredZone::bare("area-main"))
    }

    /// Reconciler pointed at a port with no listener.
    async fn offline_reconciler(store: Store) -> Reconciler {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        reconciler_for(addr, store)
    }

    fn stored(id: &str, level: u8) -> StoredZone {
        StoredZone {
            id: id.into(),
            name: Some(format!("Zone {id}")),
            color: Some("#e0f2f1".into()),
            image: None,
            water_level: level,
            last_update: Some("2026-08-01T10:00:00Z".into()),
            mode: Mode::Auto,
        }
    }

    /// Backend with a fixed roster and per-zone latest payloads; ids listed
    /// in `failing` answer `/api/latest` with a 500.
    fn fake_backend(
        roster: Vec<&str>,
        latest: HashMap<String, serde_json::Value>,
        failing: Vec<&str>,
    ) -> Router {
        let roster: Vec<String> = roster.into_iter().map(String::from).collect();
        let failing: Vec<String> = failing.into_iter().map(String::from).collect();
        Router::new()
            .route(
                "/api/ping",
                get(move || {
                    let roster = roster.clone();
                    async move { Json(json!({"ok": true, "zones": roster, "modes": {}})) }
                }),
            )
            .route(
                "/api/latest",
                get(move |Query(params): Query<HashMap<String, String>>| {
                    let latest = latest.clone();
                    let failing = failing.clone();
                    async move {
                        let id = params.get("area_id").cloned().unwrap_or_default();
                        if failing.contains(&id) {
                            return Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
                        }
                        match latest.get(&id) {
                            Some(data) => Ok(Json(json!({"ok": true, "data": data}))),
                            None => Ok(Json(json!({"ok": false, "data": null}))),
                        }
                    }
                }),
            )
    }

    // -- Full cycle merge ---------------------------------------------------

    #[tokio::test]
    async fn telemetry_wins_over_stored_and_is_persisted() {
        let store = temp_store("merge");
        store.write_zones(&[stored("z1", 50)]).await.unwrap();

        let latest = HashMap::from([(
            "z1".to_string(),
            json!({"area_id": "z1", "moist": 70.0, "ts": "2026-08-01T12:00:00Z"}),
        )]);
        let addr = spawn_backend(fake_backend(vec!["z1"], latest, vec![])).await;
        let reconciler = reconciler_for(addr, store.clone());

        let outcome = reconciler.run_cycle(CycleKind::Refresh).await;
        assert!(!outcome.degraded);
        assert_eq!(outcome.zones.len(), 1);
        assert_eq!(outcome.zones[0].water_level, 70);
        assert_eq!(outcome.zones[0].dryness, 30);
        assert_eq!(
            outcome.zones[0].last_update.as_deref(),
            Some("2026-08-01T12:00:00Z")
        );

        // The merged state is what the store holds afterwards.
        let persisted = store.read_zones().await;
        assert_eq!(persisted[0].water_level, 70);
        assert_eq!(
            persisted[0].last_update.as_deref(),
            Some("2026-08-01T12:00:00Z")
        );
    }

    #[tokio::test]
    async fn union_is_remote_first_deduped_then_stored_only() {
        let store = temp_store("union");
        store
            .write_zones(&[stored("local-a", 40), stored("remote-1", 60)])
            .await
            .unwrap();

        let addr = spawn_backend(fake_backend(
            vec!["remote-1", "remote-2", "remote-1"],
            HashMap::new(),
            vec![],
        ))
        .await;
        let reconciler = reconciler_for(addr, store);

        let outcome = reconciler.run_cycle(CycleKind::Silent).await;
        let ids: Vec<&str> = outcome.zones.iter().map(|z| z.id.as_str()).collect();
        assert_eq!(ids, vec!["remote-1", "remote-2", "local-a"]);

        // The zone the store has never seen gets generated metadata.
        let fresh = &outcome.zones[1];
        assert_eq!(fresh.name, "Remote 2");
        assert_eq!(fresh.color, palette_color(1));
    }

    #[tokio::test]
    async fn per_zone_fetch_failure_is_isolated() {
        let store = temp_store("isolated");
        store
            .write_zones(&[stored("z1", 10), stored("z2", 20), stored("z3", 30)])
            .await
            .unwrap();

        let latest = HashMap::from([
            ("z1".to_string(), json!({"area_id": "z1", "moist": 91.0})),
            ("z3".to_string(), json!({"area_id": "z3", "moist": 93.0})),
        ]);
        let addr =
            spawn_backend(fake_backend(vec!["z1", "z2", "z3"], latest, vec!["z2"])).await;
        let reconciler = reconciler_for(addr, store);

        let outcome = reconciler.run_cycle(CycleKind::Silent).await;
        assert!(!outcome.degraded);
        let by_id: HashMap<&str, &DisplayZone> =
            outcome.zones.iter().map(|z| (z.id.as_str(), z)).collect();
        assert_eq!(by_id["z1"].water_level, 91);
        assert_eq!(by_id["z3"].water_level, 93);
        // The failed zone keeps its stored values.
        assert_eq!(by_id["z2"].water_level, 20);
        assert!(by_id["z2"].telemetry.is_none());
    }

    #[tokio::test]
    async fn no_data_zone_falls_back_to_stored_values() {
        let store = temp_store("no-data");
        store.write_zones(&[stored("z1", 45)]).await.unwrap();

        let addr = spawn_backend(fake_backend(vec!["z1"], HashMap::new(), vec![])).await;
        let reconciler = reconciler_for(addr, store);

        let outcome = reconciler.run_cycle(CycleKind::Silent).await;
        assert_eq!(outcome.zones[0].water_level, 45);
        assert_eq!(outcome.zones[0].dryness, 55);
    }

    // -- Degraded mode ------------------------------------------------------

    #[tokio::test]
    async fn ping_failure_serves_stored_zones_degraded() {
        let store = temp_store("degraded");
        store
            .write_zones(&[stored("z1", 40), stored("z2", 70)])
            .await
            .unwrap();
        let reconciler = offline_reconciler(store.clone()).await;

        let outcome = reconciler.run_cycle(CycleKind::Refresh).await;
        assert!(outcome.degraded);
        assert_eq!(outcome.zones.len(), 2);
        assert_eq!(outcome.zones[0].water_level, 40);

        // Degraded cycles have nothing new to persist.
        assert_eq!(store.read_zones().await.len(), 2);
    }

    #[tokio::test]
    async fn first_run_seeds_the_default_zone() {
        let store = temp_store("seed");
        let reconciler = offline_reconciler(store.clone()).await;

        let outcome = reconciler.run_cycle(CycleKind::Initial).await;
        assert!(outcome.degraded);
        assert_eq!(outcome.zones.len(), 1);
        assert_eq!(outcome.zones[0].id, "area-main");
        assert_eq!(outcome.zones[0].name, "Area main");

        let persisted = store.read_zones().await;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, "area-main");
    }

    // -- Deletion -----------------------------------------------------------

    #[tokio::test]
    async fn delete_protected_zone_is_a_noop() {
        let store = temp_store("del-protected");
        store.write_zones(&[stored("area-main", 50)]).await.unwrap();
        let reconciler = offline_reconciler(store.clone()).await;
        let zones = reconciler.run_cycle(CycleKind::Silent).await.zones;

        let outcome = reconciler.delete_zone(&zones, "area-main").await;
        assert_eq!(outcome, DeleteOutcome::Protected);
        assert_eq!(store.read_zones().await.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_exactly_one_and_persists() {
        let store = temp_store("del-ok");
        store
            .write_zones(&[stored("area-main", 50), stored("orchard", 60)])
            .await
            .unwrap();
        let reconciler = offline_reconciler(store.clone()).await;
        let zones = reconciler.run_cycle(CycleKind::Silent).await.zones;

        match reconciler.delete_zone(&zones, "orchard").await {
            DeleteOutcome::Deleted(next) => {
                assert_eq!(next.len(), 1);
                assert_eq!(next[0].id, "area-main");
            }
            other => panic!("expected Deleted, got {other:?}"),
        }

        let persisted = store.read_zones().await;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, "area-main");
    }

    #[tokio::test]
    async fn delete_unknown_zone_is_not_found() {
        let store = temp_store("del-missing");
        store.write_zones(&[stored("area-main", 50)]).await.unwrap();
        let reconciler = offline_reconciler(store.clone()).await;
        let zones = reconciler.run_cycle(CycleKind::Silent).await.zones;

        assert_eq!(
            reconciler.delete_zone(&zones, "ghost").await,
            DeleteOutcome::NotFound
        );
    }

    // -- Zone creation ------------------------------------------------------

    #[tokio::test]
    async fn create_zone_appends_with_defaults() {
        let store = temp_store("create");
        store.write_zones(&[stored("area-main", 50)]).await.unwrap();
        let reconciler = offline_reconciler(store.clone()).await;

        let zone = reconciler
            .create_zone("  Rose bed  ", Some("file:///rose.jpg".into()))
            .await
            .unwrap();
        assert_eq!(zone.name.as_deref(), Some("Rose bed"));
        assert_eq!(zone.color.as_deref(), Some(palette_color(1)));
        assert_eq!(zone.water_level, 80);
        assert_eq!(zone.mode, Mode::Auto);
        assert!(zone.last_update.is_some());

        let persisted = store.read_zones().await;
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[1].id, zone.id);
    }

    #[tokio::test]
    async fn create_zone_rejects_blank_name() {
        let store = temp_store("create-blank");
        let reconciler = offline_reconciler(store).await;
        assert!(reconciler.create_zone("   ", None).await.is_err());
    }

    // -- Mode change --------------------------------------------------------

    #[tokio::test]
    async fn set_mode_applies_locally_and_remotely() {
        let store = temp_store("mode-ok");
        store.write_zones(&[stored("z1", 50)]).await.unwrap();

        let router = Router::new().route(
            "/api/set-mode",
            post(|Query(params): Query<HashMap<String, String>>| async move {
                Json(json!({"ok": true, "area_id": params["area_id"], "mode": params["mode"]}))
            }),
        );
        let addr = spawn_backend(router).await;
        let reconciler = reconciler_for(addr, store.clone());

        let applied = reconciler.set_mode("z1", Mode::Manual).await.unwrap();
        assert_eq!(applied, Mode::Manual);
        assert_eq!(store.read_zones().await[0].mode, Mode::Manual);
    }

    #[tokio::test]
    async fn set_mode_rolls_back_on_backend_failure() {
        let store = temp_store("mode-rollback");
        store.write_zones(&[stored("z1", 50)]).await.unwrap();
        let reconciler = offline_reconciler(store.clone()).await;

        assert!(reconciler.set_mode("z1", Mode::Manual).await.is_err());
        assert_eq!(store.read_zones().await[0].mode, Mode::Auto);
    }

    // -- Trigger coalescing --------------------------------------------------

    #[tokio::test]
    async fn queued_triggers_collapse_to_most_visible_kind() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(CycleKind::Silent).await.unwrap();
        tx.send(CycleKind::Refresh).await.unwrap();
        tx.send(CycleKind::Silent).await.unwrap();

        let kind = drain_triggers(&mut rx, CycleKind::Silent);
        assert_eq!(kind, CycleKind::Refresh);
        assert!(rx.try_recv().is_err(), "queue fully drained");
    }

    #[test]
    fn coalesce_ranks_initial_over_refresh_over_silent() {
        assert_eq!(CycleKind::Silent.coalesce(CycleKind::Refresh), CycleKind::Refresh);
        assert_eq!(CycleKind::Refresh.coalesce(CycleKind::Silent), CycleKind::Refresh);
        assert_eq!(CycleKind::Refresh.coalesce(CycleKind::Initial), CycleKind::Initial);
        assert_eq!(CycleKind::Silent.coalesce(CycleKind::Silent), CycleKind::Silent);
    }
}
