// Prometheus metrics definitions for the Pong backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Rooms currently held in memory.
    pub static ref ACTIVE_ROOMS: IntGauge =
        IntGauge::new("pong_active_rooms", "Rooms currently held in memory").unwrap();

    /// Live WebSocket connections.
    pub static ref CONNECTED_WEBSOCKETS: IntGauge =
        IntGauge::new("pong_connected_websockets", "Live WebSocket connections").unwrap();

    /// Users with at least one authenticated connection.
    pub static ref ONLINE_USERS: IntGauge =
        IntGauge::new("pong_online_users", "Users with at least one authenticated connection").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Total games started, by room kind (casual, tournament).
    pub static ref GAMES_STARTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pong_games_started_total", "Total games started"),
        &["kind"],
    )
    .unwrap();

    /// Total games completed, by room kind and end reason (win, forfeit).
    pub static ref GAMES_COMPLETED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pong_games_completed_total", "Total games completed"),
        &["kind", "reason"],
    )
    .unwrap();

    /// Total WebSocket messages sent to clients.
    pub static ref WEBSOCKET_MESSAGES_SENT_TOTAL: IntCounter = IntCounter::new(
        "pong_websocket_messages_sent_total",
        "Total WebSocket messages sent",
    )
    .unwrap();

    /// Result or bracket writes that failed and were dropped.
    pub static ref PERSISTENCE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "pong_persistence_failures_total",
        "Match result writes that failed",
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Game duration in seconds, by room kind.
    pub static ref GAME_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("pong_game_duration_seconds", "Game duration in seconds")
            .buckets(vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0]),
        &["kind"],
    )
    .unwrap();

    /// Per-tick processing time in milliseconds.
    pub static ref GAME_TICK_DURATION_MS: Histogram = Histogram::with_opts(
        HistogramOpts::new("pong_game_tick_duration_ms", "Per-tick processing time in ms")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVE_ROOMS.clone()),
        Box::new(CONNECTED_WEBSOCKETS.clone()),
        Box::new(ONLINE_USERS.clone()),
        Box::new(GAMES_STARTED_TOTAL.clone()),
        Box::new(GAMES_COMPLETED_TOTAL.clone()),
        Box::new(WEBSOCKET_MESSAGES_SENT_TOTAL.clone()),
        Box::new(PERSISTENCE_FAILURES_TOTAL.clone()),
        Box::new(GAME_DURATION_SECONDS.clone()),
        Box::new(GAME_TICK_DURATION_MS.clone()),
    ];

    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            tracing::warn!("Failed to register metric: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
