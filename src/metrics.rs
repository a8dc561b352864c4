use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

pub struct Metrics {
    pub registry: Registry,
    pub ai_jobs_total: IntCounterVec,
    pub transcriptions_total: IntCounterVec,
    pub ws_messages_total: IntCounterVec,
    pub rooms_active: IntGauge,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let ai_jobs_total = IntCounterVec::new(
            Opts::new("senseboard_ai_jobs_total", "AI jobs by kind and outcome"),
            &["kind", "outcome"],
        )
        .unwrap();
        let transcriptions_total = IntCounterVec::new(
            Opts::new(
                "senseboard_transcriptions_total",
                "Transcription attempts by provider and outcome",
            ),
            &["provider", "outcome"],
        )
        .unwrap();
        let ws_messages_total = IntCounterVec::new(
            Opts::new(
                "senseboard_ws_messages_total",
                "Accepted websocket client messages by type",
            ),
            &["type"],
        )
        .unwrap();
        let rooms_active = IntGauge::new("senseboard_rooms_active", "Rooms held in memory").unwrap();

        registry.register(Box::new(ai_jobs_total.clone())).unwrap();
        registry
            .register(Box::new(transcriptions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(ws_messages_total.clone()))
            .unwrap();
        registry.register(Box::new(rooms_active.clone())).unwrap();

        Self {
            registry,
            ai_jobs_total,
            transcriptions_total,
            ws_messages_total,
            rooms_active,
        }
    }

    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buf)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

/// Process-wide metrics handle.
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::new)
}
