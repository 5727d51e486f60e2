//! Service descriptor, health and metrics endpoints.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn service_info(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "model": config.backend.model,
        "endpoints": {
            "websocket": config.server.ws_path,
            "health": "/health",
            "metrics": "/metrics"
        }
    }))
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let sessions = state.registry.summary();
    let scheduler = state.scheduler.stats();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "backend": {
            "provider": state.backend_name,
            "model": config.backend.model,
            "available_slots": scheduler.available_slots,
            "max_concurrent": scheduler.max_concurrent
        },
        "sessions": {
            "active": sessions.active_sessions,
            "max": sessions.max_sessions
        },
        "system": load_status(sessions.active_sessions, sessions.max_sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "connections": {
            "total": metrics.connections_total,
            "rejected": metrics.connections_rejected,
            "active": metrics.active_connections
        },
        "sessions": state.registry.summary(),
        "audio_seconds_received": metrics.audio_ms_received as f64 / 1000.0,
        "inference": state.scheduler.stats(),
        "events": metrics.events_sent,
        "errors": {
            "total": metrics.error_count,
            "by_code": metrics.errors_by_code
        }
    }))
}

fn load_status(active: usize, max: usize) -> serde_json::Value {
    let usage = if max > 0 { active as f64 / max as f64 } else { 0.0 };

    let status = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (usage * 100.0).round()
    })
}
