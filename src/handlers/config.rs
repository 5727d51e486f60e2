//! Runtime configuration endpoints.
//!
//! Only the `session` section can change while the server runs. New sessions
//! pick up the change; open sessions keep the defaults they started with.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.get_config()
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let patch = body.into_inner();
    let object = patch
        .as_object()
        .ok_or_else(|| AppError::BadRequest("Expected a JSON object".to_string()))?;
    if let Some(key) = object.keys().find(|key| key.as_str() != "session") {
        return Err(AppError::BadRequest(format!(
            "Section '{}' cannot be changed at runtime",
            key
        )));
    }

    let mut updated = state.get_config();
    updated
        .update_from_json(&patch.to_string())
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    state
        .update_config(updated.clone())
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    tracing::info!(session = ?updated.session, "Session defaults updated");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": updated
    })))
}
