use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Report the effective configuration with credentials redacted.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "session": {
                "max_sessions_per_user": config.session.max_sessions_per_user,
                "stop_cooldown_ms": config.session.stop_cooldown_ms
            },
            "recognition": {
                "endpoint": config.recognition.endpoint,
                "language": config.recognition.language,
                "sample_rate": config.recognition.sample_rate
            },
            "synthesis": {
                "endpoint": config.synthesis.endpoint,
                "language": config.synthesis.language,
                "voice": config.synthesis.voice,
                "sample_rate": config.synthesis.sample_rate,
                "encoding": config.synthesis.encoding
            },
            "generation": {
                "endpoint": config.generation.endpoint,
                "configured": !config.generation.endpoint.is_empty(),
                "api_key": config.generation.api_key
            }
        }
    })))
}
