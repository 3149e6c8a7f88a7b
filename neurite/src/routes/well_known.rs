use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::config::Config;
use crate::routes::config_err;
use crate::state::AppState;
use neurite_core::MatrixError;

/// The client-server API versions this server implements.
const SUPPORTED_VERSIONS: [&str; 5] = ["v1.2", "v1.3", "v1.4", "v1.5", "v1.6"];

/// The well-known discovery document, also embedded in login responses.
pub fn client_well_known(base_url: &str, identity_server: Option<&str>) -> Value {
    let mut doc = json!({
        "m.homeserver": { "base_url": base_url },
    });
    if let Some(identity) = identity_server {
        doc["m.identity_server"] = json!({ "base_url": identity });
    }
    doc
}

/// `GET /.well-known/matrix/client`
pub async fn client(State(state): State<AppState>) -> Result<Json<Value>, MatrixError> {
    let config = Config::load(&state.db).await.map_err(config_err)?;
    Ok(Json(client_well_known(
        &config.base_url(),
        config.identity_server.as_deref(),
    )))
}

/// `GET /_matrix/client/versions`
pub async fn versions() -> Json<Value> {
    Json(json!({ "versions": SUPPORTED_VERSIONS }))
}
