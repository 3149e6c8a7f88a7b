use axum::body::Bytes;
use axum::extract::State;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::routes::{config_err, decode_body};
use crate::routes::well_known::client_well_known;
use crate::state::AppState;
use crate::users::User;
use neurite_core::{Errcode, MatrixError, UserId};

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(rename = "type")]
    kind: String,
    identifier: Map<String, Value>,
    password: String,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    initial_device_display_name: Option<String>,
    #[serde(default)]
    refresh_token: bool,
}

/// `GET /login` lists the login flows this server offers.
pub async fn flows() -> Json<Value> {
    Json(json!({ "flows": [ { "type": "m.login.password" } ] }))
}

/// `POST /login`
pub async fn login(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let config = Config::load(db).await.map_err(config_err)?;

    let request = decode_body(&body)?;
    let request: LoginRequest = serde_json::from_value(Value::Object(request))
        .map_err(|e| MatrixError::new(Errcode::BadJson).with_message(e.to_string()))?;

    if request.kind != "m.login.password" {
        return Err(MatrixError::new(Errcode::Unrecognized).with_message("Unsupported login type."));
    }

    let identifier_kind = match request.identifier.get("type") {
        None => {
            return Err(MatrixError::new(Errcode::MissingParam)
                .with_message("No login identifier type set."))
        }
        Some(Value::String(kind)) => kind.as_str(),
        Some(_) => {
            return Err(
                MatrixError::new(Errcode::BadJson).with_message("Invalid login identifier type.")
            )
        }
    };
    if identifier_kind != "m.id.user" {
        return Err(
            MatrixError::new(Errcode::Unrecognized).with_message("Invalid login identifier type.")
        );
    }

    let Some(name) = request.identifier.get("user").and_then(Value::as_str) else {
        return Err(MatrixError::new(Errcode::BadJson).with_message("Missing login identifier user."));
    };

    let Some(user_id) = UserId::parse(name, &config.server_name) else {
        return Err(MatrixError::new(Errcode::BadJson).with_message("Invalid user ID."));
    };
    if !user_id.is_local_to(&config.server_name) || !User::exists(db, &user_id.local) {
        return Err(MatrixError::new(Errcode::Forbidden).with_message("Unknown user ID."));
    }

    let Some(mut user) = User::lock(db, &user_id.local).await.map_err(crate::internal)? else {
        return Err(MatrixError::new(Errcode::Forbidden).with_message("Couldn't lock user."));
    };

    if user.deactivated() {
        // Drop discards the (unmutated) lock.
        return Err(MatrixError::new(Errcode::UserDeactivated));
    }

    let login_info = user
        .login(
            db,
            &request.password,
            request.device_id.as_deref(),
            request.initial_device_display_name.as_deref(),
            request.refresh_token,
        )
        .await
        .map_err(crate::internal)?;

    let Some(info) = login_info else {
        return Err(
            MatrixError::new(Errcode::Forbidden).with_message("Invalid credentials for user.")
        );
    };

    let mut response = Map::new();
    response.insert("access_token".into(), json!(info.access_token.token));
    response.insert("device_id".into(), json!(info.access_token.device_id));
    if request.refresh_token {
        response.insert("expires_in_ms".into(), json!(info.access_token.lifetime_ms));
        response.insert("refresh_token".into(), json!(info.refresh_token));
    }
    response.insert("user_id".into(), json!(user_id.to_string()));
    response.insert(
        "well_known".into(),
        client_well_known(&config.base_url(), config.identity_server.as_deref()),
    );

    user.unlock(db).await.map_err(crate::internal)?;
    Ok(Json(Value::Object(response)))
}
