use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::Json;
use serde_json::{json, Map, Value};

use crate::auth::{require_user, RequestToken};
use crate::config::Config;
use crate::routes::{config_err, decode_body};
use crate::state::AppState;
use crate::users::User;
use neurite_core::{Errcode, MatrixError, UserId};

/// Keys a user may set on their own profile. Everything else is readable
/// but rejected on write.
const WRITABLE_KEYS: [&str; 2] = ["displayname", "avatar_url"];

async fn lock_local_user(
    state: &AppState,
    name: &str,
) -> Result<(User, Config), MatrixError> {
    let config = Config::load(&state.db).await.map_err(config_err)?;

    let Some(user_id) = UserId::parse(name, &config.server_name) else {
        return Err(MatrixError::new(Errcode::InvalidParam).with_message("Invalid user ID."));
    };
    if !user_id.is_local_to(&config.server_name) {
        return Err(MatrixError::new(Errcode::Forbidden)
            .with_message("Profile lookup over federation is not supported."));
    }

    let Some(user) = User::lock(&state.db, &user_id.local)
        .await
        .map_err(crate::internal)?
    else {
        return Err(MatrixError::new(Errcode::NotFound).with_message("Couldn't find user."));
    };

    Ok((user, config))
}

/// `GET /profile/{user}`
pub async fn get_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, MatrixError> {
    let (user, _config) = lock_local_user(&state, &name).await?;

    let mut response = Map::new();
    for key in WRITABLE_KEYS {
        if let Some(value) = user.get_profile(key) {
            response.insert(key.to_string(), json!(value));
        }
    }

    user.unlock(&state.db).await.map_err(crate::internal)?;
    Ok(Json(Value::Object(response)))
}

/// `GET /profile/{user}/{key}`
pub async fn get_profile_key(
    State(state): State<AppState>,
    Path((name, key)): Path<(String, String)>,
) -> Result<Json<Value>, MatrixError> {
    let (user, _config) = lock_local_user(&state, &name).await?;

    let mut response = Map::new();
    if let Some(value) = user.get_profile(&key) {
        response.insert(key, json!(value));
    }

    user.unlock(&state.db).await.map_err(crate::internal)?;
    Ok(Json(Value::Object(response)))
}

/// `PUT /profile/{user}/{key}`
pub async fn set_profile_key(
    State(state): State<AppState>,
    Path((name, key)): Path<(String, String)>,
    token: RequestToken,
    body: Bytes,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let config = Config::load(db).await.map_err(config_err)?;

    let request = decode_body(&body)?;

    if !WRITABLE_KEYS.contains(&key.as_str()) {
        return Err(MatrixError::new(Errcode::Unrecognized)
            .with_message("Invalid property being changed."));
    }

    let Some(user_id) = UserId::parse(&name, &config.server_name) else {
        return Err(MatrixError::new(Errcode::InvalidParam).with_message("Invalid user ID."));
    };

    let mut user = require_user(db, &token).await?;
    if !user_id.is_local_to(&config.server_name) || user_id.local != user.name() {
        return Err(MatrixError::new(Errcode::Forbidden)
            .with_message("Cannot change another user's profile."));
    }

    if let Some(value) = request.get(&key).and_then(Value::as_str) {
        user.set_profile(&key, value);
    }

    user.unlock(db).await.map_err(crate::internal)?;
    Ok(Json(json!({})))
}
