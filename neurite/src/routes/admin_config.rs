use axum::body::Bytes;
use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::auth::{require_user, RequestToken};
use crate::config::{merge, Config, ConfigError};
use crate::internal;
use crate::routes::{config_err, decode_body};
use crate::state::AppState;
use crate::users::{Privileges, User};
use neurite_core::{Errcode, MatrixError};
use neurite_db::Db;

async fn require_config_admin(db: &Db, token: &RequestToken) -> Result<User, MatrixError> {
    let user = require_user(db, token).await?;
    if !user.privileges().contains(Privileges::CONFIG) {
        return Err(MatrixError::new(Errcode::Forbidden)
            .with_message("User does not have the 'CONFIG' privilege."));
    }
    Ok(user)
}

fn validation_err(e: ConfigError) -> MatrixError {
    match e {
        ConfigError::Invalid(msg) => MatrixError::new(Errcode::BadJson).with_message(msg),
        other => config_err(other),
    }
}

/// `GET /config` returns the raw configuration tree.
pub async fn get_config(
    State(state): State<AppState>,
    token: RequestToken,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let user = require_config_admin(db, &token).await?;

    let (r, _config) = Config::lock(db).await.map_err(config_err)?;
    let tree = r.json().clone();
    db.unlock(r).await.map_err(internal)?;

    user.unlock(db).await.map_err(internal)?;
    Ok(Json(Value::Object(tree)))
}

/// `POST /config` replaces the whole tree, if the replacement validates.
pub async fn replace_config(
    State(state): State<AppState>,
    token: RequestToken,
    body: Bytes,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let user = require_config_admin(db, &token).await?;

    let replacement = decode_body(&body)?;
    Config::parse(&replacement).map_err(validation_err)?;

    let (mut r, _current) = Config::lock(db).await.map_err(config_err)?;
    r.set_json(replacement);
    db.unlock(r).await.map_err(internal)?;

    user.unlock(db).await.map_err(internal)?;
    Ok(Json(json!({ "restart_required": true })))
}

/// `PUT /config` merges a partial tree over the current one, validating
/// the merged result before it is stored.
pub async fn merge_config(
    State(state): State<AppState>,
    token: RequestToken,
    body: Bytes,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let user = require_config_admin(db, &token).await?;

    let patch = decode_body(&body)?;

    let (mut r, _current) = Config::lock(db).await.map_err(config_err)?;
    let mut merged = r.json().clone();
    merge(&mut merged, &patch);

    if let Err(e) = Config::parse(&merged) {
        // Dropping the reference discards the attempted change.
        drop(r);
        return Err(validation_err(e));
    }

    r.set_json(merged);
    db.unlock(r).await.map_err(internal)?;

    user.unlock(db).await.map_err(internal)?;
    Ok(Json(json!({ "restart_required": true })))
}
