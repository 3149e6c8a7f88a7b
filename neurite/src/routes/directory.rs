use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{json, Map, Value};

use crate::auth::{require_user, RequestToken};
use crate::config::Config;
use crate::routes::{config_err, decode_body};
use crate::state::AppState;
use crate::users::Privileges;
use neurite_core::{parse_common_id, valid_common_id, Errcode, MatrixError};
use neurite_db::{Db, DbRef};

/// Lock the alias directory, creating the record on first use.
async fn lock_aliases(db: &Db) -> Result<DbRef, MatrixError> {
    if let Some(r) = db.lock(&["aliases"]).await.map_err(crate::internal)? {
        return Ok(r);
    }
    match db.create(&["aliases"]).await {
        Ok(r) => Ok(r),
        Err(neurite_db::DbError::Exists) => db
            .lock(&["aliases"])
            .await
            .map_err(crate::internal)?
            .ok_or_else(|| {
                MatrixError::new(Errcode::Unknown)
                    .with_message("Unable to access alias database.")
            }),
        Err(e) => Err(crate::internal(e)),
    }
}

fn parse_alias(alias: &str) -> Result<(String, String), MatrixError> {
    parse_common_id(alias, '#')
        .ok_or_else(|| MatrixError::new(Errcode::InvalidParam).with_message("Invalid room alias."))
}

/// `GET /directory/room/{alias}`
pub async fn resolve(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> Result<Json<Value>, MatrixError> {
    parse_alias(&alias)?;

    let r = lock_aliases(&state.db).await?;
    let entry = r
        .json()
        .get("alias")
        .and_then(Value::as_object)
        .and_then(|aliases| aliases.get(&alias))
        .and_then(Value::as_object)
        .cloned();
    state.db.unlock(r).await.map_err(crate::internal)?;

    match entry {
        Some(entry) => Ok(Json(json!({
            "room_id": entry.get("id"),
            "servers": entry.get("servers"),
        }))),
        None => Err(MatrixError::new(Errcode::NotFound)
            .with_message("There is no mapped room ID for this room alias.")),
    }
}

/// `PUT /directory/room/{alias}`
pub async fn create(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    token: RequestToken,
    body: Bytes,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let config = Config::load(db).await.map_err(config_err)?;
    let (_, server) = parse_alias(&alias)?;

    let mut r = lock_aliases(db).await?;
    let user = require_user(db, &token).await?;

    if server != config.server_name {
        return Err(MatrixError::new(Errcode::InvalidParam).with_message("Invalid server name."));
    }

    let exists = r
        .json()
        .get("alias")
        .and_then(Value::as_object)
        .map(|aliases| aliases.contains_key(&alias))
        .unwrap_or(false);
    if exists {
        return Err(MatrixError::new(Errcode::Unknown)
            .with_message("Room alias already exists.")
            .with_status(StatusCode::CONFLICT));
    }

    let request = decode_body(&body)?;
    let Some(room_id) = request.get("room_id").and_then(Value::as_str) else {
        return Err(
            MatrixError::new(Errcode::BadJson).with_message("Missing or invalid room_id.")
        );
    };
    if !valid_common_id(room_id, '!') {
        return Err(MatrixError::new(Errcode::InvalidParam).with_message("Invalid room ID."));
    }

    let json = r.json_mut();

    // Forward map: alias → record.
    if !matches!(json.get("alias"), Some(Value::Object(_))) {
        json.insert("alias".into(), Value::Object(Map::new()));
    }
    if let Some(Value::Object(aliases)) = json.get_mut("alias") {
        aliases.insert(
            alias.clone(),
            json!({
                "createdBy": user.name(),
                "id": room_id,
                "servers": [],
            }),
        );
    }

    // Reverse map: room id → alias list.
    if !matches!(json.get("id"), Some(Value::Object(_))) {
        json.insert("id".into(), Value::Object(Map::new()));
    }
    if let Some(Value::Object(ids)) = json.get_mut("id") {
        let entry = ids
            .entry(room_id.to_string())
            .or_insert_with(|| json!({ "aliases": [] }));
        if let Some(Value::Array(list)) = entry.get_mut("aliases") {
            list.push(json!(alias));
        }
    }

    user.unlock(db).await.map_err(crate::internal)?;
    db.unlock(r).await.map_err(crate::internal)?;
    Ok(Json(json!({})))
}

/// `DELETE /directory/room/{alias}`
pub async fn remove(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    token: RequestToken,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    parse_alias(&alias)?;

    let mut r = lock_aliases(db).await?;
    let user = require_user(db, &token).await?;

    let entry = r
        .json()
        .get("alias")
        .and_then(Value::as_object)
        .and_then(|aliases| aliases.get(&alias))
        .and_then(Value::as_object)
        .cloned();
    let Some(entry) = entry else {
        return Err(MatrixError::new(Errcode::NotFound).with_message("Room alias not found."));
    };

    let created_by = entry.get("createdBy").and_then(Value::as_str).unwrap_or("");
    if !user.privileges().contains(Privileges::ALIAS) && created_by != user.name() {
        return Err(MatrixError::new(Errcode::Unauthorized));
    }

    let room_id = entry
        .get("id")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_default();

    let json = r.json_mut();
    if let Some(Value::Object(aliases)) = json.get_mut("alias") {
        aliases.remove(&alias);
    }
    if let Some(Value::Object(ids)) = json.get_mut("id") {
        if let Some(Value::Array(list)) = ids
            .get_mut(&room_id)
            .and_then(|entry| entry.get_mut("aliases"))
        {
            list.retain(|v| v.as_str() != Some(alias.as_str()));
        }
    }

    user.unlock(db).await.map_err(crate::internal)?;
    db.unlock(r).await.map_err(crate::internal)?;
    Ok(Json(json!({})))
}
