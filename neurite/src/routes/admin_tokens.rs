use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{require_user, RequestToken};
use crate::routes::decode_body;
use crate::state::AppState;
use crate::users::{Privileges, User};
use crate::{internal, regtoken};
use neurite_core::{Errcode, MatrixError};
use neurite_db::{Db, DbError};

/// Authenticate and demand the `ISSUE_TOKENS` privilege.
async fn require_issuer(db: &Db, token: &RequestToken) -> Result<User, MatrixError> {
    let user = require_user(db, token).await?;
    if !user.privileges().contains(Privileges::ISSUE_TOKENS) {
        return Err(MatrixError::new(Errcode::Forbidden)
            .with_message("User doesn't have the ISSUE_TOKENS privilege."));
    }
    Ok(user)
}

/// `GET /tokens`
pub async fn list_tokens(
    State(state): State<AppState>,
    token: RequestToken,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let user = require_issuer(db, &token).await?;

    let mut records = Vec::new();
    for name in regtoken::list(db).map_err(internal)? {
        if let Some(info) = regtoken::get(db, &name).await.map_err(internal)? {
            records.push(info.to_json());
        }
    }

    user.unlock(db).await.map_err(internal)?;
    Ok(Json(json!({ "tokens": records })))
}

/// `GET /tokens/{name}`
pub async fn get_token(
    State(state): State<AppState>,
    Path(name): Path<String>,
    token: RequestToken,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let user = require_issuer(db, &token).await?;

    let info = regtoken::get(db, &name)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            MatrixError::new(Errcode::InvalidParam).with_message("Token doesn't exist.")
        })?;

    user.unlock(db).await.map_err(internal)?;
    Ok(Json(info.to_json()))
}

#[derive(Deserialize, Default)]
struct CreateTokenRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "expiresOn")]
    expires_on: u64,
    /// Omitted means unlimited.
    #[serde(default = "default_uses")]
    uses: i64,
    #[serde(default)]
    grants: Vec<Value>,
}

fn default_uses() -> i64 {
    -1
}

/// `POST /tokens`
pub async fn create_token(
    State(state): State<AppState>,
    token: RequestToken,
    body: Bytes,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let user = require_issuer(db, &token).await?;

    let request = decode_body(&body)?;
    let request: CreateTokenRequest = serde_json::from_value(Value::Object(request))
        .map_err(|e| MatrixError::new(Errcode::BadJson).with_message(e.to_string()))?;

    let name = request.name.unwrap_or_else(regtoken::generate_name);
    let grants = Privileges::decode(Some(&Value::Array(request.grants)));

    let created = match regtoken::create(
        db,
        &name,
        Some(user.name()),
        request.expires_on,
        request.uses,
        grants,
    )
    .await
    {
        Ok(created) => created,
        Err(DbError::Exists) => None,
        Err(e) => return Err(internal(e)),
    };

    let Some(info) = created else {
        return Err(MatrixError::new(Errcode::InvalidParam).with_message("Cannot create token."));
    };

    user.unlock(db).await.map_err(internal)?;
    Ok(Json(info.to_json()))
}

/// `DELETE /tokens/{name}`
pub async fn delete_token(
    State(state): State<AppState>,
    Path(name): Path<String>,
    token: RequestToken,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let user = require_issuer(db, &token).await?;

    regtoken::delete(db, &name).await.map_err(internal)?;

    user.unlock(db).await.map_err(internal)?;
    Ok(Json(json!({})))
}
