use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

use crate::auth::{require_user, RequestToken};
use crate::config::Config;
use crate::internal;
use crate::routes::{config_err, decode_body};
use crate::state::AppState;
use crate::uia::{self, Outcome, Stage, STAGE_PASSWORD};
use crate::users;
use neurite_core::{Errcode, MatrixError, UserId};

/// `GET /account/whoami`
pub async fn whoami(
    State(state): State<AppState>,
    token: RequestToken,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let config = Config::load(db).await.map_err(config_err)?;
    let user = require_user(db, &token).await?;

    let mut response = json!({
        "user_id": format!("@{}:{}", user.name(), config.server_name),
    });
    if let Some(device_id) = user.device_id() {
        response["device_id"] = json!(device_id);
    }

    user.unlock(db).await.map_err(internal)?;
    Ok(Json(response))
}

/// `POST /logout` revokes the presented token, its refresh token, and the
/// device entry.
pub async fn logout(
    State(state): State<AppState>,
    token: RequestToken,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let mut user = require_user(db, &token).await?;

    user.delete_token(db, &token.0).await.map_err(internal)?;
    user.unlock(db).await.map_err(internal)?;
    Ok(Json(json!({})))
}

/// `POST /logout/all` revokes every device's tokens, the presented one
/// included.
pub async fn logout_all(
    State(state): State<AppState>,
    token: RequestToken,
) -> Result<Json<Value>, MatrixError> {
    let db = &state.db;
    let mut user = require_user(db, &token).await?;

    user.delete_tokens(db, None).await.map_err(internal)?;
    user.unlock(db).await.map_err(internal)?;
    Ok(Json(json!({})))
}

/// `POST /refresh` exchanges a refresh token for a new access token.
pub async fn refresh(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, MatrixError> {
    let request = decode_body(&body)?;
    let Some(refresh_token) = request.get("refresh_token").and_then(Value::as_str) else {
        return Err(MatrixError::new(Errcode::MissingParam)
            .with_message("'refresh_token' field is unset"));
    };

    let Some(token) = users::refresh_token_exchange(&state.db, refresh_token)
        .await
        .map_err(internal)?
    else {
        return Err(MatrixError::new(Errcode::UnknownToken));
    };

    Ok(Json(json!({
        "access_token": token.token,
        "expires_in_ms": token.lifetime_ms,
        "refresh_token": refresh_token,
    })))
}

/// `POST /account/deactivate`, guarded by a password UIA flow. The account
/// record stays (localparts are never reused); every token is revoked.
pub async fn deactivate(
    State(state): State<AppState>,
    token: RequestToken,
    body: Bytes,
) -> Result<Response, MatrixError> {
    let db = &state.db;
    let config = Config::load(db).await.map_err(config_err)?;
    let request = decode_body(&body)?;

    // Resolve the presented token up front: the password stage below must
    // re-authenticate the account being deactivated, not whichever
    // identifier the client chose to put in `auth`.
    let user = require_user(db, &token).await?;
    let owner = user.name().to_string();
    user.unlock(db).await.map_err(internal)?;

    if let Some(Value::Object(auth)) = request.get("auth") {
        let claimed = auth
            .get("identifier")
            .and_then(Value::as_object)
            .and_then(|identifier| identifier.get("user"))
            .and_then(Value::as_str)
            .and_then(|user| UserId::parse(user, &config.server_name));
        let is_owner = claimed
            .map(|id| id.is_local_to(&config.server_name) && id.local == owner)
            .unwrap_or(false);
        if !is_owner {
            return Err(MatrixError::new(Errcode::Forbidden).with_message(
                "Password re-authentication must use the account being deactivated.",
            ));
        }
    }

    // UIA runs without the account lock held: the password stage takes the
    // user lock itself.
    let flows = vec![vec![Stage::new(STAGE_PASSWORD)]];
    match uia::complete(db, &config, &flows, &request).await? {
        Outcome::Continue(response) => return Ok(response),
        Outcome::Done { .. } => {}
    }

    let mut user = require_user(db, &token).await?;
    user.deactivate(None, None);
    user.delete_tokens(db, None).await.map_err(internal)?;
    tracing::info!(user = %user.name(), "deactivated account");
    user.unlock(db).await.map_err(internal)?;

    Ok(Json(json!({ "id_server_unbind_result": "success" })).into_response())
}
