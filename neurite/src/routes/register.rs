use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::routes::{config_err, decode_body};
use crate::state::AppState;
use crate::uia::{self, Outcome};
use crate::users::{Privileges, User};
use crate::{internal, regtoken};
use neurite_core::{validate_localpart, Errcode, MatrixError};
use neurite_db::{Db, DbError};

#[derive(Deserialize, Default)]
struct RegisterRequest {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    initial_device_display_name: Option<String>,
    #[serde(default)]
    refresh_token: bool,
    #[serde(default)]
    inhibit_login: bool,
}

/// The grants stashed on the UIA session by a registration-token stage, if
/// any. Read before the new user is created so the session and user locks
/// are never held together.
async fn session_grants(db: &Db, session: &str) -> Result<Option<Privileges>, MatrixError> {
    let Some(r) = db
        .lock(&["user_interactive", session])
        .await
        .map_err(internal)?
    else {
        tracing::warn!(
            session = %session,
            "unable to lock UIA session to check registration grants"
        );
        return Ok(None);
    };

    let token = r
        .json()
        .get("registration_token")
        .and_then(Value::as_str)
        .map(String::from);
    db.unlock(r).await.map_err(internal)?;

    match token {
        Some(token) => Ok(regtoken::get(db, &token)
            .await
            .map_err(internal)?
            .map(|info| info.grants)),
        None => Ok(None),
    }
}

/// `POST /register`
pub async fn register(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, MatrixError> {
    let db = &state.db;
    let config = Config::load(db).await.map_err(config_err)?;

    let request = decode_body(&body)?;
    let typed: RegisterRequest = serde_json::from_value(Value::Object(request.clone()))
        .map_err(|e| MatrixError::new(Errcode::NotJson).with_message(e.to_string()))?;

    if let Some(username) = &typed.username {
        if !validate_localpart(username, &config.server_name) {
            return Err(MatrixError::new(Errcode::InvalidUsername));
        }
        if User::exists(db, username) {
            return Err(MatrixError::new(Errcode::UserInUse));
        }
    }

    let mut flows = vec![uia::registration_token_flow()];
    if config.registration {
        flows.push(uia::dummy_flow());
    }

    let session = match uia::complete(db, &config, &flows, &request).await? {
        Outcome::Continue(response) => return Ok(response),
        Outcome::Done { session } => session,
    };

    if let Some(kind) = params.get("kind") {
        if kind != "user" {
            return Err(MatrixError::new(Errcode::InvalidParam)
                .with_message("Guest accounts are currently not supported")
                .with_status(axum::http::StatusCode::FORBIDDEN));
        }
    }

    let password = match typed.password.as_deref() {
        Some(password) if !password.is_empty() => password,
        _ => {
            return Err(
                MatrixError::new(Errcode::MissingParam).with_message("'password' field is unset")
            )
        }
    };

    let grants = session_grants(db, &session).await?;

    let mut user = match User::create(db, typed.username.as_deref(), password).await {
        Ok(user) => user,
        Err(DbError::Exists) => return Err(MatrixError::new(Errcode::UserInUse)),
        Err(e) => return Err(internal(e)),
    };

    let mut response = Map::new();
    response.insert(
        "user_id".into(),
        json!(format!("@{}:{}", user.name(), config.server_name)),
    );

    if !typed.inhibit_login {
        let info = user
            .login(
                db,
                password,
                typed.device_id.as_deref(),
                typed.initial_device_display_name.as_deref(),
                typed.refresh_token,
            )
            .await
            .map_err(internal)?;

        // A freshly created account always accepts its own password.
        if let Some(info) = info {
            response.insert("access_token".into(), json!(info.access_token.token));
            response.insert("device_id".into(), json!(info.access_token.device_id));
            if typed.refresh_token {
                response.insert("expires_in_ms".into(), json!(info.access_token.lifetime_ms));
                response.insert("refresh_token".into(), json!(info.refresh_token));
            }
        }
    }

    if let Some(grants) = grants {
        user.set_privileges(grants);
    }

    tracing::info!(user = %user.name(), "registered user");
    user.unlock(db).await.map_err(internal)?;

    Ok(Json(Value::Object(response)).into_response())
}

#[derive(Deserialize)]
pub struct AvailableParams {
    username: Option<String>,
}

/// `GET /register/available?username=...`
pub async fn available(
    State(state): State<AppState>,
    Query(params): Query<AvailableParams>,
) -> Result<Json<Value>, MatrixError> {
    let config = Config::load(&state.db).await.map_err(config_err)?;

    let Some(username) = &params.username else {
        return Err(MatrixError::new(Errcode::MissingParam)
            .with_message("'username' parameter is not set."));
    };

    if !validate_localpart(username, &config.server_name) {
        return Err(MatrixError::new(Errcode::InvalidUsername));
    }
    if User::exists(&state.db, username) {
        return Err(MatrixError::new(Errcode::UserInUse));
    }
    Ok(Json(json!({ "available": true })))
}
