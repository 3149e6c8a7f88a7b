//! User-interactive authentication.
//!
//! An endpoint that demands UIA declares one or more *flows*, each an
//! ordered list of stages. The client works through a flow one stage per
//! request, all tied together by a server-assigned session id persisted at
//! `(user_interactive, <session>)`. Until a flow is complete the endpoint
//! answers 401 with the flow catalog, the stages completed so far, and the
//! session id; once the stages of any one flow are all completed the
//! endpoint's real work runs.
//!
//! Sessions that sit idle are garbage-collected by [`cleanup`], which the
//! scheduler runs periodically.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::regtoken;
use crate::users::User;
use neurite_core::{now_ms, random_string, Errcode, MatrixError, UserId};
use neurite_db::{Db, DbRef};

const SESSION_ID_LEN: usize = 16;

/// Idle sessions older than this are eligible for deletion.
pub const SESSION_TIMEOUT_MS: u64 = 1000 * 60 * 15;

pub const STAGE_DUMMY: &str = "m.login.dummy";
pub const STAGE_PASSWORD: &str = "m.login.password";
pub const STAGE_REGISTRATION_TOKEN: &str = "m.login.registration_token";

/// One step of a flow: a stage type plus optional parameters shown to the
/// client in the flow catalog.
#[derive(Debug, Clone)]
pub struct Stage {
    pub kind: String,
    pub params: Option<Value>,
}

impl Stage {
    pub fn new(kind: &str) -> Stage {
        Stage {
            kind: kind.to_string(),
            params: None,
        }
    }
}

pub type Flow = Vec<Stage>;

/// The flow satisfied by doing nothing, used where registration is open.
pub fn dummy_flow() -> Flow {
    vec![Stage::new(STAGE_DUMMY)]
}

/// The flow satisfied by presenting a valid registration token.
pub fn registration_token_flow() -> Flow {
    vec![Stage::new(STAGE_REGISTRATION_TOKEN)]
}

/// What [`complete`] decided.
#[derive(Debug)]
pub enum Outcome {
    /// Authentication is satisfied; the endpoint's work may proceed.
    Done { session: String },

    /// The client still has work to do. The response (normally a 401
    /// carrying the flow catalog) is ready to send as-is.
    Continue(Response),
}

/// The flow catalog shown to clients: every flow's stage list, plus the
/// union of stage parameters keyed by stage type.
fn flow_catalog(flows: &[Flow]) -> Map<String, Value> {
    let mut params = Map::new();
    let mut catalog = Vec::new();

    for flow in flows {
        let stages: Vec<&str> = flow.iter().map(|s| s.kind.as_str()).collect();
        catalog.push(json!({ "stages": stages }));

        for stage in flow {
            if let Some(p) = &stage.params {
                params.insert(stage.kind.clone(), p.clone());
            }
        }
    }

    let mut out = Map::new();
    out.insert("flows".into(), Value::Array(catalog));
    out.insert("params".into(), Value::Object(params));
    out
}

/// Mint a fresh session and answer 401 with an empty `completed` list.
async fn new_session_response(db: &Db, flows: &[Flow]) -> Result<Response, MatrixError> {
    let session = random_string(SESSION_ID_LEN);

    let mut r = db
        .create(&["user_interactive", &session])
        .await
        .map_err(crate::internal)?;
    let json = r.json_mut();
    json.insert("completed".into(), json!([]));
    json.insert("last_access".into(), json!(now_ms()));
    db.unlock(r).await.map_err(crate::internal)?;

    let mut body = flow_catalog(flows);
    body.insert("completed".into(), json!([]));
    body.insert("session".into(), json!(session));
    Ok((StatusCode::UNAUTHORIZED, Json(Value::Object(body))).into_response())
}

/// Answer 401 with the catalog and the session's current progress.
fn challenge_response(flows: &[Flow], completed: &[String], session: &str) -> Response {
    let mut body = flow_catalog(flows);
    body.insert("completed".into(), json!(completed));
    body.insert("session".into(), json!(session));
    (StatusCode::UNAUTHORIZED, Json(Value::Object(body))).into_response()
}

/// Stamp the session and release it.
async fn release(db: &Db, mut session_ref: DbRef) -> Result<(), MatrixError> {
    session_ref
        .json_mut()
        .insert("last_access".into(), json!(now_ms()));
    db.unlock(session_ref).await.map_err(crate::internal)
}

/// Run one round of user-interactive auth against `request`.
///
/// `Err` means the request itself was malformed (or the store failed);
/// `Ok(Continue)` carries the 401 challenge to send; `Ok(Done)` means a
/// flow is fully satisfied and the caller should do its real work.
pub async fn complete(
    db: &Db,
    config: &Config,
    flows: &[Flow],
    request: &Map<String, Value>,
) -> Result<Outcome, MatrixError> {
    let auth = match request.get("auth") {
        None => return Ok(Outcome::Continue(new_session_response(db, flows).await?)),
        Some(Value::Object(auth)) => auth,
        Some(_) => return Err(MatrixError::new(Errcode::BadJson)),
    };

    let Some(session) = auth.get("session").and_then(Value::as_str) else {
        return Err(MatrixError::new(Errcode::BadJson));
    };
    let session = session.to_string();

    let Some(mut session_ref) = db
        .lock(&["user_interactive", &session])
        .await
        .map_err(crate::internal)?
    else {
        // Unknown (possibly expired) session: start over.
        return Ok(Outcome::Continue(new_session_response(db, flows).await?));
    };

    let completed: Vec<String> = session_ref
        .json()
        .get("completed")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    // The stage types a candidate flow (one whose stages extend the
    // session's progress) would accept next.
    let mut possible: Vec<String> = Vec::new();
    for flow in flows {
        let kinds: Vec<&str> = flow.iter().map(|s| s.kind.as_str()).collect();

        if kinds.len() == completed.len() && kinds.iter().eq(completed.iter()) {
            // The session already satisfies this flow in full.
            release(db, session_ref).await?;
            return Ok(Outcome::Done { session });
        }

        if kinds.len() > completed.len()
            && kinds[..completed.len()].iter().eq(completed.iter())
        {
            possible.push(kinds[completed.len()].to_string());
        }
    }

    let auth_type = match auth.get("type").and_then(Value::as_str) {
        Some(auth_type) => auth_type.to_string(),
        None => {
            release(db, session_ref).await?;
            return Err(MatrixError::new(Errcode::BadJson));
        }
    };

    if !possible.iter().any(|kind| *kind == auth_type) {
        let response = challenge_response(flows, &completed, &session);
        release(db, session_ref).await?;
        return Ok(Outcome::Continue(response));
    }

    let accepted = match auth_type.as_str() {
        STAGE_DUMMY => true,
        STAGE_PASSWORD => verify_password(db, config, auth).await?,
        STAGE_REGISTRATION_TOKEN => {
            match auth.get("token").and_then(Value::as_str) {
                Some(token) => {
                    let used = regtoken::use_once(db, token)
                        .await
                        .map_err(crate::internal)?
                        .is_some();
                    if used {
                        // Stash the token so the registration endpoint can
                        // apply its grants to the new account.
                        session_ref
                            .json_mut()
                            .insert("registration_token".into(), json!(token));
                    }
                    used
                }
                None => false,
            }
        }
        _ => false,
    };

    if !accepted {
        let response = challenge_response(flows, &completed, &session);
        release(db, session_ref).await?;
        return Ok(Outcome::Continue(response));
    }

    let mut new_completed = completed;
    new_completed.push(auth_type);
    session_ref
        .json_mut()
        .insert("completed".into(), json!(new_completed.clone()));

    // Authentication is satisfied only when no candidate flow has stages
    // left beyond the progress just recorded, regardless of which flow
    // offered the accepted stage.
    let stages_remain = flows.iter().any(|flow| {
        flow.len() > new_completed.len()
            && flow
                .iter()
                .map(|s| s.kind.as_str())
                .take(new_completed.len())
                .eq(new_completed.iter().map(String::as_str))
    });

    if stages_remain {
        let response = challenge_response(flows, &new_completed, &session);
        release(db, session_ref).await?;
        return Ok(Outcome::Continue(response));
    }

    release(db, session_ref).await?;
    Ok(Outcome::Done { session })
}

/// Validate an `m.login.password` stage payload.
async fn verify_password(
    db: &Db,
    config: &Config,
    auth: &Map<String, Value>,
) -> Result<bool, MatrixError> {
    let Some(password) = auth.get("password").and_then(Value::as_str) else {
        return Ok(false);
    };
    let Some(identifier) = auth.get("identifier").and_then(Value::as_object) else {
        return Ok(false);
    };
    if identifier.get("type").and_then(Value::as_str) != Some("m.id.user") {
        return Ok(false);
    }

    let Some(user_id) = identifier
        .get("user")
        .and_then(Value::as_str)
        .and_then(|u| UserId::parse(u, &config.server_name))
    else {
        return Ok(false);
    };
    if !user_id.is_local_to(&config.server_name) {
        return Ok(false);
    }

    let Some(user) = User::lock(db, &user_id.local).await.map_err(crate::internal)? else {
        return Ok(false);
    };
    let ok = user.check_password(password);
    user.unlock(db).await.map_err(crate::internal)?;
    Ok(ok)
}

/// Drop every UIA session idle for longer than [`SESSION_TIMEOUT_MS`].
/// Registered with the scheduler; failures are logged and swallowed.
pub async fn cleanup(db: &Db) {
    let sessions = match db.list(&["user_interactive"]) {
        Ok(sessions) => sessions,
        Err(e) => {
            tracing::error!(error = %e, "unable to list UIA sessions");
            return;
        }
    };

    tracing::debug!(count = sessions.len(), "user-interactive auth sessions");

    for session in sessions {
        let r = match db.lock(&["user_interactive", &session]).await {
            Ok(Some(r)) => r,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(session = %session, error = %e, "unable to lock UIA session");
                continue;
            }
        };

        let last_access = r.json().get("last_access").and_then(Value::as_u64).unwrap_or(0);
        if let Err(e) = db.unlock(r).await {
            tracing::error!(session = %session, error = %e, "unable to release UIA session");
            continue;
        }

        if now_ms().saturating_sub(last_access) > SESSION_TIMEOUT_MS {
            match db.delete(&["user_interactive", &session]).await {
                Ok(_) => tracing::debug!(session = %session, "deleted stale UIA session"),
                Err(e) => {
                    tracing::error!(session = %session, error = %e, "unable to delete UIA session")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::Privileges;
    use http_body_util::BodyExt;

    fn open_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), 0).unwrap();
        (dir, db)
    }

    fn test_config() -> Config {
        let tree = match json!({
            "serverName": "example.org",
            "federation": false,
            "registration": true,
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        Config::parse(&tree).unwrap()
    }

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn response_json(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn expect_challenge(outcome: Outcome) -> Value {
        match outcome {
            Outcome::Continue(response) => {
                let (status, body) = response_json(response).await;
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                body
            }
            Outcome::Done { .. } => panic!("expected a challenge, got Done"),
        }
    }

    #[tokio::test]
    async fn missing_auth_mints_a_session() {
        let (_dir, db) = open_db();
        let config = test_config();
        let flows = vec![dummy_flow()];

        let outcome = complete(&db, &config, &flows, &obj(json!({})))
            .await
            .unwrap();
        let body = expect_challenge(outcome).await;

        assert_eq!(body["flows"], json!([{"stages": ["m.login.dummy"]}]));
        assert_eq!(body["completed"], json!([]));
        let session = body["session"].as_str().unwrap();
        assert!(db.exists(&["user_interactive", session]));
    }

    #[tokio::test]
    async fn unknown_session_mints_a_fresh_one() {
        let (_dir, db) = open_db();
        let config = test_config();
        let flows = vec![dummy_flow()];

        let request = obj(json!({"auth": {"type": "m.login.dummy", "session": "expired"}}));
        let outcome = complete(&db, &config, &flows, &request).await.unwrap();
        let body = expect_challenge(outcome).await;
        assert_ne!(body["session"], json!("expired"));
    }

    #[tokio::test]
    async fn malformed_auth_is_bad_json() {
        let (_dir, db) = open_db();
        let config = test_config();
        let flows = vec![dummy_flow()];

        let err = complete(&db, &config, &flows, &obj(json!({"auth": 42})))
            .await
            .unwrap_err();
        assert_eq!(err.errcode(), Errcode::BadJson);

        let err = complete(&db, &config, &flows, &obj(json!({"auth": {}})))
            .await
            .unwrap_err();
        assert_eq!(err.errcode(), Errcode::BadJson);
    }

    #[tokio::test]
    async fn dummy_flow_completes_in_one_step() {
        let (_dir, db) = open_db();
        let config = test_config();
        let flows = vec![dummy_flow()];

        let outcome = complete(&db, &config, &flows, &obj(json!({}))).await.unwrap();
        let body = expect_challenge(outcome).await;
        let session = body["session"].as_str().unwrap().to_string();

        let request = obj(json!({"auth": {"type": "m.login.dummy", "session": session}}));
        match complete(&db, &config, &flows, &request).await.unwrap() {
            Outcome::Done { session: done } => assert_eq!(done, session),
            Outcome::Continue(_) => panic!("expected Done"),
        }
    }

    #[tokio::test]
    async fn two_stage_flow_progresses_then_completes() {
        let (_dir, db) = open_db();
        let config = test_config();

        let user = User::create(&db, Some("alice"), "pw").await.unwrap();
        user.unlock(&db).await.unwrap();
        regtoken::create(&db, "tok", None, 0, 1, Privileges::NONE)
            .await
            .unwrap()
            .unwrap();

        let flows = vec![vec![
            Stage::new(STAGE_PASSWORD),
            Stage::new(STAGE_REGISTRATION_TOKEN),
        ]];

        let outcome = complete(&db, &config, &flows, &obj(json!({}))).await.unwrap();
        let body = expect_challenge(outcome).await;
        let session = body["session"].as_str().unwrap().to_string();

        // First stage: password.
        let request = obj(json!({"auth": {
            "type": "m.login.password",
            "identifier": {"type": "m.id.user", "user": "alice"},
            "password": "pw",
            "session": session,
        }}));
        let outcome = complete(&db, &config, &flows, &request).await.unwrap();
        let body = expect_challenge(outcome).await;
        assert_eq!(body["completed"], json!(["m.login.password"]));

        // Second stage: registration token.
        let request = obj(json!({"auth": {
            "type": "m.login.registration_token",
            "token": "tok",
            "session": session,
        }}));
        match complete(&db, &config, &flows, &request).await.unwrap() {
            Outcome::Done { .. } => {}
            Outcome::Continue(_) => panic!("expected Done after final stage"),
        }

        // The token was consumed and stashed on the session.
        let spent = regtoken::get(&db, "tok").await.unwrap().unwrap();
        assert_eq!(spent.uses, 0);
        let r = db
            .lock(&["user_interactive", &session])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.json().get("registration_token"), Some(&json!("tok")));
        db.unlock(r).await.unwrap();
    }

    #[tokio::test]
    async fn wrong_password_keeps_progress_unchanged() {
        let (_dir, db) = open_db();
        let config = test_config();
        let user = User::create(&db, Some("alice"), "pw").await.unwrap();
        user.unlock(&db).await.unwrap();

        let flows = vec![vec![Stage::new(STAGE_PASSWORD)]];
        let outcome = complete(&db, &config, &flows, &obj(json!({}))).await.unwrap();
        let body = expect_challenge(outcome).await;
        let session = body["session"].as_str().unwrap().to_string();

        let request = obj(json!({"auth": {
            "type": "m.login.password",
            "identifier": {"type": "m.id.user", "user": "alice"},
            "password": "wrong",
            "session": session,
        }}));
        let outcome = complete(&db, &config, &flows, &request).await.unwrap();
        let body = expect_challenge(outcome).await;
        assert_eq!(body["completed"], json!([]));
    }

    #[tokio::test]
    async fn off_flow_stage_type_is_rejected() {
        let (_dir, db) = open_db();
        let config = test_config();
        let flows = vec![registration_token_flow()];

        let outcome = complete(&db, &config, &flows, &obj(json!({}))).await.unwrap();
        let body = expect_challenge(outcome).await;
        let session = body["session"].as_str().unwrap().to_string();

        let request = obj(json!({"auth": {"type": "m.login.dummy", "session": session}}));
        let outcome = complete(&db, &config, &flows, &request).await.unwrap();
        let body = expect_challenge(outcome).await;
        assert_eq!(body["completed"], json!([]));
    }

    #[tokio::test]
    async fn overlapping_flows_hold_the_challenge_regardless_of_order() {
        let (_dir, db) = open_db();
        let config = test_config();

        // Two flows share a first stage; one of them has more to do. The
        // outcome must not depend on which comes first in the list.
        let long_first = vec![
            vec![Stage::new(STAGE_DUMMY), Stage::new(STAGE_REGISTRATION_TOKEN)],
            vec![Stage::new(STAGE_DUMMY)],
        ];
        let short_first = vec![
            vec![Stage::new(STAGE_DUMMY)],
            vec![Stage::new(STAGE_DUMMY), Stage::new(STAGE_REGISTRATION_TOKEN)],
        ];

        for flows in [&long_first, &short_first] {
            let outcome = complete(&db, &config, flows, &obj(json!({}))).await.unwrap();
            let body = expect_challenge(outcome).await;
            let session = body["session"].as_str().unwrap().to_string();

            let request =
                obj(json!({"auth": {"type": "m.login.dummy", "session": session}}));
            let outcome = complete(&db, &config, flows, &request).await.unwrap();
            let body = expect_challenge(outcome).await;
            assert_eq!(body["completed"], json!(["m.login.dummy"]));

            // The progress now matches the one-stage flow exactly, so the
            // next round short-circuits to done.
            let replay = obj(json!({"auth": {"session": session}}));
            assert!(matches!(
                complete(&db, &config, flows, &replay).await.unwrap(),
                Outcome::Done { .. }
            ));
        }
    }

    #[tokio::test]
    async fn completed_flow_short_circuits_future_calls() {
        let (_dir, db) = open_db();
        let config = test_config();
        let flows = vec![dummy_flow()];

        let outcome = complete(&db, &config, &flows, &obj(json!({}))).await.unwrap();
        let body = expect_challenge(outcome).await;
        let session = body["session"].as_str().unwrap().to_string();

        let request = obj(json!({"auth": {"type": "m.login.dummy", "session": session}}));
        assert!(matches!(
            complete(&db, &config, &flows, &request).await.unwrap(),
            Outcome::Done { .. }
        ));

        // A replay with no type still satisfies: completed matches exactly.
        let replay = obj(json!({"auth": {"session": session}}));
        assert!(matches!(
            complete(&db, &config, &flows, &replay).await.unwrap(),
            Outcome::Done { .. }
        ));
    }

    #[tokio::test]
    async fn cleanup_deletes_only_stale_sessions() {
        let (_dir, db) = open_db();
        let config = test_config();
        let flows = vec![dummy_flow()];

        let stale = expect_challenge(
            complete(&db, &config, &flows, &obj(json!({}))).await.unwrap(),
        )
        .await["session"]
            .as_str()
            .unwrap()
            .to_string();
        let fresh = expect_challenge(
            complete(&db, &config, &flows, &obj(json!({}))).await.unwrap(),
        )
        .await["session"]
            .as_str()
            .unwrap()
            .to_string();

        // Age the first session past the timeout.
        let mut r = db
            .lock(&["user_interactive", &stale])
            .await
            .unwrap()
            .unwrap();
        r.json_mut().insert(
            "last_access".into(),
            json!(now_ms() - SESSION_TIMEOUT_MS - 1000),
        );
        db.unlock(r).await.unwrap();

        cleanup(&db).await;

        assert!(!db.exists(&["user_interactive", &stale]));
        assert!(db.exists(&["user_interactive", &fresh]));
    }
}
