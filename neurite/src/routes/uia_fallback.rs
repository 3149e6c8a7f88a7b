use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Response};
use serde_json::json;

use crate::config::Config;
use crate::routes::{config_err, decode_body};
use crate::state::AppState;
use crate::uia::{self, Outcome, Stage, STAGE_PASSWORD, STAGE_REGISTRATION_TOKEN};
use neurite_core::{Errcode, MatrixError};

/// Shared page shell. `@FORM@`, `@BUILD@`, `@TYPE@`, and `@SESSION@` are
/// substituted per stage type; the substituted values are either fixed
/// strings or validated alphanumeric ids, so nothing user-controlled can
/// escape into markup or script.
const PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Authentication</title>
<style>
body { font-family: sans-serif; margin: 2em auto; max-width: 24em; }
label { display: block; margin-top: 0.5em; }
#error { color: red; }
</style>
</head>
<body>
<h1>Authentication</h1>
<p id="error"></p>
<form id="auth-form">
@FORM@
<br>
<input type="submit" value="Authenticate">
</form>
<script>
function setFormError(msg) {
  document.getElementById('error').textContent = msg;
}
function jsonRequest(method, url, body, callback) {
  var xhr = new XMLHttpRequest();
  xhr.open(method, url);
  xhr.setRequestHeader('Content-Type', 'application/json');
  xhr.onreadystatechange = function () {
    if (xhr.readyState === 4) {
      callback(xhr);
    }
  };
  xhr.send(JSON.stringify(body));
}
@BUILD@
function processResponse(xhr) {
  var r = JSON.parse(xhr.responseText);
  if (xhr.status == 200 || (r.completed && r.completed.includes('@TYPE@'))) {
    if (window.onAuthDone) {
      window.onAuthDone();
    } else if (window.opener && window.opener.postMessage) {
      window.opener.postMessage('authDone', '*');
    } else {
      setFormError('Client error.');
    }
  } else if (r.session != '@SESSION@') {
    setFormError('Invalid session.');
  } else {
    setFormError('Invalid credentials.');
  }
}
document.getElementById('auth-form').addEventListener('submit', function (e) {
  e.preventDefault();
  var request = buildRequest();
  if (request) {
    jsonRequest('POST', window.location.pathname, request, processResponse);
  }
});
</script>
</body>
</html>
"#;

const PASSWORD_FORM: &str = r#"<label for="user">Username:</label>
<input type="text" id="user">
<label for="password">Password:</label>
<input type="password" id="password">"#;

const PASSWORD_BUILD: &str = r#"function buildRequest() {
  var user = document.getElementById('user').value;
  var pass = document.getElementById('password').value;
  if (!user || !pass) {
    setFormError('Please specify a username and password.');
    return false;
  }
  return {
    auth: {
      type: '@TYPE@',
      identifier: { type: 'm.id.user', user: user },
      password: pass,
      session: '@SESSION@'
    }
  };
}"#;

const TOKEN_FORM: &str = r#"<label for="token">Registration Token:</label>
<input type="password" id="token">"#;

const TOKEN_BUILD: &str = r#"function buildRequest() {
  var token = document.getElementById('token').value;
  if (!token) {
    setFormError('Please specify a registration token.');
    return false;
  }
  return {
    auth: {
      type: '@TYPE@',
      session: '@SESSION@',
      token: token
    }
  };
}"#;

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render(form: &str, build: &str, kind: &str, session: &str) -> String {
    PAGE_TEMPLATE
        .replace("@FORM@", form)
        .replace("@BUILD@", build)
        .replace("@TYPE@", kind)
        .replace("@SESSION@", session)
}

/// `GET /auth/{kind}/fallback/web?session=...` serves the HTML fallback page a
/// non-JSON client is sent to for one UIA stage.
pub async fn page(
    Path(kind): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, MatrixError> {
    let Some(session) = params.get("session") else {
        return Err(
            MatrixError::new(Errcode::MissingParam).with_message("'session' parameter is unset.")
        );
    };
    // Session ids are minted alphanumeric; anything else is not ours and
    // must not reach the page source.
    if !session.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(MatrixError::new(Errcode::InvalidParam).with_message("Invalid session."));
    }

    let page = match kind.as_str() {
        STAGE_PASSWORD => render(PASSWORD_FORM, PASSWORD_BUILD, STAGE_PASSWORD, session),
        STAGE_REGISTRATION_TOKEN => render(
            TOKEN_FORM,
            TOKEN_BUILD,
            STAGE_REGISTRATION_TOKEN,
            session,
        ),
        other => {
            let body = format!(
                "<p>Unknown auth type: <code>{}</code></p>",
                html_escape(other)
            );
            return Ok((StatusCode::NOT_FOUND, Html(body)).into_response());
        }
    };

    Ok(Html(page).into_response())
}

/// `POST /auth/{kind}/fallback/web` runs a single-stage flow of `kind`
/// against the posted auth payload.
pub async fn submit(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    body: Bytes,
) -> Result<Response, MatrixError> {
    let config = Config::load(&state.db).await.map_err(config_err)?;
    let request = decode_body(&body)?;

    let flows = vec![vec![Stage::new(&kind)]];
    match uia::complete(&state.db, &config, &flows, &request).await? {
        Outcome::Done { .. } => Ok(Json(json!({})).into_response()),
        Outcome::Continue(response) => Ok(response),
    }
}
