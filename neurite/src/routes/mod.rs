//! Client-server API request handlers.

mod account;
mod admin_config;
mod admin_tokens;
mod directory;
mod login;
mod profile;
mod register;
mod uia_fallback;
mod well_known;

use axum::routing::{get, post};
use axum::Router;
use serde_json::{Map, Value};

use crate::config::ConfigError;
use crate::state::AppState;
use neurite_core::{Errcode, MatrixError};

/// Build the full application router, dispatcher layers included.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/.well-known/matrix/client", get(well_known::client))
        .route("/_matrix/client/versions", get(well_known::versions))
        .route(
            "/_matrix/client/v3/login",
            get(login::flows).post(login::login),
        )
        .route("/_matrix/client/v3/register", post(register::register))
        .route(
            "/_matrix/client/v3/register/available",
            get(register::available),
        )
        .route("/_matrix/client/v3/logout", post(account::logout))
        .route("/_matrix/client/v3/logout/all", post(account::logout_all))
        .route("/_matrix/client/v3/refresh", post(account::refresh))
        .route("/_matrix/client/v3/account/whoami", get(account::whoami))
        .route(
            "/_matrix/client/v3/account/deactivate",
            post(account::deactivate),
        )
        .route(
            "/_matrix/client/v3/profile/{user}",
            get(profile::get_profile),
        )
        .route(
            "/_matrix/client/v3/profile/{user}/{key}",
            get(profile::get_profile_key).put(profile::set_profile_key),
        )
        .route(
            "/_matrix/client/v3/directory/room/{alias}",
            get(directory::resolve)
                .put(directory::create)
                .delete(directory::remove),
        )
        .route(
            "/_matrix/client/v3/auth/{kind}/fallback/web",
            get(uia_fallback::page).post(uia_fallback::submit),
        )
        .route(
            "/_neurite/admin/v1/tokens",
            get(admin_tokens::list_tokens).post(admin_tokens::create_token),
        )
        .route(
            "/_neurite/admin/v1/tokens/{name}",
            get(admin_tokens::get_token).delete(admin_tokens::delete_token),
        )
        .route(
            "/_neurite/admin/v1/config",
            get(admin_config::get_config)
                .post(admin_config::replace_config)
                .put(admin_config::merge_config),
        )
        .with_state(state);

    neurite_http::dispatch(api)
}

/// Strictly decode a request body as a JSON object, or fail with
/// `M_NOT_JSON`.
pub(crate) fn decode_body(body: &[u8]) -> Result<Map<String, Value>, MatrixError> {
    neurite_json::decode_object(body).map_err(|_| MatrixError::new(Errcode::NotJson))
}

/// A configuration that cannot be loaded is a server-side failure.
pub(crate) fn config_err(e: ConfigError) -> MatrixError {
    tracing::error!(error = %e, "unable to load configuration");
    MatrixError::new(Errcode::Unknown).with_message(e.to_string())
}
