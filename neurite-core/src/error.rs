use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

/// The Matrix client-server error code taxonomy.
///
/// Every error reply carries one of these as `errcode` next to a
/// human-readable `error` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errcode {
    Forbidden,
    UnknownToken,
    MissingToken,
    BadJson,
    NotJson,
    NotFound,
    LimitExceeded,
    Unknown,
    Unrecognized,
    Unauthorized,
    UserDeactivated,
    UserInUse,
    InvalidUsername,
    RoomInUse,
    InvalidRoomState,
    ThreepidInUse,
    ThreepidNotFound,
    ThreepidAuthFailed,
    ThreepidDenied,
    ServerNotTrusted,
    UnsupportedRoomVersion,
    IncompatibleRoomVersion,
    BadState,
    GuestAccessForbidden,
    CaptchaNeeded,
    CaptchaInvalid,
    MissingParam,
    InvalidParam,
    TooLarge,
    Exclusive,
    ResourceLimitExceeded,
    CannotLeaveServerNoticeRoom,
}

impl Errcode {
    /// The wire form, e.g. `M_FORBIDDEN`.
    pub fn as_str(self) -> &'static str {
        match self {
            Errcode::Forbidden => "M_FORBIDDEN",
            Errcode::UnknownToken => "M_UNKNOWN_TOKEN",
            Errcode::MissingToken => "M_MISSING_TOKEN",
            Errcode::BadJson => "M_BAD_JSON",
            Errcode::NotJson => "M_NOT_JSON",
            Errcode::NotFound => "M_NOT_FOUND",
            Errcode::LimitExceeded => "M_LIMIT_EXCEEDED",
            Errcode::Unknown => "M_UNKNOWN",
            Errcode::Unrecognized => "M_UNRECOGNIZED",
            Errcode::Unauthorized => "M_UNAUTHORIZED",
            Errcode::UserDeactivated => "M_USER_DEACTIVATED",
            Errcode::UserInUse => "M_USER_IN_USE",
            Errcode::InvalidUsername => "M_INVALID_USERNAME",
            Errcode::RoomInUse => "M_ROOM_IN_USE",
            Errcode::InvalidRoomState => "M_INVALID_ROOM_STATE",
            Errcode::ThreepidInUse => "M_THREEPID_IN_USE",
            Errcode::ThreepidNotFound => "M_THREEPID_NOT_FOUND",
            Errcode::ThreepidAuthFailed => "M_THREEPID_AUTH_FAILED",
            Errcode::ThreepidDenied => "M_THREEPID_DENIED",
            Errcode::ServerNotTrusted => "M_SERVER_NOT_TRUSTED",
            Errcode::UnsupportedRoomVersion => "M_UNSUPPORTED_ROOM_VERSION",
            Errcode::IncompatibleRoomVersion => "M_INCOMPATIBLE_ROOM_VERSION",
            Errcode::BadState => "M_BAD_STATE",
            Errcode::GuestAccessForbidden => "M_GUEST_ACCESS_FORBIDDEN",
            Errcode::CaptchaNeeded => "M_CAPTCHA_NEEDED",
            Errcode::CaptchaInvalid => "M_CAPTCHA_INVALID",
            Errcode::MissingParam => "M_MISSING_PARAM",
            Errcode::InvalidParam => "M_INVALID_PARAM",
            Errcode::TooLarge => "M_TOO_LARGE",
            Errcode::Exclusive => "M_EXCLUSIVE",
            Errcode::ResourceLimitExceeded => "M_RESOURCE_LIMIT_EXCEEDED",
            Errcode::CannotLeaveServerNoticeRoom => "M_CANNOT_LEAVE_SERVER_NOTICE_ROOM",
        }
    }

    /// The default human-readable message for this code.
    fn default_message(self) -> &'static str {
        match self {
            Errcode::Forbidden => "Forbidden access. Bad permissions or not authenticated.",
            Errcode::UnknownToken => "The access or refresh token specified was not recognized.",
            Errcode::MissingToken => "No access token was specified for the request.",
            Errcode::BadJson => "Request contained valid JSON, but it was malformed in some way.",
            Errcode::NotJson => "Request did not contain valid JSON.",
            Errcode::NotFound => "No resource was found for this request.",
            Errcode::LimitExceeded => {
                "Too many requests have been sent in a short period of time. \
                 Wait a while then try again."
            }
            Errcode::Unknown => "An unknown error has occurred.",
            Errcode::Unrecognized => "The server did not understand the request.",
            Errcode::Unauthorized => "The request was not correctly authorized.",
            Errcode::UserDeactivated => {
                "The user ID associated with the request has been deactivated."
            }
            Errcode::UserInUse => "The user ID specified has already been taken.",
            Errcode::InvalidUsername => "The user ID specified is not valid.",
            Errcode::RoomInUse => "The room alias given is already in use.",
            Errcode::InvalidRoomState => "The initial room state is invalid.",
            Errcode::ThreepidInUse => {
                "The given threepid cannot be used because the same threepid is already in use."
            }
            Errcode::ThreepidNotFound => {
                "The given threepid cannot be used because no record matching the threepid \
                 was found."
            }
            Errcode::ThreepidAuthFailed => {
                "Authentication could not be performed on the third party identifier."
            }
            Errcode::ThreepidDenied => {
                "The server does not permit this third party identifier."
            }
            Errcode::ServerNotTrusted => {
                "The request used a third party server that this server does not trust."
            }
            Errcode::UnsupportedRoomVersion => {
                "The request to create a room used a room version that the server \
                 does not support."
            }
            Errcode::IncompatibleRoomVersion => {
                "Attempted to join a room that has a version the server does not support."
            }
            Errcode::BadState => "The state change requested cannot be performed.",
            Errcode::GuestAccessForbidden => {
                "The room or resource does not permit guests to access it."
            }
            Errcode::CaptchaNeeded => "A Captcha is required to complete the request.",
            Errcode::CaptchaInvalid => "The Captcha provided did not match what was expected.",
            Errcode::MissingParam => "A required parameter was missing from the request.",
            Errcode::InvalidParam => "A required parameter was invalid in some way.",
            Errcode::TooLarge => "The request or entity was too large.",
            Errcode::Exclusive => {
                "The resource being requested is reserved by an application service, \
                 or the application service making the request has not created the resource."
            }
            Errcode::ResourceLimitExceeded => {
                "The request cannot be completed because the homeserver has reached \
                 a resource limit imposed on it."
            }
            Errcode::CannotLeaveServerNoticeRoom => {
                "The user is unable to reject an invite to join the server notices room."
            }
        }
    }

    /// The HTTP status this code maps to when the handler does not say
    /// otherwise.
    fn default_status(self) -> StatusCode {
        match self {
            Errcode::Forbidden | Errcode::UserDeactivated | Errcode::GuestAccessForbidden => {
                StatusCode::FORBIDDEN
            }
            Errcode::UnknownToken
            | Errcode::MissingToken
            | Errcode::Unauthorized => StatusCode::UNAUTHORIZED,
            Errcode::NotFound => StatusCode::NOT_FOUND,
            Errcode::LimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Errcode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
            Errcode::ResourceLimitExceeded => StatusCode::INTERNAL_SERVER_ERROR,
            Errcode::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// A Matrix-style application error, rendered as
/// `{"errcode": "M_*", "error": "..."}` with an appropriate HTTP status.
///
/// Handlers return `Result<_, MatrixError>`; the default status and message
/// for a code can be overridden where an endpoint's contract differs:
///
/// ```
/// use neurite_core::{Errcode, MatrixError};
///
/// let e = MatrixError::new(Errcode::UnknownToken);
/// let custom = MatrixError::new(Errcode::Unknown)
///     .with_message("Room alias already exists.")
///     .with_status(axum::http::StatusCode::CONFLICT);
/// ```
#[derive(Debug, Clone)]
pub struct MatrixError {
    errcode: Errcode,
    message: Option<String>,
    status: Option<StatusCode>,
}

impl MatrixError {
    pub fn new(errcode: Errcode) -> Self {
        Self {
            errcode,
            message: None,
            status: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn errcode(&self) -> Errcode {
        self.errcode
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or_else(|| self.errcode.default_status())
    }

    pub fn message(&self) -> &str {
        self.message
            .as_deref()
            .unwrap_or_else(|| self.errcode.default_message())
    }

    /// The response body alone, for callers that embed errors in larger
    /// documents.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "errcode": self.errcode.as_str(),
            "error": self.message(),
        })
    }
}

impl From<Errcode> for MatrixError {
    fn from(errcode: Errcode) -> Self {
        MatrixError::new(errcode)
    }
}

impl std::fmt::Display for MatrixError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.errcode.as_str(), self.message())
    }
}

impl std::error::Error for MatrixError {}

impl IntoResponse for MatrixError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn error_parts(err: MatrixError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn forbidden_maps_to_403() {
        let (status, body) = error_parts(MatrixError::new(Errcode::Forbidden)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["errcode"], "M_FORBIDDEN");
    }

    #[tokio::test]
    async fn unknown_token_maps_to_401() {
        let (status, body) = error_parts(MatrixError::new(Errcode::UnknownToken)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["errcode"], "M_UNKNOWN_TOKEN");
    }

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let (status, body) = error_parts(MatrixError::new(Errcode::NotFound)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errcode"], "M_NOT_FOUND");
    }

    #[tokio::test]
    async fn limit_exceeded_maps_to_429() {
        let (status, _) = error_parts(MatrixError::new(Errcode::LimitExceeded)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn bad_json_and_not_json_map_to_400() {
        for code in [Errcode::BadJson, Errcode::NotJson, Errcode::UserInUse, Errcode::RoomInUse] {
            let (status, _) = error_parts(MatrixError::new(code)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{code:?}");
        }
    }

    #[tokio::test]
    async fn custom_message_and_status_override_defaults() {
        let err = MatrixError::new(Errcode::Unknown)
            .with_message("Room alias already exists.")
            .with_status(StatusCode::CONFLICT);
        let (status, body) = error_parts(err).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errcode"], "M_UNKNOWN");
        assert_eq!(body["error"], "Room alias already exists.");
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = MatrixError::new(Errcode::MissingToken);
        assert_eq!(
            err.to_string(),
            "M_MISSING_TOKEN: No access token was specified for the request."
        );
    }
}
