use axum::{
    Extension, Json,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use cookie::{Cookie, SameSite};
use std::sync::Arc;

use super::extract::ValidJson;
use super::{
    ApiError, ApiResponse, AppState, CredentialsRequest, MessageResponse, SessionResponse,
};
use crate::domain::{SessionToken, UserId};
use crate::services::{LoginResult, UserInfo};

/// Cookie carrying the session token for browser clients.
pub const SESSION_COOKIE: &str = "sessionId";

/// Query parameter accepted when `server.allow_token_in_query` is on.
const SESSION_QUERY_PARAM: &str = "sessionId";

// ============================================================================
// Credential extraction
// ============================================================================

/// Pulls the session token out of a request.
///
/// Checked in order, first hit wins:
/// 1. `Authorization: Bearer <token>` header
/// 2. `sessionId` cookie
/// 3. `?sessionId=` query parameter, only when `allow_query` is set
#[must_use]
pub fn extract_session_token(
    headers: &HeaderMap,
    query: Option<&str>,
    allow_query: bool,
) -> Option<SessionToken> {
    if let Some(auth_header) = headers.get(header::AUTHORIZATION)
        && let Ok(auth_str) = auth_header.to_str()
        && let Some(token) = auth_str.strip_prefix("Bearer ")
        && !token.trim().is_empty()
    {
        return Some(SessionToken::new(token.trim()));
    }

    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| Cookie::split_parse(value))
        .filter_map(Result::ok)
        .find(|c| c.name() == SESSION_COOKIE && !c.value().is_empty());

    if let Some(cookie) = from_cookie {
        return Some(SessionToken::new(cookie.value()));
    }

    if allow_query
        && let Some(query) = query
    {
        return url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, value)| key == SESSION_QUERY_PARAM && !value.is_empty())
            .map(|(_, value)| SessionToken::new(value.into_owned()));
    }

    None
}

fn session_cookie(state: &AppState, token: &SessionToken) -> String {
    let mut cookie = Cookie::build((SESSION_COOKIE, token.as_str().to_owned()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(state.config.server.secure_cookies);

    if let Some(hours) = state.config.security.session_ttl_hours {
        let seconds = i64::try_from(hours).unwrap_or(i64::MAX).saturating_mul(3600);
        cookie = cookie.max_age(time::Duration::seconds(seconds));
    }

    cookie.build().to_string()
}

fn removal_cookie(state: &AppState) -> String {
    Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(state.config.server.secure_cookies)
        .max_age(time::Duration::ZERO)
        .build()
        .to_string()
}

fn session_response(state: &AppState, status: StatusCode, result: &LoginResult) -> Response {
    (
        status,
        [(header::SET_COOKIE, session_cookie(state, &result.session_token))],
        Json(ApiResponse::success(SessionResponse {
            session_token: result.session_token.as_str().to_owned(),
        })),
    )
        .into_response()
}

// ============================================================================
// Middleware
// ============================================================================

/// Rejects requests without a live session and attaches the caller's
/// [`UserId`] and [`SessionToken`] as request extensions.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_session_token(
        request.headers(),
        request.uri().query(),
        state.config.server.allow_token_in_query,
    );

    let user_id = state.auth.authenticate(token.as_ref()).await?;

    tracing::Span::current().record("user_id", user_id.value());
    request.extensions_mut().insert(user_id);
    if let Some(token) = token {
        request.extensions_mut().insert(token);
    }

    Ok(next.run(request).await)
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /signup
pub async fn signup(
    State(state): State<Arc<AppState>>,
    ValidJson(payload): ValidJson<CredentialsRequest>,
) -> Result<Response, ApiError> {
    let result = state
        .auth
        .signup(&payload.username, &payload.password)
        .await?;

    Ok(session_response(&state, StatusCode::CREATED, &result))
}

/// POST /login
pub async fn login(
    State(state): State<Arc<AppState>>,
    ValidJson(payload): ValidJson<CredentialsRequest>,
) -> Result<Response, ApiError> {
    let result = state
        .auth
        .login(&payload.username, &payload.password)
        .await?;

    Ok(session_response(&state, StatusCode::OK, &result))
}

/// GET /logout
///
/// Always succeeds and clears the cookie, whether or not the token was live.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<impl IntoResponse, ApiError> {
    let token = extract_session_token(
        &headers,
        uri.query(),
        state.config.server.allow_token_in_query,
    );

    if let Some(token) = token {
        state.auth.logout(&token).await?;
        state.sync.drop_session(&token).await;
    }

    Ok((
        [(header::SET_COOKIE, removal_cookie(&state))],
        Json(ApiResponse::success(MessageResponse {
            message: "Logged out".to_string(),
        })),
    ))
}

/// GET /me
pub async fn get_current_user(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
) -> Result<Json<ApiResponse<UserInfo>>, ApiError> {
    let info = state.auth.get_user_info(user_id).await?;
    Ok(Json(ApiResponse::success(info)))
}
