//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo, one task per connection.
//!
//! Routes:
//! - `GET /health` liveness
//! - `GET /api/status` current space status
//! - `POST /api/login` credentials in, session token out
//! - `PUT /api/buzzer?door=<door>` buzz a door, needs a bearer token

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::{bearer_token, AuthResult, Authenticator, SessionSigner};
use crate::bus::{is_open_for_member, BusHandler, Door};
use crate::types::{Result, SesameError};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub bus: BusHandler,
    pub auth: Arc<dyn Authenticator>,
    pub sessions: SessionSigner,
    /// Minimum duration of a login request
    pub login_delay: Duration,
}

#[derive(Deserialize)]
struct LoginRequest {
    login: String,
    password: String,
    #[serde(default)]
    remember: bool,
}

#[derive(Serialize)]
struct LoginResponse<'a> {
    token: String,
    user: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    open: bool,
    age_seconds: Option<u64>,
}

#[derive(Deserialize)]
struct BuzzerQuery {
    door: Option<String>,
}

/// Bind `addr` and serve until the listener fails
pub async fn run(addr: SocketAddr, state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

/// Serve connections from an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    info!("Sesame listening on {}", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request<B>(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<B>,
) -> std::result::Result<Response<BoxBody>, hyper::Error>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    debug!(method = %req.method(), path = %req.uri().path(), %addr, "request");
    Ok(to_boxed(route(&state, req).await))
}

/// Dispatch a request to its handler
pub async fn route<B>(state: &AppState, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            json_response(StatusCode::OK, &json!({ "healthy": true }))
        }
        (Method::GET, "/api/status") => handle_status(state),
        (Method::POST, "/api/login") => handle_login(state, req).await,
        (Method::PUT, "/api/buzzer") => handle_buzzer(state, req).await,
        (_, "/health" | "/healthz" | "/api/status" | "/api/login" | "/api/buzzer") => {
            json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &json!({ "error": "method_not_allowed" }),
            )
        }
        _ => json_response(
            StatusCode::NOT_FOUND,
            &json!({ "error": "Not Found", "path": path }),
        ),
    }
}

fn handle_status(state: &AppState) -> Response<Full<Bytes>> {
    let status = state.bus.status();
    let response = StatusResponse {
        open: is_open_for_member(&status.value),
        age_seconds: status.age().map(|age| age.as_secs()),
        status: status.value,
    };
    json_response(StatusCode::OK, &response)
}

async fn handle_login<B>(state: &AppState, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let started = Instant::now();
    let response = login_response(state, req).await;

    // every answer, malformed requests included, takes the same minimum time
    tokio::time::sleep_until(started + state.login_delay).await;
    response
}

async fn login_response<B>(state: &AppState, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let request: LoginRequest = match read_json(req).await {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };

    match state
        .auth
        .check_password(&request.login, &request.password)
        .await
    {
        AuthResult::Success(user) => match state.sessions.issue(&user, request.remember) {
            Ok(token) => {
                info!(user = %user, remember = request.remember, "login");
                json_response(StatusCode::OK, &LoginResponse { token, user: &user })
            }
            Err(e) => {
                error!(error = %e, "could not issue session");
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &json!({ "error": "system_error" }),
                )
            }
        },
        AuthResult::NotFound | AuthResult::InvalidCredentials => json_response(
            StatusCode::UNAUTHORIZED,
            &json!({ "error": "invalid_login" }),
        ),
        AuthResult::SystemError(reason) => {
            warn!(login = %request.login, reason = %reason, "login failed with system error");
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({ "error": "system_error" }),
            )
        }
    }
}

async fn handle_buzzer<B>(state: &AppState, req: Request<B>) -> Response<Full<Bytes>> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    let claims = match bearer_token(header).map(|token| state.sessions.validate(token)) {
        Some(Ok(claims)) => claims,
        Some(Err(e)) => {
            debug!(error = %e, "rejected session");
            return json_response(StatusCode::UNAUTHORIZED, &json!({ "result": "LOGIN" }));
        }
        None => return json_response(StatusCode::UNAUTHORIZED, &json!({ "result": "LOGIN" })),
    };

    let door = match parse_door(req.uri().query()) {
        Ok(door) => door,
        Err(e) => return error_response(e),
    };

    let result = if state.bus.send_door_buzzer(door, &claims.sub).await {
        "OK"
    } else {
        "ERROR"
    };
    json_response(StatusCode::OK, &json!({ "result": result }))
}

fn parse_door(query: Option<&str>) -> Result<Door> {
    let query: BuzzerQuery = serde_urlencoded::from_str(query.unwrap_or_default())
        .map_err(|e| SesameError::BadRequest(e.to_string()))?;
    query
        .door
        .ok_or_else(|| SesameError::BadRequest("Missing 'door' param.".into()))?
        .parse()
}

async fn read_json<B, T>(req: Request<B>) -> Result<T>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
    T: serde::de::DeserializeOwned,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| SesameError::Http(format!("Failed to read body: {e}")))?
        .to_bytes();
    Ok(serde_json::from_slice(&body)?)
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

fn error_response(err: SesameError) -> Response<Full<Bytes>> {
    let (status, message) = err.into_status_code_and_body();
    json_response(status, &json!({ "error": message }))
}

fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}
