use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, Limited};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::{net::TcpListener, sync::oneshot};
use url::form_urlencoded;

use crate::{
    config::Config,
    model::{ClientSession, RequestDetail, RequestDraft},
    storage::{CaptureRequest, Storage, StoreError},
};

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const REQUESTS_DEFAULT_LIMIT: usize = 100;

#[derive(Debug)]
pub struct ServerHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct ApiState {
    storage: Storage,
}

pub async fn serve(config: &Config) -> anyhow::Result<ServerHandle> {
    let storage = Storage::from_config(config)?;
    serve_with_storage(config.server.listen, storage).await
}

pub async fn serve_with_storage(
    listen: SocketAddr,
    storage: Storage,
) -> anyhow::Result<ServerHandle> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    let listen_addr = listener.local_addr().context("read listener address")?;
    tracing::info!(%listen_addr, db_path = %storage.db_path().display(), "capture server listening");

    let state = Arc::new(ApiState { storage });
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            api_handler(req, peer, Arc::clone(&state))
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ServerHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    Health,
    Apps,
    App(&'a str),
    Sessions,
    SessionLinks(i64),
    SessionRequests(i64),
    Capture,
    LatestRequest,
    Request(i64),
    RequestPopulate(i64),
    RequestResponse(i64),
}

fn parse_route(path: &str) -> Option<Route<'_>> {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    let segments: Vec<&str> = trimmed.split('/').skip(1).collect();
    let id = |raw: &str| raw.parse::<i64>().ok();

    match segments.as_slice() {
        ["healthz"] => Some(Route::Health),
        ["api", "apps"] => Some(Route::Apps),
        ["api", "apps", code] if !code.is_empty() => Some(Route::App(*code)),
        ["api", "sessions"] => Some(Route::Sessions),
        ["api", "sessions", session_id, "links"] => id(*session_id).map(Route::SessionLinks),
        ["api", "sessions", session_id, "requests"] => {
            id(*session_id).map(Route::SessionRequests)
        }
        ["api", "capture"] => Some(Route::Capture),
        ["api", "requests", "latest"] => Some(Route::LatestRequest),
        ["api", "requests", request_id] => id(*request_id).map(Route::Request),
        ["api", "requests", request_id, "populate"] => id(*request_id).map(Route::RequestPopulate),
        ["api", "requests", request_id, "response"] => id(*request_id).map(Route::RequestResponse),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateAppRequest {
    code: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateSessionRequest {
    app_code: String,
    key: String,
    #[serde(default)]
    client_username: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkSessionRequest {
    session_id: i64,
}

/// Capture payload. `remote_addr` defaults to the peer of the submitting connection.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CaptureBody {
    app_code: String,
    session_key: String,
    #[serde(default)]
    client_username: Option<String>,
    #[serde(default)]
    remote_addr: Option<IpAddr>,
    full_url: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct CaptureResponse {
    id: i64,
}

#[derive(Debug, Serialize)]
struct PartialPopulationResponse {
    id: i64,
    error: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateRequestBody {
    #[serde(default)]
    full_url: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordResponseBody {
    status_code: u16,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct RequestDetailResponse {
    #[serde(flatten)]
    detail: RequestDetail,
    query_string: String,
    form_body: String,
}

impl From<RequestDetail> for RequestDetailResponse {
    fn from(detail: RequestDetail) -> Self {
        Self {
            query_string: detail.query_params.to_url_encoded(),
            form_body: detail.form_params.to_url_encoded(),
            detail,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct RequestsPage {
    offset: usize,
    limit: usize,
}

/// Pagination for `/api/sessions/{id}/requests`. The session comes from the path,
/// so a `session_id` parameter is rejected rather than ignored.
fn parse_requests_page(uri: &Uri) -> Result<RequestsPage, String> {
    let mut page = RequestsPage {
        offset: 0,
        limit: REQUESTS_DEFAULT_LIMIT,
    };
    let Some(raw_query) = uri.query() else {
        return Ok(page);
    };

    for (key, value) in form_urlencoded::parse(raw_query.as_bytes()) {
        match key.as_ref() {
            "offset" => page.offset = parse_pagination(&value, "offset")?,
            "limit" => page.limit = parse_pagination(&value, "limit")?,
            "session_id" => {
                return Err(
                    "query parameter `session_id` is not accepted here; the session is part of the path"
                        .to_owned(),
                );
            }
            _ => {}
        }
    }

    Ok(page)
}

/// Optional `session_id` filter for `/api/requests/latest`.
fn parse_latest_session(uri: &Uri) -> Result<Option<i64>, String> {
    let Some(raw_query) = uri.query() else {
        return Ok(None);
    };

    let mut session_id = None;
    for (key, value) in form_urlencoded::parse(raw_query.as_bytes()) {
        if key == "session_id" {
            let parsed = value
                .trim()
                .parse::<i64>()
                .map_err(|_| "query parameter `session_id` must be an integer".to_owned())?;
            session_id = Some(parsed);
        }
    }
    Ok(session_id)
}

fn parse_pagination(value: &str, field_name: &str) -> Result<usize, String> {
    if value.is_empty() {
        return Err(format!("query parameter `{field_name}` must not be empty"));
    }
    let parsed = value
        .parse::<usize>()
        .map_err(|_| format!("query parameter `{field_name}` must be a non-negative integer"))?;
    if i64::try_from(parsed).is_err() {
        return Err(format!(
            "query parameter `{field_name}` exceeds supported sqlite range"
        ));
    }
    Ok(parsed)
}

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(payload) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => {
            tracing::debug!("failed to serialize JSON response: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to serialize response",
            )
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let payload = ErrorResponse {
        error: message.into(),
    };
    let body = serde_json::to_vec(&payload).unwrap_or_else(|err| {
        tracing::debug!("failed to serialize error response: {err}");
        br#"{"error":"failed to serialize error response"}"#.to_vec()
    });
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn method_not_allowed() -> Response<Full<Bytes>> {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

fn status_for_store_error(err: &StoreError) -> StatusCode {
    match err {
        StoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        StoreError::ConstraintViolation(_) | StoreError::ResponseConflict(_) => {
            StatusCode::CONFLICT
        }
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::PartialPopulation { .. } => StatusCode::MULTI_STATUS,
        StoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_error_response(err: StoreError) -> Response<Full<Bytes>> {
    let status = status_for_store_error(&err);
    if status.is_server_error() {
        tracing::error!(kind = err.kind(), "storage error: {err}");
    } else {
        tracing::debug!(kind = err.kind(), "request rejected: {err}");
    }

    match err {
        StoreError::PartialPopulation { request_id, .. } => json_response(
            status,
            &PartialPopulationResponse {
                id: request_id,
                error: err.to_string(),
            },
        ),
        err => error_response(status, err.to_string()),
    }
}

async fn read_json_body<T: DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, Response<Full<Bytes>>> {
    let body_bytes = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(body) => body.to_bytes(),
        Err(err) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {err}"),
            ));
        }
    };

    serde_json::from_slice(&body_bytes).map_err(|err| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid JSON body: {err}"),
        )
    })
}

async fn api_handler(
    req: Request<Incoming>,
    peer: SocketAddr,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let response = match parse_route(&path) {
        Some(route) => route_request(route, req, peer, &state.storage).await,
        None => error_response(StatusCode::NOT_FOUND, "not found"),
    };

    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        "api request"
    );
    Ok(response)
}

async fn route_request(
    route: Route<'_>,
    req: Request<Incoming>,
    peer: SocketAddr,
    storage: &Storage,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    match route {
        Route::Health => match method {
            Method::GET => json_response(StatusCode::OK, &HealthResponse { status: "ok" }),
            _ => method_not_allowed(),
        },
        Route::Apps => match method {
            Method::POST => {
                let body: CreateAppRequest = match read_json_body(req).await {
                    Ok(body) => body,
                    Err(response) => return response,
                };
                match storage.create_app(&body.code, &body.name).await {
                    Ok(app) => json_response(StatusCode::CREATED, &app),
                    Err(err) => store_error_response(err),
                }
            }
            _ => method_not_allowed(),
        },
        Route::App(code) => match method {
            Method::GET => match storage.get_app_by_code(code).await {
                Ok(Some(app)) => json_response(StatusCode::OK, &app),
                Ok(None) => error_response(
                    StatusCode::NOT_FOUND,
                    format!("app `{code}` was not found"),
                ),
                Err(err) => store_error_response(err),
            },
            _ => method_not_allowed(),
        },
        Route::Sessions => match method {
            Method::POST => {
                let body: CreateSessionRequest = match read_json_body(req).await {
                    Ok(body) => body,
                    Err(response) => return response,
                };
                match storage
                    .create_session(&body.app_code, &body.key, body.client_username.as_deref())
                    .await
                {
                    Ok(session) => json_response(StatusCode::CREATED, &session),
                    Err(err) => store_error_response(err),
                }
            }
            _ => method_not_allowed(),
        },
        Route::SessionLinks(session_id) => {
            if let Err(response) = require_session(storage, session_id).await {
                return response;
            }
            match method {
                Method::GET => linked_sessions_response(storage, session_id, StatusCode::OK).await,
                Method::POST => {
                    let body: LinkSessionRequest = match read_json_body(req).await {
                        Ok(body) => body,
                        Err(response) => return response,
                    };
                    match storage.link_sessions(session_id, body.session_id).await {
                        Ok(()) => {
                            linked_sessions_response(storage, session_id, StatusCode::CREATED)
                                .await
                        }
                        Err(err) => store_error_response(err),
                    }
                }
                _ => method_not_allowed(),
            }
        }
        Route::SessionRequests(session_id) => {
            if method != Method::GET {
                return method_not_allowed();
            }
            if let Err(response) = require_session(storage, session_id).await {
                return response;
            }
            let page = match parse_requests_page(req.uri()) {
                Ok(page) => page,
                Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
            };
            match storage
                .list_requests(Some(session_id), page.offset, page.limit)
                .await
            {
                Ok(summaries) => json_response(StatusCode::OK, &summaries),
                Err(err) => store_error_response(err),
            }
        }
        Route::Capture => match method {
            Method::POST => {
                let body: CaptureBody = match read_json_body(req).await {
                    Ok(body) => body,
                    Err(response) => return response,
                };
                let capture = CaptureRequest {
                    app_code: body.app_code,
                    session_key: body.session_key,
                    client_username: body.client_username,
                    remote_addr: body.remote_addr.unwrap_or_else(|| peer.ip()),
                    full_url: body.full_url,
                    raw_content: body.content,
                };
                match storage.capture_request(capture).await {
                    Ok(id) => json_response(StatusCode::CREATED, &CaptureResponse { id }),
                    Err(err) => store_error_response(err),
                }
            }
            _ => method_not_allowed(),
        },
        Route::LatestRequest => {
            if method != Method::GET {
                return method_not_allowed();
            }
            let session_id = match parse_latest_session(req.uri()) {
                Ok(session_id) => session_id,
                Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
            };
            let latest = match storage.latest_request(session_id).await {
                Ok(latest) => latest,
                Err(err) => return store_error_response(err),
            };
            match latest {
                Some(request) => request_detail_response(storage, request.id, StatusCode::OK).await,
                None => error_response(StatusCode::NOT_FOUND, "no requests captured yet"),
            }
        }
        Route::Request(request_id) => match method {
            Method::GET => request_detail_response(storage, request_id, StatusCode::OK).await,
            Method::PUT => {
                let body: UpdateRequestBody = match read_json_body(req).await {
                    Ok(body) => body,
                    Err(response) => return response,
                };
                update_request(storage, request_id, body).await
            }
            _ => method_not_allowed(),
        },
        Route::RequestPopulate(request_id) => match method {
            Method::POST => match storage.repopulate_request(request_id).await {
                Ok(detail) => json_response(StatusCode::OK, &RequestDetailResponse::from(detail)),
                Err(err) => store_error_response(err),
            },
            _ => method_not_allowed(),
        },
        Route::RequestResponse(request_id) => match method {
            Method::GET => match storage.get_response(request_id).await {
                Ok(Some(response)) => json_response(StatusCode::OK, &response),
                Ok(None) => error_response(
                    StatusCode::NOT_FOUND,
                    format!("request {request_id} has no response"),
                ),
                Err(err) => store_error_response(err),
            },
            Method::POST => {
                let body: RecordResponseBody = match read_json_body(req).await {
                    Ok(body) => body,
                    Err(response) => return response,
                };
                match storage
                    .record_response(request_id, body.status_code, &body.content)
                    .await
                {
                    Ok(response) => json_response(StatusCode::CREATED, &response),
                    Err(err) => store_error_response(err),
                }
            }
            _ => method_not_allowed(),
        },
    }
}

async fn require_session(
    storage: &Storage,
    session_id: i64,
) -> Result<ClientSession, Response<Full<Bytes>>> {
    match storage.get_session(session_id).await {
        Ok(Some(session)) => Ok(session),
        Ok(None) => Err(error_response(
            StatusCode::NOT_FOUND,
            format!("session {session_id} was not found"),
        )),
        Err(err) => Err(store_error_response(err)),
    }
}

async fn linked_sessions_response(
    storage: &Storage,
    session_id: i64,
    status: StatusCode,
) -> Response<Full<Bytes>> {
    match storage.linked_sessions(session_id).await {
        Ok(sessions) => json_response(status, &sessions),
        Err(err) => store_error_response(err),
    }
}

async fn request_detail_response(
    storage: &Storage,
    request_id: i64,
    status: StatusCode,
) -> Response<Full<Bytes>> {
    match storage.get_request(request_id).await {
        Ok(Some(detail)) => json_response(status, &RequestDetailResponse::from(detail)),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("request {request_id} was not found"),
        ),
        Err(err) => store_error_response(err),
    }
}

async fn update_request(
    storage: &Storage,
    request_id: i64,
    body: UpdateRequestBody,
) -> Response<Full<Bytes>> {
    let detail = match storage.get_request(request_id).await {
        Ok(Some(detail)) => detail,
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("request {request_id} was not found"),
            );
        }
        Err(err) => return store_error_response(err),
    };

    let mut draft = RequestDraft::from(detail.request);
    if let Some(full_url) = body.full_url {
        draft.full_url = full_url;
    }
    if let Some(content) = body.content {
        draft.content = content;
    }

    match storage.save_request(draft).await {
        Ok(saved) => request_detail_response(storage, saved.id, StatusCode::OK).await,
        Err(err) => store_error_response(err),
    }
}
