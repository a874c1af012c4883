//! HTTP entry point: one handler routing by session id and transport.

use std::str::FromStr;
use std::sync::{Arc, Weak};

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequest, FromRequestParts, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use eio_core::handshake::Handshake;
use eio_core::options::EngineOptions;
use eio_core::packet::Packet;
use eio_core::payload;
use eio_core::transport::{Transport, TransportKind};
use eio_core::PROTOCOL_VERSION;
use eio_polling::{content_type_for, GetOutcome, PollingTransport, PostOutcome, POST_OK_BODY};
use eio_websocket::WebSocketTransport;

use crate::engine::Engine;

#[derive(Debug, Deserialize)]
struct EngineQuery {
    #[serde(rename = "EIO")]
    eio: Option<String>,
    transport: Option<String>,
    sid: Option<String>,
    /// Cache buster; semantically ignored.
    t: Option<String>,
    /// `1` when the client cannot decode binary frames. The polling
    /// payload base64-encodes binary packets regardless, so it only gets
    /// logged here.
    b64: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u8,
    message: &'static str,
}

fn bad_request(code: u8, message: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { code, message })).into_response()
}

fn transport_unknown() -> Response {
    bad_request(0, "Transport unknown")
}

fn session_unknown() -> Response {
    bad_request(1, "Session ID unknown")
}

fn bad_handshake_method() -> Response {
    bad_request(2, "Bad handshake method")
}

fn generic_bad_request() -> Response {
    bad_request(3, "Bad request")
}

pub(crate) fn router(engine: Weak<Engine>, path: &str) -> Router {
    Router::new().route(path, any(handle)).with_state(engine)
}

async fn handle(State(engine): State<Weak<Engine>>, request: Request) -> Response {
    let Some(engine) = engine.upgrade() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let (mut parts, body) = request.into_parts();
    let query = match Query::<EngineQuery>::from_request_parts(&mut parts, &()).await {
        Ok(Query(query)) => query,
        Err(_) => return generic_bad_request(),
    };
    let method = parts.method.clone();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &()).await.ok();
    let body = match Bytes::from_request(Request::from_parts(parts, body), &()).await {
        Ok(body) => body,
        Err(_) => return generic_bad_request(),
    };
    if query.eio.as_deref() != Some(PROTOCOL_VERSION) {
        return generic_bad_request();
    }
    let Some(kind) = query
        .transport
        .as_deref()
        .and_then(|name| TransportKind::from_str(name).ok())
    else {
        return transport_unknown();
    };
    if !engine.options().transport_enabled(kind) {
        return transport_unknown();
    }
    debug!(
        transport = %kind,
        sid = ?query.sid,
        t = ?query.t,
        b64 = ?query.b64,
        "engine request"
    );

    match query.sid {
        None => handshake(engine, kind, &method, ws).await,
        Some(sid) => existing_session(engine, &sid, kind, &method, ws, &body).await,
    }
}

/// A request without a session id establishes a new session.
async fn handshake(
    engine: Arc<Engine>,
    kind: TransportKind,
    method: &Method,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if *method != Method::GET {
        return bad_handshake_method();
    }
    let options = engine.options().clone();
    match kind {
        TransportKind::Polling => {
            let socket = engine.create_socket();
            let transport = Arc::new(PollingTransport::new(
                options.ping_timeout,
                options.ping_timeout,
                socket.child_token(),
            ));
            if socket.attach(transport.clone()).is_err() {
                return generic_bad_request();
            }
            let open = match open_packet(&options, socket.id(), kind) {
                Ok(open) => open,
                Err(response) => return response,
            };
            if transport.write(open).await.is_err() {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            engine.register(&socket);
            socket.start();
            match transport.handle_get().await {
                GetOutcome::Packets(batch) => {
                    poll_response(&options, Some(socket.id()), &batch)
                }
                GetOutcome::Conflict => generic_bad_request(),
            }
        }
        TransportKind::Websocket => {
            let Some(ws) = ws else {
                return generic_bad_request();
            };
            ws.write_buffer_size(eio_websocket::BUFFER_SIZE)
                .on_upgrade(move |connection| async move {
                    let socket = engine.create_socket();
                    let transport = Arc::new(WebSocketTransport::new(
                        options.ping_timeout,
                        socket.child_token(),
                    ));
                    if socket.attach(transport.clone()).is_err() {
                        return;
                    }
                    let Ok(open) = open_packet(&options, socket.id(), TransportKind::Websocket)
                    else {
                        return;
                    };
                    if transport.write(open).await.is_err() {
                        return;
                    }
                    engine.register(&socket);
                    socket.start();
                    transport.run(connection, socket).await;
                })
        }
    }
}

/// A request with a session id is delivered to that session's transport,
/// or starts an upgrade when the kind differs.
async fn existing_session(
    engine: Arc<Engine>,
    sid: &str,
    kind: TransportKind,
    method: &Method,
    ws: Option<WebSocketUpgrade>,
    body: &[u8],
) -> Response {
    let Some(socket) = engine.get(sid) else {
        return session_unknown();
    };
    if socket.is_closed() {
        return session_unknown();
    }

    match kind {
        TransportKind::Polling => {
            // a framed session cannot fall back to polling
            let Some(transport) = socket.transport_of_kind(TransportKind::Polling) else {
                return generic_bad_request();
            };
            let Some(polling) = transport.as_any().downcast_ref::<PollingTransport>() else {
                return generic_bad_request();
            };
            if *method == Method::GET {
                match polling.handle_get().await {
                    GetOutcome::Packets(batch) => poll_response(engine.options(), None, &batch),
                    GetOutcome::Conflict => generic_bad_request(),
                }
            } else if *method == Method::POST {
                match polling.handle_post(body, &socket) {
                    PostOutcome::Accepted => (StatusCode::OK, POST_OK_BODY).into_response(),
                    PostOutcome::Conflict => generic_bad_request(),
                    PostOutcome::Malformed(e) => {
                        warn!(sid = %socket.id(), error = %e, "undecodable payload");
                        generic_bad_request()
                    }
                    PostOutcome::Overloaded => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                    PostOutcome::Gone => session_unknown(),
                }
            } else {
                bad_handshake_method()
            }
        }
        TransportKind::Websocket => {
            if socket.transport_of_kind(TransportKind::Websocket).is_some() {
                return generic_bad_request();
            }
            if !engine.options().allow_upgrades {
                return generic_bad_request();
            }
            let Some(ws) = ws else {
                return generic_bad_request();
            };
            let write_timeout = engine.options().ping_timeout;
            ws.write_buffer_size(eio_websocket::BUFFER_SIZE)
                .on_upgrade(move |connection| async move {
                    let transport =
                        Arc::new(WebSocketTransport::new(write_timeout, socket.child_token()));
                    if socket.attach(transport.clone()).is_err() {
                        warn!(sid = %socket.id(), "upgrade attach refused");
                        return;
                    }
                    transport.run(connection, socket).await;
                })
        }
    }
}

fn open_packet(
    options: &EngineOptions,
    sid: &str,
    kind: TransportKind,
) -> Result<Packet, Response> {
    let handshake = Handshake {
        sid: sid.to_owned(),
        upgrades: options.upgrades_for(kind),
        ping_interval: options.ping_interval.as_millis().try_into().unwrap_or(u64::MAX),
        ping_timeout: options.ping_timeout.as_millis().try_into().unwrap_or(u64::MAX),
    };
    Packet::open(&handshake).map_err(|e| {
        warn!(error = %e, "handshake body failed to encode");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

fn poll_response(options: &EngineOptions, new_sid: Option<&str>, batch: &[Packet]) -> Response {
    match payload::encode(batch) {
        Ok(body) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(content_type_for(batch)),
            );
            if let (Some(sid), Some(cookie)) = (new_sid, options.cookie.as_deref()) {
                match HeaderValue::from_str(&format!("{cookie}={sid}")) {
                    Ok(value) => {
                        headers.insert(header::SET_COOKIE, value);
                    }
                    Err(e) => warn!(error = %e, "session cookie not representable"),
                }
            }
            (StatusCode::OK, headers, body).into_response()
        }
        Err(e) => {
            warn!(error = %e, "payload failed to encode");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
