use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use regex::Regex;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::bridge::{HandshakeBridge, Verification};
use crate::error::RouteError;
use crate::options::ResolvedOptions;
use crate::request::{Request, UpgradeInfo};
use crate::response::Response;
use crate::router::{Outcome, Router};

type HttpResponse = http::Response<Full<Bytes>>;

/// Base64 of a 16-byte nonce.
static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+/0-9A-Za-z]{22}==$").expect("key pattern compiles"));

const SUPPORTED_VERSIONS: &str = "13, 8";

/// Shared per-listener state: the root router and the upgrade bridge in
/// front of it.
pub(crate) struct Server {
    router: Arc<Router>,
    bridge: HandshakeBridge,
    module_name: String,
}

impl Server {
    pub(crate) fn new(router: Router, options: &ResolvedOptions) -> Self {
        let router = Arc::new(router);
        Self {
            bridge: HandshakeBridge::new(Arc::clone(&router), options),
            router,
            module_name: options.module_name().to_string(),
        }
    }

    /// Accept connections until `shutdown` resolves. Each connection is
    /// served in its own task; connections already accepted keep running.
    pub(crate) async fn run<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let server = Arc::new(self);
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, module = %server.module_name, "listening");

        tokio::pin!(shutdown);
        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                () = &mut shutdown => {
                    tracing::info!(
                        addr = %local_addr,
                        "shutdown requested; no longer accepting connections"
                    );
                    return Ok(());
                }
            };

            let server = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream, remote_addr).await {
                    tracing::debug!(%remote_addr, %err, "connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let connection_id = Uuid::new_v4();
        tracing::debug!(%connection_id, %remote_addr, "connection accepted");

        let service = service_fn(move |req| {
            let server = Arc::clone(&self);
            async move {
                Ok::<_, Infallible>(server.respond(req, remote_addr, connection_id).await)
            }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await?;

        tracing::debug!(%connection_id, %remote_addr, "connection closed");
        Ok(())
    }

    async fn respond(
        &self,
        req: hyper::Request<Incoming>,
        remote_addr: SocketAddr,
        connection_id: Uuid,
    ) -> HttpResponse {
        if UpgradeInfo::from_head(req.uri(), req.headers()).is_some() {
            return self.upgrade(req, remote_addr, connection_id).await;
        }

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                tracing::debug!(%connection_id, %err, "failed to read request body");
                return abort(StatusCode::BAD_REQUEST, None);
            }
        };

        let mut req = Request::from_parts(parts, body).with_remote_addr(remote_addr);
        let mut res = Response::http();

        match self.router.handle(&mut req, &mut res).await {
            Outcome::Handled => {}
            Outcome::Unhandled(_) if res.is_finished() => {}
            Outcome::Unhandled(None) => {
                let message = format!("Cannot {} {}", req.method(), req.uri().path());
                return text_response(StatusCode::NOT_FOUND, message);
            }
            Outcome::Unhandled(Some(err)) => {
                tracing::warn!(
                    %connection_id,
                    method = %req.method(),
                    path = %req.uri().path(),
                    error = %err,
                    "request ended with unhandled error"
                );
                let status = err.status_code();
                return text_response(status, public_message(&err, status));
            }
        }

        res.into_http()
    }

    async fn upgrade(
        &self,
        mut req: hyper::Request<Incoming>,
        remote_addr: SocketAddr,
        connection_id: Uuid,
    ) -> HttpResponse {
        if let Err(response) = validate_upgrade(&req) {
            tracing::debug!(
                %connection_id,
                %remote_addr,
                status = %response.status(),
                "malformed websocket upgrade"
            );
            return response;
        }

        let accept_key = req
            .headers()
            .get(header::SEC_WEBSOCKET_KEY)
            .map(|key| derive_accept_key(key.as_bytes()));
        let on_upgrade = hyper::upgrade::on(&mut req);
        let (parts, _body) = req.into_parts();
        let req = Request::from_parts(parts, Bytes::new()).with_remote_addr(remote_addr);
        let path = req.uri().path().to_string();

        let pending = match self.bridge.verify(req).await {
            Verification::Accepted(pending) => pending,
            Verification::Rejected { status, message } => {
                tracing::info!(
                    %connection_id,
                    %remote_addr,
                    %path,
                    %status,
                    "websocket upgrade rejected"
                );
                return abort(status, message);
            }
        };

        let protocol = pending
            .request()
            .upgrade()
            .and_then(|info| info.protocols.first().cloned());

        let mut response = http::Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        if let Some(accept) = accept_key.and_then(|key| HeaderValue::from_str(&key).ok()) {
            headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        }
        if let Some(value) = protocol.as_deref().and_then(|p| HeaderValue::from_str(p).ok()) {
            headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let socket =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                            .await;
                    tracing::info!(
                        %connection_id,
                        %remote_addr,
                        %path,
                        protocol = protocol.as_deref().unwrap_or("<none>"),
                        "websocket connected"
                    );
                    pending.complete(socket).await;
                    tracing::debug!(%connection_id, %path, "websocket handler finished");
                }
                Err(err) => {
                    tracing::warn!(%connection_id, %remote_addr, %err, "websocket upgrade failed");
                }
            }
        });

        response
    }
}

/// Checks the socket library performs before an attempt reaches the router.
fn validate_upgrade<B>(req: &http::Request<B>) -> Result<(), HttpResponse> {
    if req.method() != Method::GET {
        return Err(abort(StatusCode::METHOD_NOT_ALLOWED, None));
    }

    // hyper only hands over the connection for HTTP/1.1 upgrades.
    if req.version() != Version::HTTP_11 {
        return Err(abort(
            StatusCode::BAD_REQUEST,
            Some("WebSocket upgrades require HTTP/1.1".to_string()),
        ));
    }

    let key_ok = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|key| KEY_PATTERN.is_match(key.trim()));
    if !key_ok {
        return Err(abort(
            StatusCode::BAD_REQUEST,
            Some("Missing or invalid Sec-WebSocket-Key header".to_string()),
        ));
    }

    let version_ok = req
        .headers()
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| matches!(v.trim(), "8" | "13"));
    if !version_ok {
        let mut response = abort(
            StatusCode::BAD_REQUEST,
            Some("Missing or invalid Sec-WebSocket-Version header".to_string()),
        );
        response.headers_mut().insert(
            header::SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static(SUPPORTED_VERSIONS),
        );
        return Err(response);
    }

    Ok(())
}

/// Handshake rejection: closes the connection with an HTML body carrying
/// `message`, or the status reason when there is none.
fn abort(status: StatusCode, message: Option<String>) -> HttpResponse {
    let body = message.unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_string());
    let mut response = http::Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
    response
}

fn text_response(status: StatusCode, body: String) -> HttpResponse {
    let mut response = http::Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Message safe to show a client: explicit status errors carry their own,
/// everything else falls back to the reason phrase.
fn public_message(err: &RouteError, status: StatusCode) -> String {
    match err {
        RouteError::Status { message, .. } => message.clone(),
        _ => status.canonical_reason().unwrap_or_default().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_pattern() {
        assert!(KEY_PATTERN.is_match("dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(!KEY_PATTERN.is_match("dGhlIHNhbXBsZSBub25jZQ"));
        assert!(!KEY_PATTERN.is_match("not-a-key"));
        assert!(!KEY_PATTERN.is_match(""));
    }

    fn upgrade_head(version: Version) -> http::Request<()> {
        http::Request::builder()
            .method(Method::GET)
            .version(version)
            .uri("/ok")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .body(())
            .unwrap()
    }

    #[test]
    fn upgrades_need_http_1_1() {
        assert!(validate_upgrade(&upgrade_head(Version::HTTP_11)).is_ok());

        let response = validate_upgrade(&upgrade_head(Version::HTTP_10)).unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[header::CONNECTION], "close");
    }

    #[test]
    fn abort_uses_reason_without_message() {
        let response = abort(StatusCode::NOT_FOUND, None);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONNECTION], "close");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
    }

    #[tokio::test]
    async fn abort_body_is_message() {
        let response = abort(StatusCode::FORBIDDEN, Some("Origin not allowed".to_string()));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"Origin not allowed");
    }

    #[test]
    fn internal_errors_do_not_leak() {
        let err = RouteError::from(anyhow::anyhow!("secret detail"));
        assert_eq!(
            public_message(&err, err.status_code()),
            "Internal Server Error"
        );

        let err = RouteError::status(StatusCode::CONFLICT, "name taken");
        assert_eq!(public_message(&err, err.status_code()), "name taken");
    }
}
