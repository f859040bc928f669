use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use ws_router::{
    App, ConnectionHandler, Decide, Flow, Middleware, OriginGuard, Request, Response, RouteError,
    WebSocket,
};

use crate::config::Config;
use crate::rooms::{self, Rooms};

/// Buffered messages per room before slow members start dropping.
const ROOM_CAPACITY: usize = 64;

/// Build the application: request logging, origin checks, optional token
/// auth, `/health`, and the `/echo` and `/rooms/:room` sockets.
pub fn build_app(config: &Config) -> anyhow::Result<App> {
    let mut app =
        App::with_options(config.websocket.clone()).context("invalid websocket options")?;

    app.use_middleware(log_request);
    app.use_middleware(OriginGuard::new(&config.origin_allowlist));
    app.get("/health", health);

    if let Some(token) = config.auth.token.clone() {
        app.use_middleware(require_token(token));
    }

    app.websocket("/echo", |_req: &Request, cb: Decide| async move {
        cb.accept(ConnectionHandler::from_socket(echo))?;
        Ok::<_, RouteError>(Flow::Stop)
    });

    let rooms = Arc::new(Rooms::new(ROOM_CAPACITY));
    app.websocket("/rooms/:room", move |req: &Request, cb: Decide| {
        let rooms = Arc::clone(&rooms);
        let room = req.param("room").map(str::to_string);
        async move {
            let Some(room) = room else {
                cb.reject_with(StatusCode::BAD_REQUEST, "missing room")?;
                return Ok(Flow::Stop);
            };
            cb.accept_with(move |socket, _req| async move {
                tracing::info!(%room, "member joined");
                rooms::serve_member(&rooms, &room, socket).await;
                tracing::info!(%room, "member left");
            })?;
            Ok::<_, RouteError>(Flow::Stop)
        }
    });

    Ok(app)
}

fn log_request(req: &mut Request, _res: &mut Response) -> Result<Flow, RouteError> {
    tracing::info!(
        method = %req.original_method(),
        path = %req.uri().path(),
        remote_addr = ?req.remote_addr(),
        upgrade = req.is_upgrade(),
        "request"
    );
    Ok(Flow::Next)
}

fn health(_req: &mut Request, res: &mut Response) -> Result<Flow, RouteError> {
    res.json(&serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))?;
    Ok(Flow::Stop)
}

/// Accepts `Authorization: Bearer <token>` or a `token` query parameter.
fn require_token(token: String) -> impl Middleware {
    move |req: &mut Request, res: &mut Response| -> Result<Flow, RouteError> {
        let bearer = req
            .header(AUTHORIZATION)
            .and_then(|value| value.strip_prefix("Bearer "));
        if bearer == Some(token.as_str()) || req.query_param("token") == Some(token.as_str()) {
            return Ok(Flow::Next);
        }
        tracing::warn!(
            path = %req.uri().path(),
            upgrade = req.is_upgrade(),
            "missing or wrong token"
        );
        res.send_status(StatusCode::UNAUTHORIZED)?;
        Ok(Flow::Stop)
    }
}

async fn echo(socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    while let Some(message) = stream.next().await {
        let reply = match message {
            Ok(Message::Text(text)) => Message::Text(text),
            Ok(Message::Binary(data)) => Message::Binary(data),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        if sink.send(reply).await.is_err() {
            break;
        }
    }
}
