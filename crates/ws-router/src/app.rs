use std::future::Future;

use tokio::net::{TcpListener, ToSocketAddrs};

use crate::error::ConfigError;
use crate::handler::{ErrorMiddleware, Middleware, UpgradeHandler};
use crate::options::{ResolvedOptions, WsOptions};
use crate::router::{Route, Router};
use crate::server::Server;

/// An application: a root [`Router`] plus the options it was built with.
///
/// Serving an `App` answers plain HTTP requests through the router and
/// verifies WebSocket upgrade attempts through the same router under the
/// configured websocket verb.
///
/// ```no_run
/// use ws_router::{App, Decide, Flow, Request, RouteError};
/// use futures_util::SinkExt;
/// use tokio_tungstenite::tungstenite::Message;
///
/// # async fn run() -> anyhow::Result<()> {
/// let mut app = App::new();
/// app.websocket("/hello", |_req: &Request, cb: Decide| async move {
///     cb.accept_with(|mut socket, _req| async move {
///         let _ = socket.send(Message::text("hello")).await;
///     })?;
///     Ok::<_, RouteError>(Flow::Stop)
/// });
/// app.listen("127.0.0.1:8080").await
/// # }
/// ```
#[derive(Debug)]
pub struct App {
    router: Router,
    options: ResolvedOptions,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        let options = ResolvedOptions::default();
        Self {
            router: Router::with_options(&options),
            options,
        }
    }

    pub fn with_options(options: WsOptions) -> Result<Self, ConfigError> {
        let options = options.resolve()?;
        Ok(Self {
            router: Router::with_options(&options),
            options,
        })
    }

    pub fn options(&self) -> &ResolvedOptions {
        &self.options
    }

    /// A fresh sub-router sharing this app's websocket verb, for use with
    /// [`mount`](Self::mount).
    pub fn router(&self) -> Router {
        Router::with_options(&self.options)
    }

    pub fn root(&self) -> &Router {
        &self.router
    }

    pub fn root_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn use_middleware(&mut self, middleware: impl Middleware) -> &mut Self {
        self.router.use_middleware(middleware);
        self
    }

    pub fn use_at(&mut self, path: &str, middleware: impl Middleware) -> &mut Self {
        self.router.use_at(path, middleware);
        self
    }

    pub fn catch(&mut self, handler: impl ErrorMiddleware) -> &mut Self {
        self.router.catch(handler);
        self
    }

    pub fn catch_at(&mut self, path: &str, handler: impl ErrorMiddleware) -> &mut Self {
        self.router.catch_at(path, handler);
        self
    }

    pub fn mount(&mut self, prefix: &str, router: Router) -> &mut Self {
        self.router.mount(prefix, router);
        self
    }

    pub fn route(&mut self, path: &str) -> &mut Route {
        self.router.route(path)
    }

    pub fn get(&mut self, path: &str, handler: impl Middleware) -> &mut Self {
        self.router.get(path, handler);
        self
    }

    pub fn post(&mut self, path: &str, handler: impl Middleware) -> &mut Self {
        self.router.post(path, handler);
        self
    }

    pub fn put(&mut self, path: &str, handler: impl Middleware) -> &mut Self {
        self.router.put(path, handler);
        self
    }

    pub fn delete(&mut self, path: &str, handler: impl Middleware) -> &mut Self {
        self.router.delete(path, handler);
        self
    }

    pub fn patch(&mut self, path: &str, handler: impl Middleware) -> &mut Self {
        self.router.patch(path, handler);
        self
    }

    pub fn all(&mut self, path: &str, handler: impl Middleware) -> &mut Self {
        self.router.all(path, handler);
        self
    }

    pub fn websocket(&mut self, path: &str, handler: impl UpgradeHandler) -> &mut Self {
        self.router.websocket(path, handler);
        self
    }

    /// Serve on an already bound listener until the process ends.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Connections accepted before that
    /// keep running to completion.
    pub async fn serve_with_shutdown<F>(
        self,
        listener: TcpListener,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        Server::new(self.router, &self.options)
            .run(listener, shutdown)
            .await
    }

    /// Bind `addr` and serve.
    pub async fn listen(self, addr: impl ToSocketAddrs) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_method_name_flows_into_routers() {
        let app = App::with_options(WsOptions {
            method_name: "Socket".to_string(),
            ..WsOptions::default()
        })
        .unwrap();

        assert_eq!(app.options().verb(), "socket");
        assert_eq!(app.root().upgrade_method().as_str(), "SOCKET");
        assert_eq!(app.router().upgrade_method().as_str(), "SOCKET");
    }

    #[test]
    fn reserved_method_name_is_rejected() {
        let err = App::with_options(WsOptions {
            method_name: "get".to_string(),
            ..WsOptions::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::ReservedMethod(_)));
    }
}
