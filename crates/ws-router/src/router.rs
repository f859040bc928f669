use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::{Method, StatusCode};

use crate::error::RouteError;
use crate::handler::{ErrorMiddleware, Flow, Middleware, UpgradeHandler};
use crate::options::ResolvedOptions;
use crate::path::PathPattern;
use crate::request::Request;
use crate::response::Response;

/// Result of running a request through a [`Router`].
#[derive(Debug)]
pub enum Outcome {
    /// Some layer stopped dispatch.
    Handled,
    /// Every layer passed; carries the error dispatch ended with, if any.
    Unhandled(Option<RouteError>),
}

impl Outcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MethodFilter {
    Any,
    Exact(Method),
}

enum Endpoint {
    Http(Arc<dyn Middleware>),
    Upgrade(Arc<dyn UpgradeHandler>),
}

/// Per-path set of handlers keyed by method.
pub struct Route {
    path: String,
    upgrade_method: Method,
    handlers: Vec<(MethodFilter, Endpoint)>,
}

impl Route {
    fn new(path: &str, upgrade_method: Method) -> Self {
        Self {
            path: path.to_string(),
            upgrade_method,
            handlers: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn on(&mut self, method: Method, handler: impl Middleware) -> &mut Self {
        self.handlers
            .push((MethodFilter::Exact(method), Endpoint::Http(Arc::new(handler))));
        self
    }

    pub fn get(&mut self, handler: impl Middleware) -> &mut Self {
        self.on(Method::GET, handler)
    }

    pub fn post(&mut self, handler: impl Middleware) -> &mut Self {
        self.on(Method::POST, handler)
    }

    pub fn put(&mut self, handler: impl Middleware) -> &mut Self {
        self.on(Method::PUT, handler)
    }

    pub fn delete(&mut self, handler: impl Middleware) -> &mut Self {
        self.on(Method::DELETE, handler)
    }

    pub fn patch(&mut self, handler: impl Middleware) -> &mut Self {
        self.on(Method::PATCH, handler)
    }

    /// Handler for every method, including upgrade attempts.
    pub fn all(&mut self, handler: impl Middleware) -> &mut Self {
        self.handlers
            .push((MethodFilter::Any, Endpoint::Http(Arc::new(handler))));
        self
    }

    /// Handler for WebSocket upgrade attempts on this path.
    pub fn websocket(&mut self, handler: impl UpgradeHandler) -> &mut Self {
        self.handlers.push((
            MethodFilter::Exact(self.upgrade_method.clone()),
            Endpoint::Upgrade(Arc::new(handler)),
        ));
        self
    }

    fn has_explicit(&self, method: &Method) -> bool {
        self.handlers
            .iter()
            .any(|(filter, _)| matches!(filter, MethodFilter::Exact(m) if m == method))
    }

    /// HEAD falls back to GET handlers when no HEAD handler exists.
    fn effective_method(&self, method: &Method) -> Method {
        if method == Method::HEAD && !self.has_explicit(&Method::HEAD) {
            Method::GET
        } else {
            method.clone()
        }
    }

    fn handles_method(&self, method: &Method) -> bool {
        let method = self.effective_method(method);
        self.handlers.iter().any(|(filter, _)| match filter {
            MethodFilter::Any => true,
            MethodFilter::Exact(m) => *m == method,
        })
    }

    async fn dispatch(&self, req: &mut Request, res: &mut Response) -> Result<Flow, RouteError> {
        let method = self.effective_method(req.method());

        for (filter, endpoint) in &self.handlers {
            if let MethodFilter::Exact(m) = filter {
                if *m != method {
                    continue;
                }
            }

            let flow = match endpoint {
                Endpoint::Http(handler) => handler.handle(req, res).await?,
                Endpoint::Upgrade(handler) => {
                    // A plain request that merely carries the synthetic
                    // method never reaches websocket handlers.
                    let Some(cb) = res.decide().cloned() else {
                        continue;
                    };
                    if !req.is_upgrade() {
                        continue;
                    }
                    handler.upgrade(req, cb).await?
                }
            };

            match flow {
                Flow::Next => continue,
                Flow::NextRoute => return Ok(Flow::Next),
                Flow::Stop => return Ok(Flow::Stop),
            }
        }

        Ok(Flow::Next)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods: Vec<String> = self
            .handlers
            .iter()
            .map(|(filter, _)| match filter {
                MethodFilter::Any => "*".to_string(),
                MethodFilter::Exact(m) => m.to_string(),
            })
            .collect();
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("methods", &methods)
            .finish()
    }
}

enum LayerKind {
    Middleware(Arc<dyn Middleware>),
    Catch(Arc<dyn ErrorMiddleware>),
    Route(Route),
    Mount(Router),
}

struct Layer {
    pattern: PathPattern,
    kind: LayerKind,
}

/// Ordered stack of middleware, routes, error handlers and sub-routers.
///
/// Layers run in registration order. A layer that returns
/// [`Flow::Stop`] ends dispatch; an `Err` switches to error mode, in which
/// only [`catch`](Self::catch) layers and mounted routers run.
pub struct Router {
    layers: Vec<Layer>,
    upgrade_method: Method,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Router using the default websocket verb.
    pub fn new() -> Self {
        Self::with_options(&ResolvedOptions::default())
    }

    pub fn with_options(options: &ResolvedOptions) -> Self {
        Self {
            layers: Vec::new(),
            upgrade_method: options.method().clone(),
        }
    }

    /// Synthetic method websocket routes of this router are registered under.
    pub fn upgrade_method(&self) -> &Method {
        &self.upgrade_method
    }

    /// Middleware for every path.
    pub fn use_middleware(&mut self, middleware: impl Middleware) -> &mut Self {
        self.use_at("/", middleware)
    }

    /// Middleware for `path` and everything below it.
    pub fn use_at(&mut self, path: &str, middleware: impl Middleware) -> &mut Self {
        self.layers.push(Layer {
            pattern: PathPattern::prefix(path),
            kind: LayerKind::Middleware(Arc::new(middleware)),
        });
        self
    }

    /// Error middleware for every path.
    pub fn catch(&mut self, handler: impl ErrorMiddleware) -> &mut Self {
        self.catch_at("/", handler)
    }

    pub fn catch_at(&mut self, path: &str, handler: impl ErrorMiddleware) -> &mut Self {
        self.layers.push(Layer {
            pattern: PathPattern::prefix(path),
            kind: LayerKind::Catch(Arc::new(handler)),
        });
        self
    }

    /// Mount `router` under `prefix`. Inside it, `req.path()` is relative to
    /// the prefix and `req.base_path()` includes it.
    pub fn mount(&mut self, prefix: &str, router: Router) -> &mut Self {
        self.layers.push(Layer {
            pattern: PathPattern::prefix(prefix),
            kind: LayerKind::Mount(router),
        });
        self
    }

    /// Append a new route for `path` and return it for handler registration.
    pub fn route(&mut self, path: &str) -> &mut Route {
        let pattern = PathPattern::exact(path);
        let route = Route::new(pattern.source(), self.upgrade_method.clone());
        self.layers.push(Layer {
            pattern,
            kind: LayerKind::Route(route),
        });
        match self.layers.last_mut().map(|layer| &mut layer.kind) {
            Some(LayerKind::Route(route)) => route,
            _ => unreachable!("route layer was just pushed"),
        }
    }

    pub fn get(&mut self, path: &str, handler: impl Middleware) -> &mut Self {
        self.route(path).get(handler);
        self
    }

    pub fn post(&mut self, path: &str, handler: impl Middleware) -> &mut Self {
        self.route(path).post(handler);
        self
    }

    pub fn put(&mut self, path: &str, handler: impl Middleware) -> &mut Self {
        self.route(path).put(handler);
        self
    }

    pub fn delete(&mut self, path: &str, handler: impl Middleware) -> &mut Self {
        self.route(path).delete(handler);
        self
    }

    pub fn patch(&mut self, path: &str, handler: impl Middleware) -> &mut Self {
        self.route(path).patch(handler);
        self
    }

    pub fn all(&mut self, path: &str, handler: impl Middleware) -> &mut Self {
        self.route(path).all(handler);
        self
    }

    pub fn websocket(&mut self, path: &str, handler: impl UpgradeHandler) -> &mut Self {
        self.route(path).websocket(handler);
        self
    }

    /// Run `req` through the layer stack.
    pub fn handle<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, Outcome> {
        self.dispatch(req, res, None)
    }

    fn dispatch<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
        mut error: Option<RouteError>,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            for layer in &self.layers {
                let matched = match layer.pattern.matches(req.path()) {
                    Ok(Some(matched)) => matched,
                    Ok(None) => continue,
                    Err(malformed) => {
                        // The layer is skipped; the request carries on in
                        // error mode unless it already is.
                        tracing::debug!(
                            path = layer.pattern.source(),
                            %malformed,
                            "bad path param"
                        );
                        error.get_or_insert_with(|| {
                            RouteError::status(StatusCode::BAD_REQUEST, malformed.to_string())
                        });
                        continue;
                    }
                };

                let step = match &layer.kind {
                    LayerKind::Mount(router) => {
                        let saved = req.enter_mount(matched.matched_len);
                        req.set_params(matched.params);
                        let outcome = router.dispatch(req, res, error.take()).await;
                        req.leave_mount(saved);
                        match outcome {
                            Outcome::Handled => return Outcome::Handled,
                            Outcome::Unhandled(err) => {
                                error = err;
                                continue;
                            }
                        }
                    }
                    LayerKind::Catch(handler) => {
                        let Some(err) = error.take() else {
                            continue;
                        };
                        req.set_params(matched.params);
                        handler.handle_error(err, req, res).await
                    }
                    _ if error.is_some() => continue,
                    LayerKind::Middleware(middleware) => {
                        req.set_params(matched.params);
                        middleware.handle(req, res).await
                    }
                    LayerKind::Route(route) => {
                        if !route.handles_method(req.method()) {
                            continue;
                        }
                        req.set_params(matched.params);
                        route.dispatch(req, res).await
                    }
                };

                match step {
                    Ok(Flow::Stop) => return Outcome::Handled,
                    Ok(Flow::Next | Flow::NextRoute) => {}
                    Err(err) => {
                        tracing::debug!(
                            path = layer.pattern.source(),
                            %err,
                            "handler raised error"
                        );
                        error = Some(err);
                    }
                }
            }

            Outcome::Unhandled(error)
        })
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("layers", &self.layers.len())
            .field("upgrade_method", &self.upgrade_method)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::StatusCode;

    use super::*;
    use crate::decide::{Decide, Decision};
    use crate::error::UsageError;
    use crate::request::test_support::{http_request, upgrade_request};

    async fn run_http(router: &Router, method: Method, uri: &str) -> (Outcome, Response) {
        let mut req = http_request(method, uri);
        let mut res = Response::http();
        let outcome = router.handle(&mut req, &mut res).await;
        (outcome, res)
    }

    fn send(body: &'static str) -> impl Middleware {
        move |_req: &mut Request, res: &mut Response| -> Result<Flow, RouteError> {
            res.send(body)?;
            Ok(Flow::Stop)
        }
    }

    #[tokio::test]
    async fn routes_match_by_path_and_method() {
        let mut router = Router::new();
        router.get("/a", send("get a")).post("/a", send("post a"));

        let (outcome, res) = run_http(&router, Method::POST, "/a").await;
        assert!(outcome.is_handled());
        assert_eq!(res.body().as_ref(), b"post a");

        let (outcome, _) = run_http(&router, Method::PUT, "/a").await;
        assert!(matches!(outcome, Outcome::Unhandled(None)));
    }

    #[tokio::test]
    async fn head_falls_back_to_get() {
        let mut router = Router::new();
        router.get("/a", send("get a"));
        let (outcome, _) = run_http(&router, Method::HEAD, "/a").await;
        assert!(outcome.is_handled());
    }

    #[tokio::test]
    async fn middleware_runs_before_routes_and_sees_params() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        let mut router = Router::new();
        router.use_middleware(
            move |_req: &mut Request, _res: &mut Response| -> Result<Flow, RouteError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Flow::Next)
            },
        );
        router.get(
            "/users/:id",
            |req: &mut Request, res: &mut Response| -> Result<Flow, RouteError> {
                let id = req.param("id").unwrap_or_default().to_string();
                res.send(id)?;
                Ok(Flow::Stop)
            },
        );

        let (_, res) = run_http(&router, Method::GET, "/users/42").await;
        assert_eq!(res.body().as_ref(), b"42");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn next_route_skips_remaining_handlers() {
        let mut router = Router::new();
        router
            .route("/a")
            .get(|_req: &mut Request, _res: &mut Response| -> Result<Flow, RouteError> {
                Ok(Flow::NextRoute)
            })
            .get(send("skipped"));
        router.get("/a", send("second route"));

        let (_, res) = run_http(&router, Method::GET, "/a").await;
        assert_eq!(res.body().as_ref(), b"second route");
    }

    #[tokio::test]
    async fn errors_skip_to_catch_layers() {
        let mut router = Router::new();
        router.get("/boom", |_req: &mut Request, _res: &mut Response| -> Result<Flow, RouteError> {
            Err(RouteError::status(StatusCode::IM_A_TEAPOT, "short and stout"))
        });
        router.get("/boom", send("never"));
        router.catch(
            |err: RouteError, _req: &mut Request, res: &mut Response| -> Result<Flow, RouteError> {
                res.status(err.status_code()).send(err.to_string())?;
                Ok(Flow::Stop)
            },
        );

        let (outcome, res) = run_http(&router, Method::GET, "/boom").await;
        assert!(outcome.is_handled());
        assert_eq!(res.status_code(), StatusCode::IM_A_TEAPOT);
        assert_eq!(res.body().as_ref(), b"short and stout");
    }

    #[tokio::test]
    async fn unhandled_error_is_reported() {
        let mut router = Router::new();
        router.get("/boom", |_req: &mut Request, _res: &mut Response| -> Result<Flow, RouteError> {
            Err(RouteError::status(StatusCode::BAD_GATEWAY, "upstream"))
        });

        let (outcome, _) = run_http(&router, Method::GET, "/boom").await;
        match outcome {
            Outcome::Unhandled(Some(err)) => assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_param_is_a_bad_request() {
        let mut router = Router::new();
        router.get("/rooms/:room", send("joined"));

        let (_, res) = run_http(&router, Method::GET, "/rooms/my%20room").await;
        assert_eq!(res.body().as_ref(), b"joined");

        let (outcome, res) = run_http(&router, Method::GET, "/rooms/bad%zz").await;
        assert!(!res.is_finished());
        match outcome {
            Outcome::Unhandled(Some(err)) => {
                assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
                assert_eq!(err.to_string(), "failed to decode param 'bad%zz'");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn catch_returning_next_clears_the_error() {
        let mut router = Router::new();
        router.use_middleware(
            |_req: &mut Request, _res: &mut Response| -> Result<Flow, RouteError> {
                Err(RouteError::from(anyhow::anyhow!("flaky")))
            },
        );
        router.catch(
            |_err: RouteError,
             _req: &mut Request,
             _res: &mut Response|
             -> Result<Flow, RouteError> { Ok(Flow::Next) },
        );
        router.get("/a", send("recovered"));

        let (_, res) = run_http(&router, Method::GET, "/a").await;
        assert_eq!(res.body().as_ref(), b"recovered");
    }

    #[tokio::test]
    async fn mounted_router_sees_relative_path() {
        let mut api = Router::new();
        api.get(
            "/users/:id",
            |req: &mut Request, res: &mut Response| -> Result<Flow, RouteError> {
                let body = format!(
                    "{}|{}|{}",
                    req.base_path(),
                    req.path(),
                    req.param("id").unwrap_or("")
                );
                res.send(body)?;
                Ok(Flow::Stop)
            },
        );

        let mut router = Router::new();
        router.mount("/api", api);

        let (_, res) = run_http(&router, Method::GET, "/api/users/7").await;
        assert_eq!(res.body().as_ref(), b"/api|/users/7|7");

        let (outcome, _) = run_http(&router, Method::GET, "/apiary/users/7").await;
        assert!(matches!(outcome, Outcome::Unhandled(None)));
    }

    #[tokio::test]
    async fn websocket_route_receives_decide() {
        let mut router = Router::new();
        router.websocket("/deny", |_req: &Request, cb: Decide| async move {
            cb.reject(StatusCode::UNAUTHORIZED)?;
            Ok::<_, RouteError>(Flow::Stop)
        });

        let (decide, rx) = Decide::channel();
        let mut req = upgrade_request("/deny");
        req.set_method(router.upgrade_method().clone());
        let mut res = Response::upgrade(decide);

        assert!(router.handle(&mut req, &mut res).await.is_handled());
        match rx.await.unwrap() {
            Decision::Reject { status, .. } => assert_eq!(status, StatusCode::UNAUTHORIZED),
            Decision::Accept(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn websocket_routes_ignore_plain_requests_with_synthetic_method() {
        let mut router = Router::new();
        router.websocket("/ok", |_req: &Request, cb: Decide| async move {
            cb.accept_with(|_socket, _req| async {})?;
            Ok::<_, RouteError>(Flow::Stop)
        });

        let method = router.upgrade_method().clone();
        let (outcome, _) = run_http(&router, method, "/ok").await;
        assert!(matches!(outcome, Outcome::Unhandled(None)));
    }

    #[tokio::test]
    async fn second_decision_becomes_route_error() {
        let mut router = Router::new();
        router
            .route("/bad")
            .websocket(|_req: &Request, cb: Decide| async move {
                cb.reject(StatusCode::UNAUTHORIZED)?;
                Ok::<_, RouteError>(Flow::Next)
            })
            .websocket(|_req: &Request, cb: Decide| async move {
                cb.accept_with(|_socket, _req| async {})?;
                Ok::<_, RouteError>(Flow::Stop)
            });

        let (decide, _rx) = Decide::channel();
        let mut req = upgrade_request("/bad");
        req.set_method(router.upgrade_method().clone());
        let mut res = Response::upgrade(decide);

        match router.handle(&mut req, &mut res).await {
            Outcome::Unhandled(Some(err)) => {
                assert_eq!(err.as_usage(), Some(&UsageError::AlreadyHandled));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
