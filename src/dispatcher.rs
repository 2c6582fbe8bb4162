//! Component G: the request dispatcher (spec §4.G). Pulls every other
//! component together into the pipeline a single HTTP request runs
//! through: rewrite, static-file short circuit, route resolution, body
//! parsing, identifier headers, in-filters, auth gating, the
//! proxy/websocket/static-handler branch, out-filters, response encoding,
//! optional gzip, access logging.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use async_compression::tokio::write::GzipEncoder;
use http::{HeaderValue, StatusCode};
use meshgate_core::prelude::*;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::{bearer_token, AuthChecker};
use crate::caller::Caller;
use crate::config::{AppConfig, Config};
use crate::error::DispatchError;
use crate::filters::{Body, FilterChain};
use crate::metrics::{AppLabel, Metrics};
use crate::node::AppNodeMap;
use crate::router::{RouteResolver, Target};

/// The rewrite/redirect rule parser is an external collaborator (spec
/// §1 Non-goals); the dispatcher only needs to consume its contract: given
/// a request, optionally produce a response that ends the pipeline right
/// there.
#[async_trait]
pub trait RewriteHook: Send + Sync {
    async fn maybe_rewrite(&self, req: &http::Request<Body>) -> Option<http::Response<Body>>;
}

/// Likewise the static-file handler: an external collaborator consulted
/// after rewrite and before route resolution.
#[async_trait]
pub trait StaticFileHook: Send + Sync {
    async fn maybe_serve(&self, path: &str) -> Option<http::Response<Body>>;
}

/// A locally-invoked HTTP service handler (spec §2 component G, §3 "Service
/// descriptor"), registered under the same name a `static_http`/`regex_http`
/// route resolves to. Distinct from the proxy branch: a `Target::Http(name)`
/// with a registered handler runs in-process instead of being forwarded to
/// `name` as an app in the node map.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn invoke(
        &self,
        req: &http::Request<Body>,
        vars: &HashMap<String, String>,
        args: &HashMap<String, Value>,
    ) -> Result<http::Response<Body>, DispatchError>;
}

/// Parse form-encoded or JSON request bodies into an args map (spec
/// §4.G): a JSON body (first non-whitespace byte `{`) is parsed as an
/// object; otherwise the body is treated as `application/x-www-form-
/// urlencoded` and decoded as key/value pairs. Malformed bodies yield an
/// empty map rather than failing the request.
fn parse_args(body: &[u8]) -> HashMap<String, Value> {
    let trimmed = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| &body[start..])
        .unwrap_or(body);
    if trimmed.first() == Some(&b'{') {
        match serde_json::from_slice::<Value>(trimmed) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    } else {
        url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect()
    }
}

/// Response bodies larger than this, when the caller accepts gzip, are
/// compressed (spec §4.G).
const GZIP_THRESHOLD_BYTES: usize = 1024;

/// Upper bound on how long `stop()` waits for in-flight HTTP requests and
/// live websocket sessions to drain, polled in 200ms steps (spec §5).
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct Dispatcher {
    routes: RouteResolver,
    auth: Arc<dyn AuthChecker>,
    filters: FilterChain,
    caller: Arc<Caller>,
    app_configs: HashMap<String, AppConfig>,
    node_maps: HashMap<String, Arc<RwLock<AppNodeMap>>>,
    config: Config,
    metrics: Metrics,
    rewrite_hook: Option<Arc<dyn RewriteHook>>,
    static_file_hook: Option<Arc<dyn StaticFileHook>>,
    handlers: HashMap<String, Arc<dyn HttpHandler>>,
    in_flight_http: AtomicU64,
    live_ws: StdMutex<HashSet<String>>,
    cancel: CancellationToken,
    next_request_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        routes: RouteResolver,
        auth: Arc<dyn AuthChecker>,
        filters: FilterChain,
        caller: Arc<Caller>,
        app_configs: HashMap<String, AppConfig>,
        node_maps: HashMap<String, Arc<RwLock<AppNodeMap>>>,
        config: Config,
        metrics: Metrics,
    ) -> Self {
        Self {
            routes,
            auth,
            filters,
            caller,
            app_configs,
            node_maps,
            config,
            metrics,
            rewrite_hook: None,
            static_file_hook: None,
            handlers: HashMap::new(),
            in_flight_http: AtomicU64::new(0),
            live_ws: StdMutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn with_rewrite_hook(mut self, hook: Arc<dyn RewriteHook>) -> Self {
        self.rewrite_hook = Some(hook);
        self
    }

    pub fn with_static_file_hook(mut self, hook: Arc<dyn StaticFileHook>) -> Self {
        self.static_file_hook = Some(hook);
        self
    }

    /// Register a local HTTP service handler under `name`, the same name a
    /// `static_http`/`regex_http` route's `handler` field points at.
    pub fn with_handler(mut self, name: impl Into<String>, handler: Arc<dyn HttpHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Strip a trailing slash from anything but the root, so `/foo/` and
    /// `/foo` resolve to the same route.
    fn rewrite(path: &str) -> &str {
        if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        }
    }

    pub async fn dispatch(
        &self,
        mut req: http::Request<Body>,
    ) -> Result<http::Response<Body>, DispatchError> {
        self.in_flight_http.fetch_add(1, Ordering::SeqCst);
        self.metrics.http_in_flight.inc();
        let result = self.dispatch_inner(&mut req).await;
        self.in_flight_http.fetch_sub(1, Ordering::SeqCst);
        self.metrics.http_in_flight.dec();
        result
    }

    async fn dispatch_inner(
        &self,
        req: &mut http::Request<Body>,
    ) -> Result<http::Response<Body>, DispatchError> {
        let path = Self::rewrite(req.uri().path()).to_string();

        if let Some(hook) = &self.rewrite_hook {
            if let Some(response) = hook.maybe_rewrite(req).await {
                self.log_access(&path, response.status());
                return Ok(response);
            }
        }
        if let Some(hook) = &self.static_file_hook {
            if let Some(response) = hook.maybe_serve(&path).await {
                self.log_access(&path, response.status());
                return Ok(response);
            }
        }

        let args = parse_args(req.body());

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        req.headers_mut().insert(
            "s-unique-id",
            HeaderValue::from_str(&request_id.to_string()).unwrap(),
        );
        let session_header = http::HeaderName::from_bytes(self.config.session_header.as_bytes())
            .expect("session_header must be a valid header name");
        if req.headers().get(&session_header).is_none() {
            req.headers_mut().insert(
                session_header,
                HeaderValue::from_str(&format!("sess-{request_id}")).unwrap(),
            );
        }

        if let Some(short_circuit) = self.filters.run_in(req).await? {
            self.log_access(&path, short_circuit.status());
            return Ok(short_circuit);
        }

        let resolved = self
            .routes
            .resolve(&path)
            .ok_or_else(|| DispatchError::NotFound(path.clone()))?;

        let required_level = resolved.auth_level;
        let token = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !self.auth.allows(bearer_token(token), required_level) {
            return Err(DispatchError::Forbidden {
                required: required_level,
            });
        }

        let mut response = match resolved.target {
            Target::Http(name) => {
                if let Some(handler) = self.handlers.get(&name) {
                    handler.invoke(req, &resolved.vars, &args).await?
                } else {
                    self.metrics
                        .http_requests_total
                        .get_or_create(&AppLabel { app: name.clone() })
                        .inc();
                    self.dispatch_http(&name, req).await?
                }
            }
            Target::WebSocket(_) => {
                return Err(DispatchError::UpgradeFailed(
                    "websocket upgrades are handled by the axum ws extractor, not dispatch()"
                        .to_string(),
                ))
            }
        };

        self.filters.run_out(&mut response).await?;
        self.maybe_compress(req, &mut response).await;
        self.log_access(&path, response.status());
        Ok(response)
    }

    async fn dispatch_http(
        &self,
        app: &str,
        req: &http::Request<Body>,
    ) -> Result<http::Response<Body>, DispatchError> {
        let map = self
            .node_maps
            .get(app)
            .ok_or_else(|| crate::error::CallError::UnknownApp(app.to_string()))?;
        let cfg = self.app_configs.get(app).cloned().unwrap_or_default();
        let method = req.method().clone();
        let body = req.body().clone();
        let uri = req.uri().clone();
        let response = self
            .caller
            .call(app, map, &cfg, move |client, addr| {
                client
                    .request(method.clone(), format!("http://{addr}{uri}"))
                    .body(body.clone())
            })
            .await?;

        let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
        let headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| crate::error::CallError::Transport {
                addr: app.to_string(),
                message: e.to_string(),
            })?;
        let mut builder = http::Response::builder().status(status);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        Ok(builder.body(bytes).unwrap())
    }

    async fn maybe_compress(&self, req: &http::Request<Body>, resp: &mut http::Response<Body>) {
        if !self.config.compress || resp.body().len() < GZIP_THRESHOLD_BYTES {
            return;
        }
        let accepts_gzip = req
            .headers()
            .get(http::header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);
        if !accepts_gzip {
            return;
        }
        let original = resp.body().clone();
        let mut encoder = GzipEncoder::with_quality(Vec::new(), async_compression::Level::Precise(1));
        if encoder.write_all(&original).await.is_ok() && encoder.shutdown().await.is_ok() {
            *resp.body_mut() = Body::from(encoder.into_inner());
            resp.headers_mut()
                .insert(http::header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
    }

    fn log_access(&self, path: &str, status: StatusCode) {
        let size = if self.config.log_response_size > 0 {
            Some(self.config.log_response_size)
        } else {
            None
        };
        info!(path, status = status.as_u16(), response_size = ?size, "request handled");
    }

    pub fn register_ws_session(&self, id: impl Into<String>) {
        self.live_ws.lock().unwrap().insert(id.into());
    }

    pub fn deregister_ws_session(&self, id: &str) {
        self.live_ws.lock().unwrap().remove(id);
    }

    pub fn in_flight_http(&self) -> u64 {
        self.in_flight_http.load(Ordering::SeqCst)
    }

    pub fn live_ws_count(&self) -> usize {
        self.live_ws.lock().unwrap().len()
    }

    /// Begin graceful shutdown: stop accepting new work at the caller's
    /// level, then wait up to `SHUTDOWN_TIMEOUT` (polled every
    /// `SHUTDOWN_POLL_INTERVAL`) for in-flight HTTP requests and live
    /// websocket sessions to drain.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(&self) {
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        loop {
            if self.in_flight_http() == 0 && self.live_ws_count() == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    in_flight = self.in_flight_http(),
                    live_ws = self.live_ws_count(),
                    "shutdown timeout reached with outstanding work"
                );
                return;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod dispatcher_test {
    use super::*;
    use crate::auth::TokenMapAuth;
    use crate::balancer::WeightedLeastUsed;
    use crate::pool::ClientPool;

    fn dispatcher() -> Dispatcher {
        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Metrics::new(&mut registry);
        let routes = RouteResolver::new();
        let auth = Arc::new(TokenMapAuth::new(HashMap::new()));
        let filters = FilterChain::new();
        let caller = Arc::new(Caller::new(
            Arc::new(ClientPool::new()),
            Arc::new(WeightedLeastUsed),
            Arc::new(crate::directory::MemoryDirectory::new()),
            metrics.clone(),
        ));
        Dispatcher::new(
            routes,
            auth,
            filters,
            caller,
            HashMap::new(),
            HashMap::new(),
            Config::from_str_sniffed(r#"{"registry":"redis://localhost"}"#, Some("json")).unwrap(),
            metrics,
        )
    }

    #[tokio::test]
    async fn unresolved_route_is_not_found() {
        let d = dispatcher();
        let req = http::Request::builder()
            .uri("/nope")
            .body(Body::new())
            .unwrap();
        let err = d.dispatch(req).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[test]
    fn in_flight_counter_starts_at_zero() {
        let d = dispatcher();
        assert_eq!(d.in_flight_http(), 0);
        assert_eq!(d.live_ws_count(), 0);
    }

    #[test]
    fn ws_session_registration_tracks_count() {
        let d = dispatcher();
        d.register_ws_session("sess-1");
        assert_eq!(d.live_ws_count(), 1);
        d.deregister_ws_session("sess-1");
        assert_eq!(d.live_ws_count(), 0);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let d = dispatcher();
        d.stop();
        d.wait().await;
        assert!(d.is_stopping());
    }

    #[test]
    fn rewrite_strips_trailing_slash() {
        assert_eq!(Dispatcher::rewrite("/foo/"), "/foo");
        assert_eq!(Dispatcher::rewrite("/"), "/");
    }

    #[test]
    fn parse_args_reads_json_body() {
        let args = parse_args(br#"{"a": 1, "b": "two"}"#);
        assert_eq!(args.get("a"), Some(&Value::from(1)));
        assert_eq!(args.get("b"), Some(&Value::String("two".into())));
    }

    #[test]
    fn parse_args_reads_form_body() {
        let args = parse_args(b"a=1&b=two");
        assert_eq!(args.get("a"), Some(&Value::String("1".into())));
        assert_eq!(args.get("b"), Some(&Value::String("two".into())));
    }

    struct AlwaysRewrite;

    #[async_trait]
    impl RewriteHook for AlwaysRewrite {
        async fn maybe_rewrite(&self, _req: &http::Request<Body>) -> Option<http::Response<Body>> {
            Some(
                http::Response::builder()
                    .status(StatusCode::FOUND)
                    .body(Body::new())
                    .unwrap(),
            )
        }
    }

    #[tokio::test]
    async fn rewrite_hook_short_circuits_before_route_resolution() {
        let d = dispatcher().with_rewrite_hook(Arc::new(AlwaysRewrite));
        let req = http::Request::builder()
            .uri("/anything")
            .body(Body::new())
            .unwrap();
        let resp = d.dispatch(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
    }

    struct Echo;

    #[async_trait]
    impl HttpHandler for Echo {
        async fn invoke(
            &self,
            _req: &http::Request<Body>,
            vars: &HashMap<String, String>,
            _args: &HashMap<String, Value>,
        ) -> Result<http::Response<Body>, DispatchError> {
            let id = vars.get("id").cloned().unwrap_or_default();
            Ok(http::Response::builder()
                .status(StatusCode::OK)
                .body(Body::from(id))
                .unwrap())
        }
    }

    #[tokio::test]
    async fn registered_handler_runs_locally_instead_of_proxying() {
        let mut routes = RouteResolver::new();
        routes
            .add_regex_http(r"^/users/(\w+)$", "get_user", vec!["id".into()], 0)
            .unwrap();
        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Metrics::new(&mut registry);
        let auth = Arc::new(TokenMapAuth::new(HashMap::new()));
        let filters = FilterChain::new();
        let caller = Arc::new(Caller::new(
            Arc::new(ClientPool::new()),
            Arc::new(WeightedLeastUsed),
            Arc::new(crate::directory::MemoryDirectory::new()),
            metrics.clone(),
        ));
        let d = Dispatcher::new(
            routes,
            auth,
            filters,
            caller,
            HashMap::new(),
            HashMap::new(),
            Config::from_str_sniffed(r#"{"registry":"redis://localhost"}"#, Some("json")).unwrap(),
            metrics,
        )
        .with_handler("get_user", Arc::new(Echo));

        let req = http::Request::builder()
            .uri("/users/42")
            .body(Body::new())
            .unwrap();
        let resp = d.dispatch(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body().as_ref(), b"42");
    }
}
