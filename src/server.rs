//! HTTP service boundary for the collaboration server.
//!
//! ```text
//! GET  /<session>                       greeting: [version, init_needed] + banner
//! GET  /<session>?offset=O&size=S       read S bytes at O
//! PUT  /<session>?offset=O&size=S       write body (exactly S bytes), publish (O, S)
//! GET  /<session>?watch                 live event stream until shutdown/disconnect
//! ```
//!
//! One tokio task per connection; contention is scoped per session.
//! A write resolves the session, mutates its region, then publishes
//! the changed range to the session's broker. A watch subscribes and
//! streams drained events as little-endian `(offset, size)` frames,
//! optionally followed by the changed bytes re-read at delivery time.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{Stream, StreamExt};
use uuid::Uuid;
use warp::filters::path::Tail;
use warp::filters::BoxedFilter;
use warp::http::{header, StatusCode};
use warp::hyper::body::Bytes;
use warp::hyper::Body;
use warp::Filter;

use crate::broadcast::Drained;
use crate::protocol::{greeting_header, UpdateEvent};
use crate::region::{MemoryRegion, RegionError, DEFAULT_CAPACITY};
use crate::session::{RegistryConfig, SessionError, SessionRegistry};

/// Service-level error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Invalid or unsafe session name; no session created.
    BadSession(String),
    /// Missing or malformed offset/size, or truncated body; nothing applied.
    BadRequest(&'static str),
    /// Range outside the region bounds; nothing applied.
    OutOfRange {
        offset: i64,
        size: i64,
        capacity: usize,
    },
    /// Unknown path/method combination.
    Unsupported,
    /// Backing-store failure, fatal to this request only.
    Storage(String),
    /// Server misconfiguration (bad bind address).
    Config(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadSession(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::OutOfRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            Self::Storage(_) | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadSession(name) => write!(f, "bad session name {name:?}"),
            Self::BadRequest(what) => write!(f, "bad request: {what}"),
            Self::OutOfRange {
                offset,
                size,
                capacity,
            } => write!(
                f,
                "range [{offset}, {offset}+{size}) outside region of {capacity} bytes"
            ),
            Self::Unsupported => write!(f, "unsupported path or method"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<SessionError> for ServiceError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::BadName(name) => Self::BadSession(name),
            SessionError::Io(e) => Self::Storage(e),
        }
    }
}

impl From<RegionError> for ServiceError {
    fn from(e: RegionError) -> Self {
        match e {
            RegionError::OutOfRange {
                offset,
                size,
                capacity,
            } => Self::OutOfRange {
                offset,
                size,
                capacity,
            },
            RegionError::Io(e) => Self::Storage(e),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Capacity of every session's memory region.
    pub region_capacity: usize,
    /// Data directory for backing files (None = in-memory only).
    pub data_dir: Option<PathBuf>,
    /// Banner sent after the greeting header.
    pub greeting: String,
    /// Follow each watch frame with a snapshot of the changed bytes,
    /// re-read from the region at delivery time.
    pub inline_payload: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            region_capacity: DEFAULT_CAPACITY,
            data_dir: None,
            greeting: "welcome to collab :)".to_string(),
            inline_payload: false,
        }
    }
}

/// Server statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_reads: u64,
    pub total_writes: u64,
    pub total_watches: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Atomic counters behind the snapshot; no lock on the hot path.
#[derive(Default)]
struct AtomicServerStats {
    total_reads: AtomicU64,
    total_writes: AtomicU64,
    total_watches: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_reads: self.total_reads.load(Ordering::Relaxed),
            total_writes: self.total_writes.load(Ordering::Relaxed),
            total_watches: self.total_watches.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Recognized query parameters; values are parsed in the handlers so
/// a malformed value reports `BadRequest` instead of falling through
/// the filter chain.
#[derive(Debug, Default)]
struct RangeQuery {
    offset: Option<String>,
    size: Option<String>,
    watch: Option<String>,
}

/// Fold raw query pairs into the recognized parameters.
///
/// Unknown keys are rejected rather than ignored, so a typoed request
/// cannot slip through to the greeting and clear the initialization
/// flag as a side effect.
fn parse_query(pairs: &[(String, String)]) -> Result<RangeQuery, ServiceError> {
    let mut query = RangeQuery::default();
    for (key, value) in pairs {
        match key.as_str() {
            "offset" => query.offset = Some(value.clone()),
            "size" => query.size = Some(value.clone()),
            "watch" => query.watch = Some(value.clone()),
            _ => return Err(ServiceError::BadRequest("unknown query parameter")),
        }
    }
    Ok(query)
}

/// Per-request handler context.
#[derive(Clone)]
struct ServerCtx {
    registry: Arc<SessionRegistry>,
    greeting: Arc<String>,
    inline_payload: bool,
    stats: Arc<AtomicServerStats>,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl CollabServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            region_capacity: config.region_capacity,
            data_dir: config.data_dir.clone(),
        }));
        Self {
            config,
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The complete request-routing filter.
    ///
    /// Exposed separately from [`run_until`](Self::run_until) so tests
    /// can drive it with `warp::test` without binding a socket.
    pub fn routes(&self) -> BoxedFilter<(warp::reply::Response,)> {
        let ctx = ServerCtx {
            registry: self.registry.clone(),
            greeting: Arc::new(self.config.greeting.clone()),
            inline_payload: self.config.inline_payload,
            stats: self.stats.clone(),
        };
        let with_ctx = {
            let ctx = ctx.clone();
            warp::any().map(move || ctx.clone())
        };

        let get = warp::get()
            .and(warp::path::tail())
            .and(warp::query::<Vec<(String, String)>>())
            .and(with_ctx.clone())
            .and_then(handle_get);

        let put = warp::put()
            .and(warp::path::tail())
            .and(warp::query::<Vec<(String, String)>>())
            .and(warp::body::bytes())
            .and(with_ctx)
            .and_then(handle_put);

        let unsupported = warp::any()
            .and(warp::path::tail())
            .map(|_tail: Tail| error_response(&ServiceError::Unsupported));

        get.or(put).unify().or(unsupported).unify().boxed()
    }

    /// Bind the listener, returning the bound address and the serving
    /// future.
    ///
    /// The registry is shut down as part of the shutdown signal,
    /// before the listener starts draining in-flight connections.
    /// Draining waits for open watch streams, and a watch stream only
    /// ends once its broker is closed, so closing the brokers after
    /// the drain would deadlock the shutdown.
    pub fn bind(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(SocketAddr, impl std::future::Future<Output = ()>), ServiceError> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| ServiceError::Config(format!("{}: {e}", self.config.bind_addr)))?;

        let routes = self.routes();
        let registry = self.registry.clone();

        warp::serve(routes)
            .try_bind_with_graceful_shutdown(addr, async move {
                shutdown.await;
                registry.shutdown().await;
            })
            .map_err(|e| ServiceError::Config(e.to_string()))
    }

    /// Serve until `shutdown` completes, then signal every session's
    /// broker so all in-flight watch drains unblock.
    pub async fn run_until(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServiceError> {
        let registry = self.registry.clone();
        let (bound, serving) = self.bind(shutdown)?;
        log::info!("collab server listening on {bound}");

        serving.await;
        // Sessions resolved while connections were draining still
        // need their brokers closed.
        registry.shutdown().await;
        log::info!("collab server stopped");
        Ok(())
    }

    /// Serve forever.
    pub async fn run(self) -> Result<(), ServiceError> {
        self.run_until(std::future::pending()).await
    }
}

fn required_i64(value: &Option<String>, what: &'static str) -> Result<i64, ServiceError> {
    value
        .as_deref()
        .ok_or(ServiceError::BadRequest(what))?
        .parse()
        .map_err(|_| ServiceError::BadRequest(what))
}

fn response(status: StatusCode, body: Body) -> warp::reply::Response {
    let mut resp = warp::reply::Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/octet-stream"),
    );
    resp
}

fn error_response(err: &ServiceError) -> warp::reply::Response {
    let mut resp = warp::reply::Response::new(Body::from(err.to_string()));
    *resp.status_mut() = err.status();
    resp
}

async fn handle_get(
    tail: Tail,
    pairs: Vec<(String, String)>,
    ctx: ServerCtx,
) -> Result<warp::reply::Response, warp::Rejection> {
    Ok(match get_response(tail.as_str(), &pairs, &ctx).await {
        Ok(resp) => resp,
        Err(e) => {
            log::debug!("GET /{} failed: {e}", tail.as_str());
            error_response(&e)
        }
    })
}

async fn get_response(
    name: &str,
    pairs: &[(String, String)],
    ctx: &ServerCtx,
) -> Result<warp::reply::Response, ServiceError> {
    let query = parse_query(pairs)?;
    let session = ctx.registry.resolve(name).await?;

    if query.watch.is_some() {
        let key = Uuid::new_v4();
        let handle = session.broker().clone().subscribe(key);
        ctx.stats.total_watches.fetch_add(1, Ordering::Relaxed);
        log::info!("watch {key} opened on session {}", session.name());

        let stream = watch_stream(handle, session.region().clone(), ctx.inline_payload);
        return Ok(response(StatusCode::OK, Body::wrap_stream(stream)));
    }

    if query.offset.is_some() || query.size.is_some() {
        let offset = required_i64(&query.offset, "offset")?;
        let size = required_i64(&query.size, "size")?;

        let bytes = session.region().read(offset, size).await?;
        ctx.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        ctx.stats
            .bytes_read
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        return Ok(response(StatusCode::OK, Body::from(bytes)));
    }

    // Bare session path: greeting with protocol header. Reports the
    // initialization flag at most once, then clears it.
    let init_needed = session.take_init_needed();
    let mut body = greeting_header(init_needed).to_vec();
    body.extend_from_slice(ctx.greeting.as_bytes());
    Ok(response(StatusCode::OK, Body::from(body)))
}

async fn handle_put(
    tail: Tail,
    pairs: Vec<(String, String)>,
    body: Bytes,
    ctx: ServerCtx,
) -> Result<warp::reply::Response, warp::Rejection> {
    Ok(match put_response(tail.as_str(), &pairs, body, &ctx).await {
        Ok(resp) => resp,
        Err(e) => {
            log::debug!("PUT /{} failed: {e}", tail.as_str());
            error_response(&e)
        }
    })
}

async fn put_response(
    name: &str,
    pairs: &[(String, String)],
    body: Bytes,
    ctx: &ServerCtx,
) -> Result<warp::reply::Response, ServiceError> {
    let query = parse_query(pairs)?;
    let session = ctx.registry.resolve(name).await?;

    let offset = required_i64(&query.offset, "offset")?;
    let size = required_i64(&query.size, "size")?;
    if body.len() as i64 != size {
        return Err(ServiceError::BadRequest("body length does not match size"));
    }

    // The event frame carries 32-bit fields; reject anything it
    // cannot address before touching the region, so a failed request
    // never leaves an unannounced mutation behind.
    let event = UpdateEvent::new(
        i32::try_from(offset).map_err(|_| ServiceError::BadRequest("offset"))?,
        i32::try_from(size).map_err(|_| ServiceError::BadRequest("size"))?,
    );

    session.region().write(offset, &body).await?;
    session.broker().publish(event);

    ctx.stats.total_writes.fetch_add(1, Ordering::Relaxed);
    ctx.stats
        .bytes_written
        .fetch_add(body.len() as u64, Ordering::Relaxed);
    log::debug!(
        "session {}: wrote [{offset}, {offset}+{size}), {} watchers notified",
        session.name(),
        session.broker().watcher_count()
    );

    Ok(response(StatusCode::OK, Body::empty()))
}

/// Turn a watcher's drained batches into wire chunks.
///
/// The stream ends when the close signal is drained; dropping the
/// stream (client disconnect) releases the watcher slot through the
/// handle's drop.
fn watch_stream(
    handle: crate::broadcast::WatcherHandle,
    region: Arc<MemoryRegion>,
    inline_payload: bool,
) -> impl Stream<Item = Result<Vec<u8>, Infallible>> {
    futures_util::stream::unfold(handle, move |mut handle| {
        let region = region.clone();
        async move {
            match handle.drain().await {
                Drained::Closed => {
                    log::info!("watch {} closed", handle.key());
                    None
                }
                Drained::Events(events) => {
                    let mut chunk = Vec::with_capacity(events.len() * crate::protocol::EVENT_FRAME_LEN);
                    for event in events {
                        chunk.extend_from_slice(&event.encode());
                        if inline_payload {
                            if let Ok(bytes) = region
                                .read(i64::from(event.offset), i64::from(event.size))
                                .await
                            {
                                chunk.extend_from_slice(&bytes);
                            }
                        }
                    }
                    Some((Ok(chunk), handle))
                }
            }
        }
    })
    .boxed()
}
