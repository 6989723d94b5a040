//! Unix-socket control plane.
//!
//! One request and one response per connection. The accept task hands
//! each connection to its own task; `stop` closes the listener, then
//! waits on a condition until every in-flight handler has finished
//! before unlinking the socket file.

use crate::rate_limit::RateLimiter;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use warden_shared::protocol::{error_codes, MAX_MESSAGE_SIZE};
use warden_shared::{Request, Response};

/// Per-socket send/receive timeout.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Linux sun_path is 108 bytes including the terminator.
const MAX_SOCKET_PATH: usize = 107;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Response> + Send>>;
pub type Handler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

struct Shared {
    rate_limiter: RateLimiter,
    handlers: RwLock<HashMap<String, Handler>>,
    running: AtomicBool,
    active_connections: AtomicUsize,
    connections_served: AtomicU64,
    drained: Notify,
    shutdown: Notify,
}

pub struct IpcServer {
    socket_path: PathBuf,
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl IpcServer {
    pub fn new(socket_path: impl Into<PathBuf>, max_requests_per_sec: u32) -> Self {
        Self {
            socket_path: socket_path.into(),
            shared: Arc::new(Shared {
                rate_limiter: RateLimiter::new(max_requests_per_sec),
                handlers: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
                active_connections: AtomicUsize::new(0),
                connections_served: AtomicU64::new(0),
                drained: Notify::new(),
                shutdown: Notify::new(),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// Register (or replace) the handler for a method. Handlers run
    /// without any registry lock held, so a handler may itself register
    /// further handlers.
    pub fn register<F>(&self, method: &str, handler: F)
    where
        F: Fn(Request) -> HandlerFuture + Send + Sync + 'static,
    {
        let mut handlers = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        handlers.insert(method.to_string(), Arc::new(handler));
        debug!("Registered handler for: {}", method);
    }

    /// Bind the socket and spawn the accept task. Idempotent while
    /// running. Bind failure leaves nothing behind.
    pub fn start(&self) -> Result<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.socket_path.as_os_str().as_bytes().len() > MAX_SOCKET_PATH {
            bail!(
                "Socket path too long: {} (max {} bytes)",
                self.socket_path.display(),
                MAX_SOCKET_PATH
            );
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {:?}", parent))?;
            }
        }

        // A previous run may have left its socket file behind.
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to unlink stale socket: {:?}", self.socket_path))?;
            debug!("Removed stale socket file");
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind socket: {:?}", self.socket_path))?;

        // World read/write is safe for a local stream socket; the parent
        // directory provides any additional access control.
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(
                &self.socket_path,
                std::fs::Permissions::from_mode(0o666),
            ) {
                warn!("Failed to set socket permissions: {}", e);
            }
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(accept_loop(shared, listener));
        *self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!("IPC server listening on {}", self.socket_path.display());
        Ok(())
    }

    /// Stop accepting, wait for in-flight handlers to drain, then unlink
    /// the socket file.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Unblock the accept task; dropping the listener closes the socket.
        self.shared.shutdown.notify_one();
        let handle = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Drain: every decrement leaves a wakeup permit, so the last
        // in-flight handler always gets us past this loop.
        loop {
            if self.shared.active_connections.load(Ordering::Acquire) == 0 {
                break;
            }
            self.shared.drained.notified().await;
        }

        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        info!("IPC server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.shared.active_connections.load(Ordering::SeqCst)
    }

    pub fn connections_served(&self) -> u64 {
        self.shared.connections_served.load(Ordering::SeqCst)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: UnixListener) {
    debug!("Accept loop started");
    loop {
        let stream = tokio::select! {
            _ = shared.shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    if shared.running.load(Ordering::SeqCst) {
                        error!("Accept failed: {}", e);
                    }
                    continue;
                }
            },
        };

        shared.active_connections.fetch_add(1, Ordering::AcqRel);
        shared.connections_served.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            handle_connection(&shared, stream).await;
            shared.active_connections.fetch_sub(1, Ordering::AcqRel);
            shared.drained.notify_one();
        });
    }
    debug!("Accept loop ended");
}

async fn handle_connection(shared: &Shared, mut stream: UnixStream) {
    let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
    let read = match timeout(SOCKET_TIMEOUT, stream.read(&mut buffer)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("Read failed: {}", e);
            return;
        }
        Err(_) => {
            debug!("Read timed out");
            return;
        }
    };

    if read == 0 {
        debug!("Client disconnected without data");
        return;
    }
    debug!("Received request ({} bytes)", read);

    // Rate-limit before parse and dispatch; a denied request never
    // reaches a handler.
    if !shared.rate_limiter.allow() {
        warn!("Rate limit exceeded");
        send_response(
            &mut stream,
            &Response::err("Rate limit exceeded", error_codes::RATE_LIMITED),
        )
        .await;
        return;
    }

    let response = match Request::parse(&buffer[..read]) {
        Some(request) => {
            let id = request.id.clone();
            dispatch(shared, request).await.with_id(id)
        }
        None => Response::err("Invalid request format", error_codes::PARSE_ERROR),
    };

    send_response(&mut stream, &response).await;
}

async fn dispatch(shared: &Shared, request: Request) -> Response {
    // Copy the handler out so it runs without the registry lock.
    let handler = {
        let handlers = shared.handlers.read().unwrap_or_else(|e| e.into_inner());
        match handlers.get(&request.method) {
            Some(handler) => Arc::clone(handler),
            None => {
                warn!("Unknown method: {}", request.method);
                return Response::err(
                    format!("Method not found: {}", request.method),
                    error_codes::METHOD_NOT_FOUND,
                );
            }
        }
    };

    let method = request.method.clone();
    // Run the handler in its own task so a panic degrades to an error
    // response instead of tearing down the connection task.
    match tokio::spawn(handler(request)).await {
        Ok(response) => response,
        Err(e) => {
            let message = if e.is_panic() {
                panic_message(e.into_panic())
            } else {
                e.to_string()
            };
            error!("Handler error for {}: {}", method, message);
            Response::err(message, error_codes::INTERNAL_ERROR)
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

async fn send_response(stream: &mut UnixStream, response: &Response) {
    let bytes = response.to_bytes();
    debug!("Sending response ({} bytes)", bytes.len());
    match timeout(SOCKET_TIMEOUT, stream.write_all(&bytes)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Failed to send response: {}", e),
        Err(_) => error!("Send timed out"),
    }
    let _ = stream.shutdown().await;
}
