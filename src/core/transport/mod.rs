//! Transport layer: serial connections addressed by integer handles
//!
//! Supports:
//! - Serial ports (RS-232, RS-485, USB-Serial) through `serialport`
//! - Caller-supplied links (simulated devices, test doubles)
//! - Port enumeration, USB bridge detection and baud-rate probing
//!
//! Blocking device calls never run on the async runtime: each one is handed
//! to a fixed-size [`IoPool`]. Calls against the same handle are queued in
//! arrival order; calls against different handles run in parallel up to the
//! pool size.

mod link;
mod pool;
mod serial;

pub use link::{FrameLength, ReadSpec, SerialLink};
#[cfg(test)]
pub use link::MockSerialLink;
pub use pool::IoPool;
pub use serial::{pick_port, PortBackend, PortInfo, SerialConfig, SerialParity, SystemPorts};

use link::LinkState;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Opaque identifier of one open connection
pub type ConnectionHandle = u32;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Read did not complete in time
    #[error("I/O timeout: expected {expected} bytes, received {received}")]
    Timeout {
        /// Bytes requested
        expected: usize,
        /// Bytes that arrived before the deadline
        received: usize,
    },

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Port already held by an open connection
    #[error("Port already in use: {0}")]
    PortInUse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Handle is unknown or closed
    #[error("Connection {0} is not open")]
    NotConnected(ConnectionHandle),

    /// Device stayed silent
    #[error("Device not responding")]
    NoResponse,

    /// The I/O worker pool is gone or the job was lost
    #[error("I/O worker unavailable")]
    WorkerUnavailable,
}

/// Transport tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Number of blocking I/O workers
    pub pool_size: usize,
    /// Pause between a request write and the first read, in milliseconds
    pub inter_byte_delay_ms: u64,
    /// Markers identifying USB-serial bridges during auto-detection
    pub usb_keywords: Vec<String>,
    /// How long each baud candidate may take to answer, in milliseconds
    pub probe_timeout_ms: u64,
}

impl TransportSettings {
    /// Pause between write and read
    pub fn inter_byte_delay(&self) -> Duration {
        Duration::from_millis(self.inter_byte_delay_ms)
    }

    /// Per-candidate auto-baud timeout
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            pool_size: 4,
            inter_byte_delay_ms: 10,
            usb_keywords: ["usb", "ch340", "ch341", "cp210", "ft232", "pl2303"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            probe_timeout_ms: 300,
        }
    }
}

/// Snapshot of one registered connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Handle
    pub handle: ConnectionHandle,
    /// Serial settings the connection was opened with
    pub config: SerialConfig,
    /// Open/closed flag
    pub open: bool,
}

struct Connection {
    handle: ConnectionHandle,
    config: SerialConfig,
    link: Arc<Mutex<LinkState>>,
    /// Fair FIFO turn-taking for jobs on this connection
    turn: tokio::sync::Mutex<()>,
    open: AtomicBool,
}

impl Connection {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            handle: self.handle,
            config: self.config.clone(),
            open: self.open.load(Ordering::SeqCst),
        }
    }
}

struct Inner {
    backend: Arc<dyn PortBackend>,
    pool: IoPool,
    settings: TransportSettings,
    connections: RwLock<HashMap<ConnectionHandle, Arc<Connection>>>,
    /// Serializes connect/disconnect
    lifecycle: tokio::sync::Mutex<()>,
    next_handle: AtomicU32,
}

/// Registry of open connections; cheap to clone
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Transport over real serial hardware
    pub fn new(settings: TransportSettings) -> Result<Self, TransportError> {
        Self::with_backend(settings, Arc::new(SystemPorts))
    }

    /// Transport over a custom port backend
    pub fn with_backend(
        settings: TransportSettings,
        backend: Arc<dyn PortBackend>,
    ) -> Result<Self, TransportError> {
        let pool = IoPool::new(settings.pool_size)?;
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                pool,
                settings,
                connections: RwLock::new(HashMap::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                next_handle: AtomicU32::new(1),
            }),
        })
    }

    /// Active settings
    pub fn settings(&self) -> &TransportSettings {
        &self.inner.settings
    }

    /// Open a port, or return the existing handle if the path is already open
    pub async fn connect(&self, config: SerialConfig) -> Result<ConnectionHandle, TransportError> {
        config.validate()?;
        let _guard = self.inner.lifecycle.lock().await;

        if let Some(handle) = self.handle_for_path(&config.port) {
            debug!("{} already open as handle {}", config.port, handle);
            return Ok(handle);
        }

        let backend = self.inner.backend.clone();
        let open_config = config.clone();
        let link = self.inner.pool.run(move || backend.open(&open_config)).await??;
        Ok(self.register(config, link))
    }

    /// Register a caller-supplied link under `config.port`
    pub async fn connect_link(
        &self,
        config: SerialConfig,
        link: Box<dyn SerialLink>,
    ) -> Result<ConnectionHandle, TransportError> {
        config.validate()?;
        let _guard = self.inner.lifecycle.lock().await;

        if let Some(handle) = self.handle_for_path(&config.port) {
            return Ok(handle);
        }
        Ok(self.register(config, link))
    }

    fn register(&self, config: SerialConfig, link: Box<dyn SerialLink>) -> ConnectionHandle {
        let handle = self.inner.next_handle.fetch_add(1, Ordering::SeqCst);
        info!("Connected {} as handle {}", config.describe(), handle);
        let connection = Arc::new(Connection {
            handle,
            config,
            link: Arc::new(Mutex::new(LinkState::new(link))),
            turn: tokio::sync::Mutex::new(()),
            open: AtomicBool::new(true),
        });
        self.inner.connections.write().insert(handle, connection);
        handle
    }

    fn handle_for_path(&self, path: &str) -> Option<ConnectionHandle> {
        self.inner
            .connections
            .read()
            .values()
            .find(|c| c.config.port == path)
            .map(|c| c.handle)
    }

    /// Close one connection, or every connection when `handle` is `None`
    pub async fn disconnect(&self, handle: Option<ConnectionHandle>) -> Result<(), TransportError> {
        let _guard = self.inner.lifecycle.lock().await;

        let closing: Vec<Arc<Connection>> = {
            let mut connections = self.inner.connections.write();
            match handle {
                Some(h) => vec![connections.remove(&h).ok_or(TransportError::NotConnected(h))?],
                None => connections.drain().map(|(_, c)| c).collect(),
            }
        };

        for connection in closing {
            connection.open.store(false, Ordering::SeqCst);
            // Wait for in-flight jobs on this handle before releasing the device
            let _turn = connection.turn.lock().await;
            let link = connection.link.clone();
            self.inner.pool.run(move || link.lock().close()).await?;
            info!("Disconnected handle {} ({})", connection.handle, connection.config.port);
        }
        Ok(())
    }

    /// Whether `handle` refers to an open connection
    pub fn is_connected(&self, handle: ConnectionHandle) -> bool {
        self.inner
            .connections
            .read()
            .get(&handle)
            .is_some_and(|c| c.open.load(Ordering::SeqCst))
    }

    /// Settings and state of one connection
    pub fn connection_info(&self, handle: ConnectionHandle) -> Result<ConnectionInfo, TransportError> {
        self.connection(handle).map(|c| c.info())
    }

    /// All registered connections, ordered by handle
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.inner.connections.read().values().map(|c| c.info()).collect();
        infos.sort_by_key(|i| i.handle);
        infos
    }

    fn connection(&self, handle: ConnectionHandle) -> Result<Arc<Connection>, TransportError> {
        let connection = self
            .inner
            .connections
            .read()
            .get(&handle)
            .cloned()
            .ok_or(TransportError::NotConnected(handle))?;
        if connection.open.load(Ordering::SeqCst) {
            Ok(connection)
        } else {
            Err(TransportError::NotConnected(handle))
        }
    }

    /// Run one blocking job against a connection, in per-connection FIFO order
    async fn with_link<T, F>(&self, handle: ConnectionHandle, job: F) -> Result<T, TransportError>
    where
        F: FnOnce(&mut LinkState) -> Result<T, TransportError> + Send + 'static,
        T: Send + 'static,
    {
        let connection = self.connection(handle)?;
        let _turn = connection.turn.lock().await;
        if !connection.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected(handle));
        }
        let link = connection.link.clone();
        self.inner.pool.run(move || job(&mut link.lock())).await?
    }

    /// Write bytes
    pub async fn write(&self, handle: ConnectionHandle, data: &[u8]) -> Result<(), TransportError> {
        let data = data.to_vec();
        debug!("TX[{}] {}", handle, hex::encode(&data));
        self.with_link(handle, move |link| link.write(&data)).await
    }

    /// Drop unread input, buffered leftovers included
    pub async fn clear_input(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        self.with_link(handle, LinkState::discard_input).await
    }

    /// Read exactly `n` bytes
    pub async fn read_exact(
        &self,
        handle: ConnectionHandle,
        n: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let data = self
            .with_link(handle, move |link| link.read_exact(n, timeout))
            .await?;
        debug!("RX[{}] {}", handle, hex::encode(&data));
        Ok(data)
    }

    /// Read until `terminator`, `max_bytes`, or timeout; partial data on timeout is returned
    pub async fn read_until(
        &self,
        handle: ConnectionHandle,
        terminator: &[u8],
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let terminator = terminator.to_vec();
        let data = self
            .with_link(handle, move |link| link.read_until(&terminator, max_bytes, timeout))
            .await?;
        debug!("RX[{}] {}", handle, hex::encode(&data));
        Ok(data)
    }

    /// Discard stale input, write, wait `inter_byte_delay`, then read per `spec`.
    ///
    /// The whole exchange holds the connection, so replies cannot interleave
    /// with another caller's request.
    pub async fn write_then_read(
        &self,
        handle: ConnectionHandle,
        data: &[u8],
        spec: ReadSpec,
        timeout: Duration,
        inter_byte_delay: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        let data = data.to_vec();
        let delay = inter_byte_delay.unwrap_or_else(|| self.inner.settings.inter_byte_delay());
        debug!("TX[{}] {}", handle, hex::encode(&data));
        let reply = self
            .with_link(handle, move |link| {
                link.discard_input()?;
                link.write(&data)?;
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                link.read(&spec, timeout)
            })
            .await?;
        debug!("RX[{}] {}", handle, hex::encode(&reply));
        Ok(reply)
    }

    /// Enumerate serial ports
    pub async fn list_ports(&self) -> Result<Vec<PortInfo>, TransportError> {
        let backend = self.inner.backend.clone();
        self.inner.pool.run(move || backend.list()).await?
    }

    /// Best candidate port: a USB-serial bridge if present, else the first port
    pub async fn auto_detect_port(&self) -> Result<Option<String>, TransportError> {
        let ports = self.list_ports().await?;
        let picked = pick_port(&ports, &self.inner.settings.usb_keywords);
        match &picked {
            Some(port) => info!("Auto-detected port {}", port),
            None => warn!("No serial ports available"),
        }
        Ok(picked)
    }

    /// First baud rate in `candidates` at which `probe` gets any reply.
    ///
    /// Each candidate uses its own short-lived connection, closed before the
    /// next attempt. Fails with `PortInUse` if the registry already holds `path`.
    pub async fn auto_detect_baud(
        &self,
        path: &str,
        candidates: &[u32],
        probe: &[u8],
    ) -> Result<Option<u32>, TransportError> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.handle_for_path(path).is_some() {
            return Err(TransportError::PortInUse(path.to_string()));
        }

        let timeout = self.inner.settings.probe_timeout();
        let delay = self.inner.settings.inter_byte_delay();

        for &baud in candidates {
            let backend = self.inner.backend.clone();
            let config = SerialConfig::new(path, baud).timeout(timeout);
            let probe = probe.to_vec();

            let reply = self
                .inner
                .pool
                .run(move || -> Result<Vec<u8>, TransportError> {
                    let mut link = LinkState::new(backend.open(&config)?);
                    let result = link
                        .discard_input()
                        .and_then(|()| link.write(&probe))
                        .and_then(|()| {
                            std::thread::sleep(delay);
                            link.read_any(256, timeout)
                        });
                    link.close();
                    result
                })
                .await?;

            match reply {
                Ok(bytes) if !bytes.is_empty() => {
                    info!("{} answered at {} baud", path, baud);
                    return Ok(Some(baud));
                }
                Ok(_) => debug!("{} silent at {} baud", path, baud),
                Err(e) => debug!("{} probe at {} baud failed: {}", path, baud, e),
            }
        }
        Ok(None)
    }
}
