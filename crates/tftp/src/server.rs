//! TFTP server: listener loop, control block, and the embedding API
//!
//! The listener owns the well-known port. Each valid RRQ/WRQ that passes
//! the duplicate and capacity gates is copied into a session context and
//! handed to a spawned worker; the listener itself never blocks on a
//! session. Stopping a server only prevents new sessions - transfers in
//! flight run to completion on their own endpoints.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::endpoint::Endpoint;
use crate::protocol::{MAX_FRAME_SIZE, TftpErrorCode, TftpOpcode, get_tftp_opcode};
use crate::registry::{ConnectionRegistry, MAX_CONNECTIONS};
use crate::store::BlobStore;
use crate::transfer::{SessionContext, run_rrq_session, run_wrq_session};

/// Standard TFTP service port.
pub const TFTP_SERVER_PORT: u16 = 69;

/// Per-server cap on concurrent sessions.
pub const MAX_SESSIONS: usize = MAX_CONNECTIONS;

/// Cap on server instances running concurrently in one process. Each must
/// listen on its own port.
pub const MAX_SERVERS: usize = 3;

/// [`ServerHandle::last_error_code`] value when no session has failed.
pub const NO_ERROR: i32 = -1;

static RUNNING_SERVERS: AtomicUsize = AtomicUsize::new(0);

/// Server instance configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory RRQ files are served from.
    pub read_root: PathBuf,
    /// Directory WRQ files are written to.
    pub write_root: PathBuf,
    /// Listening port; 0 picks an ephemeral port.
    pub port: u16,
    /// Concurrent session cap, clamped to `1..=MAX_SESSIONS` at start.
    pub max_sessions: usize,
}

impl ServerConfig {
    pub fn new(read_root: impl Into<PathBuf>, write_root: impl Into<PathBuf>) -> Self {
        Self {
            read_root: read_root.into(),
            write_root: write_root.into(),
            port: TFTP_SERVER_PORT,
            max_sessions: MAX_SESSIONS,
        }
    }
}

/// Control block shared by the listener and its sessions. Configuration is
/// written once at start; the counters and flags are read with plain
/// atomic loads wherever staleness is tolerable.
pub(crate) struct ServerState {
    pub config: ServerConfig,
    pub store: BlobStore,
    pub registry: ConnectionRegistry,
    pub opened_sessions: AtomicU32,
    running: AtomicBool,
    stop_requested: AtomicBool,
    last_err_code: AtomicI32,
    shutdown: Notify,
}

impl ServerState {
    pub(crate) fn new(config: ServerConfig) -> Self {
        let store = BlobStore::new(&config.read_root, &config.write_root);

        Self {
            config,
            store,
            registry: ConnectionRegistry::new(),
            opened_sessions: AtomicU32::new(0),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            last_err_code: AtomicI32::new(NO_ERROR),
            shutdown: Notify::new(),
        }
    }

    /// Record the terminal wire code of a failed session.
    pub(crate) fn set_last_error(&self, code: TftpErrorCode) {
        self.last_err_code.store(code.as_u16() as i32, Ordering::SeqCst);
    }

    pub(crate) fn last_error_code(&self) -> i32 {
        self.last_err_code.load(Ordering::SeqCst)
    }
}

/// A running server instance.
///
/// Holding the handle does not keep the listener alive; [`stop`] asks it
/// to exit and [`join`] waits for it.
///
/// [`stop`]: ServerHandle::stop
/// [`join`]: ServerHandle::join
pub struct ServerHandle {
    state: Arc<ServerState>,
    local_port: u16,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Request shutdown: no further sessions are accepted and the listener
    /// exits as soon as it observes the request. Sessions already running
    /// are unaffected.
    pub fn stop(&self) {
        self.state.stop_requested.store(true, Ordering::SeqCst);
        self.state.shutdown.notify_one();
    }

    /// Count of sessions currently being serviced.
    pub fn opened_sessions(&self) -> u32 {
        self.state.opened_sessions.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.state.stop_requested.load(Ordering::SeqCst)
    }

    /// Most recent terminal wire error code observed by any session, or
    /// [`NO_ERROR`].
    pub fn last_error_code(&self) -> i32 {
        self.state.last_error_code()
    }

    /// Human-readable rendition of [`last_error_code`].
    ///
    /// [`last_error_code`]: ServerHandle::last_error_code
    pub fn last_error_message(&self) -> &'static str {
        let code = self.last_error_code();
        if code == NO_ERROR {
            return "None";
        }
        match u16::try_from(code).ok().and_then(TftpErrorCode::from_u16) {
            Some(code) => code.wire_message(),
            None => "Unknown",
        }
    }

    /// The port the listener is bound to. Differs from the configured port
    /// only when the configuration asked for port 0.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Wait for the listener to exit.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Bind and start a server instance. Fails if the process-wide instance
/// limit is reached or the listening port cannot be bound.
pub async fn start_server(config: ServerConfig) -> Result<ServerHandle> {
    let claimed = RUNNING_SERVERS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
        (n < MAX_SERVERS).then_some(n + 1)
    });
    if claimed.is_err() {
        return Err(anyhow!("server instance limit ({MAX_SERVERS}) reached"));
    }

    match try_start(config).await {
        Ok(handle) => Ok(handle),
        Err(e) => {
            RUNNING_SERVERS.fetch_sub(1, Ordering::SeqCst);
            Err(e)
        }
    }
}

async fn try_start(mut config: ServerConfig) -> Result<ServerHandle> {
    config.max_sessions = config.max_sessions.clamp(1, MAX_SESSIONS);

    let endpoint = Endpoint::bind(config.port).await?;
    let local_port = endpoint.local_port().context("failed to read listener port")?;

    let state = Arc::new(ServerState::new(config));
    state.running.store(true, Ordering::SeqCst);

    let task = tokio::spawn(listen(state.clone(), endpoint, local_port));

    Ok(ServerHandle {
        state,
        local_port,
        task,
    })
}

async fn listen(state: Arc<ServerState>, endpoint: Endpoint, local_port: u16) {
    tracing::info!(
        "tftp server on port {} started, GET from {:?}, PUT to {:?}",
        local_port,
        state.config.read_root,
        state.config.write_root
    );

    state.registry.invalidate_all();
    let mut buf = vec![0u8; MAX_FRAME_SIZE];

    loop {
        let (len, peer) = tokio::select! {
            _ = state.shutdown.notified() => break,
            received = endpoint.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!("listener receive failed: {}", e);
                    break;
                }
            },
        };

        // A peer that is already being serviced is retrying its request on
        // the well-known port; the in-flight session will absorb it.
        if state.registry.search(peer).is_some() {
            tracing::warn!("request from {} already being serviced", peer);
            // With no sessions running the entry can only be stale.
            if state.opened_sessions.load(Ordering::SeqCst) == 0 {
                state.registry.invalidate_all();
            }
            continue;
        }

        let opcode = match get_tftp_opcode(&buf[..len]) {
            Some(op @ (TftpOpcode::ReadRequest | TftpOpcode::WriteRequest)) => op,
            _ => {
                tracing::debug!("ignoring non-request packet from {}", peer);
                continue;
            }
        };

        // The counter may lag sessions that are still winding down; one
        // excess admission under a stale read is tolerated.
        if state.opened_sessions.load(Ordering::SeqCst) as usize >= state.config.max_sessions {
            tracing::warn!(
                "{} from {} ignored, session cap ({}) reached",
                opcode,
                peer,
                state.config.max_sessions
            );
            continue;
        }

        let Some(registry_index) = state.registry.insert(peer) else {
            tracing::warn!("{} from {} ignored, connection table full", opcode, peer);
            continue;
        };

        tracing::debug!("{} from {} enters session slot {}", opcode, peer, registry_index);

        let ctx = SessionContext {
            server: state.clone(),
            peer,
            frame: buf[..len].to_vec(),
            registry_index,
        };

        match opcode {
            TftpOpcode::ReadRequest => {
                tokio::spawn(run_rrq_session(ctx));
            }
            _ => {
                tokio::spawn(run_wrq_session(ctx));
            }
        }
    }

    if !state.stop_requested.load(Ordering::SeqCst) {
        state.set_last_error(TftpErrorCode::NotDefined);
    }
    state.running.store(false, Ordering::SeqCst);
    RUNNING_SERVERS.fetch_sub(1, Ordering::SeqCst);

    tracing::info!("tftp server on port {} stopped", local_port);
}
