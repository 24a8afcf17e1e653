//! Daemon Server Implementation
//!
//! Accepts connections on a Unix socket and runs one session per connection:
//!
//! ```text
//!                     DaemonServer
//!                          │ accept, peer uid check
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!       conn-a          conn-b          conn-c
//!     (session s1)    (session s2)    (session s3)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                    StreamManager
//! ```
//!
//! On shutdown the server stops accepting, cancels every in-flight session,
//! gives connections a grace period to flush their terminal frame, and then
//! removes the socket file.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use relay_core::{RelayConfig, StreamManager};

use crate::connection::{handle_connection, ConnectionLimits, ConnectionOutcome};

/// Unique identifier for an accepted connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state tracking
#[derive(Debug)]
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote peer UID (from `SO_PEERCRED`)
    peer_uid: Option<u32>,
}

/// Configuration for the daemon server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of open connections
    pub max_connections: usize,
    /// Per-connection limits
    pub connection: ConnectionLimits,
    /// How long shutdown waits for connections to finish
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            connection: ConnectionLimits::default(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl ServerConfig {
    /// Server settings derived from relay configuration
    #[must_use]
    pub fn from_relay_config(config: &RelayConfig) -> Self {
        Self {
            connection: ConnectionLimits {
                max_frame_size: config.max_frame_size,
                ..ConnectionLimits::default()
            },
            ..Self::default()
        }
    }
}

/// The main daemon server
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Session manager shared by all connections
    manager: Arc<StreamManager>,
    /// Server configuration
    config: ServerConfig,
    /// Open connections
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    /// Create a new daemon server
    #[must_use]
    pub fn new(socket_path: PathBuf, manager: Arc<StreamManager>, config: ServerConfig) -> Self {
        Self {
            socket_path,
            manager,
            config,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Socket this server binds
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Shared session manager
    #[must_use]
    pub fn manager(&self) -> &Arc<StreamManager> {
        &self.manager
    }

    /// Number of open connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }

    /// Get peer credentials from a Unix socket
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        // SAFETY: ucred is plain old data; getsockopt writes at most `len` bytes
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        #[allow(clippy::cast_possible_truncation)]
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    /// Same user as the daemon, or root
    fn peer_allowed(peer_uid: Option<u32>) -> bool {
        // SAFETY: getuid has no preconditions
        let our_uid = unsafe { libc::getuid() };
        match peer_uid {
            Some(uid) if uid != our_uid && uid != 0 => {
                warn!(
                    peer_uid = uid,
                    our_uid = our_uid,
                    "Rejecting connection from different user"
                );
                false
            }
            _ => true,
        }
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Bind the socket with owner-only permissions
    ///
    /// # Errors
    ///
    /// Fails if the socket directory cannot be created, a stale socket cannot
    /// be removed, or the bind itself fails.
    pub fn bind(&self) -> Result<UnixListener> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.socket_path, perms)
                .with_context(|| format!("Failed to set permissions on {:?}", self.socket_path))?;
        }

        info!(path = ?self.socket_path, "Listening for connections");
        Ok(listener)
    }

    /// Bind and serve until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be bound.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Fails only if the socket file cannot be removed afterwards.
    pub async fn serve(&self, listener: UnixListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task failed");
                    }
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.accept(stream, &mut tasks),
                        Err(e) => error!(error = %e, "Accept failed"),
                    }
                }
            }
        }

        drop(listener);
        self.shutdown(tasks).await
    }

    fn accept(&self, stream: UnixStream, tasks: &mut JoinSet<()>) {
        if self.connection_states.len() >= self.config.max_connections {
            warn!("Connection limit reached, rejecting new connection");
            return;
        }

        let peer_uid = Self::get_peer_uid(&stream);
        if !Self::peer_allowed(peer_uid) {
            return;
        }

        let conn_id = ConnectionId::new();
        self.connection_states.insert(
            conn_id,
            ConnectionState {
                connected_at: Instant::now(),
                peer_uid,
            },
        );

        info!(
            conn_id = %conn_id,
            peer_uid = ?peer_uid,
            active_connections = self.connection_states.len(),
            "New connection accepted"
        );

        let manager = Arc::clone(&self.manager);
        let connection_states = Arc::clone(&self.connection_states);
        let limits = self.config.connection;

        tasks.spawn(
            async move {
                let (read_half, write_half) = stream.into_split();
                match handle_connection(read_half, write_half, manager, limits).await {
                    Ok(ConnectionOutcome::Streamed(status)) => {
                        debug!(status = ?status, "Session connection finished");
                    }
                    Ok(outcome) => debug!(outcome = ?outcome, "Connection finished"),
                    Err(e) => warn!(error = %e, "Connection failed"),
                }

                if let Some((_, state)) = connection_states.remove(&conn_id) {
                    info!(
                        peer_uid = ?state.peer_uid,
                        duration_ms = state.connected_at.elapsed().as_millis(),
                        "Connection closed"
                    );
                }
            }
            .instrument(tracing::info_span!("connection", %conn_id)),
        );
    }

    /// Cancel sessions, drain connections, remove the socket
    async fn shutdown(&self, mut tasks: JoinSet<()>) -> Result<()> {
        info!(
            active_sessions = self.manager.active_count(),
            active_connections = self.connection_states.len(),
            "Shutting down daemon server"
        );

        self.manager.shutdown();

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "Connections did not finish in time, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        self.connection_states.clear();

        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => info!(path = ?self.socket_path, "Removed socket file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path));
            }
        }

        info!("Daemon server shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for DaemonServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonServer")
            .field("socket_path", &self.socket_path)
            .field("connections", &self.connection_states.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::pipeline::ScriptedPipeline;
    use relay_core::StreamManagerConfig;
    use tempfile::TempDir;

    fn server(dir: &TempDir) -> DaemonServer {
        let manager = StreamManager::new(
            Arc::new(ScriptedPipeline::staged(&["a"])),
            StreamManagerConfig::default(),
        );
        DaemonServer::new(
            dir.path().join("sock").join("relay.sock"),
            Arc::new(manager),
            ServerConfig::default(),
        )
    }

    #[test]
    fn test_connection_id_format() {
        let id = ConnectionId::new();
        let shown = id.to_string();
        assert!(shown.starts_with("conn-"));
        assert_eq!(shown.len(), "conn-".len() + 36);
        assert_ne!(id, ConnectionId::new());
    }

    #[test]
    fn test_root_and_self_allowed() {
        assert!(DaemonServer::peer_allowed(None));
        assert!(DaemonServer::peer_allowed(Some(0)));
        let me = unsafe { libc::getuid() };
        assert!(DaemonServer::peer_allowed(Some(me)));
    }

    #[test]
    fn test_server_config_follows_relay_config() {
        let mut relay = RelayConfig::default();
        relay.max_frame_size = 4096;
        let config = ServerConfig::from_relay_config(&relay);
        assert_eq!(config.connection.max_frame_size, 4096);
    }

    #[tokio::test]
    async fn test_bind_creates_dir_and_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let _listener = server.bind().unwrap();

        let mode = fs::metadata(server.socket_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_stale_socket_replaced() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        fs::create_dir_all(server.socket_path().parent().unwrap()).unwrap();
        fs::write(server.socket_path(), b"stale").unwrap();

        assert!(server.bind().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_removes_socket() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);

        server.run(async {}).await.unwrap();
        assert!(!server.socket_path().exists());
    }
}
