//! TCP session server
//!
//! Accepts connections on the data port and serves each as an authenticated
//! command loop. Admission runs through the capacity governor before the
//! handshake; a saturated server answers with a single-line JSON rejection
//! and closes the socket.
//!
//! Per-connection state machine: acquire permit → login line → command loop
//! (one JSON object per line in, one per line out) → release permit. Reads
//! carry a bounded timeout, and a server-wide shutdown signal closes the
//! listener, the management plane, and every engine.

pub mod governor;
pub mod management;
pub mod persistence;

pub use governor::Governor;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::auth::AuthManager;
use crate::config::Config;
use crate::defaults::{MONITOR_INTERVAL, SESSION_READ_TIMEOUT};
use crate::query::{error_line, login_ok_line, LoginRequest, QueryEngine, Request};
use crate::spaces::SpaceManager;

/// A configured but not yet listening server
pub struct Server {
    config: Config,
    spaces: Arc<SpaceManager>,
    auth: Arc<AuthManager>,
    governor: Arc<Governor>,
    query: Arc<QueryEngine>,
}

/// Handle to a listening server
pub struct RunningServer {
    pub data_addr: SocketAddr,
    pub management_addr: SocketAddr,
    spaces: Arc<SpaceManager>,
    shutdown: watch::Sender<bool>,
}

impl RunningServer {
    /// Stop the listeners, drain sessions, and close every engine
    pub fn shutdown(&self) {
        tracing::info!("server shutting down");
        let _ = self.shutdown.send(true);
        self.spaces.close_all();
    }
}

impl Server {
    /// Construct the subsystems from the config
    pub fn new(config: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let spaces = Arc::new(SpaceManager::open(&config.data_dir, config.engine.clone())?);
        let auth = Arc::new(AuthManager::open(
            &config.users_path,
            config.engine.bcrypt_cost,
        )?);
        let governor = Governor::new(config.limit_path.clone(), config.max_connections);
        let query = Arc::new(QueryEngine::new(Arc::clone(&spaces), Arc::clone(&auth)));

        Ok(Self {
            config,
            spaces,
            auth,
            governor,
            query,
        })
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    /// Bind both listeners and start serving in background tasks
    pub async fn start(self) -> anyhow::Result<RunningServer> {
        anyhow::ensure!(
            self.auth.has_users(),
            "no users provisioned; an admin must exist before the server accepts connections"
        );

        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        let data_addr = listener.local_addr()?;

        let (management_listener, management_addr) =
            management::bind(self.config.management_port).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(management::serve(
            management_listener,
            Arc::clone(&self.governor),
            shutdown_rx.clone(),
        ));
        governor::spawn_signal_handler(Arc::clone(&self.governor));
        spawn_monitor(Arc::clone(&self.governor), shutdown_rx.clone());

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.query),
            Arc::clone(&self.auth),
            Arc::clone(&self.governor),
            shutdown_rx,
        ));

        tracing::info!(
            data = %data_addr,
            management = %management_addr,
            max_connections = self.governor.current_limit(),
            "server started"
        );

        Ok(RunningServer {
            data_addr,
            management_addr,
            spaces: self.spaces,
            shutdown,
        })
    }
}

impl RunningServer {
    /// Block until ctrl-c or SIGTERM, then shut down
    pub async fn wait_for_signals(self) -> anyhow::Result<()> {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }

        self.shutdown();
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    query: Arc<QueryEngine>,
    auth: Arc<AuthManager>,
    governor: Arc<Governor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        let (mut stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                continue;
            }
        };

        if let Err(e) = governor.try_acquire(addr) {
            tracing::warn!(peer = %addr, "connection rejected at capacity");
            let line = format!("{}\n", error_line(&format!("{e}. Please try again later.")));
            let _ = stream.write_all(line.as_bytes()).await;
            continue;
        }

        tracing::info!(
            peer = %addr,
            active = governor.active(),
            max = governor.current_limit(),
            "connection accepted"
        );

        let query = Arc::clone(&query);
        let auth = Arc::clone(&auth);
        let governor = Arc::clone(&governor);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            handle_session(stream, addr, query, auth, shutdown).await;
            governor.release(addr);
            tracing::info!(peer = %addr, "connection closed");
        });
    }
}

async fn handle_session(
    stream: TcpStream,
    addr: SocketAddr,
    query: Arc<QueryEngine>,
    auth: Arc<AuthManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // Handshake: the first line must be a login
    let user = match read_line(&mut lines).await {
        Some(line) => {
            let login: LoginRequest = match serde_json::from_str(&line) {
                Ok(login) => login,
                Err(_) => {
                    let _ = write_line(&mut writer, &error_line("invalid login format")).await;
                    return;
                }
            };
            match auth.authenticate(&login.username, &login.password) {
                Ok(user) => user,
                Err(e) => {
                    let _ = write_line(&mut writer, &error_line(&e.to_string())).await;
                    return;
                }
            }
        }
        None => return,
    };

    if write_line(&mut writer, &login_ok_line(&user)).await.is_err() {
        return;
    }
    tracing::debug!(peer = %addr, username = %user.username, "session authenticated");

    let mut session_space = String::new();
    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break,
            line = read_line(&mut lines) => line,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(_) => {
                if write_line(&mut writer, &error_line("invalid query")).await.is_err() {
                    break;
                }
                continue;
            }
        };

        match query.execute(&user, &mut session_space, request) {
            Ok(response) => {
                if write_line(&mut writer, &response.to_line()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let fatal = e.is_fatal_for_session();
                if fatal {
                    tracing::error!(peer = %addr, error = %e, "session terminated");
                }
                if write_line(&mut writer, &error_line(&e.to_string())).await.is_err() || fatal {
                    break;
                }
            }
        }
    }
}

/// One line with the session read timeout; `None` ends the session
async fn read_line(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
) -> Option<String> {
    match tokio::time::timeout(SESSION_READ_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => Some(line),
        Ok(Ok(None)) | Ok(Err(_)) => None,
        Err(_) => {
            tracing::debug!("session read timed out");
            None
        }
    }
}

async fn write_line(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    line: &str,
) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// Periodic connection-stats log line
fn spawn_monitor(governor: Arc<Governor>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let stats = governor.stats();
                    if stats.usage_percentage > 80.0 {
                        tracing::warn!(
                            active = stats.active_connections,
                            max = stats.max_connections,
                            usage = %format!("{:.1}%", stats.usage_percentage),
                            "high connection usage"
                        );
                    } else {
                        tracing::info!(
                            active = stats.active_connections,
                            max = stats.max_connections,
                            usage = %format!("{:.1}%", stats.usage_percentage),
                            "connection status"
                        );
                    }
                }
            }
        }
    });
}
