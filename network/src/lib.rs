//! Network side of the visualization daemon
//!
//! [`VisualizationServer`] accepts TCP connections from visualization
//! clients, runs one [`session::ClientSession`] per connection and fans
//! audio output open/close notifications out to all of them.

use log::{debug, error, info, trace, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use vis_core::{Error, SessionId};
use visualization::{AnalysisParameters, OutputObserver, RingCache};

pub mod connection;
pub mod events;
pub mod protocol;
pub mod session;

use connection::{run_session, sleep_until_opt, TokioIo};
use events::{ServerCommand, SessionCommand};
use session::ClientSession;


/// Connection manager settings
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// Most clients served at once; 0 means no limit
    pub max_clients: usize,
    /// How often closed sessions are cleaned up
    pub reap_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 0,
            reap_interval: Duration::from_secs(3),
        }
    }
}

/// State of the audio output as last reported
enum PluginState {
    Closed,
    Open(Arc<RingCache>),
}

/// Manager-side view of one session task
struct SessionHandle {
    id: SessionId,
    peer: SocketAddr,
    commands: mpsc::UnboundedSender<SessionCommand>,
    /// Raised by the task once the session is done
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Accepts visualization clients and owns their sessions.
pub struct VisualizationServer {
    listener: TcpListener,
    params: AnalysisParameters,
    config: ServerConfig,
    plugin: PluginState,
    sessions: Vec<SessionHandle>,
    /// Template for [`ServerHandle`]s; released when the server starts
    command_tx: Option<mpsc::Sender<ServerCommand>>,
    command_rx: mpsc::Receiver<ServerCommand>,
}

impl VisualizationServer {
    /// Bind the listening socket.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        params: AnalysisParameters,
        config: ServerConfig,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind listener: {}", e)))?;

        let (command_tx, command_rx) = mpsc::channel(16);

        Ok(Self {
            listener,
            params,
            config,
            plugin: PluginState::Closed,
            sessions: Vec::new(),
            command_tx: Some(command_tx),
            command_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Get a handle for controlling the server once it runs.
    ///
    /// Handles must be taken before [`run`](Self::run); the server stops when
    /// every handle has been dropped or one of them asks it to shut down.
    pub fn handle(&self) -> Option<ServerHandle> {
        self.command_tx
            .as_ref()
            .map(|tx| ServerHandle { tx: tx.clone() })
    }

    /// Sessions not yet reaped
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Serve clients until shut down.
    pub async fn run(mut self) -> Result<(), Error> {
        self.command_tx = None;
        info!(
            "Visualization server listening on {}",
            self.local_addr()?
        );

        let mut next_reap: Option<Instant> = None;
        loop {
            if self.sessions.is_empty() {
                next_reap = None;
            } else if next_reap.is_none() {
                next_reap = Some(Instant::now() + self.config.reap_interval);
            }

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        // Typically out of descriptors; give sessions a moment to close
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },

                command = self.command_rx.recv() => match command {
                    Some(ServerCommand::Shutdown) => {
                        info!("Visualization server shutting down");
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All server handles dropped");
                        break;
                    }
                },

                _ = sleep_until_opt(next_reap) => {
                    self.reap();
                    next_reap = None;
                }
            }
        }

        self.close_sessions().await;
        Ok(())
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let live = self.sessions.iter().filter(|s| !s.is_closed()).count();
        if self.config.max_clients > 0 && live >= self.config.max_clients {
            warn!(
                "Rejecting {}: already serving {} clients (max {})",
                peer, live, self.config.max_clients
            );
            return;
        }

        let id = SessionId::new();
        info!("[{}] Accepted visualization client {}", id, peer);

        let cache = match &self.plugin {
            PluginState::Open(cache) => Some(Arc::clone(cache)),
            PluginState::Closed => None,
        };
        let session = ClientSession::new(id, TokioIo::new(stream), self.params, cache);

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_session(session, commands_rx, Arc::clone(&closed)));

        self.sessions.push(SessionHandle {
            id,
            peer,
            commands,
            closed,
            task,
        });
    }

    fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::PluginOpened { cache, ack } => {
                info!("Audio output opened: {}", cache.format());
                self.plugin = PluginState::Open(Arc::clone(&cache));
                self.broadcast(SessionCommand::PluginOpened(cache));
                let _ = ack.send(());
            }

            ServerCommand::PluginClosed { ack } => {
                info!("Audio output closed");
                self.plugin = PluginState::Closed;
                self.broadcast(SessionCommand::PluginClosed);
                let _ = ack.send(());
            }

            ServerCommand::SessionCount { reply } => {
                let _ = reply.send(self.sessions.len());
            }

            ServerCommand::Shutdown => {}
        }
    }

    fn broadcast(&self, command: SessionCommand) {
        for session in &self.sessions {
            if session.is_closed() {
                continue;
            }
            if session.commands.send(command.clone()).is_err() {
                trace!("[{}] Session already finished", session.id);
            }
        }
    }

    /// Drop sessions whose task has finished
    fn reap(&mut self) {
        let before = self.sessions.len();
        self.sessions.retain(|session| {
            let closed = session.is_closed();
            if closed {
                debug!("[{}] Reaping session for {}", session.id, session.peer);
            }
            !closed
        });

        let reaped = before - self.sessions.len();
        if reaped > 0 {
            info!(
                "Reaped {} closed sessions, {} remain",
                reaped,
                self.sessions.len()
            );
        }
    }

    async fn close_sessions(&mut self) {
        let sessions = std::mem::take(&mut self.sessions);
        debug!("Closing {} sessions", sessions.len());

        // Dropping the command senders makes every session shut down
        let tasks: Vec<_> = sessions
            .into_iter()
            .map(|session| (session.id, session.task))
            .collect();

        for (id, task) in tasks {
            if let Err(e) = task.await {
                warn!("[{}] Session task failed: {}", id, e);
            }
        }
    }
}

/// Cloneable control handle for a running [`VisualizationServer`].
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<ServerCommand>,
}

fn not_running() -> Error {
    Error::Network("Visualization server is not running".to_string())
}

impl ServerHandle {
    /// Tell every session the audio output opened with `cache`.
    pub async fn plugin_opened(&self, cache: Arc<RingCache>) -> Result<(), Error> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(ServerCommand::PluginOpened { cache, ack })
            .await
            .map_err(|_| not_running())?;
        done.await.map_err(|_| not_running())
    }

    pub async fn plugin_closed(&self) -> Result<(), Error> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(ServerCommand::PluginClosed { ack })
            .await
            .map_err(|_| not_running())?;
        done.await.map_err(|_| not_running())
    }

    pub async fn session_count(&self) -> Result<usize, Error> {
        let (reply, count) = oneshot::channel();
        self.tx
            .send(ServerCommand::SessionCount { reply })
            .await
            .map_err(|_| not_running())?;
        count.await.map_err(|_| not_running())
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        self.tx
            .send(ServerCommand::Shutdown)
            .await
            .map_err(|_| not_running())
    }

    /// Blocking variant of [`plugin_opened`](Self::plugin_opened) for
    /// threads outside the runtime.
    pub fn plugin_opened_blocking(&self, cache: Arc<RingCache>) -> Result<(), Error> {
        let (ack, done) = oneshot::channel();
        self.tx
            .blocking_send(ServerCommand::PluginOpened { cache, ack })
            .map_err(|_| not_running())?;
        done.blocking_recv().map_err(|_| not_running())
    }

    /// Blocking variant of [`plugin_closed`](Self::plugin_closed).
    pub fn plugin_closed_blocking(&self) -> Result<(), Error> {
        let (ack, done) = oneshot::channel();
        self.tx
            .blocking_send(ServerCommand::PluginClosed { ack })
            .map_err(|_| not_running())?;
        done.blocking_recv().map_err(|_| not_running())
    }
}

/// Lets the audio thread drive the server directly. Must not be called from
/// within the runtime.
impl OutputObserver for ServerHandle {
    fn plugin_opened(&self, cache: Arc<RingCache>) -> Result<(), Error> {
        self.plugin_opened_blocking(cache)
    }

    fn plugin_closed(&self) -> Result<(), Error> {
        self.plugin_closed_blocking()
    }
}
