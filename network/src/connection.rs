//! Tokio driver for [`ClientSession`]
//!
//! Each accepted connection gets its own task that turns socket readiness,
//! the session's timer and commands from the manager into session callbacks.

use crate::events::SessionCommand;
use crate::session::{ClientSession, Readiness, SessionIo};
use log::{debug, trace, warn};
use std::future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// [`SessionIo`] over a non-blocking tokio socket
pub struct TokioIo {
    stream: TcpStream,
    read_interest: bool,
    write_interest: bool,
    deadline: Option<Instant>,
    closed: bool,
}

impl TokioIo {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_interest: false,
            write_interest: false,
            deadline: None,
            closed: false,
        }
    }

    /// Readiness the session is currently waiting for
    pub fn interest(&self) -> Option<Interest> {
        if self.closed {
            return None;
        }
        match (self.read_interest, self.write_interest) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl SessionIo for TokioIo {
    fn schedule_read(&mut self) {
        self.read_interest = true;
    }

    fn cancel_read(&mut self) {
        self.read_interest = false;
    }

    fn schedule_write(&mut self) {
        self.write_interest = true;
    }

    fn cancel_write(&mut self) {
        self.write_interest = false;
    }

    fn schedule_timer(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    fn cancel_timer(&mut self) {
        self.deadline = None;
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.stream.try_read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.stream.try_write(buf)
    }

    fn close(&mut self) {
        // The socket itself is released when the session task drops it
        self.closed = true;
        self.read_interest = false;
        self.write_interest = false;
    }
}

/// Wait until the socket is ready for `interest`. With no interest, only the
/// peer going away is reported.
async fn wait_ready(stream: &TcpStream, interest: Option<Interest>) -> Readiness {
    let Some(interest) = interest else {
        return wait_hangup(stream).await;
    };

    match stream.ready(interest).await {
        Ok(ready) => {
            let mut flags = Readiness::empty();
            if ready.is_readable() || ready.is_read_closed() {
                flags |= Readiness::READ;
            }
            if ready.is_writable() {
                flags |= Readiness::WRITE;
            }
            if ready.is_write_closed() {
                flags |= Readiness::HANGUP;
            }
            flags
        }
        Err(e) => {
            warn!("Failed to poll socket readiness: {}", e);
            Readiness::ERROR
        }
    }
}

/// Watch an idle socket until the peer closes it. Anything the peer sends
/// meanwhile is discarded.
async fn wait_hangup(stream: &TcpStream) -> Readiness {
    let mut discard = [0u8; 256];
    loop {
        let ready = match stream.ready(Interest::READABLE).await {
            Ok(ready) => ready,
            Err(e) => {
                warn!("Failed to poll socket readiness: {}", e);
                return Readiness::ERROR;
            }
        };
        if ready.is_read_closed() {
            return Readiness::HANGUP;
        }

        loop {
            match stream.try_read(&mut discard) {
                Ok(0) => return Readiness::HANGUP,
                Ok(n) => trace!("Discarding {} unexpected bytes", n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Failed to read from idle socket: {}", e);
                    return Readiness::ERROR;
                }
            }
        }
    }
}

/// Sleep until `deadline`, or forever if there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

enum Wakeup {
    Socket(Readiness),
    Timer,
    Command(Option<SessionCommand>),
}

/// Drive `session` until it shuts down, then raise `closed` so the manager
/// can reap it.
pub async fn run_session(
    mut session: ClientSession<TokioIo>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    closed: Arc<AtomicBool>,
) {
    let id = session.id();
    debug!("[{}] Session task started", id);

    while !session.is_closed() {
        let io = session.io();
        let wakeup = tokio::select! {
            flags = wait_ready(io.stream(), io.interest()) => Wakeup::Socket(flags),
            _ = sleep_until_opt(io.deadline()) => Wakeup::Timer,
            command = commands.recv() => Wakeup::Command(command),
        };

        match wakeup {
            Wakeup::Socket(flags) => session.on_socket_ready(flags),
            Wakeup::Timer => {
                session.io_mut().clear_deadline();
                session.on_timer();
            }
            Wakeup::Command(Some(command)) => {
                trace!("[{}] {:?}", id, command);
                match command {
                    SessionCommand::PluginOpened(cache) => session.on_plugin_opened(cache),
                    SessionCommand::PluginClosed => session.on_plugin_closed(),
                }
            }
            Wakeup::Command(None) => {
                debug!("[{}] Manager went away", id);
                session.shutdown();
            }
        }
    }

    closed.store(true, Ordering::Release);
    debug!("[{}] Session task finished", id);
}
