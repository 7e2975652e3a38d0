//! Per-connection protocol state machine
//!
//! A [`ClientSession`] is driven entirely by callbacks: socket readiness,
//! its one-shot timer, and open/close notifications for the audio output.
//! It never blocks; all I/O and scheduling goes through [`SessionIo`].

use crate::protocol::{self, ParseResult, PROTOCOL_MAJOR, PROTOCOL_MINOR};
use bytes::{Buf, BytesMut};
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vis_core::SessionId;
use visualization::{AnalysisParameters, FrequencyAnalyzer, RingCache};

/// Socket readiness flags delivered to [`ClientSession::on_socket_ready`]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const READ: Readiness = Readiness(0b0001);
    pub const WRITE: Readiness = Readiness(0b0010);
    pub const ERROR: Readiness = Readiness(0b0100);
    pub const HANGUP: Readiness = Readiness(0b1000);

    pub const fn empty() -> Self {
        Readiness(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All of `other`'s flags are set
    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any of `other`'s flags are set
    pub fn intersects(self, other: Readiness) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Readiness::READ, "READ"),
            (Readiness::WRITE, "WRITE"),
            (Readiness::ERROR, "ERROR"),
            (Readiness::HANGUP, "HANGUP"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        write!(f, "Readiness({})", names.join("|"))
    }
}

/// Event-loop services a session needs.
///
/// `schedule_*` register interest, `cancel_*` withdraw it; the driver reports
/// readiness back through [`ClientSession::on_socket_ready`] and timer expiry
/// through [`ClientSession::on_timer`]. `read` and `write` never block.
#[cfg_attr(test, mockall::automock)]
pub trait SessionIo {
    fn schedule_read(&mut self);
    fn cancel_read(&mut self);
    fn schedule_write(&mut self);
    fn cancel_write(&mut self);
    /// Arm the one-shot timer, replacing any pending expiry
    fn schedule_timer(&mut self, after: Duration);
    fn cancel_timer(&mut self);
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn close(&mut self);
}

/// Where a session is in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Waiting for the CLIHLO
    Init,
    /// Sending the SRVHLO
    SrvHlo,
    /// Handshake done, but the audio output is closed
    ProtocolClosed,
    /// Waiting for the timer before the next analysis
    Waiting,
    /// A FRAME is buffered and being written
    FrameReady,
    /// Closed; waiting to be reaped
    Done,
}

/// Whether the session currently has audio to analyze
enum PcmState {
    Closed,
    Open(Box<FrequencyAnalyzer>),
}

/// Timing negotiated in the CLIHLO
#[derive(Debug, Clone, Copy)]
struct ClientTimings {
    /// Offset from "now" of the audio each frame describes, in ms
    tau: i16,
    /// Frame period
    freq: Duration,
}

impl ClientTimings {
    /// The instant whose audio should be analyzed at `now`
    fn analysis_time(&self, now: Instant) -> Option<Instant> {
        let offset = Duration::from_millis(self.tau.unsigned_abs() as u64);
        if self.tau >= 0 {
            now.checked_add(offset)
        } else {
            now.checked_sub(offset)
        }
    }
}

/// One visualization client connection.
pub struct ClientSession<I: SessionIo> {
    id: SessionId,
    io: I,
    params: AnalysisParameters,
    pcm: PcmState,
    state: ProtocolState,
    timings: Option<ClientTimings>,
    /// Bytes received while waiting for the CLIHLO
    input: Vec<u8>,
    /// The SRVHLO or FRAME being written
    next_frame: BytesMut,
}

impl<I: SessionIo> ClientSession<I> {
    /// Start a session on a freshly accepted connection. `cache` is present
    /// when the audio output is already open.
    pub fn new(
        id: SessionId,
        mut io: I,
        params: AnalysisParameters,
        cache: Option<Arc<RingCache>>,
    ) -> Self {
        let pcm = match cache {
            Some(cache) => Self::open_analyzer(id, &params, cache),
            None => PcmState::Closed,
        };

        io.schedule_read();

        Self {
            id,
            io,
            params,
            pcm,
            state: ProtocolState::Init,
            timings: None,
            input: Vec::with_capacity(protocol::CLIHLO_LEN),
            next_frame: BytesMut::new(),
        }
    }

    fn open_analyzer(id: SessionId, params: &AnalysisParameters, cache: Arc<RingCache>) -> PcmState {
        match FrequencyAnalyzer::new(params, cache) {
            Ok(analyzer) => PcmState::Open(Box::new(analyzer)),
            Err(e) => {
                error!("[{}] Failed to set up sound analysis: {}", id, e);
                PcmState::Closed
            }
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// The session has shut down and may be reaped
    pub fn is_closed(&self) -> bool {
        self.state == ProtocolState::Done
    }

    pub fn plugin_is_open(&self) -> bool {
        matches!(self.pcm, PcmState::Open(_))
    }

    pub fn io(&self) -> &I {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut I {
        &mut self.io
    }

    /// The audio output opened; start analyzing `cache`.
    pub fn on_plugin_opened(&mut self, cache: Arc<RingCache>) {
        debug!("[{}] Plugin opened in state {:?}", self.id, self.state);
        if self.is_closed() {
            return;
        }

        self.pcm = Self::open_analyzer(self.id, &self.params, cache);
        if !self.plugin_is_open() {
            return;
        }

        if self.state == ProtocolState::ProtocolClosed {
            self.handle_first_frame();
        }
    }

    /// The audio output closed. The next analysis attempt notices and parks
    /// the session in `ProtocolClosed`.
    pub fn on_plugin_closed(&mut self) {
        debug!("[{}] Plugin closed in state {:?}", self.id, self.state);
        if self.is_closed() {
            self.shutdown();
            return;
        }
        self.pcm = PcmState::Closed;
    }

    pub fn on_socket_ready(&mut self, flags: Readiness) {
        trace!(
            "[{}] Socket ready in state {:?}: {:?}",
            self.id,
            self.state,
            flags
        );

        if self.is_closed() {
            return;
        }
        if flags.intersects(Readiness::ERROR | Readiness::HANGUP) {
            info!(
                "[{}] Socket reported {:?} in state {:?}; closing",
                self.id, flags, self.state
            );
            self.shutdown();
            return;
        }

        let expected = match self.state {
            ProtocolState::Init => Readiness::READ,
            ProtocolState::SrvHlo | ProtocolState::FrameReady => Readiness::WRITE,
            other => {
                error!(
                    "[{}] Socket activity {:?} in state {:?}; closing",
                    self.id, flags, other
                );
                self.shutdown();
                return;
            }
        };

        if !flags.contains(expected) {
            error!(
                "[{}] Expected {:?} in state {:?} but got {:?}; closing",
                self.id, expected, self.state, flags
            );
            self.shutdown();
            return;
        }

        match self.state {
            ProtocolState::Init => self.handle_input(),
            ProtocolState::SrvHlo => self.handle_srvhlo(),
            _ => self.handle_frame_ready(),
        }
    }

    pub fn on_timer(&mut self) {
        let Some(timings) = self.timings else {
            return;
        };

        match self.state {
            ProtocolState::Waiting => {}
            ProtocolState::FrameReady => {
                // Previous frame still draining; don't pile up another
                trace!("[{}] Frame still pending; skipping analysis", self.id);
                self.io.schedule_timer(timings.freq);
                return;
            }
            other => {
                debug!("[{}] Ignoring timer in state {:?}", self.id, other);
                return;
            }
        }

        if self.compose_frame() {
            trace!("[{}] Frame composed", self.id);
            self.io.schedule_write();
            self.state = ProtocolState::FrameReady;
            self.io.schedule_timer(timings.freq);
        } else if self.state == ProtocolState::ProtocolClosed {
            debug!(
                "[{}] Plugin closed; waiting for it to reopen",
                self.id
            );
            self.io.cancel_write();
            self.io.cancel_timer();
        } else {
            self.io.cancel_write();
            self.state = ProtocolState::Waiting;
            self.io.schedule_timer(timings.freq);
        }
    }

    /// Close the connection and stop all activity. Idempotent.
    pub fn shutdown(&mut self) {
        if self.is_closed() {
            return;
        }

        debug!("[{}] Shutting down from state {:?}", self.id, self.state);
        self.io.cancel_timer();
        self.io.cancel_read();
        self.io.cancel_write();
        self.io.close();
        self.pcm = PcmState::Closed;
        self.state = ProtocolState::Done;
    }

    fn handle_input(&mut self) {
        let mut chunk = [0u8; 64];
        while self.input.len() < protocol::CLIHLO_LEN {
            match self.io.read(&mut chunk) {
                Ok(0) => {
                    info!("[{}] Client closed the connection", self.id);
                    self.shutdown();
                    return;
                }
                Ok(n) => self.input.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("[{}] Failed to read from client: {}", self.id, e);
                    self.shutdown();
                    return;
                }
            }
        }

        let hello = match protocol::parse_clihlo(&self.input) {
            ParseResult::Ok(hello) => hello,
            ParseResult::NeedMoreData => return,
            ParseResult::Error => {
                error!("[{}] Expected CLIHLO, received invalid message", self.id);
                self.shutdown();
                return;
            }
        };

        debug!(
            "[{}] Got CLIHLO: {}fps, tau={}ms",
            self.id, hello.requested_fps, hello.tau
        );

        if hello.major_version != PROTOCOL_MAJOR || hello.minor_version != PROTOCOL_MINOR {
            warn!(
                "[{}] Client requested protocol {}.{}; serving {}.{}",
                self.id,
                hello.major_version,
                hello.minor_version,
                PROTOCOL_MAJOR,
                PROTOCOL_MINOR
            );
        }

        if hello.requested_fps == 0 {
            error!("[{}] Client requested 0fps; closing", self.id);
            self.shutdown();
            return;
        }

        self.timings = Some(ClientTimings {
            tau: hello.tau,
            // Never a zero period, even above 1000fps
            freq: Duration::from_millis((1000 / hello.requested_fps as u64).max(1)),
        });

        self.input.clear();
        self.next_frame.clear();
        protocol::serialize_srvhlo(PROTOCOL_MAJOR, PROTOCOL_MINOR, &mut self.next_frame);

        self.state = ProtocolState::SrvHlo;
        self.io.cancel_read();
        self.io.schedule_write();
    }

    fn handle_srvhlo(&mut self) {
        if !self.write_frame() {
            return;
        }

        if self.plugin_is_open() {
            self.handle_first_frame();
        } else {
            debug!("[{}] Plugin is closed; parking session", self.id);
            self.state = ProtocolState::ProtocolClosed;
            self.io.cancel_write();
        }
    }

    fn handle_frame_ready(&mut self) {
        if !self.write_frame() {
            return;
        }
        // Timer is already running
        self.state = ProtocolState::Waiting;
    }

    /// Start streaming right after the handshake or once the plugin reopens
    fn handle_first_frame(&mut self) {
        let Some(timings) = self.timings else {
            return;
        };

        if timings.tau < 0 {
            let delay = Duration::from_millis(timings.tau.unsigned_abs() as u64);
            debug!("[{}] First analysis in {:?}", self.id, delay);
            self.io.schedule_timer(delay);
            self.state = ProtocolState::Waiting;
        } else if self.compose_frame() {
            debug!("[{}] First frame composed", self.id);
            self.io.schedule_write();
            self.io.schedule_timer(timings.freq);
            self.state = ProtocolState::FrameReady;
        } else {
            debug!(
                "[{}] No analysis available yet; retrying in {:?}",
                self.id, timings.freq
            );
            self.io.cancel_write();
            self.io.schedule_timer(timings.freq);
            self.state = ProtocolState::Waiting;
        }
    }

    /// Analyze and serialize the next FRAME into `next_frame`.
    fn compose_frame(&mut self) -> bool {
        let Some(timings) = self.timings else {
            return false;
        };
        let PcmState::Open(analyzer) = &mut self.pcm else {
            self.state = ProtocolState::ProtocolClosed;
            return false;
        };

        let Some(t) = timings.analysis_time(Instant::now()) else {
            return false;
        };
        if !analyzer.update(t) {
            return false;
        }

        self.next_frame.clear();
        self.next_frame
            .reserve(protocol::sound_info_frame_len(analyzer));
        protocol::serialize_sound_info_frame(analyzer, &mut self.next_frame);
        true
    }

    /// Write as much of `next_frame` as the socket accepts. Returns `true`
    /// once the whole message is out.
    fn write_frame(&mut self) -> bool {
        let expected = self.next_frame.len();
        match self.io.write(&self.next_frame) {
            Ok(written) if written < expected => {
                debug!(
                    "[{}] Wrote {} of {} bytes; rescheduling",
                    self.id, written, expected
                );
                self.next_frame.advance(written);
                self.io.schedule_write();
                false
            }
            Ok(written) => {
                trace!("[{}] Wrote {} bytes", self.id, written);
                self.io.cancel_write();
                self.next_frame.clear();
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("[{}] Socket ready, but write would block", self.id);
                self.io.schedule_write();
                false
            }
            Err(e) => {
                match e.kind() {
                    io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted => {
                        info!("[{}] Client went away: {}", self.id, e)
                    }
                    _ => warn!("[{}] Failed to write to client: {}", self.id, e),
                }
                self.shutdown();
                false
            }
        }
    }
}

impl<I: SessionIo> Drop for ClientSession<I> {
    fn drop(&mut self) {
        // Stop the timer and socket interest before the cache handle goes
        if !self.is_closed() {
            self.io.cancel_timer();
            self.io.cancel_read();
            self.io.cancel_write();
        }
    }
}
