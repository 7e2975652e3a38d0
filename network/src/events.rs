use std::sync::Arc;
use tokio::sync::oneshot;
use visualization::RingCache;

/// Commands from the connection manager to one session task
#[derive(Clone)]
pub enum SessionCommand {
    /// The audio output opened; analyze this cache from now on
    PluginOpened(Arc<RingCache>),
    /// The audio output closed
    PluginClosed,
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionCommand::PluginOpened(cache) => {
                write!(f, "PluginOpened({})", cache.format())
            }
            SessionCommand::PluginClosed => write!(f, "PluginClosed"),
        }
    }
}

/// Commands accepted by the connection manager
pub enum ServerCommand {
    /// The audio output opened with a fresh cache
    PluginOpened {
        cache: Arc<RingCache>,
        /// Signalled once every session has been told
        ack: oneshot::Sender<()>,
    },

    /// The audio output closed
    PluginClosed {
        ack: oneshot::Sender<()>,
    },

    /// Report the number of sessions not yet reaped
    SessionCount {
        reply: oneshot::Sender<usize>,
    },

    /// Close every session and stop accepting connections
    Shutdown,
}
