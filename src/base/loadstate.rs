/// The current state of a stream request.
/// This roughly matches net/base/load_states.h
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// The request is idle (not started, completed, or cancelled).
    #[default]
    Idle,

    /// Waiting for another group to release capacity in a full pool.
    WaitingForStalledSocketPool,

    /// Waiting for a slot in the destination's own group.
    WaitingForAvailableSocket,

    /// Resolving the host.
    ResolvingHost,

    /// Connecting to the host (TCP handshake).
    Connecting,

    /// Establishing an SSL connection.
    SslHandshake,
}

impl LoadState {
    /// Whether the request is still waiting on the pool.
    pub fn is_pending(&self) -> bool {
        !matches!(self, LoadState::Idle)
    }
}
