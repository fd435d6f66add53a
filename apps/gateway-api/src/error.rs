use thiserror::Error;

/// Error taxonomy for the event-distribution core.
///
/// Only [`GatewayError::AuthTimeout`], [`GatewayError::Auth`] and
/// [`GatewayError::Protocol`] terminate a connection. Everything else is
/// reported back to the originating connection as an `error` event and the
/// session keeps running. Nothing here ever terminates the process.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No valid credential presented within the handshake grace period.
    #[error("authentication timed out")]
    AuthTimeout,

    /// Credential rejected by the auth collaborator.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed inbound frame or an event outside the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Sender is not a member of the target room, or not permitted to join.
    #[error("not permitted: {0}")]
    Authorization(String),

    /// The persistence collaborator failed; room state is unaffected.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// The fanout broker is unreachable. Cross-process delivery is dropped;
    /// local-process delivery still proceeds.
    #[error("fanout transport unavailable: {0}")]
    FanoutUnavailable(String),

    /// A connection id was registered twice. This is a programming invariant
    /// violation, logged as a defect; the connection is rejected.
    #[error("duplicate connection id: {0}")]
    DuplicateConnection(String),
}

impl GatewayError {
    /// Whether this error terminates the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::AuthTimeout | GatewayError::Auth(_) | GatewayError::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(GatewayError::AuthTimeout.is_fatal());
        assert!(GatewayError::Auth("bad token".into()).is_fatal());
        assert!(GatewayError::Protocol("not json".into()).is_fatal());

        assert!(!GatewayError::Authorization("not a member".into()).is_fatal());
        assert!(!GatewayError::Persistence("db down".into()).is_fatal());
        assert!(!GatewayError::FanoutUnavailable("broker gone".into()).is_fatal());
        assert!(!GatewayError::DuplicateConnection("conn_x".into()).is_fatal());
    }
}
