//! Error taxonomy for the gatekeeper
//!
//! Configuration errors are fatal at startup. Provisioning errors are
//! recovered at the connection level: the offending connection is rejected
//! and the listener keeps running. Proxy errors are normal session
//! termination. Teardown errors are logged and swallowed at the call site
//! and never surface here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    /// A required configuration field is missing or empty
    #[error("missing required config field `{0}`")]
    MissingField(&'static str),

    /// A configuration field is present but invalid
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No free loopback port could be allocated for a container
    #[error("port allocation failed: {0}")]
    PortAllocation(#[source] std::io::Error),

    /// The container engine rejected a create/start request
    #[error("container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),
}

pub type Result<T> = std::result::Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = GateError::MissingField("image");
        assert_eq!(err.to_string(), "missing required config field `image`");

        let err = GateError::Config("listen port must be nonzero".into());
        assert!(err.to_string().contains("listen port must be nonzero"));
    }
}
