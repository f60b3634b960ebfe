//! Fatal errors of the bridge and their process exit codes.

use thiserror::Error;

use crate::session::ConnectError;
use crate::settings::SettingsError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] SettingsError),
    #[error(transparent)]
    TransportOpen(TransportError),
    #[error("unable to connect to the broker: {0}")]
    Connect(#[from] ConnectError),
    #[error("the broker did not grant the subscription to '{0}'")]
    Subscribe(String),
    #[error("serial port '{0}' was lost")]
    TransportLost(String),
}

impl BridgeError {
    /// Exit status of the process when the bridge stops on this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Config(_) => 1,
            BridgeError::TransportOpen(_) => 2,
            BridgeError::Connect(_) => 3,
            BridgeError::Subscribe(_) => 4,
            BridgeError::TransportLost(_) => 5,
        }
    }
}
