use thiserror::Error;

/// Classified failure of establishing a remote session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Authentication failed")]
    Authentication,
    #[error("Could not resolve address {0}")]
    AddressResolution(String),
    #[error("Connection timed out")]
    Timeout,
    #[error("SSH protocol failure: {0}")]
    Protocol(String),
}

impl ConnectionError {
    /// Message shown to the person running the backup.
    pub fn user_message(&self) -> String {
        match self {
            ConnectionError::Authentication => {
                "Authentication failed: the username or password was rejected by the server"
                    .to_string()
            }
            ConnectionError::AddressResolution(host) => {
                format!("Could not find the server {host:?}: check the host name")
            }
            ConnectionError::Timeout => {
                "The connection timed out: check the host and port, and that the server is up"
                    .to_string()
            }
            ConnectionError::Protocol(detail) => {
                format!("The server did not speak a usable SSH protocol: {detail}")
            }
        }
    }
}

/// Message for a server that accepted the login but whose folder is unusable.
pub fn missing_folder_message(folder: &std::path::Path) -> String {
    format!("Connected, but {folder:?} is not a folder or cannot be accessed")
}
