use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Error taxonomy for the mail engine core. Each variant maps to one of the
/// propagation policies in the component design: transport/auth errors drive
/// the IMAP worker's reconnect loop, protocol/client-invariant errors fail
/// just the current operation, cache errors degrade to a cache miss.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("client invariant violated: {0}")]
    ClientInvariant(String),

    #[error("smtp error: {0}")]
    Smtp(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn is_transport(&self) -> bool {
        matches!(self, AppError::Transport(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, AppError::Auth(_))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Cache(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Cache(e.to_string())
    }
}

impl From<async_imap::error::Error> for AppError {
    fn from(e: async_imap::error::Error) -> Self {
        use async_imap::error::Error as ImapErr;
        match e {
            ImapErr::Io(io) => AppError::Transport(io.to_string()),
            ImapErr::ConnectionLost => AppError::Transport("connection lost".into()),
            ImapErr::Bad(_) | ImapErr::No(_) => AppError::Protocol(e.to_string()),
            other => AppError::Protocol(other.to_string()),
        }
    }
}

/// Classification of an SMTP delivery failure, per the spec's
/// permanent-vs-transient split: permanent (5xx) surfaces to the user and
/// offers a draft; transient (4xx / transport) queues to the outbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmtpFailureKind {
    Permanent,
    Transient,
}
