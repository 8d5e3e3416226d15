use thiserror::Error;

/// Error kinds surfaced by the collector.
///
/// Retries happen inside the HTTP client; by the time an error reaches a
/// caller it is final for the run. `Blocked` means the anti-bot fallback
/// path was also exhausted.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("blocked by anti-bot protection: {0}")]
    Blocked(String),

    #[error("decode failure: {0}")]
    Decode(String),

    #[error("cache io failure: {0}")]
    CacheIo(String),

    #[error("run canceled: {0}")]
    Canceled(String),
}

impl CollectError {
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn cache_io(msg: impl Into<String>) -> Self {
        Self::CacheIo(msg.into())
    }

    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 2,
            Self::Upstream(_) | Self::Decode(_) => 3,
            Self::Blocked(_) => 4,
            Self::CacheIo(_) | Self::Canceled(_) => 1,
        }
    }
}

impl From<std::io::Error> for CollectError {
    fn from(err: std::io::Error) -> Self {
        Self::CacheIo(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(CollectError::InvalidArgument("x".into()).exit_code(), 2);
        assert_eq!(CollectError::Upstream("x".into()).exit_code(), 3);
        assert_eq!(CollectError::Decode("x".into()).exit_code(), 3);
        assert_eq!(CollectError::Blocked("x".into()).exit_code(), 4);
        assert_eq!(CollectError::CacheIo("x".into()).exit_code(), 1);
        assert_eq!(CollectError::Canceled("x".into()).exit_code(), 1);
    }
}
