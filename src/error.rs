use std::time::Duration;
use thiserror::Error;
#[derive(Debug, Error)]
pub enum StreamError {
    /// The requested acquisition setup cannot be realised by the scan table.
    /// Nothing on the device has been touched when this is returned.
    #[error("configuration rejected: {reason}")]
    ConfigRejected { reason: String },
    /// A scan entry's conversion result never arrived. Fatal for the current run.
    #[error("scan timeout on slot {slot} after {waited:?}")]
    ScanTimeout { slot: usize, waited: Duration },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive error: {0}")]
    Archive(#[from] serde_json::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
}
impl StreamError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        StreamError::ConfigRejected {
            reason: reason.into(),
        }
    }
    /// True for failures the caller has to surface to the user (as opposed to
    /// plumbing errors that usually just end a thread).
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            StreamError::ConfigRejected { .. } | StreamError::ScanTimeout { .. }
        )
    }
}
pub type Result<T> = std::result::Result<T, StreamError>;
#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn rejected_message_carries_reason() {
        let err = StreamError::rejected("channel list is empty");
        assert_eq!(
            err.to_string(),
            "configuration rejected: channel list is empty"
        );
        assert!(err.is_user_facing());
    }
    #[test]
    fn io_errors_are_plumbing() {
        let err: StreamError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(!err.is_user_facing());
    }
}
