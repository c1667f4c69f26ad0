//! RRDtool error types

use thiserror::Error;

/// Failures of rrdtool commands and the persistent process
#[derive(Error, Debug)]
pub enum RrdError {
    /// The RRD file does not exist (yet)
    #[error("RRD file not found: {0}")]
    NotFound(String),

    /// Update with a timestamp at or before the last one
    #[error("Premature update of {path}: {message}")]
    PrematureUpdate { path: String, message: String },

    /// rrdtool reported an error
    #[error("rrdtool error: {0}")]
    Command(String),

    /// The persistent process is not usable
    #[error("rrdtool process error: {0}")]
    ProcessState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RrdError {
    /// Classify an `ERROR:` message printed by rrdtool
    pub fn from_message(message: &str) -> Self {
        let message = message.trim();
        let message = message.strip_prefix("ERROR:").map(str::trim).unwrap_or(message);

        if message.contains("No such file") {
            return Self::NotFound(quoted_path(message).unwrap_or(message).to_string());
        }
        if message.contains("illegal attempt to update") || message.contains("minimum one second step") {
            return Self::PrematureUpdate {
                path: quoted_path(message).unwrap_or_default().to_string(),
                message: message.to_string(),
            };
        }
        Self::Command(message.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// First single-quoted segment, e.g. the file in `opening '/x.rrd': ...`
fn quoted_path(message: &str) -> Option<&str> {
    let start = message.find('\'')? + 1;
    let len = message[start..].find('\'')?;
    Some(&message[start..start + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found() {
        let err = RrdError::from_message("ERROR: opening '/data/cpu.rrd': No such file or directory");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "RRD file not found: /data/cpu.rrd");
    }

    #[test]
    fn test_premature_update() {
        let err = RrdError::from_message(
            "ERROR: /data/cpu.rrd: illegal attempt to update using time 1698408000 when last update time is 1698408000 (minimum one second step)",
        );
        match err {
            RrdError::PrematureUpdate { message, .. } => assert!(message.starts_with("/data/cpu.rrd")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_other_errors() {
        let err = RrdError::from_message("ERROR: No DS called 'idle' in '/data/cpu.rrd'");
        assert!(matches!(err, RrdError::Command(_)));
        assert!(!err.is_not_found());
    }
}
