//! Error types and exit-code mapping
//!
//! Fatal classes (scan failures, unusable configuration, a store that
//! cannot be opened for ingestion) terminate the run with a non-zero exit
//! code. Recovered classes (a corrupt feed document, a store missing at
//! correlation time) surface only as warnings and the run continues with
//! best-effort data.

/// Failure talking to or interpreting the external scanner. Fatal to the
/// whole run; the core never retries it.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// The scanner binary is not installed or not on PATH.
    #[error("scanner executable `{0}` not found on PATH")]
    ScannerNotFound(String),

    /// The scanner ran but reported failure.
    #[error("scanner exited with {status}: {stderr}")]
    ScannerFailed { status: String, stderr: String },

    /// The scanner produced no output within the configured timeout.
    #[error("scan timed out after {0} seconds")]
    Timeout(u64),

    /// The scanner's JSON output could not be parsed.
    #[error("malformed scanner output: {0}")]
    MalformedOutput(#[from] serde_json::Error),

    /// Launching the scanner process failed.
    #[error("failed to launch scanner: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level application error, mapped to a process exit code.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// Image scan failure (fatal, see [`ScanError`]).
    #[error("scan failed: {0}")]
    Scan(#[from] ScanError),

    /// The vulnerability store could not be opened for ingestion.
    #[error("vulnerability store unavailable: {0}")]
    Store(String),

    /// A feed run failed beyond per-document recovery.
    #[error("feed ingestion failed: {0}")]
    Feed(String),

    /// Report serialization failure.
    #[error("report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// IO error writing reports or cache files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Map the error to a process exit code.
    ///
    /// | Code | Meaning                       |
    /// |------|-------------------------------|
    /// | 0    | Success                       |
    /// | 1    | General / feed / IO error     |
    /// | 2    | Configuration error           |
    /// | 3    | Scan failure                  |
    /// | 4    | Store unavailable (ingestion) |
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) => 2,
            AppError::Scan(_) => 3,
            AppError::Store(_) => 4,
            AppError::Feed(_) | AppError::Serialize(_) | AppError::Io(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(AppError::Config("bad toml".into()).exit_code(), 2);
        assert_eq!(
            AppError::Scan(ScanError::ScannerNotFound("syft".into())).exit_code(),
            3
        );
        assert_eq!(AppError::Store("no such file".into()).exit_code(), 4);
        assert_eq!(AppError::Feed("probe failed".into()).exit_code(), 1);
    }

    #[test]
    fn test_scan_error_display() {
        let err = ScanError::ScannerFailed {
            status: "exit status: 1".into(),
            stderr: "image not found".into(),
        };
        let message = err.to_string();
        assert!(message.contains("exit status: 1"));
        assert!(message.contains("image not found"));
    }
}
