//! Scan helper turning clamd verdicts into accept/reject decisions.

use crate::clamd::{ClamdClient, ClamdError};
use crate::config::{Messages, Settings};
use crate::protocol::ScanVerdict;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

/// Why a scan was rejected.
#[derive(Debug, Error)]
pub enum HelperError {
    /// The data may contain a virus. Carries `messages.virus`.
    #[error("{0}")]
    VirusSuspected(String),

    /// The scan did not complete. Carries `messages.failed`.
    #[error("{0}")]
    ScanFailed(String),

    /// The data to scan could not be opened.
    #[error("Failed to open scan input: {0}")]
    Input(std::io::Error),

    /// clamd reported a configuration problem.
    #[error(transparent)]
    Clamd(#[from] ClamdError),
}

impl From<std::io::Error> for HelperError {
    fn from(e: std::io::Error) -> Self {
        HelperError::Input(e)
    }
}

/// Scan helper wrapping a [`ClamdClient`].
#[derive(Debug, Clone)]
pub struct ScanHelper {
    client: ClamdClient,
    messages: Messages,
    settings: Settings,
}

impl ScanHelper {
    pub fn new(client: ClamdClient, messages: Messages, settings: Settings) -> Self {
        Self {
            client,
            messages,
            settings,
        }
    }

    pub fn client(&self) -> &ClamdClient {
        &self.client
    }

    /// Whether the scanner is reachable.
    pub async fn check_scanner_status(&self) -> bool {
        self.client.ping().await
    }

    /// Scan an in-memory buffer.
    ///
    /// Returns `Ok(true)` when the data may contain a virus and
    /// `throw_if_virus` is false, `Ok(false)` when it is clean.
    pub async fn check_if_virus(
        &self,
        data: &[u8],
        throw_if_virus: bool,
    ) -> Result<bool, HelperError> {
        let mut source = data;
        self.check_stream_if_virus(&mut source, "memory", throw_if_virus)
            .await
    }

    /// Scan a file, streaming it from disk.
    pub async fn check_file_if_virus(
        &self,
        path: &Path,
        throw_if_virus: bool,
    ) -> Result<bool, HelperError> {
        let mut file = tokio::fs::File::open(path).await?;
        let label = path.display().to_string();
        self.check_stream_if_virus(&mut file, &label, throw_if_virus)
            .await
    }

    /// Scan any byte source. `label` only identifies the input in logs.
    pub async fn check_stream_if_virus<R>(
        &self,
        source: &mut R,
        label: &str,
        throw_if_virus: bool,
    ) -> Result<bool, HelperError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let start = Instant::now();
        let verdict = self.client.scan_stream(source).await?;
        let scan_time = start.elapsed();

        match verdict {
            ScanVerdict::Clean => {
                if self.settings.log_clean {
                    info!(
                        input = %label,
                        scan_time_ms = scan_time.as_millis(),
                        "Scan complete: clean"
                    );
                }
            }
            ScanVerdict::Infected => {
                if self.settings.log_detections {
                    info!(
                        input = %label,
                        scan_time_ms = scan_time.as_millis(),
                        "Malware detected"
                    );
                }
            }
            ScanVerdict::Failed => {
                warn!(input = %label, "ClamAV scan failed");
            }
        }

        self.process_verdict(verdict, throw_if_virus)
    }

    fn process_verdict(
        &self,
        verdict: ScanVerdict,
        throw_if_virus: bool,
    ) -> Result<bool, HelperError> {
        debug!(verdict = %verdict, throw_if_virus, "Processing scan verdict");
        match verdict {
            ScanVerdict::Clean => Ok(false),
            ScanVerdict::Infected if throw_if_virus => {
                Err(HelperError::VirusSuspected(self.messages.virus.clone()))
            }
            ScanVerdict::Infected => Ok(true),
            ScanVerdict::Failed => Err(HelperError::ScanFailed(self.messages.failed.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClamdConfig;

    fn create_test_helper() -> ScanHelper {
        let client = ClamdClient::new(&ClamdConfig::default()).unwrap();
        let messages = Messages {
            failed: "scan failed".to_string(),
            virus: "virus suspected".to_string(),
        };
        ScanHelper::new(client, messages, Settings::default())
    }

    #[test]
    fn test_process_clean() {
        let helper = create_test_helper();
        assert!(!helper.process_verdict(ScanVerdict::Clean, true).unwrap());
        assert!(!helper.process_verdict(ScanVerdict::Clean, false).unwrap());
    }

    #[test]
    fn test_process_infected_without_throw() {
        let helper = create_test_helper();
        assert!(helper.process_verdict(ScanVerdict::Infected, false).unwrap());
    }

    #[test]
    fn test_process_infected_with_throw() {
        let helper = create_test_helper();
        match helper.process_verdict(ScanVerdict::Infected, true) {
            Err(HelperError::VirusSuspected(msg)) => assert_eq!(msg, "virus suspected"),
            other => panic!("Expected VirusSuspected, got {:?}", other),
        }
    }

    #[test]
    fn test_process_failed() {
        let helper = create_test_helper();
        for throw_if_virus in [true, false] {
            match helper.process_verdict(ScanVerdict::Failed, throw_if_virus) {
                Err(HelperError::ScanFailed(msg)) => assert_eq!(msg, "scan failed"),
                other => panic!("Expected ScanFailed, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_helper_error_display() {
        let err = HelperError::VirusSuspected("Suspected file".to_string());
        assert_eq!(err.to_string(), "Suspected file");

        let err = HelperError::Clamd(ClamdError::SizeLimitExceeded("limit".to_string()));
        assert_eq!(
            err.to_string(),
            "Clamd size limit exceeded. Full reply from server: limit"
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_input_error() {
        let helper = create_test_helper();
        let dir = tempfile::tempdir().unwrap();
        let result = helper
            .check_file_if_virus(&dir.path().join("missing.bin"), true)
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, HelperError::Input(_)));

        let chain = format!("{:#}", anyhow::Error::from(err));
        assert!(chain.starts_with("Failed to open scan input: "));
        assert_eq!(chain.matches(": ").count(), 1);
    }
}
