//! Tesseract OCR adapter.
//!
//! Runs `tesseract stdin stdout` per image, piping the image bytes in and
//! reading the recognized text back.

use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, process::Command, time::timeout};
use tracing::{debug, warn};

use tgs_core::{errors::Error, ports::OcrEngine, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const STDERR_PREVIEW_CHARS: usize = 300;

#[derive(Clone, Debug)]
pub struct TesseractOcr {
    binary: PathBuf,
    lang: String,
    timeout: Duration,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            lang: "eng".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl TesseractOcr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the binary can be started at all.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn run(&self, image: &[u8]) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", self.lang.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::Config(format!("{} not found on PATH", self.binary.display()))
                } else {
                    Error::Io(e)
                }
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::External("tesseract stdin was not captured".to_string()))?;
        let bytes = image.to_vec();
        let writer = tokio::spawn(async move {
            // The process may exit early on a bad image; a broken pipe is
            // reported through its exit status instead.
            let _ = stdin.write_all(&bytes).await;
            let _ = stdin.shutdown().await;
        });

        let out = child.wait_with_output().await?;
        let _ = writer.await;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(Error::External(format!(
                "tesseract exited with {}: {}",
                out.status,
                stderr.trim().chars().take(STDERR_PREVIEW_CHARS).collect::<String>()
            )));
        }
        Ok(out.stdout)
    }
}

/// Trim recognizer output; whitespace-only output means no text.
fn normalize_output(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let joined = lines.join("\n");
    let trimmed = joined.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn extract_text(&self, image: &[u8]) -> Result<Option<String>> {
        if image.is_empty() {
            return Ok(None);
        }
        let raw = match timeout(self.timeout, self.run(image)).await {
            Ok(r) => r?,
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "ocr timed out");
                return Err(Error::Timeout(format!(
                    "tesseract did not finish within {}s",
                    self.timeout.as_secs()
                )));
            }
        };
        let text = normalize_output(&raw);
        debug!(
            bytes = image.len(),
            chars = text.as_ref().map(|t| t.chars().count()).unwrap_or(0),
            "ocr finished"
        );
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_trimmed() {
        assert_eq!(
            normalize_output(b"  URGENT notice  \n\nsecond line   \n\x0c").as_deref(),
            Some("URGENT notice\n\nsecond line")
        );
        assert_eq!(normalize_output(b" \n \x0c\n"), None);
        assert_eq!(normalize_output(b""), None);
    }

    #[tokio::test]
    async fn empty_image_skips_the_process() {
        let ocr = TesseractOcr::new().with_binary("/nonexistent/tesseract");
        assert_eq!(ocr.extract_text(&[]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_binary_is_a_config_error() {
        let ocr = TesseractOcr::new().with_binary("/nonexistent/tesseract");
        assert!(!ocr.is_available().await);
        assert!(matches!(
            ocr.extract_text(b"\x89PNG").await,
            Err(Error::Config(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_process_reports_exit_status() {
        let ocr = TesseractOcr::new().with_binary("false");
        let err = ocr.extract_text(b"\x89PNG").await.unwrap_err();
        assert!(err.to_string().contains("tesseract exited"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_process_yields_no_text() {
        let ocr = TesseractOcr::new().with_binary("true");
        assert_eq!(ocr.extract_text(b"\x89PNG").await.unwrap(), None);
    }
}
