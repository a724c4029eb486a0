//! Output comparison predicates.
//!
//! Pure functions over captured output bytes. Each platform has one declared
//! policy: enclave output must be empty once the boot banner and benign
//! status lines are removed, local output must equal the expected document
//! byte for byte once comment lines are removed. Output is never decoded
//! before comparison, so invalid UTF-8 cannot be papered over.

use regex::bytes::Regex;

use crate::capability::Platform;
use crate::error::RunnerError;

/// Configuration for output comparison.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Number of stdout lines emitted by the enclave host before guest output.
    pub boot_banner_lines: usize,
    /// Pattern for benign stderr status lines (unanchored, like `grep`).
    pub benign_stderr: String,
    /// Prefix marking comment lines in local stdout.
    pub comment_marker: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            boot_banner_lines: 11,
            benign_stderr: "Start.*".to_string(),
            comment_marker: "#".to_string(),
        }
    }
}

/// Remove lines beginning with `marker`.
pub fn strip_comment_lines(text: &[u8], marker: &str) -> Vec<u8> {
    keep_lines(text, |line| !line.starts_with(marker.as_bytes()))
}

/// Discard the first `count` lines.
pub fn discard_boot_banner(text: &[u8], count: usize) -> Vec<u8> {
    text.split_inclusive(|&b| b == b'\n')
        .skip(count)
        .flatten()
        .copied()
        .collect()
}

/// Remove lines matching `benign`.
pub fn filter_benign_lines(text: &[u8], benign: &Regex) -> Vec<u8> {
    keep_lines(text, |line| !benign.is_match(line))
}

fn keep_lines(text: &[u8], keep: impl Fn(&[u8]) -> bool) -> Vec<u8> {
    text.split_inclusive(|&b| b == b'\n')
        .filter(|line| keep(trim_line_end(line)))
        .flatten()
        .copied()
        .collect()
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Why a comparison failed. The streams are rendered for display; the
/// comparison itself ran on raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub stream: &'static str,
    pub expected: String,
    pub actual: String,
}

impl Mismatch {
    fn new(stream: &'static str, expected: &[u8], actual: &[u8]) -> Self {
        Self {
            stream,
            expected: String::from_utf8_lossy(expected).into_owned(),
            actual: String::from_utf8_lossy(actual).into_owned(),
        }
    }

    pub fn into_error(self, test: &str) -> RunnerError {
        RunnerError::OutputMismatch {
            test: format!("{} ({})", test, self.stream),
            expected: self.expected,
            actual: self.actual,
        }
    }

    pub fn diagnostic(&self) -> String {
        format!(
            "{} mismatch: expected {:?}, actual {:?}",
            self.stream, self.expected, self.actual
        )
    }
}

/// Compiled comparison policy for one platform.
pub struct OutputPolicy {
    platform: Platform,
    config: FilterConfig,
    benign: Regex,
}

impl OutputPolicy {
    pub fn new(platform: Platform, config: FilterConfig) -> Result<Self, RunnerError> {
        let benign = Regex::new(&config.benign_stderr).map_err(|e| {
            RunnerError::Config(format!("invalid benign stderr pattern: {}", e))
        })?;
        Ok(Self {
            platform,
            config,
            benign,
        })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Compare captured streams. `expected` is only consulted on Local.
    pub fn compare(
        &self,
        stdout: &[u8],
        stderr: &[u8],
        expected: Option<&[u8]>,
    ) -> Result<(), Mismatch> {
        match self.platform {
            Platform::Enclave => self.compare_enclave(stdout, stderr),
            Platform::Local => {
                let actual = strip_comment_lines(stdout, &self.config.comment_marker);
                let expected = expected.unwrap_or_default();
                if actual == expected {
                    Ok(())
                } else {
                    Err(Mismatch::new("stdout", expected, &actual))
                }
            }
        }
    }

    fn compare_enclave(&self, stdout: &[u8], stderr: &[u8]) -> Result<(), Mismatch> {
        let out = discard_boot_banner(stdout, self.config.boot_banner_lines);
        if !out.is_empty() {
            return Err(Mismatch::new("stdout", b"", &out));
        }
        let err = filter_benign_lines(stderr, &self.benign);
        if !err.is_empty() {
            return Err(Mismatch::new("stderr", b"", &err));
        }
        Ok(())
    }
}
