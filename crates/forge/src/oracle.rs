//! Oracle boundary and the retrying client in front of it.
//!
//! An oracle takes a prompt and returns free text. `OracleClient` turns that
//! text into a typed response, retrying transport and parse failures with
//! exponential backoff.

use crate::process::{CommandOutcome, CommandRunner, ShellCommand};
use async_trait::async_trait;
use chrono::Utc;
use forge_core::parser::{parse_response, ParseError, ParseStrategy};
use forge_core::Config;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable telling a command oracle whether a cached answer is acceptable.
pub const CACHEABLE_ENV: &str = "FORGE_CACHEABLE";

/// Maximum stderr characters kept in an exit-code error.
const STDERR_TAIL_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("failed to start oracle command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("oracle timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("oracle command exited with code {code}: {stderr}")]
    ExitCode { code: i32, stderr: String },
    #[error("oracle returned an empty response")]
    EmptyResponse,
    #[error("could not parse oracle response: {0}")]
    Parse(#[from] ParseError),
    #[error("oracle call failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<OracleError>,
    },
}

pub type Result<T> = std::result::Result<T, OracleError>;

/// A text-generation backend.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Send a prompt and return the raw response text.
    ///
    /// `cacheable = false` asks the backend for a fresh answer.
    async fn send_prompt(&self, prompt: &str, cacheable: bool) -> Result<String>;
}

/// Retry and failure-capture settings for `OracleClient`.
#[derive(Debug, Clone)]
pub struct OracleClientConfig {
    pub attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub backoff: Duration,
    pub failure_dir: Option<PathBuf>,
}

impl Default for OracleClientConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(1000),
            failure_dir: None,
        }
    }
}

impl OracleClientConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.oracle_attempts,
            backoff: config.oracle_backoff(),
            failure_dir: config.failure_dir.clone(),
        }
    }
}

/// Typed, retrying front end over an `Oracle`.
#[derive(Clone)]
pub struct OracleClient {
    oracle: Arc<dyn Oracle>,
    config: OracleClientConfig,
}

impl std::fmt::Debug for OracleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleClient")
            .field("oracle", &"dyn Oracle")
            .field("config", &self.config)
            .finish()
    }
}

impl OracleClient {
    pub fn new(oracle: Arc<dyn Oracle>, config: OracleClientConfig) -> Self {
        Self { oracle, config }
    }

    /// Send `prompt` and parse the answer as `T`.
    ///
    /// `label` names the call in logs and failure captures.
    pub async fn call<T: DeserializeOwned>(&self, label: &str, prompt: &str) -> Result<T> {
        let attempts = self.config.attempts.max(1);
        let mut cacheable = true;
        let mut last_error = None;

        for attempt in 1..=attempts {
            debug!(label, attempt, prompt_bytes = prompt.len(), cacheable, "calling oracle");

            let error = match self.oracle.send_prompt(prompt, cacheable).await {
                Ok(text) => match parse_response::<T>(&text) {
                    Ok(parsed) => {
                        if parsed.strategy != ParseStrategy::Strict {
                            debug!(label, strategy = parsed.strategy.as_str(), "parsed embedded response");
                        }
                        info!(label, attempt, response_bytes = text.len(), "oracle call succeeded");
                        return Ok(parsed.value);
                    }
                    Err(err) => {
                        cacheable = false;
                        self.capture_failure(label, attempt, prompt, Some(&text), &err);
                        OracleError::Parse(err)
                    }
                },
                Err(err) => {
                    self.capture_failure(label, attempt, prompt, None, &err);
                    err
                }
            };

            warn!(label, attempt, max_attempts = attempts, error = %error, "oracle call failed");
            last_error = Some(error);

            if attempt < attempts {
                let backoff = self.config.backoff.saturating_mul(2u32.saturating_pow(attempt - 1));
                info!(label, backoff_ms = backoff.as_millis() as u64, "retrying after backoff");
                tokio::time::sleep(backoff).await;
            }
        }

        Err(OracleError::RetriesExhausted {
            attempts,
            last: Box::new(last_error.unwrap_or(OracleError::EmptyResponse)),
        })
    }

    fn capture_failure(
        &self,
        label: &str,
        attempt: u32,
        prompt: &str,
        response: Option<&str>,
        error: &dyn std::fmt::Display,
    ) {
        let Some(dir) = &self.config.failure_dir else {
            return;
        };
        match write_failure(dir, label, attempt, prompt, response, error) {
            Ok(path) => debug!(label, path = %path.display(), "captured failed oracle call"),
            Err(err) => warn!(label, error = %err, "failed to capture oracle failure"),
        }
    }
}

fn write_failure(
    dir: &Path,
    label: &str,
    attempt: u32,
    prompt: &str,
    response: Option<&str>,
    error: &dyn std::fmt::Display,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let slug: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let path = dir.join(format!(
        "{}-{slug}-attempt{attempt}.txt",
        Utc::now().format("%Y%m%dT%H%M%S%.3f")
    ));
    let content = format!(
        "error: {error}\n\n--- PROMPT ---\n{prompt}\n\n--- RESPONSE ---\n{}\n",
        response.unwrap_or("(none)")
    );
    std::fs::write(&path, content)?;
    Ok(path)
}

/// Oracle backed by a shell command reading the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    command: String,
    cwd: PathBuf,
    runner: CommandRunner,
}

impl CommandOracle {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            runner: CommandRunner::new(timeout),
        }
    }

    pub fn from_config(config: &Config, project_root: &Path) -> Self {
        Self::new(&config.oracle_cmd, project_root, config.oracle_timeout())
    }
}

#[async_trait]
impl Oracle for CommandOracle {
    async fn send_prompt(&self, prompt: &str, cacheable: bool) -> Result<String> {
        let shell = ShellCommand::new(&self.command)
            .with_stdin(prompt)
            .with_env(CACHEABLE_ENV, if cacheable { "1" } else { "0" });

        match self
            .runner
            .run_shell(&shell, &self.cwd)
            .await
            .map_err(OracleError::Spawn)?
        {
            CommandOutcome::TimedOut { timeout, .. } => Err(OracleError::Timeout(timeout)),
            CommandOutcome::Completed {
                exit_code, stderr, ..
            } if exit_code != 0 => {
                let skip = stderr.chars().count().saturating_sub(STDERR_TAIL_CHARS);
                Err(OracleError::ExitCode {
                    code: exit_code,
                    stderr: stderr.chars().skip(skip).collect::<String>().trim().to_string(),
                })
            }
            CommandOutcome::Completed { stdout, .. } if stdout.trim().is_empty() => {
                Err(OracleError::EmptyResponse)
            }
            CommandOutcome::Completed { stdout, .. } => Ok(stdout),
        }
    }
}
