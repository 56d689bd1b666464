use std::collections::{BTreeMap, BTreeSet};
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::{debug, warn};

use crate::config::ExternalSection;

const RETRY_DELAY_MS: u64 = 350;
const MIN_REQUEST_GAP_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalCheck {
    Reachable(u16),
    Failed(String),
}

impl ExternalCheck {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Reachable(status) => format!("reachable (HTTP {status})"),
            Self::Failed(message) => format!("unreachable: {message}"),
        }
    }
}

/// Whether a target is an http(s) URL worth probing.
pub fn is_checkable(target: &str) -> bool {
    let lower = target.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Probes each distinct http(s) target once. Never fails the run: a client
/// that cannot be built marks every target as failed.
pub fn check_external_links<'a>(
    targets: impl IntoIterator<Item = &'a str>,
    settings: &ExternalSection,
) -> BTreeMap<String, ExternalCheck> {
    let targets = targets
        .into_iter()
        .filter(|target| is_checkable(target))
        .map(ToString::to_string)
        .collect::<BTreeSet<_>>();
    if targets.is_empty() {
        return BTreeMap::new();
    }

    let mut client = match ExternalClient::new(settings) {
        Ok(client) => client,
        Err(error) => {
            warn!(%error, "external link check disabled");
            return targets
                .into_iter()
                .map(|target| (target, ExternalCheck::Failed(error.to_string())))
                .collect();
        }
    };

    targets
        .into_iter()
        .map(|target| {
            let outcome = match client.probe(&target) {
                Ok(status) => ExternalCheck::Reachable(status),
                Err(error) => ExternalCheck::Failed(error.to_string()),
            };
            if !outcome.is_reachable() {
                warn!(target = %target, outcome = %outcome.describe(), "external link check failed");
            } else {
                debug!(target = %target, outcome = %outcome.describe(), "external link checked");
            }
            (target, outcome)
        })
        .collect()
}

struct ExternalClient {
    client: Client,
    user_agent: String,
    retries: usize,
    last_request_at: Option<Instant>,
}

impl ExternalClient {
    fn new(settings: &ExternalSection) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("failed to build external HTTP client")?;
        Ok(Self {
            client,
            user_agent: settings.user_agent.clone(),
            retries: settings.retries,
            last_request_at: None,
        })
    }

    /// HEAD first, GET when the server rejects HEAD with 405.
    fn probe(&mut self, url: &str) -> Result<u16> {
        let status = self.send_with_retries(url, false)?;
        let status = if status == StatusCode::METHOD_NOT_ALLOWED {
            self.send_with_retries(url, true)?
        } else {
            status
        };
        if status.is_success() || status.is_redirection() {
            return Ok(status.as_u16());
        }
        bail!("HTTP {}", status.as_u16())
    }

    fn send_with_retries(&mut self, url: &str, use_get: bool) -> Result<StatusCode> {
        let mut last_error = None::<String>;
        for attempt in 0..=self.retries {
            if let Some(last) = self.last_request_at {
                let elapsed = last.elapsed();
                let min_delay = Duration::from_millis(MIN_REQUEST_GAP_MS);
                if elapsed < min_delay {
                    sleep(min_delay - elapsed);
                }
            }

            let request = if use_get {
                self.client.get(url)
            } else {
                self.client.head(url)
            };
            let response = request
                .header("User-Agent", self.user_agent.clone())
                .send();
            self.last_request_at = Some(Instant::now());

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() && attempt < self.retries {
                        last_error = Some(format!("HTTP {status}"));
                        sleep(Duration::from_millis(
                            RETRY_DELAY_MS.saturating_mul(attempt as u64 + 1),
                        ));
                        continue;
                    }
                    return Ok(status);
                }
                Err(error) => {
                    last_error = Some(error.to_string());
                    if attempt < self.retries {
                        sleep(Duration::from_millis(
                            RETRY_DELAY_MS.saturating_mul(attempt as u64 + 1),
                        ));
                    }
                }
            }
        }

        let message = last_error.unwrap_or_else(|| "request failed".to_string());
        bail!("{message}")
    }
}
