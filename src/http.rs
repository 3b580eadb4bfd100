use std::thread;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) attempts: usize,
    pub(crate) retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(6),
            attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum HttpError {
    #[error("HTTP status {status}{}", format_body(.body))]
    Status { status: u16, body: String },
    #[error("request failed after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: Box<HttpError>,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response decode failed: {0}")]
    Decode(String),
}

impl HttpError {
    pub(crate) fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Exhausted { source, .. } => source.status(),
            Self::Transport(_) | Self::Decode(_) => None,
        }
    }
}

fn format_body(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(" ({body})")
    }
}

fn should_retry_http_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

pub(crate) fn post_json_with_retries(
    url: &str,
    bearer_token: Option<&str>,
    body: &Value,
    policy: &RetryPolicy,
) -> Result<String, HttpError> {
    let attempts = policy.attempts.max(1);
    let payload = body.to_string();

    for attempt in 1..=attempts {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(policy.connect_timeout)
            .timeout_read(policy.read_timeout)
            .timeout_write(policy.read_timeout)
            .build();

        let mut request = agent
            .post(url)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json");
        if let Some(token) = bearer_token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }

        match request.send_string(&payload) {
            Ok(response) => {
                return response
                    .into_string()
                    .map_err(|err| HttpError::Decode(err.to_string()));
            }
            Err(ureq::Error::Status(status, response)) => {
                let response_body = response.into_string().ok().unwrap_or_default();
                let error = HttpError::Status {
                    status,
                    body: response_body.trim().chars().take(240).collect(),
                };

                if should_retry_http_status(status) && attempt < attempts {
                    log::debug!("retrying {url} after {error} (attempt {attempt})");
                    thread::sleep(policy.retry_delay);
                    continue;
                }

                if should_retry_http_status(status) {
                    return Err(HttpError::Exhausted {
                        attempts,
                        source: Box::new(error),
                    });
                }

                return Err(error);
            }
            Err(ureq::Error::Transport(err)) => {
                let error = HttpError::Transport(err.to_string());
                if attempt < attempts {
                    log::debug!("retrying {url} after {error} (attempt {attempt})");
                    thread::sleep(policy.retry_delay);
                    continue;
                }
                return Err(HttpError::Exhausted {
                    attempts,
                    source: Box::new(error),
                });
            }
        }
    }

    Err(HttpError::Transport(
        "exhausted attempts without a concrete error".to_string(),
    ))
}
