//! HTTP JSON poster
//!
//! Posts are retried up to the configured attempts. When every attempt
//! fails and a spool directory is configured, the body is written there so
//! an operator can replay it.

use std::path::{Path, PathBuf};

use apolo_core::utils::gen_uuid;
use apolo_core::{AppError, AppResult};
use reqwest::{Client, ClientBuilder};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use crate::settings::ActionSettings;

#[derive(Clone)]
pub struct HttpPoster {
    client: Client,
    attempts: u32,
    failed_dir: Option<PathBuf>,
}

impl HttpPoster {
    /// Build a poster from the action settings
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` if the HTTP client cannot be built
    pub fn new(settings: &ActionSettings) -> AppResult<Self> {
        let client = ClientBuilder::new()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.connect_timeout + settings.reply_timeout)
            .danger_accept_invalid_certs(settings.http_skip_tls_verify)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| {
                error!("Failed to build HTTP client: {}", e);
                AppError::Http(e.to_string())
            })?;

        let failed_dir = if settings.http_failed_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&settings.http_failed_dir))
        };

        Ok(Self {
            client,
            attempts: settings.http_attempts.max(1),
            failed_dir,
        })
    }

    /// POST `body` to `url` until it succeeds or the attempts run out
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` with the last failure
    #[instrument(skip(self, body))]
    pub async fn post(&self, url: &str, body: &Value) -> AppResult<()> {
        let mut last = String::new();
        for attempt in 1..=self.attempts {
            match self.client.post(url).json(body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("Posted to {} on attempt {}", url, attempt);
                    return Ok(());
                }
                Ok(resp) => {
                    last = format!("status {}", resp.status().as_u16());
                }
                Err(e) => {
                    last = e.to_string();
                }
            }
            warn!("Post to {} failed (attempt {}/{}): {}", url, attempt, self.attempts, last);
        }
        Err(AppError::Http(format!("{}: {}", url, last)))
    }

    /// Post, spooling the body under `file_name` when delivery fails
    ///
    /// # Errors
    ///
    /// Returns the delivery error; spooling problems are only logged.
    pub async fn post_or_spool(&self, url: &str, body: &Value, file_name: &str) -> AppResult<()> {
        let result = self.post(url, body).await;
        if result.is_err() {
            if let Some(dir) = &self.failed_dir {
                if let Err(e) = spool(dir, file_name, body).await {
                    error!("Failed to spool post for {}: {}", url, e);
                }
            }
        }
        result
    }
}

async fn spool(dir: &Path, file_name: &str, body: &Value) -> AppResult<()> {
    let path = dir.join(file_name);
    let json = serde_json::to_vec_pretty(body)?;
    tokio::fs::write(&path, json).await?;
    warn!("Spooled failed post to {}", path.display());
    Ok(())
}

/// `act_{kind}_{params}_{uuid}.json`, with path-unsafe characters replaced
pub fn spool_file_name(kind: &str, params: &str) -> String {
    let safe: String = params
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    format!("act_{}_{}_{}.json", kind.trim_start_matches('*'), safe, gen_uuid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(dir: &str) -> ActionSettings {
        ActionSettings {
            http_attempts: 2,
            http_failed_dir: dir.to_string(),
            connect_timeout: Duration::from_millis(500),
            reply_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_post_success() {
        let server = MockServer::start().await;
        let body = serde_json::json!({"name": "rif"});
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(&body))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let poster = HttpPoster::new(&settings("")).unwrap();
        poster
            .post(&format!("{}/hook", server.uri()), &body)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_post_is_retried_and_spooled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let poster = HttpPoster::new(&settings(dir.path().to_str().unwrap())).unwrap();
        let name = spool_file_name("*call_url", "http://x/y");
        let err = poster
            .post_or_spool(&format!("{}/hook", server.uri()), &serde_json::json!({"a": 1}), &name)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "http_error");

        let spooled = std::fs::read_to_string(dir.path().join(&name)).unwrap();
        let value: Value = serde_json::from_str(&spooled).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_spool_file_name() {
        let name = spool_file_name("*call_url_async", "http://h:80/p?q=1");
        assert!(name.starts_with("act_call_url_async_http___h_80_p_q_1_"));
        assert!(name.ends_with(".json"));
        assert!(!name.contains('/'));
    }
}
