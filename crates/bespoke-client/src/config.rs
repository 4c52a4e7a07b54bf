//! Client configuration: where the coordinator listens and how patient the
//! HTTP layer should be.

use std::time::Duration;

use url::Url;

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl AsRef<str>) -> ClientResult<Self> {
        let base_url = Url::parse(base_url.as_ref())
            .map_err(|e| ClientError::config_error(format!("invalid coordinator URL: {e}")))?;
        Ok(Self { base_url, timeout: Duration::from_secs(30) })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("http://127.0.0.1:15323").expect("default coordinator URL is well-formed")
    }
}
