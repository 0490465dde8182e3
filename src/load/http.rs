//! Sessions against a running comparison endpoint over HTTP

use super::{AutoRefresh, DriverFactory, SessionDriver};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::{debug, warn};

/// Builds one HTTP client per session, identified by its user agent
#[derive(Debug, Clone)]
pub struct HttpDriverFactory {
    base_url: Url,
    request_timeout: Duration,
    auto_refresh_interval: Duration,
}

impl HttpDriverFactory {
    /// Default interval of the page's own auto-refresh
    pub const DEFAULT_AUTO_REFRESH: Duration = Duration::from_secs(5);

    /// Target `base_url`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if `base_url` does not parse
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| Error::InvalidInput(format!("invalid URL {base_url}: {e}")))?;
        Ok(Self {
            base_url,
            request_timeout: Duration::from_secs(30),
            auto_refresh_interval: Self::DEFAULT_AUTO_REFRESH,
        })
    }

    /// Per-request timeout
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Interval used while auto-refresh is active
    #[must_use]
    pub const fn with_auto_refresh_interval(mut self, interval: Duration) -> Self {
        self.auto_refresh_interval = interval;
        self
    }

    /// Page URL for a session, with the pinned query if any
    #[must_use]
    pub fn page_url(&self, query: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Some(query) = query {
            url.query_pairs_mut().append_pair("query", query);
        }
        url
    }
}

impl DriverFactory for HttpDriverFactory {
    fn create(&self, session_id: &str, query: Option<&str>) -> Result<Box<dyn SessionDriver>> {
        let client = Client::builder()
            .user_agent(format!("LoadTest/{session_id}"))
            .timeout(self.request_timeout)
            .build()?;
        Ok(Box::new(HttpSessionDriver {
            session_id: session_id.to_string(),
            client,
            url: self.page_url(query),
            auto_refresh_interval: self.auto_refresh_interval,
            auto_refresh: None,
        }))
    }
}

struct HttpSessionDriver {
    session_id: String,
    client: Client,
    url: Url,
    auto_refresh_interval: Duration,
    auto_refresh: Option<AutoRefresh>,
}

async fn load_page(client: &Client, url: Url) -> Result<()> {
    client.get(url).send().await?.error_for_status()?;
    Ok(())
}

#[async_trait]
impl SessionDriver for HttpSessionDriver {
    async fn open(&mut self) -> Result<()> {
        load_page(&self.client, self.url.clone()).await
    }

    async fn refresh(&mut self) -> Result<()> {
        load_page(&self.client, self.url.clone()).await
    }

    async fn start_auto_refresh(&mut self) -> Result<()> {
        if self.auto_refresh.is_some() {
            return Ok(());
        }
        let client = self.client.clone();
        let url = self.url.clone();
        let session = self.session_id.clone();
        self.auto_refresh = Some(AutoRefresh::spawn(self.auto_refresh_interval, move || {
            let client = client.clone();
            let url = url.clone();
            let session = session.clone();
            async move {
                match load_page(&client, url).await {
                    Ok(()) => debug!(%session, "auto-refresh"),
                    Err(err) => warn!(%session, error = %err, "auto-refresh failed"),
                }
            }
        }));
        Ok(())
    }

    async fn stop_auto_refresh(&mut self) -> Result<()> {
        self.auto_refresh
            .take()
            .map(drop)
            .ok_or_else(|| Error::Session("auto-refresh is not active".to_string()))
    }

    async fn close(&mut self) {
        self.auto_refresh = None;
    }
}
