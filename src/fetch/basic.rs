use super::client::HttpClient;
use async_trait::async_trait;
use std::time::Duration;

/// Plain `reqwest` client with a whole-request timeout.
#[derive(Clone)]
pub struct BasicClient(reqwest::Client);

impl BasicClient {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("marine_obs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self(client))
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.0.execute(req).await
    }
}
