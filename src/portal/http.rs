use super::{Method, PortalRequest, PortalResponse, PortalSession, SessionFactory, TransportError};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0";

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError(format!("request timed out: {e}"))
        } else {
            TransportError(e.to_string())
        }
    }
}

/// Builds a cookie-storing reqwest client per fetch cycle.
#[derive(Debug, Clone)]
pub struct ReqwestConnector {
    timeout: Duration,
    user_agent: String,
}

impl Default for ReqwestConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl ReqwestConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            user_agent: BROWSER_USER_AGENT.into(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl SessionFactory for ReqwestConnector {
    type Session = ReqwestSession;

    fn open(&self) -> Result<ReqwestSession, TransportError> {
        let client = Client::builder()
            .cookie_store(true)
            .user_agent(self.user_agent.as_str())
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .build()?;
        Ok(ReqwestSession { client })
    }
}

pub struct ReqwestSession {
    client: Client,
}

#[async_trait]
impl PortalSession for ReqwestSession {
    async fn send(&mut self, request: PortalRequest) -> Result<PortalResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url).form(&request.form),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response.text().await?;

        Ok(PortalResponse { status, url, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_defaults_to_ten_second_timeout() {
        assert_eq!(ReqwestConnector::default().timeout(), Duration::from_secs(10));
    }

    #[test]
    fn connector_opens_independent_sessions() {
        let connector = ReqwestConnector::new(Duration::from_secs(3));
        assert!(connector.open().is_ok());
        assert!(connector.open().is_ok());
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let mut session = ReqwestConnector::new(Duration::from_secs(2))
            .open()
            .expect("client builds");
        let result = session
            .send(PortalRequest::get("http://127.0.0.1:9/unreachable"))
            .await;
        assert!(result.is_err());
    }
}
