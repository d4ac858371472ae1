//! Client for the ESB Networks customer portal.
//!
//! The portal has no API; usage data is reached by replaying the browser
//! sign-in against its Azure B2C identity provider and then downloading the
//! half-hourly CSV export. Every fetch performs a fresh sign-in.

use crate::aggregate::AggregateView;
use crate::cache::UsageSource;
use crate::error::{PortalError, Stage};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tracing::{info, instrument};

pub mod export;
pub mod http;
pub mod login;

pub use http::ReqwestConnector;
pub use login::{AuthenticatedSession, ConsentForm, PortalSettings, Unauthenticated};

pub const DEFAULT_LANDING_URL: &str = "https://myaccount.esbnetworks.ie/";
pub const DEFAULT_LOGIN_BASE_URL: &str =
    "https://login.esbnetworks.ie/esbntwkscustportalprdb2c01.onmicrosoft.com/B2C_1A_signup_signin";
pub const DEFAULT_POLICY: &str = "B2C_1A_signup_signin";
pub const DEFAULT_DOWNLOAD_URL: &str = "https://myaccount.esbnetworks.ie/DataHub/DownloadHdf";

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub mprn: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        mprn: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            mprn: mprn.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("mprn", &self.mprn)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalEndpoints {
    pub landing_url: String,
    pub login_base_url: String,
    pub policy: String,
    pub download_url: String,
}

impl Default for PortalEndpoints {
    fn default() -> Self {
        Self {
            landing_url: DEFAULT_LANDING_URL.into(),
            login_base_url: DEFAULT_LOGIN_BASE_URL.into(),
            policy: DEFAULT_POLICY.into(),
            download_url: DEFAULT_DOWNLOAD_URL.into(),
        }
    }
}

impl PortalEndpoints {
    pub fn self_asserted_url(&self) -> String {
        format!("{}/SelfAsserted", self.login_base_url.trim_end_matches('/'))
    }

    pub fn confirmed_url(&self) -> String {
        format!(
            "{}/api/CombinedSigninAndSignup/confirmed",
            self.login_base_url.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
}

impl PortalRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: vec![],
            headers: vec![],
            form: vec![],
        }
    }

    pub fn query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.push((name.to_string(), value.into()));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn form_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.form.push((name.to_string(), value.into()));
        self
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        lookup(&self.query, name)
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn form_value(&self, name: &str) -> Option<&str> {
        lookup(&self.form, name)
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    pub status: u16,
    /// Final URL after redirects.
    pub url: String,
    pub body: String,
}

impl PortalResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level failure: connect error, timeout, unreadable body.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// One cookie-carrying browser session. Owned by exactly one fetch cycle.
#[async_trait]
pub trait PortalSession: Send {
    async fn send(&mut self, request: PortalRequest) -> Result<PortalResponse, TransportError>;
}

/// Opens a fresh, empty session for each fetch cycle.
pub trait SessionFactory: Send + Sync {
    type Session: PortalSession;

    fn open(&self) -> Result<Self::Session, TransportError>;
}

pub struct PortalClient<F> {
    factory: F,
    credentials: Credentials,
    endpoints: PortalEndpoints,
}

impl<F: SessionFactory> PortalClient<F> {
    pub fn new(factory: F, credentials: Credentials, endpoints: PortalEndpoints) -> Self {
        Self {
            factory,
            credentials,
            endpoints,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn endpoints(&self) -> &PortalEndpoints {
        &self.endpoints
    }

    /// Sign in, download the usage export and parse it.
    #[instrument(skip(self), fields(mprn = %self.credentials.mprn))]
    pub async fn fetch(&self) -> Result<AggregateView, PortalError> {
        let session = self
            .factory
            .open()
            .map_err(|e| PortalError::network(Stage::Bootstrap, e.to_string()))?;

        let authenticated = Unauthenticated::new(session)
            .bootstrap(&self.endpoints)
            .await?
            .sign_in(&self.endpoints, &self.credentials)
            .await?
            .confirm(&self.endpoints)
            .await?
            .redeem()
            .await?;

        let csv = authenticated
            .download(&self.endpoints, &self.credentials.mprn)
            .await?;
        let readings = export::parse_readings(&csv)?;
        info!(rows = readings.len(), "fetched usage export");

        Ok(AggregateView::new(readings))
    }
}

#[async_trait]
impl<F: SessionFactory> UsageSource for PortalClient<F> {
    async fn fetch(&self) -> Result<AggregateView, PortalError> {
        PortalClient::fetch(self).await
    }
}
