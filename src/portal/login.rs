//! Portal sign-in as a chain of typed steps.
//!
//! Each step consumes the previous state, including the session that holds
//! the cookie jar, and returns the next one. The chain ends in an
//! [`AuthenticatedSession`] that is spent by a single download.

use super::{Credentials, PortalEndpoints, PortalRequest, PortalResponse, PortalSession};
use crate::error::{PortalError, Stage};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

const CSRF_HEADER: &str = "x-csrf-token";
static SETTINGS_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)var\s+SETTINGS\s*=\s*(\{.*?\})\s*;").ok());

/// Anti-forgery token and B2C transaction id from the landing page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortalSettings {
    pub csrf: String,
    #[serde(rename = "transId")]
    pub trans_id: String,
}

/// Auto-submitting OAuth form returned by the confirmation endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentForm {
    pub action: String,
    pub state: String,
    pub client_info: String,
    pub code: String,
}

pub fn extract_settings(html: &str) -> Result<PortalSettings, PortalError> {
    let pattern = SETTINGS_PATTERN
        .as_ref()
        .ok_or_else(|| PortalError::parse(Stage::Bootstrap, "invalid SETTINGS pattern"))?;
    let blob = pattern
        .captures(html)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| {
            PortalError::parse(Stage::Bootstrap, "landing page has no SETTINGS variable")
        })?;

    let settings: PortalSettings = serde_json::from_str(blob.as_str()).map_err(|e| {
        PortalError::parse(Stage::Bootstrap, format!("malformed SETTINGS blob: {e}"))
    })?;

    if settings.csrf.is_empty() || settings.trans_id.is_empty() {
        return Err(PortalError::parse(
            Stage::Bootstrap,
            "SETTINGS blob has an empty csrf or transId",
        ));
    }
    Ok(settings)
}

fn selector(raw: &str) -> Result<Selector, PortalError> {
    Selector::parse(raw)
        .map_err(|e| PortalError::parse(Stage::Confirm, format!("invalid selector {raw}: {e:?}")))
}

pub fn extract_consent_form(html: &str) -> Result<ConsentForm, PortalError> {
    let document = Html::parse_document(html);
    let form_selector = selector("form#auto")?;
    let input_selector = selector("input[name]")?;

    let form = document
        .select(&form_selector)
        .next()
        .ok_or_else(|| PortalError::parse(Stage::Confirm, "consent form 'auto' not found"))?;

    let action = form
        .value()
        .attr("action")
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| PortalError::parse(Stage::Confirm, "consent form has no action"))?;

    let field = |name: &str| -> Result<String, PortalError> {
        form.select(&input_selector)
            .find(|input| input.value().attr("name") == Some(name))
            .and_then(|input| input.value().attr("value"))
            .map(ToString::to_string)
            .ok_or_else(|| {
                PortalError::parse(Stage::Confirm, format!("consent form missing field '{name}'"))
            })
    };

    Ok(ConsentForm {
        action: action.to_string(),
        state: field("state")?,
        client_info: field("client_info")?,
        code: field("code")?,
    })
}

/// The identity provider answers a refused sign-in with HTTP 200 and a JSON
/// body whose `status` is not "200".
fn rejected_sign_in(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let status = value.get("status")?;
    let status = status
        .as_str()
        .map(ToString::to_string)
        .unwrap_or_else(|| status.to_string());
    if status == "200" {
        return None;
    }
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("sign-in rejected");
    Some(format!("identity provider status {status}: {message}"))
}

fn resolve_action(base: &str, action: &str) -> Result<String, PortalError> {
    let resolved = match Url::parse(base) {
        Ok(base) => base.join(action),
        Err(_) => Url::parse(action),
    };
    resolved.map(String::from).map_err(|e| {
        PortalError::parse(
            Stage::Confirm,
            format!("consent form action '{action}' is not a URL: {e}"),
        )
    })
}

async fn exchange<S: PortalSession>(
    session: &mut S,
    stage: Stage,
    request: PortalRequest,
) -> Result<PortalResponse, PortalError> {
    debug!(%stage, method = ?request.method, url = %request.url, "portal request");
    let response = session
        .send(request)
        .await
        .map_err(|e| PortalError::network(stage, e.to_string()))?;
    debug!(%stage, status = response.status, "portal response");
    Ok(response)
}

fn require_success(
    stage: Stage,
    response: &PortalResponse,
    on_failure: fn(Stage, String) -> PortalError,
) -> Result<(), PortalError> {
    if response.is_success() {
        return Ok(());
    }
    Err(on_failure(stage, format!("HTTP {}", response.status)))
}

fn auth_error(stage: Stage, detail: String) -> PortalError {
    PortalError::authentication(stage, detail)
}

fn network_error(stage: Stage, detail: String) -> PortalError {
    PortalError::network(stage, detail)
}

pub struct Unauthenticated<S> {
    session: S,
}

pub struct Bootstrapped<S> {
    session: S,
    settings: PortalSettings,
}

pub struct SignedIn<S> {
    session: S,
    settings: PortalSettings,
}

pub struct ConsentPending<S> {
    session: S,
    form: ConsentForm,
}

/// Session whose cookies grant access to the data hub. Spent by one download.
pub struct AuthenticatedSession<S> {
    session: S,
}

impl<S: PortalSession> Unauthenticated<S> {
    pub fn new(session: S) -> Self {
        Self { session }
    }

    pub async fn bootstrap(
        mut self,
        endpoints: &PortalEndpoints,
    ) -> Result<Bootstrapped<S>, PortalError> {
        let stage = Stage::Bootstrap;
        let response = exchange(
            &mut self.session,
            stage,
            PortalRequest::get(&endpoints.landing_url),
        )
        .await?;
        require_success(stage, &response, network_error)?;

        let settings = extract_settings(&response.body)?;
        Ok(Bootstrapped {
            session: self.session,
            settings,
        })
    }
}

impl<S: PortalSession> Bootstrapped<S> {
    pub fn settings(&self) -> &PortalSettings {
        &self.settings
    }

    pub async fn sign_in(
        mut self,
        endpoints: &PortalEndpoints,
        credentials: &Credentials,
    ) -> Result<SignedIn<S>, PortalError> {
        let stage = Stage::SignIn;
        let request = PortalRequest::post(endpoints.self_asserted_url())
            .query("tx", &self.settings.trans_id)
            .query("p", &endpoints.policy)
            .header(CSRF_HEADER, &self.settings.csrf)
            .form_field("signInName", &credentials.username)
            .form_field("password", &credentials.password)
            .form_field("request_type", "RESPONSE");

        let response = exchange(&mut self.session, stage, request).await?;
        require_success(stage, &response, auth_error)?;
        if let Some(detail) = rejected_sign_in(&response.body) {
            return Err(PortalError::authentication(stage, detail));
        }

        Ok(SignedIn {
            session: self.session,
            settings: self.settings,
        })
    }
}

impl<S: PortalSession> SignedIn<S> {
    pub async fn confirm(
        mut self,
        endpoints: &PortalEndpoints,
    ) -> Result<ConsentPending<S>, PortalError> {
        let stage = Stage::Confirm;
        let request = PortalRequest::get(endpoints.confirmed_url())
            .query("rememberMe", "false")
            .query("csrf_token", &self.settings.csrf)
            .query("tx", &self.settings.trans_id)
            .query("p", &endpoints.policy)
            .header(CSRF_HEADER, &self.settings.csrf);

        let response = exchange(&mut self.session, stage, request).await?;
        require_success(stage, &response, auth_error)?;

        let mut form = extract_consent_form(&response.body)?;
        form.action = resolve_action(&response.url, &form.action)?;
        Ok(ConsentPending {
            session: self.session,
            form,
        })
    }
}

impl<S: PortalSession> ConsentPending<S> {
    pub fn form(&self) -> &ConsentForm {
        &self.form
    }

    pub async fn redeem(mut self) -> Result<AuthenticatedSession<S>, PortalError> {
        let stage = Stage::Redeem;
        let request = PortalRequest::post(&self.form.action)
            .form_field("state", &self.form.state)
            .form_field("client_info", &self.form.client_info)
            .form_field("code", &self.form.code);

        let response = exchange(&mut self.session, stage, request).await?;
        require_success(stage, &response, auth_error)?;

        info!("portal sign-in complete");
        Ok(AuthenticatedSession {
            session: self.session,
        })
    }
}

impl<S: PortalSession> AuthenticatedSession<S> {
    /// Download the interval export for `mprn` as CSV text.
    pub async fn download(
        mut self,
        endpoints: &PortalEndpoints,
        mprn: &str,
    ) -> Result<String, PortalError> {
        let stage = Stage::Download;
        let request = PortalRequest::get(&endpoints.download_url).query("mprn", mprn);

        let response = exchange(&mut self.session, stage, request).await?;
        require_success(stage, &response, network_error)?;
        Ok(response.body)
    }
}
