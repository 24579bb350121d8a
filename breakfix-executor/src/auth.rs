//! Control-plane credential strategies.
//!
//! A strategy is chosen once when the client is built. Ticket logins are
//! exchanged again for every logical call and never cached.

use async_trait::async_trait;
use hyper::Method;
use serde::Deserialize;

use crate::api_client::{ApiClient, AuthHeaders};
use crate::config::Credentials;
use crate::HypervisorError;

/// Produces the headers that authenticate one logical control-plane call.
#[async_trait]
pub trait CredentialStrategy: Send + Sync + std::fmt::Debug {
    /// Resolve headers for the next call.
    ///
    /// # Errors
    /// Returns [`HypervisorError::Authentication`] if the credentials are
    /// rejected.
    async fn resolve(&self, api: &ApiClient) -> Result<AuthHeaders, HypervisorError>;
}

/// Static API token sent as `Authorization: PVEAPIToken=<id>=<secret>`.
pub struct ApiToken {
    token_id: String,
    secret: String,
}

impl ApiToken {
    #[must_use]
    pub fn new(token_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            secret: secret.into(),
        }
    }

    fn headers(&self) -> AuthHeaders {
        AuthHeaders(vec![(
            "Authorization",
            format!("PVEAPIToken={}={}", self.token_id, self.secret),
        )])
    }
}

impl std::fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiToken")
            .field("token_id", &self.token_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialStrategy for ApiToken {
    async fn resolve(&self, _api: &ApiClient) -> Result<AuthHeaders, HypervisorError> {
        Ok(self.headers())
    }
}

/// Username/password exchanged for a session ticket plus anti-forgery token.
pub struct TicketLogin {
    username: String,
    password: String,
}

impl TicketLogin {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for TicketLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketLogin")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct Ticket {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

impl Ticket {
    fn headers(&self) -> AuthHeaders {
        AuthHeaders(vec![
            ("Cookie", format!("PVEAuthCookie={}", self.ticket)),
            ("CSRFPreventionToken", self.csrf_token.clone()),
        ])
    }
}

#[async_trait]
impl CredentialStrategy for TicketLogin {
    async fn resolve(&self, api: &ApiClient) -> Result<AuthHeaders, HypervisorError> {
        let body = serde_json::json!({
            "username": self.username,
            "password": self.password,
        });
        let data = api
            .request(Method::POST, "/access/ticket", &AuthHeaders::default(), Some(&body))
            .await
            .map_err(|e| match e {
                HypervisorError::Authentication(msg) => HypervisorError::Authentication(msg),
                other => HypervisorError::Authentication(format!("ticket exchange: {other}")),
            })?;

        let ticket: Ticket = serde_json::from_value(data).map_err(|e| {
            HypervisorError::Authentication(format!("malformed ticket response: {e}"))
        })?;

        tracing::debug!(user = %self.username, "obtained control-plane ticket");
        Ok(ticket.headers())
    }
}

/// Pick the strategy for the configured credentials.
///
/// # Errors
/// Returns [`HypervisorError::Authentication`] when no credentials are
/// configured.
pub fn strategy_for(
    credentials: Option<&Credentials>,
) -> Result<Box<dyn CredentialStrategy>, HypervisorError> {
    match credentials {
        Some(Credentials::ApiToken { token_id, secret }) => {
            Ok(Box::new(ApiToken::new(token_id.clone(), secret.clone())))
        }
        Some(Credentials::Ticket { username, password }) => {
            Ok(Box::new(TicketLogin::new(username.clone(), password.clone())))
        }
        None => Err(HypervisorError::Authentication(
            "no hypervisor credentials configured".to_owned(),
        )),
    }
}
