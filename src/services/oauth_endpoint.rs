//! OAuth authorization endpoint contract and a generic HTTP implementation.
//!
//! The token manager only needs two operations: exchange an authorization
//! code and refresh an access token. Provider differences collapse into the
//! token URL, client credentials, and whether PKCE is in play.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::models::token::TokenResponse;

#[async_trait]
pub trait AuthorizationEndpoint: Send + Sync {
    async fn exchange(&self, code: &str, pkce_verifier: Option<&str>) -> Result<TokenResponse>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

/// Standard OAuth token endpoint speaking `application/x-www-form-urlencoded`
pub struct HttpAuthorizationEndpoint {
    http: reqwest::Client,
    service: String,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: String,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl HttpAuthorizationEndpoint {
    pub fn new(
        http: reqwest::Client,
        service: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            http,
            service: service.into(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            redirect_uri: redirect_uri.into(),
        }
    }

    async fn post_form(&self, form: Vec<(&str, String)>) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<TokenResponse>().await.map_err(|e| {
                AppError::ExternalService {
                    service: self.service.clone(),
                    message: format!("malformed token response: {e}"),
                }
            });
        }

        // Map provider error bodies onto our error kinds; invalid_grant is
        // the signal that only a fresh user authorization can fix this.
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body: Option<OAuthErrorBody> = response.json().await.ok();

        Err(match (status.as_u16(), body) {
            (_, Some(err)) if err.error == "invalid_grant" => AppError::NeedsReauthentication {
                service: self.service.clone(),
            },
            (429, _) => AppError::RateLimited { retry_after },
            (500..=599, _) => AppError::ServiceUnavailable {
                service: self.service.clone(),
            },
            (_, Some(err)) => AppError::ExternalService {
                service: self.service.clone(),
                message: err
                    .error_description
                    .unwrap_or(err.error),
            },
            (_, None) => AppError::ExternalService {
                service: self.service.clone(),
                message: format!("token endpoint returned {status}"),
            },
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> AppError {
        if err.is_timeout() || err.is_connect() {
            AppError::ServiceUnavailable {
                service: self.service.clone(),
            }
        } else {
            AppError::ExternalService {
                service: self.service.clone(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl AuthorizationEndpoint for HttpAuthorizationEndpoint {
    async fn exchange(&self, code: &str, pkce_verifier: Option<&str>) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.redirect_uri.clone()),
            ("client_id", self.client_id.clone()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        if let Some(verifier) = pkce_verifier {
            form.push(("code_verifier", verifier.to_string()));
        }
        self.post_form(form).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", self.client_id.clone()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        self.post_form(form).await
    }
}
