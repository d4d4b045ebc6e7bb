use std::collections::HashMap;

use async_trait::async_trait;
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::{
  AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
  RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};

use crate::credentials::TokenRefresher;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{OAuthTokens, Provider};

pub type OAuthClient =
  BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Per-provider OAuth application registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthAppConfig {
  pub provider: Provider,
  pub client_id: String,
  pub client_secret: String,
  pub redirect_uri: String,
  pub auth_url: String,
  pub token_url: String,
  pub scopes: Vec<String>,
}

fn default_endpoints(provider: Provider) -> Option<(&'static str, &'static str)> {
  match provider {
    Provider::Video => Some((
      "https://accounts.google.com/o/oauth2/v2/auth",
      "https://oauth2.googleapis.com/token",
    )),
    Provider::SocialGraph => Some((
      "https://www.facebook.com/v19.0/dialog/oauth",
      "https://graph.facebook.com/v19.0/oauth/access_token",
    )),
    // Tenants of the aggregator run their own authorization server.
    Provider::Aggregator => None,
  }
}

fn default_scopes(provider: Provider) -> Vec<String> {
  let scopes: &[&str] = match provider {
    Provider::Video => &[
      "https://www.googleapis.com/auth/youtube.readonly",
      "https://www.googleapis.com/auth/yt-analytics.readonly",
    ],
    Provider::SocialGraph => &["pages_show_list", "pages_read_engagement", "read_insights"],
    Provider::Aggregator => &["reports:read"],
  };
  scopes.iter().map(|s| s.to_string()).collect()
}

impl OAuthAppConfig {
  pub fn from_env(provider: Provider) -> PipelineResult<Self> {
    Self::from_lookup(provider, |key| std::env::var(key).ok())
  }

  pub fn from_lookup<F>(provider: Provider, lookup: F) -> PipelineResult<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let prefix = provider.env_prefix();
    let get = |suffix: &str| {
      lookup(&format!("{prefix}_{suffix}"))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    };
    let require = |suffix: &str| {
      get(suffix).ok_or_else(|| PipelineError::Config(format!("Missing {prefix}_{suffix}")))
    };

    let defaults = default_endpoints(provider);
    let auth_url = match get("AUTH_URL") {
      Some(url) => url,
      None => defaults
        .map(|(auth, _)| auth.to_string())
        .ok_or_else(|| PipelineError::Config(format!("Missing {prefix}_AUTH_URL")))?,
    };
    let token_url = match get("TOKEN_URL") {
      Some(url) => url,
      None => defaults
        .map(|(_, token)| token.to_string())
        .ok_or_else(|| PipelineError::Config(format!("Missing {prefix}_TOKEN_URL")))?,
    };
    let scopes = get("SCOPES")
      .map(|v| v.split([' ', ',']).filter(|s| !s.is_empty()).map(str::to_string).collect())
      .unwrap_or_else(|| default_scopes(provider));

    Ok(Self {
      provider,
      client_id: require("CLIENT_ID")?,
      client_secret: require("CLIENT_SECRET")?,
      redirect_uri: require("REDIRECT_URI")?,
      auth_url,
      token_url,
      scopes,
    })
  }
}

pub fn oauth_client(config: &OAuthAppConfig) -> PipelineResult<OAuthClient> {
  let invalid = |what: &str, e: &dyn std::fmt::Display| {
    PipelineError::Config(format!("invalid {} {what}: {e}", config.provider.env_prefix()))
  };
  let auth_url = AuthUrl::new(config.auth_url.clone()).map_err(|e| invalid("auth url", &e))?;
  let token_url = TokenUrl::new(config.token_url.clone()).map_err(|e| invalid("token url", &e))?;
  let redirect_url =
    RedirectUrl::new(config.redirect_uri.clone()).map_err(|e| invalid("redirect uri", &e))?;

  Ok(
    BasicClient::new(ClientId::new(config.client_id.clone()))
      .set_client_secret(ClientSecret::new(config.client_secret.clone()))
      .set_auth_uri(auth_url)
      .set_token_uri(token_url)
      .set_redirect_uri(redirect_url),
  )
}

/// Returns `(authorize_url, state)`.
pub fn build_authorize_url(
  client: &OAuthClient,
  config: &OAuthAppConfig,
  state: Option<String>,
) -> (String, String) {
  let mut request = client.authorize_url(|| {
    state
      .clone()
      .map(CsrfToken::new)
      .unwrap_or_else(CsrfToken::new_random)
  });
  for scope in &config.scopes {
    request = request.add_scope(Scope::new(scope.clone()));
  }
  if config.provider == Provider::Video {
    // Without these Google omits the refresh token on repeat consent.
    request = request
      .add_extra_param("access_type", "offline")
      .add_extra_param("prompt", "consent");
  }
  let (url, csrf) = request.url();
  (url.to_string(), csrf.secret().to_string())
}

fn token_http_client() -> PipelineResult<oauth2::reqwest::Client> {
  oauth2::reqwest::ClientBuilder::new()
    .redirect(oauth2::reqwest::redirect::Policy::none())
    .build()
    .map_err(|e| PipelineError::Config(format!("failed to build oauth http client: {e}")))
}

fn to_tokens(token: &BasicTokenResponse) -> OAuthTokens {
  OAuthTokens {
    access_token: token.access_token().secret().to_string(),
    refresh_token: token.refresh_token().map(|t| t.secret().to_string()),
    token_type: token.token_type().as_ref().to_string(),
    scope: token
      .scopes()
      .map(|scopes| scopes.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")),
    expires_in_seconds: token.expires_in().map(|d| d.as_secs()),
  }
}

pub async fn exchange_code_for_tokens(
  client: &OAuthClient,
  provider: Provider,
  code: &str,
) -> PipelineResult<OAuthTokens> {
  let http_client = token_http_client()?;
  let token = client
    .exchange_code(AuthorizationCode::new(code.to_string()))
    .request_async(&http_client)
    .await
    .map_err(|e| PipelineError::Auth {
      provider,
      message: format!("code exchange failed: {e}"),
    })?;
  Ok(to_tokens(&token))
}

pub async fn refresh_tokens(
  client: &OAuthClient,
  provider: Provider,
  refresh_token: &str,
) -> PipelineResult<OAuthTokens> {
  let http_client = token_http_client()?;
  let token = client
    .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
    .request_async(&http_client)
    .await
    .map_err(|e| PipelineError::Auth {
      provider,
      message: format!("refresh failed: {e}"),
    })?;
  Ok(to_tokens(&token))
}

/// Refresh-token grant against each provider's token endpoint.
pub struct OAuthRefresher {
  apps: HashMap<Provider, OAuthAppConfig>,
}

impl OAuthRefresher {
  pub fn new(apps: Vec<OAuthAppConfig>) -> Self {
    Self {
      apps: apps.into_iter().map(|app| (app.provider, app)).collect(),
    }
  }

  /// Providers without client credentials are left out; refreshing them fails with `Config`.
  pub fn from_env() -> Self {
    let apps = Provider::ALL
      .into_iter()
      .filter_map(|provider| match OAuthAppConfig::from_env(provider) {
        Ok(app) => Some(app),
        Err(err) => {
          tracing::debug!(provider = %provider, error = %err, "oauth app not configured");
          None
        }
      })
      .collect();
    Self::new(apps)
  }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
  async fn refresh(&self, provider: Provider, refresh_token: &str) -> PipelineResult<OAuthTokens> {
    let app = self
      .apps
      .get(&provider)
      .ok_or_else(|| PipelineError::Config(format!("Missing {}_CLIENT_ID", provider.env_prefix())))?;
    let client = oauth_client(app)?;
    refresh_tokens(&client, provider, refresh_token).await
  }
}
