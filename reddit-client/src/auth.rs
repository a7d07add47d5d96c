use modbot_core::{CoreError, RedditApiError, RedditCredentials};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, HttpRequest, HttpResponse, RequestTokenError,
    ResourceOwnerPassword, ResourceOwnerUsername, Scope, TokenResponse, TokenUrl,
};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const AUTHORIZE_URL: &str = "https://www.reddit.com/api/v1/authorize";
const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";

/// Refresh this long before the server-side expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

pub const REQUIRED_SCOPES: &[&str] = &[
    "identity",
    "read",
    "submit",
    "modposts",
    "modcontributors",
    "modothers",
];

#[derive(Debug, Clone)]
pub struct CachedToken {
    secret: String,
    expires_at: Instant,
}

impl CachedToken {
    pub fn new(secret: String, lifetime: Duration) -> Self {
        Self {
            secret,
            expires_at: Instant::now() + lifetime,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now + EXPIRY_MARGIN < self.expires_at
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

/// Script-app password grant with a cached bearer token.
pub struct TokenManager {
    oauth: BasicClient,
    credentials: RedditCredentials,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(credentials: RedditCredentials, http: reqwest::Client) -> Result<Self, CoreError> {
        let invalid_url = |e: oauth2::url::ParseError| CoreError::Internal {
            message: format!("invalid OAuth endpoint: {e}"),
        };
        let oauth = BasicClient::new(
            ClientId::new(credentials.client_id.clone()),
            Some(ClientSecret::new(credentials.client_secret.clone())),
            AuthUrl::new(AUTHORIZE_URL.to_string()).map_err(invalid_url)?,
            Some(TokenUrl::new(TOKEN_URL.to_string()).map_err(invalid_url)?),
        );

        Ok(Self {
            oauth,
            credentials,
            http,
            token: Mutex::new(None),
        })
    }

    /// Returns a valid bearer token, requesting a new one when the cache is stale.
    pub async fn access_token(&self) -> Result<String, CoreError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Instant::now())) {
            return Ok(token.secret().to_string());
        }

        let token = self.request_token().await?;
        let secret = token.secret().to_string();
        *cached = Some(token);
        Ok(secret)
    }

    /// Drops the cached token after the API rejected it.
    pub async fn invalidate(&self) {
        warn!("Discarding rejected Reddit access token");
        *self.token.lock().await = None;
    }

    async fn request_token(&self) -> Result<CachedToken, CoreError> {
        debug!("Requesting Reddit token for u/{}", self.credentials.username);
        let username = ResourceOwnerUsername::new(self.credentials.username.clone());
        let password = ResourceOwnerPassword::new(self.credentials.password.clone());

        let response = self
            .oauth
            .exchange_password(&username, &password)
            .add_scopes(REQUIRED_SCOPES.iter().map(|s| Scope::new(s.to_string())))
            .request_async(|request| send_oauth_request(&self.http, request))
            .await
            .map_err(|e| match e {
                RequestTokenError::Request(inner) => inner,
                RequestTokenError::ServerResponse(response) => {
                    RedditApiError::AuthenticationFailed {
                        reason: response.to_string(),
                    }
                    .into()
                }
                // Reddit answers bad credentials with 200 {"error": "invalid_grant"}
                other => RedditApiError::AuthenticationFailed {
                    reason: other.to_string(),
                }
                .into(),
            })?;

        let lifetime = response
            .expires_in()
            .unwrap_or(Duration::from_secs(3600));
        info!("Authenticated as u/{} (token valid {:?})", self.credentials.username, lifetime);
        Ok(CachedToken::new(
            response.access_token().secret().to_string(),
            lifetime,
        ))
    }
}

/// Bridges oauth2's request type onto our reqwest client, which carries the
/// User-Agent Reddit requires.
async fn send_oauth_request(
    http: &reqwest::Client,
    request: HttpRequest,
) -> Result<HttpResponse, CoreError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes()).map_err(|e| {
        CoreError::Internal {
            message: format!("invalid OAuth method: {e}"),
        }
    })?;

    let mut builder = http.request(method, request.url.as_str()).body(request.body);
    for (name, value) in request.headers.iter() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            CoreError::RedditApi(RedditApiError::RequestTimeout)
        } else {
            CoreError::Network(e)
        }
    })?;

    let status_code = oauth2::http::StatusCode::from_u16(response.status().as_u16()).map_err(|e| {
        RedditApiError::InvalidResponse {
            details: format!("bad status from token endpoint: {e}"),
        }
    })?;
    let mut headers = oauth2::http::HeaderMap::new();
    for (name, value) in response.headers() {
        if let (Ok(name), Ok(value)) = (
            oauth2::http::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            oauth2::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    let body = response.bytes().await.map_err(CoreError::Network)?.to_vec();

    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}
