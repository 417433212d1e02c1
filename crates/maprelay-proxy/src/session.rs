//! Proxy session: one in-flight sign-in
//!
//! Owns the outbound HTTP client and cookie jar for a single login attempt.
//! Every browser interaction is replayed against the provider through
//! [`ProxySession::forward`]; the resulting response is kept as the session's
//! last response until the next round trip.

use crate::cookies::seed_jar;
use crate::error::{ProxyError, ProxyResult};
use crate::rewrite::rewrite_html;
use bytes::Bytes;
use maprelay_core::{access_token_from_url, build_start_url, client_id, new_serial, register_url, Marketplace};
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// User agent of the provider's iOS app web view
pub const USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 15_0 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148";

/// Default timeout for each outbound request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for outbound requests
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Timeout applied to every request to the provider
    pub timeout: Duration,
    /// Origin serving the sign-in and registration endpoints in place of the
    /// marketplace hosts
    pub endpoint_base: Option<Url>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            endpoint_base: None,
        }
    }
}

impl ProxyOptions {
    /// Builder pattern: set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builder pattern: send every request to `base`, keeping paths and queries
    pub fn with_endpoint_base(mut self, base: Url) -> Self {
        self.endpoint_base = Some(base);
        self
    }
}

/// Lifecycle state of a sign-in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    /// Client allocated, nothing sent yet
    Created,
    /// First page fetched
    Started,
    /// At least one browser interaction forwarded
    InProgress,
    /// Access token captured
    Complete,
    /// Closed before an access token appeared
    Abandoned,
}

/// A browser interaction to replay against the provider
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path relative to the provider origin (e.g. `ap/signin`)
    pub resource: String,
    /// Raw query string, without the leading `?`
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub accept: Option<String>,
    pub body: Bytes,
}

impl ProxyRequest {
    /// A bodyless request
    pub fn new(method: Method, resource: impl Into<String>) -> Self {
        Self {
            method,
            resource: resource.into(),
            query: None,
            content_type: None,
            accept: None,
            body: Bytes::new(),
        }
    }

    /// Builder pattern: set the raw query string
    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query.filter(|q| !q.is_empty());
        self
    }

    /// Builder pattern: set the body and its content type
    pub fn with_body(mut self, content_type: Option<String>, body: Bytes) -> Self {
        self.content_type = content_type;
        self.body = body;
        self
    }

    /// Builder pattern: set the Accept header
    pub fn with_accept(mut self, accept: Option<String>) -> Self {
        self.accept = accept;
        self
    }
}

/// The request that produced the last response
#[derive(Debug, Clone)]
pub struct LastRequest {
    pub method: Method,
    /// Final URL after redirects
    pub url: Url,
}

/// The provider's last response, after rewriting
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    /// Final URL after redirects
    pub url: Url,
    pub body: Bytes,
}

impl ProxiedResponse {
    /// Whether the response is an HTML page
    pub fn is_html(&self) -> bool {
        is_html(self.content_type.as_deref())
    }
}

fn is_html(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
}

fn charset(content_type: Option<&str>) -> Option<String> {
    content_type?
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"').to_ascii_lowercase())
}

/// Pages in other charsets pass through unrewritten
fn is_rewritable(content_type: Option<&str>) -> bool {
    matches!(
        charset(content_type).as_deref(),
        None | Some("utf-8" | "utf8" | "us-ascii")
    )
}

fn rebase(url: &Url, base: &Url) -> Url {
    let mut rebased = base.clone();
    rebased.set_path(url.path());
    rebased.set_query(url.query());
    rebased
}

/// One in-flight sign-in against the provider
pub struct ProxySession {
    marketplace: Marketplace,
    serial: String,
    with_username: bool,
    start_url: Url,
    register_url: Url,
    timeout: Duration,
    client: Option<Client>,
    jar: Arc<Jar>,
    started: bool,
    round_trips: u64,
    last_request: Option<LastRequest>,
    last_response: Option<ProxiedResponse>,
    access_token: Option<String>,
    logged_in: Arc<AtomicBool>,
    registered: bool,
    proxy_base: Option<Url>,
}

impl ProxySession {
    /// Create a session for a marketplace
    ///
    /// A fresh serial is generated unless one is supplied. Fails before any
    /// network activity if the login mode is not offered in the marketplace.
    pub fn new(
        marketplace: Marketplace,
        serial: Option<String>,
        with_username: bool,
        options: &ProxyOptions,
    ) -> ProxyResult<Self> {
        let serial = serial.unwrap_or_else(new_serial);
        let start_url = build_start_url(&marketplace, &client_id(&serial), with_username)?;
        let register_url = register_url(&marketplace)?;
        let (start_url, register_url) = match &options.endpoint_base {
            Some(base) => (rebase(&start_url, base), rebase(&register_url, base)),
            None => (start_url, register_url),
        };
        Self::with_endpoints(marketplace, serial, with_username, start_url, register_url, options)
    }

    /// Create a session with explicit start and registration endpoints
    pub fn with_endpoints(
        marketplace: Marketplace,
        serial: String,
        with_username: bool,
        start_url: Url,
        register_url: Url,
        options: &ProxyOptions,
    ) -> ProxyResult<Self> {
        let jar = Arc::new(Jar::default());
        seed_jar(&jar, &start_url);

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US"));

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .cookie_provider(jar.clone())
            .gzip(true)
            .timeout(options.timeout)
            .build()?;

        debug!(
            "Created sign-in session for {} (username mode: {})",
            marketplace.country_code, with_username
        );

        Ok(Self {
            marketplace,
            serial,
            with_username,
            start_url,
            register_url,
            timeout: options.timeout,
            client: Some(client),
            jar,
            started: false,
            round_trips: 0,
            last_request: None,
            last_response: None,
            access_token: None,
            logged_in: Arc::new(AtomicBool::new(false)),
            registered: false,
            proxy_base: None,
        })
    }

    /// Record the browser-facing proxy base and fetch the first page
    pub async fn start(&mut self, proxy_base: Url) -> ProxyResult<()> {
        if self.client.is_none() {
            return Err(ProxyError::SessionClosed);
        }

        self.proxy_base = Some(proxy_base);
        let request = ProxyRequest::new(Method::GET, String::new());
        let url = self.start_url.clone();
        self.execute(url, request).await?;
        self.started = true;

        info!("Started sign-in for {}", self.marketplace.country_code);
        Ok(())
    }

    /// Replay a browser interaction against the provider
    ///
    /// Updates the last request and response. Once an access token has been
    /// captured the session stops proxying and this is a no-op.
    pub async fn forward(&mut self, request: ProxyRequest) -> ProxyResult<()> {
        if self.client.is_none() {
            return Err(ProxyError::SessionClosed);
        }
        if !self.started {
            return Err(ProxyError::NotStarted);
        }
        if self.is_logged_in() {
            debug!("Login already complete, not forwarding {}", request.resource);
            return Ok(());
        }

        let url = self.resolve(&request.resource, request.query.as_deref())?;
        self.execute(url, request).await?;
        self.round_trips += 1;
        Ok(())
    }

    async fn execute(&mut self, url: Url, request: ProxyRequest) -> ProxyResult<()> {
        let client = self.client.as_ref().ok_or(ProxyError::SessionClosed)?;

        debug!("{} {}", request.method, url.path());

        let mut builder = client.request(request.method.clone(), url);
        if let Some(content_type) = &request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(accept) = &request.accept {
            builder = builder.header(ACCEPT, accept);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        let body = if !is_html(content_type.as_deref()) {
            body
        } else if is_rewritable(content_type.as_deref()) {
            Bytes::from(self.rewrite(&body))
        } else {
            debug!("Passing through {:?} page unrewritten", content_type);
            body
        };

        if let Some(token) = access_token_from_url(&final_url) {
            info!("Access token captured for device {}", self.serial);
            self.access_token = Some(token);
            self.logged_in.store(true, Ordering::Release);
        }

        self.last_request = Some(LastRequest {
            method: request.method,
            url: final_url.clone(),
        });
        self.last_response = Some(ProxiedResponse {
            status,
            content_type,
            url: final_url,
            body,
        });
        Ok(())
    }

    fn resolve(&self, resource: &str, query: Option<&str>) -> ProxyResult<Url> {
        let mut url = self
            .start_url
            .join(&format!("/{}", resource.trim_start_matches('/')))?;
        url.set_query(query.filter(|q| !q.is_empty()));
        url.set_fragment(None);
        Ok(url)
    }

    fn rewrite(&self, body: &[u8]) -> String {
        let proxy_path = self.proxy_base.as_ref().map_or("", |base| base.path());
        rewrite_html(
            &String::from_utf8_lossy(body),
            proxy_path,
            &self.provider_origin(),
        )
    }

    /// Release the HTTP client; idempotent
    pub fn close(&mut self) {
        if self.client.take().is_some() {
            debug!("Closed sign-in session for device {}", self.serial);
        }
    }

    /// Whether the HTTP client has been released
    pub fn is_closed(&self) -> bool {
        self.client.is_none()
    }

    /// Whether an access token has been captured
    pub fn is_logged_in(&self) -> bool {
        self.access_token.is_some()
    }

    /// The captured access token
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Flag raised when the access token is captured
    ///
    /// Readable without holding the session.
    pub fn login_flag(&self) -> Arc<AtomicBool> {
        self.logged_in.clone()
    }

    /// Record that the captured token has been exchanged for a device
    pub fn mark_registered(&mut self) {
        self.registered = true;
    }

    /// Whether a device has already been registered with this session's token
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Current lifecycle state
    pub fn state(&self) -> LoginState {
        if self.access_token.is_some() {
            LoginState::Complete
        } else if self.client.is_none() {
            LoginState::Abandoned
        } else if self.round_trips > 0 {
            LoginState::InProgress
        } else if self.started {
            LoginState::Started
        } else {
            LoginState::Created
        }
    }

    /// Scheme and host of the provider (e.g. `https://www.amazon.com`)
    pub fn provider_origin(&self) -> String {
        self.start_url.origin().ascii_serialization()
    }

    pub fn marketplace(&self) -> &Marketplace {
        &self.marketplace
    }

    pub fn device_serial(&self) -> &str {
        &self.serial
    }

    pub fn with_username(&self) -> bool {
        self.with_username
    }

    pub fn start_url(&self) -> &Url {
        &self.start_url
    }

    pub fn register_url(&self) -> &Url {
        &self.register_url
    }

    pub fn proxy_base(&self) -> Option<&Url> {
        self.proxy_base.as_ref()
    }

    pub fn last_request(&self) -> Option<&LastRequest> {
        self.last_request.as_ref()
    }

    pub fn last_response(&self) -> Option<&ProxiedResponse> {
        self.last_response.as_ref()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cookie jar shared with the HTTP client
    pub fn cookie_jar(&self) -> &Arc<Jar> {
        &self.jar
    }
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("marketplace", &self.marketplace.country_code)
            .field("serial", &self.serial)
            .field("with_username", &self.with_username)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
