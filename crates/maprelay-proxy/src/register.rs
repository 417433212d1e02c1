//! Device registration
//!
//! Exchanges a captured access token for the durable credentials of a new
//! device. This is a direct call to the provider's API host; it does not go
//! through the proxied sign-in client.

use crate::error::{ProxyError, ProxyResult};
use crate::session::ProxySession;
use chrono::{Duration, Utc};
use maprelay_core::{
    CustomerInfo, DeviceInfo, Marketplace, RegistrationBundle, StoreAuthenticationCookie,
    DEVICE_TYPE,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

const APP_NAME: &str = "Audible";
const APP_VERSION: &str = "3.26.1";
const OS_VERSION: &str = "14.7.0";
const DEVICE_MODEL: &str = "iPhone";
const DEVICE_NAME_TEMPLATE: &str =
    "%FIRST_NAME%%FIRST_NAME_POSSESSIVE_STRING%%DUPE_STRATEGY_1ST%Audible for iPhone";

/// Lifetime assumed when the endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Build the registration request body
pub fn registration_request(serial: &str, access_token: &str, market: &Marketplace) -> Value {
    json!({
        "requested_token_type": [
            "bearer",
            "mac_dms",
            "website_cookies",
            "store_authentication_cookie"
        ],
        "cookies": {
            "website_cookies": [],
            "domain": market.cookie_domain()
        },
        "registration_data": {
            "domain": "Device",
            "app_version": APP_VERSION,
            "device_serial": serial,
            "device_type": DEVICE_TYPE,
            "device_name": DEVICE_NAME_TEMPLATE,
            "os_version": OS_VERSION,
            "device_model": DEVICE_MODEL,
            "app_name": APP_NAME
        },
        "auth_data": {
            "access_token": access_token
        },
        "requested_extensions": ["device_info", "customer_info"]
    })
}

#[derive(Deserialize)]
struct Envelope {
    response: EnvelopeResponse,
}

#[derive(Deserialize)]
struct EnvelopeResponse {
    success: Option<Success>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct Success {
    tokens: Tokens,
    #[serde(default)]
    extensions: Extensions,
}

#[derive(Deserialize)]
struct Tokens {
    bearer: Bearer,
    mac_dms: MacDms,
    #[serde(default)]
    website_cookies: Vec<WebsiteCookie>,
    #[serde(default)]
    store_authentication_cookie: StoreAuthenticationCookie,
}

#[derive(Deserialize)]
struct Bearer {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<Value>,
}

#[derive(Deserialize)]
struct MacDms {
    device_private_key: String,
    adp_token: String,
}

#[derive(Deserialize)]
struct WebsiteCookie {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Deserialize, Default)]
struct Extensions {
    #[serde(default)]
    device_info: DeviceInfo,
    #[serde(default)]
    customer_info: CustomerInfo,
}

/// Parse a successful registration response into a bundle
///
/// `status` is only used to report an error envelope.
pub fn parse_registration(
    status: u16,
    body: &str,
    market: &Marketplace,
    with_username: bool,
) -> ProxyResult<RegistrationBundle> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| ProxyError::InvalidRegistration(e.to_string()))?;

    let Some(success) = envelope.response.success else {
        let body = envelope
            .response
            .error
            .map_or_else(|| body.to_string(), |err| err.to_string());
        return Err(ProxyError::Registration { status, body });
    };

    let tokens = success.tokens;
    let expires_in = expires_in_seconds(tokens.bearer.expires_in.as_ref())?;

    let website_cookies: BTreeMap<String, String> = tokens
        .website_cookies
        .into_iter()
        .map(|cookie| (cookie.name, cookie.value.replace('"', "")))
        .collect();

    Ok(RegistrationBundle {
        access_token: tokens.bearer.access_token,
        refresh_token: tokens.bearer.refresh_token,
        expires: Utc::now() + Duration::seconds(expires_in),
        adp_token: tokens.mac_dms.adp_token,
        device_private_key: tokens.mac_dms.device_private_key,
        store_authentication_cookie: tokens.store_authentication_cookie,
        website_cookies,
        device_info: success.extensions.device_info,
        customer_info: success.extensions.customer_info,
        locale_code: market.country_code.to_string(),
        with_username,
    })
}

// The endpoint sends the lifetime as a decimal string.
fn expires_in_seconds(value: Option<&Value>) -> ProxyResult<i64> {
    match value {
        None | Some(Value::Null) => Ok(DEFAULT_EXPIRES_IN),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| ProxyError::InvalidRegistration(format!("bad expires_in: {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| ProxyError::InvalidRegistration(format!("bad expires_in: {}", s))),
        Some(other) => Err(ProxyError::InvalidRegistration(format!(
            "bad expires_in: {}",
            other
        ))),
    }
}

impl ProxySession {
    /// Register a new device with the captured access token
    ///
    /// Returns [`ProxyError::LoginNotComplete`] if no token has been captured.
    /// Works after the session has been closed.
    pub async fn register_device(&self) -> ProxyResult<RegistrationBundle> {
        let token = self.access_token().ok_or(ProxyError::LoginNotComplete)?;
        let body = registration_request(self.device_serial(), token, self.marketplace());

        let client = Client::builder().timeout(self.timeout()).build()?;
        let response = client
            .post(self.register_url().clone())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            warn!("Device registration rejected with status {}", status);
            return Err(ProxyError::Registration {
                status: status.as_u16(),
                body: text,
            });
        }

        let bundle = parse_registration(
            status.as_u16(),
            &text,
            self.marketplace(),
            self.with_username(),
        )?;
        info!(
            "Registered device {} in {}",
            bundle.device_name(),
            self.marketplace().country_code
        );
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ProxyOptions, ProxyRequest};
    use reqwest::Method;
    use url::Url;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn success_body() -> Value {
        json!({
            "response": {
                "success": {
                    "tokens": {
                        "bearer": {
                            "access_token": "Atna|access",
                            "refresh_token": "Atnr|refresh",
                            "expires_in": "3600"
                        },
                        "mac_dms": {
                            "device_private_key": "MIIE...",
                            "adp_token": "{enc:...}"
                        },
                        "website_cookies": [
                            {"Name": "session-id", "Value": "\"123-456\"", "Path": "/"},
                            {"Name": "ubid-main", "Value": "789"}
                        ],
                        "store_authentication_cookie": {"cookie": "store"}
                    },
                    "extensions": {
                        "device_info": {
                            "device_name": "Jane's Audible for iPhone",
                            "device_serial_number": "SERIAL",
                            "device_type": "A2CZJZGLK2JJVM"
                        },
                        "customer_info": {
                            "account_pool": "Amazon",
                            "user_id": "amzn1.account.X",
                            "home_region": "NA",
                            "name": "Jane Doe",
                            "given_name": "Jane"
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn test_registration_request_shape() {
        let market = Marketplace::lookup("uk").unwrap();
        let body = registration_request("SERIAL", "TOKEN", &market);

        assert_eq!(body["cookies"]["domain"], ".amazon.co.uk");
        assert_eq!(body["registration_data"]["device_serial"], "SERIAL");
        assert_eq!(body["registration_data"]["device_type"], DEVICE_TYPE);
        assert_eq!(body["auth_data"]["access_token"], "TOKEN");
        assert_eq!(body["requested_token_type"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_parse_registration_maps_bundle() {
        let market = Marketplace::lookup("de").unwrap();
        let before = Utc::now();
        let bundle =
            parse_registration(200, &success_body().to_string(), &market, true).unwrap();

        assert_eq!(bundle.access_token, "Atna|access");
        assert_eq!(bundle.refresh_token, "Atnr|refresh");
        assert_eq!(bundle.adp_token, "{enc:...}");
        assert_eq!(bundle.website_cookies["session-id"], "123-456");
        assert_eq!(bundle.website_cookies["ubid-main"], "789");
        assert_eq!(bundle.store_authentication_cookie.cookie, "store");
        assert_eq!(bundle.device_name(), "Jane's Audible for iPhone");
        assert_eq!(bundle.customer_info.given_name, "Jane");
        assert_eq!(bundle.locale_code, "de");
        assert!(bundle.with_username);
        assert!(bundle.expires >= before + Duration::seconds(3600));
        assert!(!bundle.is_expired());
    }

    #[test]
    fn test_parse_registration_error_envelope() {
        let market = Marketplace::lookup("us").unwrap();
        let body = json!({"response": {"error": {"code": "InvalidToken"}}}).to_string();

        match parse_registration(200, &body, &market, false) {
            Err(ProxyError::Registration { status, body }) => {
                assert_eq!(status, 200);
                assert!(body.contains("InvalidToken"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_parse_registration_malformed() {
        let market = Marketplace::lookup("us").unwrap();
        assert!(matches!(
            parse_registration(200, "not json", &market, false),
            Err(ProxyError::InvalidRegistration(_))
        ));

        let mut body = success_body();
        body["response"]["success"]["tokens"]["bearer"]["expires_in"] = json!("soon");
        assert!(matches!(
            parse_registration(200, &body.to_string(), &market, false),
            Err(ProxyError::InvalidRegistration(_))
        ));
    }

    async fn logged_in_session(server: &MockServer) -> ProxySession {
        Mock::given(method("GET"))
            .and(path("/ap/signin"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ap/maplanding"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
            .mount(server)
            .await;

        let market = Marketplace::lookup("us").unwrap();
        let start = Url::parse(&format!("{}/ap/signin", server.uri())).unwrap();
        let register = Url::parse(&format!("{}/auth/register", server.uri())).unwrap();
        let mut session = ProxySession::with_endpoints(
            market,
            "SERIAL".to_string(),
            false,
            start,
            register,
            &ProxyOptions::default(),
        )
        .unwrap();

        session
            .start(Url::parse("http://relay.test/login/abc/").unwrap())
            .await
            .unwrap();
        session
            .forward(
                ProxyRequest::new(Method::GET, "ap/maplanding")
                    .with_query(Some("openid.oa2.access_token=TOKEN".to_string())),
            )
            .await
            .unwrap();
        assert!(session.is_logged_in());
        session
    }

    #[tokio::test]
    async fn test_register_requires_login() {
        let server = MockServer::start().await;
        let market = Marketplace::lookup("us").unwrap();
        let start = Url::parse(&format!("{}/ap/signin", server.uri())).unwrap();
        let register = Url::parse(&format!("{}/auth/register", server.uri())).unwrap();
        let session = ProxySession::with_endpoints(
            market,
            "SERIAL".to_string(),
            false,
            start,
            register,
            &ProxyOptions::default(),
        )
        .unwrap();

        assert!(matches!(
            session.register_device().await,
            Err(ProxyError::LoginNotComplete)
        ));
    }

    #[tokio::test]
    async fn test_register_device_after_close() {
        let server = MockServer::start().await;
        let mut session = logged_in_session(&server).await;

        Mock::given(method("POST"))
            .and(path("/auth/register"))
            .and(body_partial_json(json!({
                "auth_data": {"access_token": "TOKEN"},
                "registration_data": {"device_serial": "SERIAL"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
            .expect(1)
            .mount(&server)
            .await;

        session.close();
        let bundle = session.register_device().await.unwrap();
        assert_eq!(bundle.locale_code, "us");
        assert_eq!(bundle.device_info.device_serial_number, "SERIAL");
    }

    #[tokio::test]
    async fn test_register_device_rejected() {
        let server = MockServer::start().await;
        let session = logged_in_session(&server).await;

        Mock::given(method("POST"))
            .and(path("/auth/register"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"response": {"error": {"code": "InvalidValue"}}})),
            )
            .mount(&server)
            .await;

        match session.register_device().await {
            Err(ProxyError::Registration { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("InvalidValue"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
