//! Seed cookies for a fresh sign-in session
//!
//! The provider shows a captcha far less often when the first request already
//! carries the cookies its iOS sign-in library would set.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use reqwest::cookie::Jar;
use serde_json::json;
use url::Url;

/// Length of the random `frc` token in bytes
pub const FRC_LEN: usize = 313;

const APP_ID: &str = "MAPiOSLib/6.0/ToHideRetailLink";

/// Build the initial `(name, value)` cookie set
pub fn seed_cookies() -> Vec<(&'static str, String)> {
    let mut frc = vec![0u8; FRC_LEN];
    rand::thread_rng().fill_bytes(&mut frc);

    let map_md = json!({
        "device_user_dictionary": [],
        "device_registration_data": {
            "software_version": "35602678"
        },
        "app_identifier": {
            "app_version": "3.56.2",
            "bundle_id": "com.audible.iphone"
        }
    });

    vec![
        ("frc", unpadded(&frc)),
        ("map-md", unpadded(map_md.to_string().as_bytes())),
        ("amzn-app-id", APP_ID.to_string()),
    ]
}

/// Add the seed cookies to `jar`, scoped to the host of `url`
pub fn seed_jar(jar: &Jar, url: &Url) {
    for (name, value) in seed_cookies() {
        jar.add_cookie_str(&format!("{}={}; Path=/", name, value), url);
    }
}

fn unpadded(bytes: &[u8]) -> String {
    BASE64.encode(bytes).trim_end_matches('=').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD_NO_PAD;
    use reqwest::cookie::CookieStore;

    fn cookie(name: &str) -> String {
        seed_cookies()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .unwrap()
    }

    #[test]
    fn test_frc_is_random_and_unpadded() {
        let frc = cookie("frc");
        assert!(!frc.ends_with('='));
        assert_eq!(STANDARD_NO_PAD.decode(&frc).unwrap().len(), FRC_LEN);
        assert_ne!(frc, cookie("frc"));
    }

    #[test]
    fn test_map_md_decodes_to_metadata() {
        let raw = STANDARD_NO_PAD.decode(cookie("map-md")).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["app_identifier"]["bundle_id"], "com.audible.iphone");
        assert_eq!(
            value["device_registration_data"]["software_version"],
            "35602678"
        );
    }

    #[test]
    fn test_seed_jar_sends_cookies_to_host() {
        let jar = Jar::default();
        let url = Url::parse("https://www.amazon.de/ap/signin").unwrap();
        seed_jar(&jar, &url);

        let header = jar.cookies(&url).unwrap();
        let header = header.to_str().unwrap();
        assert!(header.contains("frc="));
        assert!(header.contains("map-md="));
        assert!(header.contains("amzn-app-id=MAPiOSLib/6.0/ToHideRetailLink"));
    }
}
