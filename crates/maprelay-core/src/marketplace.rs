//! Marketplace registry
//!
//! Static table of the provider's regional storefronts. Each login attempt
//! looks up its marketplace once; entries are never mutated.

use crate::error::{Error, Result};
use serde::Serialize;
use tracing::debug;

/// A region-specific storefront of the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Marketplace {
    /// Lowercase country code (e.g. "us", "de")
    pub country_code: &'static str,
    /// Domain suffix shared by the storefront and sign-in hosts (e.g. "co.uk")
    pub domain: &'static str,
    /// Provider marketplace identifier sent as `marketPlaceId`
    pub marketplace_id: &'static str,
    /// Human-readable country name
    pub display_name: &'static str,
}

const fn entry(
    country_code: &'static str,
    domain: &'static str,
    marketplace_id: &'static str,
    display_name: &'static str,
) -> Marketplace {
    Marketplace {
        country_code,
        domain,
        marketplace_id,
        display_name,
    }
}

static MARKETPLACES: &[Marketplace] = &[
    entry("de", "de", "AN7V1F1VY261K", "Germany"),
    entry("us", "com", "AF2M0KC94RCEA", "United States"),
    entry("uk", "co.uk", "A2I9A3Q2GNFNGQ", "United Kingdom"),
    entry("fr", "fr", "A2728XDNODOQ8T", "France"),
    entry("ca", "ca", "A2CQZ5RBY40XE", "Canada"),
    entry("it", "it", "A2N7FU2W2BU2ZC", "Italy"),
    entry("au", "com.au", "AN7EY7DTAW63G", "Australia"),
    entry("in", "in", "AJO3FBRUE6J4S", "India"),
    entry("jp", "co.jp", "A1QAP3MOU4173J", "Japan"),
    entry("es", "es", "ALMIKO4SZCSAR", "Spain"),
];

impl Marketplace {
    /// Look up a marketplace by country code (case-insensitive)
    pub fn lookup(country_code: &str) -> Result<Self> {
        let code = country_code.trim();
        let found = MARKETPLACES
            .iter()
            .find(|m| m.country_code.eq_ignore_ascii_case(code))
            .copied();

        match found {
            Some(market) => {
                debug!("Found marketplace for {}", market.country_code);
                Ok(market)
            }
            None => Err(Error::UnknownMarketplace(country_code.to_string())),
        }
    }

    /// Look up a marketplace by its provider marketplace id
    pub fn lookup_by_marketplace_id(marketplace_id: &str) -> Result<Self> {
        MARKETPLACES
            .iter()
            .find(|m| m.marketplace_id == marketplace_id.trim())
            .copied()
            .ok_or_else(|| Error::UnknownMarketplace(marketplace_id.to_string()))
    }

    /// All known marketplaces in table order
    pub fn all() -> &'static [Marketplace] {
        MARKETPLACES
    }

    /// `(country_code, display_name)` pairs sorted by country code
    pub fn choices() -> Vec<(&'static str, &'static str)> {
        let mut choices: Vec<_> = MARKETPLACES
            .iter()
            .map(|m| (m.country_code, m.display_name))
            .collect();
        choices.sort_by_key(|(code, _)| *code);
        choices
    }

    /// Cookie domain used by the provider for this marketplace
    pub fn cookie_domain(&self) -> String {
        format!(".amazon.{}", self.domain)
    }
}

impl std::fmt::Display for Marketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "marketplace for {}", self.display_name)
    }
}
