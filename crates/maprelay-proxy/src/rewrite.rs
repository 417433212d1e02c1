//! HTML rewriting for proxied sign-in pages
//!
//! The provider's pages assume they are served from the provider's own
//! origin. Before a page is handed to the browser, every navigation target
//! (`href`, `action`, `data-refresh-url`) is pointed back at the proxy, while
//! passive assets (`src`, `style`) are made absolute so the browser loads them
//! straight from the provider.
//!
//! This is a token scanner, not an HTML parser: a regex finds attribute
//! tokens preceded by whitespace, and only the attribute *value* is examined.
//! Text outside those tokens is copied unchanged, with one exception. Quoted
//! `/ap/uedata` literals in inline scripts are pinned to the provider origin,
//! because the telemetry beacon must not be relayed.

use regex::{Captures, Regex};
use std::borrow::Cow;
use std::sync::LazyLock;

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(\s)(src|style|href|action|data-refresh-url)(\s*=\s*)("[^"]*"|'[^']*'|[^\s"'>]+)"#,
    )
    .expect("Invalid attribute regex")
});

static UEDATA_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)(["'])(/ap/uedata)"#).expect("Invalid uedata regex"));

const UEDATA_PATH: &str = "/ap/uedata";

/// Rewrite a provider HTML page for delivery through the proxy
///
/// * `proxy_path` - path under which this session is proxied (e.g. `/login/<id>`)
/// * `provider_origin` - scheme and host of the provider (e.g. `https://www.amazon.com`)
pub fn rewrite_html(html: &str, proxy_path: &str, provider_origin: &str) -> String {
    let proxy_path = proxy_path.trim_end_matches('/');
    let origin = provider_origin.trim_end_matches('/');

    let rewritten = ATTRIBUTE.replace_all(html, |caps: &Captures| {
        let attr = &caps[2];
        let (quote, value) = split_quote(&caps[4]);
        let value = rewrite_value(attr, value, proxy_path, origin);
        format!("{}{}{}{quote}{value}{quote}", &caps[1], attr, &caps[3])
    });

    UEDATA_LITERAL
        .replace_all(&rewritten, |caps: &Captures| {
            format!("{}{}{}", &caps[1], origin, &caps[2])
        })
        .into_owned()
}

fn split_quote(raw: &str) -> (&str, &str) {
    for quote in ["\"", "'"] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return (quote, &raw[1..raw.len() - 1]);
        }
    }
    ("", raw)
}

fn rewrite_value<'a>(attr: &str, value: &'a str, proxy_path: &str, origin: &str) -> Cow<'a, str> {
    if attr.eq_ignore_ascii_case("src") || attr.eq_ignore_ascii_case("style") {
        return if value.starts_with("//") {
            Cow::Owned(format!("https:{}", value))
        } else if value.starts_with('/') {
            Cow::Owned(format!("{}{}", origin, value))
        } else {
            Cow::Borrowed(value)
        };
    }

    let Some(path) = provider_path(value, origin) else {
        return Cow::Borrowed(value);
    };

    if starts_with_ignore_case(&path, UEDATA_PATH) {
        Cow::Owned(format!("{}{}", origin, path))
    } else {
        Cow::Owned(format!("{}{}", proxy_path, path))
    }
}

/// Path (with query) of a navigation target on the provider's origin
fn provider_path<'a>(value: &'a str, origin: &str) -> Option<Cow<'a, str>> {
    let host = origin.split_once("://").map_or(origin, |(_, host)| host);

    let rest = if let Some(rest) = value.strip_prefix("//") {
        strip_prefix_ignore_case(rest, host)?
    } else if value.starts_with('/') {
        return Some(Cow::Borrowed(value));
    } else {
        strip_prefix_ignore_case(value, origin)?
    };

    match rest.chars().next() {
        None => Some(Cow::Borrowed("/")),
        Some('/') => Some(Cow::Borrowed(rest)),
        Some('?') | Some('#') => Some(Cow::Owned(format!("/{}", rest))),
        // A longer host that merely starts with the provider's host
        Some(_) => None,
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if starts_with_ignore_case(value, prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.is_char_boundary(prefix.len())
        && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}
