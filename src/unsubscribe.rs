//! Unsubscribe affordances: finding links and acting on them
//!
//! Links come from the `List-Unsubscribe` header when present (https beats
//! http beats mailto) and otherwise from the message body. A link is acted on
//! with an RFC 8058 one-click POST when the sender advertises
//! `List-Unsubscribe-Post: List-Unsubscribe=One-Click`, or a plain GET.
//! `mailto:` links cannot be followed automatically.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{GmailError, Result};
use crate::models::{LinkSource, UnsubscribeAffordances, UnsubscribeLink};

/// Form body for RFC 8058 one-click requests
pub const ONE_CLICK_BODY: &str = "List-Unsubscribe=One-Click";

static ANGLE_ENTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^<>]+)>").expect("valid regex"));

static HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#).expect("valid regex")
});

static BARE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>()]+"#).expect("valid regex"));

static UNSUBSCRIBE_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)unsubscribe|opt[-_ ]?out|optout").expect("valid regex"));

/// Entries of a `List-Unsubscribe` header, in header order
pub fn parse_list_unsubscribe(header: &str) -> Vec<String> {
    let bracketed: Vec<String> = ANGLE_ENTRY
        .captures_iter(header)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if !bracketed.is_empty() {
        return bracketed;
    }

    // Some senders omit the angle brackets
    header
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn scheme_rank(link: &str) -> Option<u8> {
    let lower = link.to_ascii_lowercase();
    if lower.starts_with("https://") {
        Some(0)
    } else if lower.starts_with("http://") {
        Some(1)
    } else if lower.starts_with("mailto:") {
        Some(2)
    } else {
        None
    }
}

/// Preferred entry: https over http over mailto; unknown schemes are ignored
pub fn best_link(entries: &[String]) -> Option<String> {
    entries
        .iter()
        .filter_map(|entry| scheme_rank(entry).map(|rank| (rank, entry)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, entry)| entry.clone())
}

/// True when `List-Unsubscribe-Post` advertises one-click
pub fn is_one_click(post_header: Option<&str>) -> bool {
    post_header
        .map(|v| v.to_ascii_lowercase().contains("list-unsubscribe=one-click"))
        .unwrap_or(false)
}

/// Affordances carried by a message's headers
pub fn affordances_from_headers(
    list_unsubscribe: Option<&str>,
    list_unsubscribe_post: Option<&str>,
) -> UnsubscribeAffordances {
    let Some(header) = list_unsubscribe.filter(|h| !h.trim().is_empty()) else {
        return UnsubscribeAffordances::default();
    };

    let link = best_link(&parse_list_unsubscribe(header));
    // One-click only applies to an https target
    let one_click = is_one_click(list_unsubscribe_post)
        && link
            .as_deref()
            .map(|l| l.to_ascii_lowercase().starts_with("https://"))
            .unwrap_or(false);

    UnsubscribeAffordances {
        link,
        header: Some(header.to_string()),
        one_click,
    }
}

/// Turn affordances into an actionable link, if there is one
pub fn link_from_affordances(
    affordances: &UnsubscribeAffordances,
    source: LinkSource,
) -> Option<UnsubscribeLink> {
    affordances.link.as_ref().map(|url| UnsubscribeLink {
        url: url.clone(),
        one_click: affordances.one_click,
        source,
    })
}

/// First unsubscribe-looking URL in an HTML or plain-text body
///
/// Anchors are checked first: the URL or the anchor text must mention
/// unsubscribing. Then bare URLs that mention it themselves.
pub fn find_body_link(body: &str) -> Option<String> {
    for caps in HREF.captures_iter(body) {
        let url = decode_entities(caps[1].trim());
        if scheme_rank(&url).is_none() {
            continue;
        }
        if UNSUBSCRIBE_WORD.is_match(&url) || UNSUBSCRIBE_WORD.is_match(&caps[2]) {
            return Some(url);
        }
    }

    BARE_URL
        .find_iter(body)
        .map(|m| decode_entities(m.as_str().trim_end_matches(['.', ',', ';'])))
        .find(|url| UNSUBSCRIBE_WORD.is_match(url))
}

fn decode_entities(url: &str) -> String {
    url.replace("&amp;", "&")
}

/// Result of an unsubscribe attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UnsubscribeOutcome {
    /// The sender's endpoint accepted the request
    Unsubscribed { status: u16, one_click: bool },
    /// The link needs the user, e.g. a mailto address
    ManualRequired { url: String },
}

impl UnsubscribeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnsubscribeOutcome::Unsubscribed { .. })
    }
}

/// Performs an unsubscribe request
#[async_trait]
pub trait Unsubscriber: Send + Sync {
    async fn unsubscribe(&self, link: &UnsubscribeLink) -> Result<UnsubscribeOutcome>;
}

/// Unsubscriber that talks HTTP with reqwest
#[derive(Debug, Clone)]
pub struct HttpUnsubscriber {
    client: reqwest::Client,
}

impl HttpUnsubscriber {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(15))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .user_agent(concat!("gmail-bulk/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GmailError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Unsubscriber for HttpUnsubscriber {
    async fn unsubscribe(&self, link: &UnsubscribeLink) -> Result<UnsubscribeOutcome> {
        if link.is_mailto() {
            debug!("Manual unsubscribe required for {}", link.url);
            return Ok(UnsubscribeOutcome::ManualRequired {
                url: link.url.clone(),
            });
        }

        let url = reqwest::Url::parse(&link.url)
            .map_err(|e| GmailError::InvalidRequest(format!("invalid link {:?}: {}", link.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GmailError::InvalidRequest(format!(
                "unsupported link scheme {:?}",
                url.scheme()
            )));
        }

        let request = if link.one_click {
            self.client
                .post(url)
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .body(ONE_CLICK_BODY)
        } else {
            self.client.get(url)
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("Unsubscribe via {} returned {}", link.url, status);
            return Err(GmailError::Unsubscribe(format!(
                "{} returned HTTP {}",
                link.url,
                status.as_u16()
            )));
        }

        info!(
            "Unsubscribed via {} ({})",
            link.url,
            if link.one_click { "one-click POST" } else { "GET" }
        );
        Ok(UnsubscribeOutcome::Unsubscribed {
            status: status.as_u16(),
            one_click: link.one_click,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_unsubscribe_bracketed() {
        let entries = parse_list_unsubscribe(
            "<mailto:leave@news.example.com?subject=unsub>, <https://news.example.com/u/abc>",
        );
        assert_eq!(
            entries,
            vec![
                "mailto:leave@news.example.com?subject=unsub".to_string(),
                "https://news.example.com/u/abc".to_string()
            ]
        );
    }

    #[test]
    fn test_parse_list_unsubscribe_without_brackets() {
        let entries = parse_list_unsubscribe("https://a.example/u, mailto:x@a.example");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_best_link_prefers_https() {
        let entries = vec![
            "mailto:x@example.com".to_string(),
            "http://example.com/u".to_string(),
            "https://example.com/u".to_string(),
        ];
        assert_eq!(best_link(&entries).as_deref(), Some("https://example.com/u"));

        let entries = vec![
            "mailto:x@example.com".to_string(),
            "http://example.com/u".to_string(),
        ];
        assert_eq!(best_link(&entries).as_deref(), Some("http://example.com/u"));

        assert_eq!(best_link(&["ftp://nope".to_string()]), None);
    }

    #[test]
    fn test_affordances_one_click_needs_https() {
        let a = affordances_from_headers(
            Some("<https://example.com/unsub?id=1>"),
            Some("List-Unsubscribe=One-Click"),
        );
        assert_eq!(a.link.as_deref(), Some("https://example.com/unsub?id=1"));
        assert!(a.one_click);

        let mailto_only = affordances_from_headers(
            Some("<mailto:x@example.com>"),
            Some("List-Unsubscribe=One-Click"),
        );
        assert!(!mailto_only.one_click);
        assert!(mailto_only.header.is_some());
    }

    #[test]
    fn test_affordances_absent_header() {
        assert_eq!(
            affordances_from_headers(None, Some("List-Unsubscribe=One-Click")),
            UnsubscribeAffordances::default()
        );
    }

    #[test]
    fn test_find_body_link_in_anchor_text() {
        let html = r#"<p>Thanks</p><a href="https://shop.example/p?a=1&amp;b=2">Unsubscribe here</a>"#;
        assert_eq!(
            find_body_link(html).as_deref(),
            Some("https://shop.example/p?a=1&b=2")
        );
    }

    #[test]
    fn test_find_body_link_skips_unrelated_anchors() {
        let html = r#"<a href="https://shop.example/sale">Sale</a>
            <a href='https://shop.example/optout/xyz'>here</a>"#;
        assert_eq!(
            find_body_link(html).as_deref(),
            Some("https://shop.example/optout/xyz")
        );
    }

    #[test]
    fn test_find_body_link_plain_text() {
        let text = "To stop: https://mail.example.com/unsubscribe/42. Bye";
        assert_eq!(
            find_body_link(text).as_deref(),
            Some("https://mail.example.com/unsubscribe/42")
        );
        assert_eq!(find_body_link("https://example.com/home only"), None);
    }

    #[tokio::test]
    async fn test_mailto_is_manual() {
        let unsubscriber = HttpUnsubscriber::new().unwrap();
        let link = UnsubscribeLink {
            url: "mailto:leave@example.com".to_string(),
            one_click: false,
            source: LinkSource::Header,
        };
        let outcome = unsubscriber.unsubscribe(&link).await.unwrap();
        assert_eq!(
            outcome,
            UnsubscribeOutcome::ManualRequired {
                url: "mailto:leave@example.com".to_string()
            }
        );
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_rejects_unsupported_scheme() {
        let unsubscriber = HttpUnsubscriber::new().unwrap();
        let link = UnsubscribeLink {
            url: "javascript:alert(1)".to_string(),
            one_click: false,
            source: LinkSource::Body,
        };
        assert!(matches!(
            unsubscriber.unsubscribe(&link).await,
            Err(GmailError::InvalidRequest(_))
        ));
    }
}
