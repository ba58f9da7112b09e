//! Web access tools: `web_search` (Brave Search API) and `web_fetch`.

use std::time::Duration;

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::Value;

use crate::tools::ToolContext;
use crate::utils::take_chars;

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_7_2) AppleWebKit/537.36";

/// Shared HTTP client for the web tools.
pub struct WebClient {
    client: reqwest::Client,
    brave_api_key: Option<String>,
    search_endpoint: String,
    fetch_max_chars: usize,
}

impl WebClient {
    /// `proxy` applies to every scheme. Without it reqwest honours the
    /// usual `HTTPS_PROXY` / `HTTP_PROXY` variables.
    pub fn new(
        proxy: Option<&str>,
        brave_api_key: Option<String>,
        fetch_max_chars: usize,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(20))
            .connect_timeout(Duration::from_secs(10));
        if let Some(url) = proxy.filter(|p| !p.trim().is_empty()) {
            builder = builder.proxy(
                reqwest::Proxy::all(url).with_context(|| format!("invalid proxy URL: {url}"))?,
            );
        }
        Ok(Self {
            client: builder.build().context("failed to build web HTTP client")?,
            brave_api_key,
            search_endpoint: BRAVE_ENDPOINT.to_string(),
            fetch_max_chars,
        })
    }

    /// Point `web_search` at another Brave-compatible endpoint.
    pub fn with_search_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.search_endpoint = endpoint.into();
        self
    }
}

// ── web_search ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WebSearchArgs {
    pub query: String,
    #[serde(default)]
    pub count: Option<u32>,
}

pub async fn web_search(ctx: &ToolContext, args: WebSearchArgs) -> anyhow::Result<String> {
    let web = &ctx.web;
    let key = web.brave_api_key.as_deref().ok_or_else(|| {
        anyhow::anyhow!("web_search: Brave Search API key not configured (tools.web.brave_api_key)")
    })?;
    let count = args.count.unwrap_or(5).clamp(1, 10);

    let resp = web
        .client
        .get(&web.search_endpoint)
        .query(&[("q", args.query.as_str()), ("count", count.to_string().as_str())])
        .header("Accept", "application/json")
        .header("X-Subscription-Token", key)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("web_search: request failed: {e}"))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!(
            "web_search: Brave API returned {status}: {}",
            crate::utils::truncate_str(&body, 300)
        );
    }
    let json: Value = resp
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("web_search: invalid response: {e}"))?;

    Ok(render_search_results(&args.query, &json, count as usize))
}

/// `Search results for: Q` followed by numbered title / url / snippet.
fn render_search_results(query: &str, json: &Value, count: usize) -> String {
    let results = json["web"]["results"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    if results.is_empty() {
        return format!("No results for: {query}");
    }
    let mut lines = vec![format!("Search results for: {query}\n")];
    for (i, item) in results.iter().take(count).enumerate() {
        lines.push(format!(
            "{}. {}\n   {}",
            i + 1,
            item["title"].as_str().unwrap_or(""),
            item["url"].as_str().unwrap_or("")
        ));
        if let Some(desc) = item["description"].as_str().filter(|d| !d.is_empty()) {
            lines.push(format!("   {}", strip_html(desc)));
        }
    }
    lines.join("\n")
}

// ── web_fetch ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WebFetchArgs {
    pub url: String,
    #[serde(default)]
    pub max_chars: Option<usize>,
}

pub async fn web_fetch(ctx: &ToolContext, args: WebFetchArgs) -> anyhow::Result<String> {
    let web = &ctx.web;
    let max_chars = args.max_chars.filter(|m| *m > 0).unwrap_or(web.fetch_max_chars);

    let resp = web
        .client
        .get(&args.url)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("web_fetch: request to {} failed: {e}", args.url))?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("web_fetch: {} returned {status}", args.url);
    }
    let body = resp
        .text()
        .await
        .map_err(|e| anyhow::anyhow!("web_fetch: cannot read body: {e}"))?;

    let text = strip_html(&body);
    let (kept, cut) = take_chars(&text, max_chars);
    if cut {
        Ok(format!(
            "{kept}\n\n[truncated, {} chars total]",
            text.chars().count()
        ))
    } else {
        Ok(text)
    }
}

// ── HTML to text ────────────────────────────────────────────

static SCRIPT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<script\b.*?</script\s*>").unwrap());
static STYLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<style\b.*?</style\s*>").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").unwrap());
static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\r\f]+").unwrap());
static BLANK_LINES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \n]*\n").unwrap());

/// Drop scripts, styles and tags, decode entities, collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let text = SCRIPT_RE.replace_all(html, "");
    let text = STYLE_RE.replace_all(&text, "");
    let text = TAG_RE.replace_all(&text, "");
    let text = decode_entities(&text);
    let text = SPACES_RE.replace_all(&text, " ");
    let text = BLANK_LINES_RE.replace_all(&text, "\n\n");
    text.trim().to_string()
}

fn decode_entities(s: &str) -> String {
    ENTITY_RE
        .replace_all(s, |caps: &Captures| {
            let ent = &caps[1];
            let decoded = if let Some(hex) = ent.strip_prefix("#x").or_else(|| ent.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = ent.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match ent {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some(' '),
                    "mdash" => Some('\u{2014}'),
                    "ndash" => Some('\u{2013}'),
                    "hellip" => Some('\u{2026}'),
                    "copy" => Some('\u{a9}'),
                    _ => None,
                }
            };
            decoded.map(String::from).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
