//! Web 工具：web_search（DuckDuckGo Lite）与 fetch_url（抓取网页可读文本）
//!
//! 两者都是普通远程调用：请求带超时与 User-Agent，网络/HTTP 失败统一返回 ToolError::Failed，
//! 由调度器按工具重试策略重试。HTML 用 html2text 提取可读文本，失败时退回简易去标签。

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use regex::Regex;
use reqwest::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::math::schema_value;
use crate::tools::{parse_args, Tool, ToolError};

const SEARCH_ENDPOINT: &str = "https://lite.duckduckgo.com/lite/";
const SEARCH_ORIGIN: &str = "https://lite.duckduckgo.com";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
/// max_results 上限
const MAX_SEARCH_RESULTS: usize = 25;

fn build_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_default()
}

async fn get_text(client: &Client, url: &str) -> Result<String, ToolError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| ToolError::Failed(format!("Request failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(ToolError::Failed(format!("HTTP {} for {url}", resp.status())));
    }
    let body = resp
        .text()
        .await
        .map_err(|e| ToolError::Failed(format!("Read body: {e}")))?;
    Ok(body.trim_start_matches('\u{FEFF}').to_string())
}

/// 一条搜索结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WebSearchArgs {
    /// Search query
    pub query: String,
    /// Maximum number of results (1-25)
    #[serde(default)]
    pub max_results: Option<usize>,
}

pub struct WebSearchTool {
    client: Client,
    default_max_results: usize,
}

impl WebSearchTool {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            client: build_client(timeout_secs),
            default_max_results: 5,
        }
    }

    /// 调用方未给出 max_results 时使用的条数
    pub fn with_default_max_results(mut self, n: usize) -> Self {
        self.default_max_results = n.clamp(1, MAX_SEARCH_RESULTS);
        self
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Performs a web search using DuckDuckGo Lite. Result: {\"results\": [{\"title\", \"url\", \"snippet\"}]}"
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<WebSearchArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: WebSearchArgs = parse_args(self.name(), args)?;
        if args.query.trim().is_empty() {
            return Err(ToolError::InvalidArgs {
                tool: self.name().to_string(),
                reason: "empty query".to_string(),
            });
        }
        let max_results = args.max_results.unwrap_or(self.default_max_results);
        if !(1..=MAX_SEARCH_RESULTS).contains(&max_results) {
            return Err(ToolError::InvalidArgs {
                tool: self.name().to_string(),
                reason: format!("max_results must be within 1..={MAX_SEARCH_RESULTS}"),
            });
        }
        let url = format!("{SEARCH_ENDPOINT}?q={}", urlencoding::encode(args.query.trim()));
        tracing::info!(query = %args.query, "web_search");
        let html = get_text(&self.client, &url).await?;
        let hits = parse_search_results(&html, max_results);
        Ok(serde_json::json!({ "results": hits }))
    }
}

fn anchor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?is)<a\b([^>]*)>(.*?)</a>"#).expect("valid anchor regex"))
}

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)href\s*=\s*["']([^"']*)["']"#).expect("valid href regex"))
}

fn snippet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<td[^>]*class\s*=\s*["']result-snippet["'][^>]*>(.*?)</td>"#)
            .expect("valid snippet regex")
    })
}

/// 从 DuckDuckGo Lite 结果页提取结果；优先 a.result-link，找不到时退回页面内所有链接
pub fn parse_search_results(html: &str, max_results: usize) -> Vec<SearchHit> {
    let anchors: Vec<(String, String)> = anchor_re()
        .captures_iter(html)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();
    let is_result_link = |attrs: &str| attrs.contains("result-link");
    let use_result_links = anchors.iter().any(|(attrs, _)| is_result_link(attrs));
    let snippets: Vec<String> = snippet_re()
        .captures_iter(html)
        .map(|c| clean_fragment(&c[1]))
        .collect();

    let mut hits = Vec::new();
    for (attrs, inner) in anchors
        .iter()
        .filter(|(attrs, _)| !use_result_links || is_result_link(attrs))
    {
        let Some(raw_href) = href_re().captures(attrs).map(|c| decode_entities(&c[1])) else {
            continue;
        };
        let Some(url) = clean_result_url(&raw_href) else {
            continue;
        };
        let snippet = if use_result_links {
            snippets.get(hits.len()).cloned().unwrap_or_default()
        } else {
            String::new()
        };
        hits.push(SearchHit {
            title: clean_fragment(inner),
            url,
            snippet,
        });
        if hits.len() >= max_results {
            break;
        }
    }
    hits
}

/// 解开 DuckDuckGo 跳转链接（uddg 参数），补全站内相对路径
pub fn clean_result_url(raw: &str) -> Option<String> {
    if let Some(idx) = raw.find("uddg=") {
        let encoded = raw[idx + "uddg=".len()..].split('&').next().unwrap_or("");
        if let Ok(decoded) = urlencoding::decode(encoded) {
            if !decoded.is_empty() {
                return Some(decoded.into_owned());
            }
        }
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(raw.to_string());
    }
    if raw.starts_with("//") {
        return Some(format!("https:{raw}"));
    }
    if raw.starts_with('/') {
        return Some(format!("{SEARCH_ORIGIN}{raw}"));
    }
    None
}

fn clean_fragment(fragment: &str) -> String {
    decode_entities(&strip_html_tags(fragment))
}

fn decode_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

/// 简易去除 HTML 标签并折叠空白（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.to_lowercase().starts_with("<html")
        || (s.contains('<') && (s.contains("</") || s.contains("<head") || s.contains("<title")))
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FetchUrlArgs {
    /// URL of the webpage to read
    pub url: String,
}

pub struct FetchUrlTool {
    client: Client,
    max_result_chars: usize,
}

impl FetchUrlTool {
    pub fn new(timeout_secs: u64, max_result_chars: usize) -> Self {
        Self {
            client: build_client(timeout_secs),
            max_result_chars,
        }
    }
}

/// HTML 转可读文本并按字符数截断
pub fn readable_text(body: &str, max_chars: usize) -> String {
    let text = if looks_like_html(body) {
        match from_read(body.as_bytes(), 120) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => strip_html_tags(body),
        }
    } else {
        body.to_string()
    };
    text.chars().take(max_chars).collect()
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch and clean the content of a public webpage. Result: {\"text\": \"...\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<FetchUrlArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: FetchUrlArgs = parse_args(self.name(), args)?;
        let url = args.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ToolError::InvalidArgs {
                tool: self.name().to_string(),
                reason: format!("not an http(s) url: {url}"),
            });
        }
        tracing::info!(url = %url, "fetch_url");
        let body = get_text(&self.client, url).await?;
        Ok(serde_json::json!({ "text": readable_text(&body, self.max_result_chars) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LITE_PAGE: &str = r#"
<html><body><table>
<tr><td><a rel="nofollow" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.rust-lang.org%2F&amp;rut=abc" class='result-link'>Rust <b>Programming</b> Language</a></td></tr>
<tr><td class='result-snippet'>A language empowering everyone.</td></tr>
<tr><td><a rel="nofollow" href="https://doc.rust-lang.org/book/" class='result-link'>The Book</a></td></tr>
<tr><td class='result-snippet'>Learn &amp; build.</td></tr>
<tr><td><a href="/lite/?q=rust&amp;s=30">Next Page</a></td></tr>
</table></body></html>"#;

    #[test]
    fn test_parse_result_links() {
        let hits = parse_search_results(LITE_PAGE, 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://www.rust-lang.org/");
        assert_eq!(hits[0].title, "Rust Programming Language");
        assert_eq!(hits[0].snippet, "A language empowering everyone.");
        assert_eq!(hits[1].url, "https://doc.rust-lang.org/book/");
        assert_eq!(hits[1].snippet, "Learn & build.");
    }

    #[test]
    fn test_parse_respects_max_results() {
        assert_eq!(parse_search_results(LITE_PAGE, 1).len(), 1);
    }

    #[test]
    fn test_parse_falls_back_to_plain_links() {
        let html = r#"<a href="https://a.example/">A</a><a href="mailto:x@y">mail</a><a href="/about">About</a>"#;
        let hits = parse_search_results(html, 10);
        let urls: Vec<&str> = hits.iter().map(|h| h.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.example/", "https://lite.duckduckgo.com/about"]);
    }

    #[test]
    fn test_clean_result_url() {
        assert_eq!(
            clean_result_url("/l/?uddg=https%3A%2F%2Fexample.com%2Fa%3Fb%3D1&rut=x").as_deref(),
            Some("https://example.com/a?b=1")
        );
        assert_eq!(clean_result_url("javascript:void(0)"), None);
    }

    #[test]
    fn test_readable_text_strips_markup_and_truncates() {
        let html = "<html><head><title>t</title></head><body><p>Hello world</p></body></html>";
        let text = readable_text(html, 1000);
        assert!(text.contains("Hello world"));
        assert!(!text.contains("<p>"));
        assert_eq!(readable_text("plain text body", 5), "plain");
    }

    #[tokio::test]
    async fn test_search_rejects_out_of_range_max_results() {
        let tool = WebSearchTool::new(1);
        let err = tool
            .execute(serde_json::json!({"query": "rust", "max_results": 99}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs { .. }));
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_http_url() {
        let tool = FetchUrlTool::new(1, 100);
        let err = tool
            .execute(serde_json::json!({"url": "file:///etc/passwd"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs { .. }));
    }
}
