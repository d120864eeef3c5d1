//! HTTP content fetcher.
//!
//! Downloads a URL with a bounded timeout and size, and reduces HTML
//! responses to readable plain text. Non-2xx responses are errors, so a
//! failed fetch never produces a reference.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;

use refindex_core::capability::ContentFetcher;

use crate::config::FetchConfig;

pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, source: &str) -> Result<String> {
        let url = reqwest::Url::parse(source).with_context(|| format!("invalid URL: {}", source))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("unsupported URL scheme: {}", url.scheme());
        }

        let mut resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("HTTP {}", status);
        }

        let is_html = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("html"))
            .unwrap_or(false);

        if let Some(len) = resp.content_length() {
            if len > self.max_bytes as u64 {
                bail!("response too large ({} bytes, limit {})", len, self.max_bytes);
            }
        }
        let mut bytes = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if bytes.len() + chunk.len() > self.max_bytes {
                bail!("response exceeds limit of {} bytes", self.max_bytes);
            }
            bytes.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&bytes);

        let text = if is_html || looks_like_html(&body) {
            html_to_text(&body)
        } else {
            body.trim().to_string()
        };
        if text.is_empty() {
            bail!("no text content");
        }
        Ok(text)
    }
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(32).collect();
    let head = head.to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

struct HtmlPatterns {
    invisible: Regex,
    block: Regex,
    tag: Regex,
    spaces: Regex,
    blank_lines: Regex,
}

fn patterns() -> &'static HtmlPatterns {
    static PATTERNS: OnceLock<HtmlPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| HtmlPatterns {
        invisible: Regex::new(r"(?is)<(script|style|noscript|svg|head)\b.*?</(script|style|noscript|svg|head)\s*>|<!--.*?-->")
            .expect("valid regex"),
        block: Regex::new(r"(?i)</?(p|div|br|li|ul|ol|h[1-6]|tr|section|article|header|footer|blockquote|pre)\b[^>]*>")
            .expect("valid regex"),
        tag: Regex::new(r"(?s)<[^>]*>").expect("valid regex"),
        spaces: Regex::new(r"[ \t\r\f]+").expect("valid regex"),
        blank_lines: Regex::new(r"\n\s*\n+").expect("valid regex"),
    })
}

/// Strip markup from an HTML document, keeping block boundaries as
/// paragraph breaks so segmentation still sees structure.
pub fn html_to_text(html: &str) -> String {
    let p = patterns();
    let text = p.invisible.replace_all(html, " ");
    let text = p.block.replace_all(&text, "\n\n");
    let text = p.tag.replace_all(&text, " ");
    let text = decode_entities(&text);
    let text = p.spaces.replace_all(&text, " ");
    let text = p.blank_lines.replace_all(&text, "\n\n");
    text.lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_to_text_drops_scripts_and_tags() {
        let html = r#"<!DOCTYPE html><html><head><title>x</title><style>p{}</style></head>
<body><h1>Cats</h1><script>alert(1)</script><p>Cats are <b>small</b> &amp; furry.</p></body></html>"#;
        let text = html_to_text(html);
        assert!(text.contains("Cats"));
        assert!(text.contains("Cats are small & furry."));
        assert!(!text.contains("alert"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn test_html_blocks_become_paragraphs() {
        let text = html_to_text("<p>one</p><p>two</p>");
        assert_eq!(text, "one\n\ntwo");
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html("  <!DOCTYPE html><html>"));
        assert!(!looks_like_html("plain text"));
    }

    #[tokio::test]
    async fn test_rejects_non_http_scheme() {
        let fetcher = HttpFetcher::new(&FetchConfig::default()).unwrap();
        let err = fetcher.fetch("file:///etc/passwd").await.unwrap_err();
        assert!(err.to_string().contains("unsupported URL scheme"));
    }

    /// Serves `body` once with no Content-Length, closing the connection
    /// to end it.
    async fn serve_unsized(body: String) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let head = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n";
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(body.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_stops_reading_past_max_bytes() {
        let config = FetchConfig {
            max_bytes: 1024,
            ..FetchConfig::default()
        };
        let fetcher = HttpFetcher::new(&config).unwrap();

        let url = serve_unsized("x".repeat(64 * 1024)).await;
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit of 1024 bytes"));

        let url = serve_unsized("Small page. Fits easily.".to_string()).await;
        assert_eq!(fetcher.fetch(&url).await.unwrap(), "Small page. Fits easily.");
    }
}
