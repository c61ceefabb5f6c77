//! HTML page metadata extraction and streaming URL relocation.

use std::sync::OnceLock;

use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pipeline::Result;

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap())
}

fn meta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<meta\s+([^>]*?)/?>").unwrap())
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)([a-z-]+)\s*=\s*"([^"]*)""#).unwrap())
}

/// Extract page metadata from an HTML document: the `<title>` text plus
/// every `<meta name content>` pair, with `type` defaulting to `page`.
pub fn extract_page_meta(html: &str) -> serde_json::Value {
    let mut page = serde_json::Map::new();

    if let Some(captures) = title_re().captures(html) {
        let title = captures.get(1).map_or("", |m| m.as_str());
        page.insert(
            "title".to_string(),
            serde_json::Value::String(collapse_whitespace(title)),
        );
    }

    for captures in meta_re().captures_iter(html) {
        let attrs = captures.get(1).map_or("", |m| m.as_str());
        let mut name = None;
        let mut content = None;
        for attr in attr_re().captures_iter(attrs) {
            match attr[1].to_ascii_lowercase().as_str() {
                "name" => name = Some(attr[2].to_string()),
                "content" => content = Some(attr[2].to_string()),
                _ => {}
            }
        }
        if let (Some(name), Some(content)) = (name, content) {
            page.insert(name, serde_json::Value::String(content));
        }
    }

    page.entry("type".to_string())
        .or_insert_with(|| serde_json::Value::String("page".to_string()));

    serde_json::Value::Object(page)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip tags from HTML, yielding the text content for search indexing.
pub fn text_content(html: &str) -> String {
    static SCRIPT_RE: OnceLock<Regex> = OnceLock::new();
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let script = SCRIPT_RE
        .get_or_init(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").unwrap());
    let tag = TAG_RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").unwrap());

    let without_scripts = script.replace_all(html, " ");
    let without_tags = tag.replace_all(&without_scripts, " ");
    collapse_whitespace(&without_tags)
}

// =============================================================================
// Streaming URL relocation
// =============================================================================

/// Bytes of lookahead a rewrite decision can need: `href=` plus a
/// quote, a slash, and the second slash of a protocol-relative URL.
const LOOKAHEAD: usize = 9;

/// Copy HTML from `input` to `out`, prepending `base_path` to every
/// absolute `src`/`href` URL.
///
/// Operates on bounded chunks with a small carry buffer so a pattern
/// split across chunk boundaries is still rewritten; the document is
/// never buffered whole.
pub async fn relocate_html<R, W>(base_path: &str, input: &mut R, out: &mut W) -> Result<()>
where
    R: AsyncBufRead + Send + Unpin + ?Sized,
    W: AsyncWrite + Send + Unpin + ?Sized,
{
    if base_path.is_empty() || base_path == "/" {
        tokio::io::copy_buf(input, out).await?;
        return Ok(());
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        let read = input.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
        let (rewritten, consumed) = relocate_chunk(base_path, &buf, false);
        out.write_all(&rewritten).await?;
        buf.drain(..consumed);
    }
    if !buf.is_empty() {
        let (rewritten, _) = relocate_chunk(base_path, &buf, true);
        out.write_all(&rewritten).await?;
    }
    Ok(())
}

/// Rewrite `src="/…"` / `href="/…"` occurrences in `bytes`.
///
/// Unless `at_eof`, stops where a decision could still depend on bytes
/// not yet read, and reports how much input it consumed.
fn relocate_chunk(base_path: &str, bytes: &[u8], at_eof: bool) -> (Vec<u8>, usize) {
    let base = base_path.trim_end_matches('/');
    let mut out = Vec::with_capacity(bytes.len() + 64);
    let mut i = 0;

    while i < bytes.len() {
        if !at_eof && i + LOOKAHEAD > bytes.len() {
            break;
        }
        match attribute_at(bytes, i) {
            // `//` is protocol-relative, not site-absolute.
            Some(len)
                if bytes.get(i + len) == Some(&b'/') && bytes.get(i + len + 1) != Some(&b'/') =>
            {
                out.extend_from_slice(&bytes[i..i + len]);
                out.extend_from_slice(base.as_bytes());
                i += len;
            }
            _ => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    (out, i)
}

/// If `src=` or `href=` plus a quote starts at `pos`, its length.
fn attribute_at(bytes: &[u8], pos: usize) -> Option<usize> {
    for name in [&b"src="[..], &b"href="[..]] {
        let end = pos + name.len();
        if bytes.len() > end
            && bytes[pos..end].eq_ignore_ascii_case(name)
            && (bytes[end] == b'"' || bytes[end] == b'\'')
        {
            // Require a boundary before the attribute name.
            if pos == 0 || !bytes[pos - 1].is_ascii_alphanumeric() {
                return Some(name.len() + 1);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_title_and_meta() {
        let html = r#"<html><head>
            <title> The  Guide </title>
            <meta name="author" content="ops team">
            <meta name="type" content="article">
        </head><body></body></html>"#;
        let page = extract_page_meta(html);
        assert_eq!(page["title"], "The Guide");
        assert_eq!(page["author"], "ops team");
        assert_eq!(page["type"], "article");
    }

    #[test]
    fn type_defaults_to_page() {
        let page = extract_page_meta("<title>x</title>");
        assert_eq!(page["type"], "page");
    }

    #[test]
    fn text_content_strips_markup() {
        let html = "<p>Hello <b>world</b></p><script>ignore()</script>";
        assert_eq!(text_content(html), "Hello world");
    }

    async fn relocate(base: &str, html: &str) -> String {
        let mut input = std::io::Cursor::new(html.as_bytes().to_vec());
        let mut out = Vec::new();
        relocate_html(base, &mut input, &mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn prefixes_absolute_urls() {
        let html = r#"<a href="/page.html"><img src="/img/x.png"></a>"#;
        assert_eq!(
            relocate("/acc/site", html).await,
            r#"<a href="/acc/site/page.html"><img src="/acc/site/img/x.png"></a>"#
        );
    }

    #[tokio::test]
    async fn leaves_relative_and_protocol_urls_alone() {
        let html = r#"<a href="page.html"><img src="//cdn/x.png"><a href="https://x/y">"#;
        assert_eq!(relocate("/base", html).await, html);
    }

    #[tokio::test]
    async fn empty_base_is_a_passthrough() {
        let html = r#"<a href="/x">"#;
        assert_eq!(relocate("", html).await, html);
    }

    #[tokio::test]
    async fn rewrites_across_chunk_boundaries() {
        // Build a document large enough to span several read chunks with
        // an attribute near each boundary.
        let mut html = String::new();
        for i in 0..2000 {
            html.push_str(&format!("<p>{i}</p><a href=\"/p/{i}\">x</a>"));
        }
        let relocated = relocate("/b", &html).await;
        assert!(relocated.contains("href=\"/b/p/0\""));
        assert!(relocated.contains("href=\"/b/p/1999\""));
        assert!(!relocated.contains("href=\"/p/7\""));
    }

    #[tokio::test]
    async fn single_quoted_attributes_are_rewritten() {
        let html = "<img src='/x.png'>";
        assert_eq!(relocate("/b", html).await, "<img src='/b/x.png'>");
    }
}
