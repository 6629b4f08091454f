//! Markdown/HTML normalization for CMS and local content.
//!
//! Input is either Markdown or an HTML fragment. Both end up as one HTML
//! fragment inside `<div class="content-wrapper">`, with styling classes on
//! bare block tags, responsive table containers and hardened external links.
//! Normalizing already-normalized output returns it unchanged.

use std::borrow::Cow;
use std::sync::OnceLock;

use anyhow::{Result, anyhow};
use pulldown_cmark::{Options, Parser, html};
use regex::{Captures, Regex};
use tracing::warn;

pub const WRAPPER_OPEN: &str = r#"<div class="content-wrapper">"#;
const WRAPPER_CLOSE: &str = "</div>";
const MAX_FIXPOINT_PASSES: usize = 8;

const HTML_MARKERS: &[&str] = &[
    "<p>", "<p ", "<div", "<table", "<h1", "<h2", "<h3", "<h4", "<h5", "<h6", "<ul", "<ol",
    "<br", "<img",
];

static REWRITER: OnceLock<Result<Rewriter, String>> = OnceLock::new();

/// Normalize raw content into a styled HTML fragment. Never fails: on internal
/// errors the raw text is returned escaped inside an error notice.
pub fn process_markdown_content(raw: &str) -> String {
    match try_process(raw) {
        Ok(html) => html,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "content processing failed; falling back to raw content");
            fallback_fragment(raw)
        }
    }
}

pub fn looks_like_html(content: &str) -> bool {
    let lowered = content.to_ascii_lowercase();
    HTML_MARKERS.iter().any(|marker| lowered.contains(marker))
}

pub fn fallback_fragment(raw: &str) -> String {
    format!(
        "<div class=\"content-wrapper content-error\"><p class=\"content-error-message\">内容处理失败，显示原始内容 (content processing failed, showing raw content)</p><pre>{}</pre></div>",
        html_escape(raw)
    )
}

pub fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Plain-text excerpt of an HTML fragment, cut at `max_chars` characters.
pub fn excerpt_from_html(fragment: &str, max_chars: usize) -> String {
    let mut text = String::with_capacity(fragment.len());
    let mut in_tag = false;
    for ch in fragment.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut cut = collapsed.chars().take(max_chars).collect::<String>();
    cut.truncate(cut.trim_end().len());
    cut.push('…');
    cut
}

fn try_process(raw: &str) -> Result<String> {
    let rewriter = rewriter()?;
    let source = raw.replace("\r\n", "\n");
    let trimmed = source.trim();
    let fragment = if trimmed.is_empty() || looks_like_html(trimmed) {
        trimmed.to_string()
    } else {
        markdown_to_html(&rewriter.preprocess_markdown(trimmed))
    };
    Ok(rewriter.post_process(&fragment))
}

fn rewriter() -> Result<&'static Rewriter> {
    REWRITER
        .get_or_init(|| Rewriter::new().map_err(|error| error.to_string()))
        .as_ref()
        .map_err(|message| anyhow!("normalizer patterns failed to compile: {message}"))
}

fn markdown_to_html(markdown: &str) -> String {
    let options = Options::ENABLE_TABLES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_FOOTNOTES
        | Options::ENABLE_TASKLISTS;
    let parser = Parser::new_ext(markdown, options);
    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

struct Rewriter {
    inline_fence: Regex,
    heading_without_space: Regex,
    heading_line: Regex,
    list_item: Regex,
    spaced_link: Regex,
    pre_block: Regex,
    nested_paragraph_open: Regex,
    nested_paragraph_close: Regex,
    bare_block_tag: Regex,
    image: Regex,
    wrapped_table: Regex,
    table: Regex,
    anchor: Regex,
    empty_paragraph: Regex,
    empty_div: Regex,
    double_escaped_entity: Regex,
    repeated_spaces: Regex,
}

impl Rewriter {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            inline_fence: Regex::new(r"([^\n`])```")?,
            heading_without_space: Regex::new(r"^(#{1,6})([^#\s])")?,
            heading_line: Regex::new(r"^#{1,6}\s")?,
            list_item: Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+")?,
            spaced_link: Regex::new(r"\[([^\]]+)\]\s+\(([^)\s]+)\)")?,
            pre_block: Regex::new(r"(?is)<pre\b.*?</pre>")?,
            nested_paragraph_open: Regex::new(r"(?i)<p>\s*(<p[\s>])")?,
            nested_paragraph_close: Regex::new(r"(?i)</p>\s*</p>")?,
            bare_block_tag: Regex::new(r"<(h[1-6]|p|ul|ol|blockquote|table|pre)>")?,
            image: Regex::new(r"(?i)<img\b([^>]*?)(\s*/?)>")?,
            wrapped_table: Regex::new(
                r#"(?s)<div class="table-responsive">\s*(<table\b.*?</table>)\s*</div>"#,
            )?,
            table: Regex::new(r"(?s)<table\b.*?</table>")?,
            anchor: Regex::new(r"(?i)<a\s([^>]*)>")?,
            empty_paragraph: Regex::new(r"(?i)<p(?:\s[^>]*)?>\s*(?:&nbsp;|<br\s*/?>)?\s*</p>")?,
            empty_div: Regex::new(r"(?i)<div>\s*</div>")?,
            double_escaped_entity: Regex::new(
                r"&amp;(nbsp|amp|lt|gt|quot|apos|#[0-9]+|#x[0-9a-fA-F]+);",
            )?,
            repeated_spaces: Regex::new(r"[ \t]{2,}")?,
        })
    }

    /// Tidy Markdown so the converter sees well-separated blocks. Fenced code is left alone.
    fn preprocess_markdown(&self, markdown: &str) -> String {
        let split_fences = self.inline_fence.replace_all(markdown, "$1\n```");
        let mut lines: Vec<Cow<'_, str>> = Vec::new();
        let mut in_fence = false;

        for line in split_fences.lines() {
            let trimmed = line.trim_start();
            let is_fence = trimmed.starts_with("```") || trimmed.starts_with("~~~");
            if in_fence {
                lines.push(Cow::Borrowed(line));
                if is_fence {
                    in_fence = false;
                }
                continue;
            }
            if is_fence {
                push_separator(&mut lines);
                lines.push(Cow::Borrowed(line));
                in_fence = true;
                continue;
            }
            if line.trim().is_empty() {
                if lines.last().is_some_and(|last| !last.trim().is_empty()) {
                    lines.push(Cow::Borrowed(""));
                }
                continue;
            }

            let line = self.heading_without_space.replace(line, "$1 $2");
            let line = if self.spaced_link.is_match(&line) {
                Cow::Owned(self.spaced_link.replace_all(&line, "[$1]($2)").into_owned())
            } else {
                line
            };

            if self.heading_line.is_match(&line) {
                push_separator(&mut lines);
                lines.push(line);
                lines.push(Cow::Borrowed(""));
                continue;
            }
            if self.list_item.is_match(&line)
                && lines.last().is_some_and(|last| {
                    !last.trim().is_empty()
                        && !self.list_item.is_match(last)
                        && !last.starts_with(char::is_whitespace)
                })
            {
                lines.push(Cow::Borrowed(""));
            }
            lines.push(line);
        }

        while lines.last().is_some_and(|last| last.trim().is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }

    fn post_process(&self, fragment: &str) -> String {
        let mut body = strip_wrappers(fragment).to_string();

        body = replace_until_stable(&self.nested_paragraph_open, &body, "$1");
        body = replace_until_stable(&self.nested_paragraph_close, &body, "</p>");

        body = self
            .bare_block_tag
            .replace_all(&body, |caps: &Captures<'_>| {
                let tag = &caps[1];
                let class = match tag {
                    "p" => "content-paragraph".to_string(),
                    "ul" => "content-list".to_string(),
                    "ol" => "content-list content-list-ordered".to_string(),
                    "blockquote" => "content-quote".to_string(),
                    "table" => "content-table".to_string(),
                    "pre" => "content-code".to_string(),
                    heading => format!("content-heading content-{heading}"),
                };
                format!("<{tag} class=\"{class}\">")
            })
            .into_owned();

        body = self
            .image
            .replace_all(&body, |caps: &Captures<'_>| {
                let attrs = &caps[1];
                if attrs.contains("class=") {
                    return caps[0].to_string();
                }
                let lazy = if attrs.contains("loading=") {
                    ""
                } else {
                    " loading=\"lazy\""
                };
                format!("<img{attrs} class=\"content-image\"{lazy}{}>", &caps[2])
            })
            .into_owned();

        body = self.wrapped_table.replace_all(&body, "$1").into_owned();
        body = self
            .table
            .replace_all(&body, r#"<div class="table-responsive">$0</div>"#)
            .into_owned();

        body = self
            .anchor
            .replace_all(&body, |caps: &Captures<'_>| {
                let attrs = caps[1].trim_end();
                let lowered = attrs.to_ascii_lowercase();
                let external = ["href=\"http://", "href=\"https://", "href='http://", "href='https://"]
                    .iter()
                    .any(|prefix| lowered.contains(prefix));
                if !external {
                    return caps[0].to_string();
                }
                let mut extra = String::new();
                if !lowered.contains("target=") {
                    extra.push_str(" target=\"_blank\"");
                }
                if !lowered.contains("rel=") {
                    extra.push_str(" rel=\"noopener noreferrer\"");
                }
                format!("<a {attrs}{extra}>")
            })
            .into_owned();

        body = replace_until_stable(&self.double_escaped_entity, &body, "&$1;");
        body = replace_until_stable(&self.empty_paragraph, &body, "");
        body = replace_until_stable(&self.empty_div, &body, "");

        let body = self.collapse_whitespace(&body);
        if body.is_empty() {
            return format!("{WRAPPER_OPEN}{WRAPPER_CLOSE}");
        }
        format!("{WRAPPER_OPEN}\n{body}\n{WRAPPER_CLOSE}")
    }

    /// Drop blank lines and squeeze runs of spaces, except inside `<pre>` blocks.
    fn collapse_whitespace(&self, body: &str) -> String {
        let mut out = String::with_capacity(body.len());
        let mut cursor = 0;
        for block in self.pre_block.find_iter(body) {
            self.push_cleaned(&mut out, &body[cursor..block.start()]);
            out.push_str(block.as_str());
            cursor = block.end();
        }
        self.push_cleaned(&mut out, &body[cursor..]);
        out.trim().to_string()
    }

    fn push_cleaned(&self, out: &mut String, segment: &str) {
        let cleaned = segment
            .lines()
            .map(|line| self.repeated_spaces.replace_all(line.trim_end(), " "))
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if cleaned.is_empty() {
            return;
        }
        if !out.is_empty() && !out.ends_with('\n') && segment.starts_with('\n') {
            out.push('\n');
        }
        out.push_str(&cleaned);
        if segment.ends_with('\n') {
            out.push('\n');
        }
    }
}

fn push_separator(lines: &mut Vec<Cow<'_, str>>) {
    if lines.last().is_some_and(|last| !last.trim().is_empty()) {
        lines.push(Cow::Borrowed(""));
    }
}

fn strip_wrappers(fragment: &str) -> &str {
    let mut body = fragment.trim();
    while let Some(inner) = body
        .strip_prefix(WRAPPER_OPEN)
        .and_then(|rest| rest.strip_suffix(WRAPPER_CLOSE))
    {
        body = inner.trim();
    }
    body
}

fn replace_until_stable(pattern: &Regex, text: &str, replacement: &str) -> String {
    let mut current = text.to_string();
    for _ in 0..MAX_FIXPOINT_PASSES {
        if !pattern.is_match(&current) {
            break;
        }
        current = pattern.replace_all(&current, replacement).into_owned();
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading_gets_heading_class() {
        let html = process_markdown_content("# Hi");
        assert!(html.contains(r#"<h1 class="content-heading content-h1">Hi</h1>"#));
        assert!(html.starts_with(WRAPPER_OPEN));
    }

    #[test]
    fn empty_and_malformed_input_do_not_fail() {
        assert_eq!(
            process_markdown_content(""),
            format!("{WRAPPER_OPEN}{WRAPPER_CLOSE}")
        );
        for input in [
            "   \n\n",
            "```\nunterminated fence",
            "<<<>>>",
            "[broken](",
            "| a | b\n|---\n| 1",
            "<div><p>unclosed",
            "\u{0}\u{7}",
        ] {
            let html = process_markdown_content(input);
            assert!(html.starts_with(WRAPPER_OPEN), "input {input:?} gave {html}");
        }
    }

    #[test]
    fn normalizer_is_idempotent() {
        let markdown = "#Title\nIntro paragraph with a [link] (https://example.com).\n- one\n- two\n\n\n\n| Port | Days |\n|---|---|\n| Rotterdam | 3 |\n\n![crane](https://img.example/crane.png)\n\nSee```rust\nfn main() {\n\n    let  x = 1;\n}\n```\n\n> quoted   text\n\n&amp;nbsp;";
        let once = process_markdown_content(markdown);
        let twice = process_markdown_content(&once);
        assert_eq!(once, twice);
        assert_eq!(once.matches("content-wrapper").count(), 1);
        assert_eq!(once.matches("table-responsive").count(), 1);
        assert!(once.contains("    let  x = 1;"));
    }

    #[test]
    fn markdown_preprocessing_fixes_common_slips() {
        let html = process_markdown_content(
            "#Heading\nText before list\n- item\n[site] (https://example.com)",
        );
        assert!(html.contains(r#"<h1 class="content-heading content-h1">Heading</h1>"#));
        assert!(html.contains(r#"<ul class="content-list">"#));
        assert!(html.contains(
            r#"<a href="https://example.com" target="_blank" rel="noopener noreferrer">site</a>"#
        ));
    }

    #[test]
    fn html_input_skips_markdown_conversion() {
        let input = "<p><p>Rates rose</p></p>\n\n<p>&nbsp;</p><div></div><table><tr><td>1</td></tr></table><a href=\"/local\">x</a>";
        let html = process_markdown_content(input);
        assert!(html.contains(r#"<p class="content-paragraph">Rates rose</p>"#));
        assert!(!html.contains("<p><p>"));
        assert!(!html.contains("&nbsp;"));
        assert!(!html.contains("<div></div>"));
        assert!(html.contains(
            r#"<div class="table-responsive"><table class="content-table">"#
        ));
        assert!(html.contains(r#"<a href="/local">x</a>"#));
    }

    #[test]
    fn images_get_class_once() {
        let html = process_markdown_content(r#"<p><img src="a.png" alt="a"></p><img class="logo" src="b.png">"#);
        assert!(html.contains(r#"<img src="a.png" alt="a" class="content-image" loading="lazy">"#));
        assert!(html.contains(r#"<img class="logo" src="b.png">"#));
    }

    #[test]
    fn double_escaped_entities_are_fixed() {
        let html = process_markdown_content("<p>A&amp;amp;B &amp;lt;tag&amp;gt;</p>");
        assert!(html.contains("A&amp;B &lt;tag&gt;"));
    }

    #[test]
    fn code_blocks_keep_whitespace() {
        let html = process_markdown_content("```\nline one\n\n    indented\n```");
        assert!(html.contains("line one\n\n    indented"));
        assert!(html.contains(r#"<pre class="content-code">"#));
    }

    #[test]
    fn fallback_fragment_escapes_raw_text() {
        let html = fallback_fragment("<script>alert(1)</script>");
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("content processing failed"));
    }

    #[test]
    fn excerpt_strips_tags_and_truncates() {
        let excerpt = excerpt_from_html("<p>Hello <b>freight</b> &amp; logistics world</p>", 16);
        assert_eq!(excerpt, "Hello freight &…");
        assert_eq!(excerpt_from_html("<p>short</p>", 50), "short");
    }
}
