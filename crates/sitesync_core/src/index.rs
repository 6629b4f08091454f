use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::metadata::read_metadata;
use crate::normalize::{excerpt_from_html, html_escape};
use crate::page::render_template;
use crate::record::{Importance, UNTITLED};

pub const INDEX_FILENAME: &str = "index.html";
const LIST_EXCERPT_CHARS: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub slug: String,
    pub href: String,
    pub title: String,
    pub date: String,
    pub importance: Importance,
    pub excerpt: String,
    pub from_sidecar: bool,
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub section_title: String,
    pub updated_at: String,
}

impl IndexOptions {
    pub fn new(section_title: &str) -> Self {
        Self {
            section_title: section_title.to_string(),
            updated_at: Local::now().format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub index_path: PathBuf,
    pub entries: Vec<IndexEntry>,
    pub legacy_pages: usize,
    pub errors: Vec<String>,
}

/// Pages found in a section directory, newest first.
#[derive(Debug, Clone, Default)]
pub struct EntryScan {
    pub entries: Vec<IndexEntry>,
    pub legacy_pages: usize,
    pub errors: Vec<String>,
}

/// Rebuild `{section_dir}/index.html` from the pages currently in the directory.
pub fn regenerate_index(
    section_dir: &Path,
    index_template: &Path,
    options: &IndexOptions,
) -> Result<IndexReport> {
    let template = fs::read_to_string(index_template)
        .with_context(|| format!("failed to read index template {}", index_template.display()))?;
    fs::create_dir_all(section_dir)
        .with_context(|| format!("failed to create {}", section_dir.display()))?;

    let scan = scan_entries(section_dir, "")?;
    let list = render_article_list(&scan.entries);
    let count = scan.entries.len().to_string();
    let rendered = render_template(&template, |token| match token {
        "ARTICLE_LIST" => Some(list.clone()),
        "SECTION_TITLE" => Some(html_escape(&options.section_title)),
        "COUNT" => Some(count.clone()),
        "UPDATED_AT" => Some(html_escape(&options.updated_at)),
        _ => None,
    });

    let index_path = section_dir.join(INDEX_FILENAME);
    fs::write(&index_path, rendered)
        .with_context(|| format!("failed to write {}", index_path.display()))?;
    info!(
        index = %index_path.display(),
        entries = scan.entries.len(),
        legacy = scan.legacy_pages,
        "index regenerated"
    );

    Ok(IndexReport {
        index_path,
        entries: scan.entries,
        legacy_pages: scan.legacy_pages,
        errors: scan.errors,
    })
}

/// Collect entries for every generated page directly inside `section_dir`.
/// `href_prefix` is prepended to each page's file name.
pub fn scan_entries(section_dir: &Path, href_prefix: &str) -> Result<EntryScan> {
    let mut scan = EntryScan::default();
    if !section_dir.exists() {
        return Ok(scan);
    }

    let mut pages = Vec::new();
    for entry in fs::read_dir(section_dir)
        .with_context(|| format!("failed to list {}", section_dir.display()))?
    {
        let entry = entry.with_context(|| format!("failed to list {}", section_dir.display()))?;
        let path = entry.path();
        if path.is_file() && is_listable_page(&path) {
            pages.push(path);
        }
    }
    pages.sort();

    for path in pages {
        match entry_for_page(&path, href_prefix) {
            Ok(entry) => {
                if !entry.from_sidecar {
                    scan.legacy_pages += 1;
                }
                scan.entries.push(entry);
            }
            Err(error) => {
                let message = format!("{}: {error:#}", path.display());
                warn!(%message, "skipping page in index");
                scan.errors.push(message);
            }
        }
    }
    sort_entries(&mut scan.entries);
    Ok(scan)
}

fn is_listable_page(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    name.strip_suffix(".html")
        .is_some_and(|slug| !is_reserved_slug(slug))
}

/// Slugs whose pages would collide with the index or be left out of it.
pub fn is_reserved_slug(slug: &str) -> bool {
    INDEX_FILENAME.strip_suffix(".html") == Some(slug) || slug.contains("template")
}

fn entry_for_page(path: &Path, href_prefix: &str) -> Result<IndexEntry> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("page file name is not valid UTF-8"))?;
    let slug = file_name.trim_end_matches(".html").to_string();
    let href = format!("{href_prefix}{file_name}");

    match read_metadata(path) {
        Ok(Some(metadata)) => {
            return Ok(IndexEntry {
                slug,
                href,
                title: metadata.title,
                date: metadata.date,
                importance: metadata.importance,
                excerpt: metadata.excerpt,
                from_sidecar: true,
            });
        }
        Ok(None) => {}
        Err(error) => {
            debug!(page = %path.display(), error = %format!("{error:#}"), "unreadable sidecar; parsing page HTML");
        }
    }

    let html = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let extracted = extract_legacy_metadata(&html)?;
    Ok(IndexEntry {
        slug,
        href,
        title: extracted.title,
        date: extracted.date,
        importance: extracted.importance,
        excerpt: extracted.excerpt,
        from_sidecar: false,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyMetadata {
    pub title: String,
    pub date: String,
    pub importance: Importance,
    pub excerpt: String,
}

struct LegacyPatterns {
    heading: Regex,
    title: Regex,
    data_date: Regex,
    time_datetime: Regex,
    importance: Regex,
    description: Regex,
}

static LEGACY_PATTERNS: OnceLock<Result<LegacyPatterns, String>> = OnceLock::new();

fn legacy_patterns() -> Result<&'static LegacyPatterns> {
    LEGACY_PATTERNS
        .get_or_init(|| {
            let build = || -> Result<LegacyPatterns, regex::Error> {
                Ok(LegacyPatterns {
                    heading: Regex::new(r#"(?is)<h1[^>]*class="[^"]*article-title[^"]*"[^>]*>(.*?)</h1>"#)?,
                    title: Regex::new(r"(?is)<title[^>]*>(.*?)</title>")?,
                    data_date: Regex::new(r#"data-date="([^"]+)""#)?,
                    time_datetime: Regex::new(r#"(?i)<time[^>]*datetime="([^"]+)""#)?,
                    importance: Regex::new(r"importance-(normal|important|critical)\b")?,
                    description: Regex::new(
                        r#"(?is)<meta\s+name="description"\s+content="([^"]*)""#,
                    )?,
                })
            };
            build().map_err(|error| error.to_string())
        })
        .as_ref()
        .map_err(|message| anyhow!("legacy page patterns failed to compile: {message}"))
}

/// Recover listing fields from a page that has no sidecar.
pub fn extract_legacy_metadata(html: &str) -> Result<LegacyMetadata> {
    let patterns = legacy_patterns()?;
    let capture = |regex: &Regex| {
        regex
            .captures(html)
            .and_then(|caps| caps.get(1))
            .map(|value| excerpt_from_html(value.as_str(), usize::MAX))
            .filter(|value| !value.is_empty())
    };

    let title = capture(&patterns.heading)
        .or_else(|| {
            capture(&patterns.title).map(|title| match title.split_once(" | ") {
                Some((head, _)) => head.trim().to_string(),
                None => title,
            })
        })
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());
    let date = capture(&patterns.data_date)
        .or_else(|| capture(&patterns.time_datetime))
        .unwrap_or_default();
    let importance = patterns
        .importance
        .captures(html)
        .and_then(|caps| caps.get(0))
        .and_then(|class| Importance::from_css_class(class.as_str()))
        .unwrap_or_default();
    let excerpt = capture(&patterns.description).unwrap_or_default();

    Ok(LegacyMetadata {
        title,
        date,
        importance,
        excerpt,
    })
}

/// Newest first. Parsable dates beat unparsable ones; ties fall back to the slug.
pub fn sort_entries(entries: &mut [IndexEntry]) {
    entries.sort_by(|left, right| {
        compare_dates_desc(&left.date, &right.date).then_with(|| left.slug.cmp(&right.slug))
    });
}

fn compare_dates_desc(left: &str, right: &str) -> Ordering {
    match (parse_date(left), parse_date(right)) {
        (Some(left), Some(right)) => right.cmp(&left),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => right.cmp(left),
    }
}

pub fn parse_date(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed);
        }
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, format) {
            return parsed.and_hms_opt(0, 0, 0);
        }
    }
    None
}

pub fn render_article_list(entries: &[IndexEntry]) -> String {
    let mut out = String::from("<ul class=\"article-list\">\n");
    for entry in entries {
        out.push_str(&format!(
            "  <li class=\"article-item {}\">\n    <a class=\"article-link\" href=\"{}\">{}</a>\n",
            entry.importance.css_class(),
            html_escape(&entry.href),
            html_escape(&entry.title)
        ));
        if !entry.date.is_empty() {
            let date = html_escape(&entry.date);
            out.push_str(&format!("    <time datetime=\"{date}\">{date}</time>\n"));
        }
        if !entry.excerpt.is_empty() {
            out.push_str(&format!(
                "    <p class=\"article-excerpt\">{}</p>\n",
                html_escape(&excerpt_from_html(&entry.excerpt, LIST_EXCERPT_CHARS))
            ));
        }
        out.push_str("  </li>\n");
    }
    out.push_str("</ul>");
    out
}

pub fn widget_markers(widget: &str) -> (String, String) {
    (
        format!("<!-- sitesync:{widget}:start -->"),
        format!("<!-- sitesync:{widget}:end -->"),
    )
}

/// Replace the marked `widget` block in `target_html` with up to `limit` links.
/// Returns `Ok(false)` when the page or its markers are missing.
pub fn update_widget(
    target_html: &Path,
    widget: &str,
    entries: &[IndexEntry],
    limit: usize,
) -> Result<bool> {
    if !target_html.exists() {
        warn!(page = %target_html.display(), widget, "widget target page does not exist");
        return Ok(false);
    }
    let html = fs::read_to_string(target_html)
        .with_context(|| format!("failed to read {}", target_html.display()))?;

    let (start_marker, end_marker) = widget_markers(widget);
    let Some(start) = html.find(&start_marker) else {
        warn!(page = %target_html.display(), widget, "widget start marker not found");
        return Ok(false);
    };
    let body_start = start + start_marker.len();
    let Some(end_offset) = html[body_start..].find(&end_marker) else {
        warn!(page = %target_html.display(), widget, "widget end marker not found");
        return Ok(false);
    };
    let body_end = body_start + end_offset;

    let mut block = format!("\n<ul class=\"widget-list widget-{widget}\">\n");
    for entry in entries.iter().take(limit) {
        block.push_str(&format!(
            "  <li><a href=\"{}\">{}</a></li>\n",
            html_escape(&entry.href),
            html_escape(&entry.title)
        ));
    }
    block.push_str("</ul>\n");

    let updated = format!("{}{}{}", &html[..body_start], block, &html[body_end..]);
    if updated != html {
        fs::write(target_html, updated)
            .with_context(|| format!("failed to write {}", target_html.display()))?;
    }
    Ok(true)
}
