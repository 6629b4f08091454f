use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};

use crate::metadata::{self, PageMetadata};
use crate::normalize::{excerpt_from_html, html_escape};
use crate::record::{ContentKind, ContentRecord};

const EXCERPT_CHARS: usize = 200;
const META_DESCRIPTION_CHARS: usize = 155;

#[derive(Debug, Clone)]
pub struct GeneratedPage {
    pub path: PathBuf,
    pub metadata_path: PathBuf,
    pub metadata: PageMetadata,
}

/// `{site_dir}/{section}/{key}/{slug}.html`
pub fn page_path(site_dir: &Path, section: ContentKind, key: &str, slug: &str) -> PathBuf {
    site_dir
        .join(section.as_str())
        .join(key)
        .join(format!("{slug}.html"))
}

/// Hash over every record field that reaches the rendered page.
pub fn record_hash(record: &ContentRecord) -> String {
    metadata::content_hash(&format!(
        "{}\n{}\n{}\n{}\n{}",
        record.title,
        record.date,
        record.importance.as_str(),
        record.excerpt.as_deref().unwrap_or_default(),
        record.content
    ))
}

/// Render `record` through the template at `template_path` and write the page plus its sidecar.
pub fn generate_page(
    record: &ContentRecord,
    template_path: &Path,
    output_path: &Path,
    section: ContentKind,
) -> Result<GeneratedPage> {
    let template = fs::read_to_string(template_path)
        .with_context(|| format!("failed to read page template {}", template_path.display()))?;

    // Callers normalize first; raw content goes in untouched.
    let content = record
        .processed_content
        .clone()
        .unwrap_or_else(|| record.content.clone());
    let excerpt = match record.excerpt.as_deref() {
        Some(excerpt) if !excerpt.trim().is_empty() => excerpt_from_html(excerpt, EXCERPT_CHARS),
        _ => excerpt_from_html(&content, EXCERPT_CHARS),
    };
    let meta_description = excerpt_from_html(&excerpt, META_DESCRIPTION_CHARS);
    let id = record.id.to_string();

    let rendered = render_template(&template, |token| match token {
        "TITLE" => Some(html_escape(&record.title)),
        "DATE" => Some(html_escape(&record.date)),
        "REGION" => Some(html_escape(record.region.as_deref().unwrap_or_default())),
        "CATEGORY" => Some(html_escape(record.category.as_deref().unwrap_or_default())),
        "IMPORTANCE_CLASS" => Some(record.importance.css_class().to_string()),
        "IMPORTANCE_LABEL" => Some(record.importance.label().to_string()),
        "CONTENT" => Some(content.clone()),
        "EXCERPT" => Some(html_escape(&excerpt)),
        "META_DESCRIPTION" => Some(html_escape(&meta_description)),
        "ID" => Some(id.clone()),
        _ => None,
    });

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(output_path, rendered)
        .with_context(|| format!("failed to write {}", output_path.display()))?;

    let slug = output_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| id.clone());
    let metadata = PageMetadata {
        slug,
        id: record.id,
        title: record.title.clone(),
        date: record.date.clone(),
        importance: record.importance,
        excerpt,
        section,
        status: record.status,
        content_hash: record_hash(record),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    let metadata_path = metadata::write_metadata(output_path, &metadata)?;

    Ok(GeneratedPage {
        path: output_path.to_path_buf(),
        metadata_path,
        metadata,
    })
}

/// Single-pass `{{TOKEN}}` substitution; substituted text is never rescanned and
/// unknown tokens are kept verbatim.
pub fn render_template<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len() * 2);
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let token = &after[..end];
                match lookup(token.trim()) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str("{{");
                        out.push_str(token);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
