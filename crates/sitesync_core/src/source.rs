use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::index::is_reserved_slug;
use crate::record::{ContentKind, ContentRecord, Importance, RecordOrigin, RecordStatus, UNTITLED};

/// A local Markdown article with YAML front matter.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub path: PathBuf,
    pub slug: String,
    pub id: u64,
    pub title: String,
    pub date: String,
    pub importance: Importance,
    pub excerpt: Option<String>,
    pub regions: Vec<String>,
    pub categories: Vec<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct SourceLoad {
    pub documents: Vec<SourceDocument>,
    pub errors: Vec<SourceError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FrontMatter {
    id: Option<u64>,
    title: Option<String>,
    date: Option<String>,
    importance: Option<String>,
    excerpt: Option<String>,
    region: Option<OneOrMany>,
    regions: Option<OneOrMany>,
    category: Option<OneOrMany>,
    categories: Option<OneOrMany>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

impl SourceDocument {
    /// Keys this document is published under for the given section.
    pub fn keys(&self, kind: ContentKind) -> &[String] {
        match kind {
            ContentKind::News => &self.regions,
            ContentKind::Tools | ContentKind::Guides => &self.categories,
        }
    }

    pub fn to_record(&self, target: &str) -> ContentRecord {
        let in_regions = self.regions.iter().any(|region| region == target);
        let in_categories = self.categories.iter().any(|category| category == target);
        ContentRecord {
            id: self.id,
            title: self.title.clone(),
            date: self.date.clone(),
            content: self.body.clone(),
            excerpt: self.excerpt.clone(),
            region: in_regions
                .then(|| target.to_string())
                .or_else(|| self.regions.first().cloned()),
            category: in_categories
                .then(|| target.to_string())
                .or_else(|| self.categories.first().cloned()),
            importance: self.importance,
            processed_content: None,
            status: RecordStatus::from_content(&self.body),
            origin: RecordOrigin::Listing,
        }
    }
}

/// Read every `*.md` file directly inside `dir`. Unreadable files and bad
/// front matter are collected in `errors` instead of aborting the load.
pub fn load_markdown_sources(dir: &Path) -> Result<SourceLoad> {
    let mut load = SourceLoad::default();
    if !dir.exists() {
        debug!(dir = %dir.display(), "markdown source directory does not exist");
        return Ok(load);
    }

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|ext| ext.to_str()) != Some("md")
        {
            continue;
        }
        match parse_source_file(path) {
            Ok(document) => load.documents.push(document),
            Err(error) => {
                let message = format!("{error:#}");
                warn!(path = %path.display(), %message, "skipping markdown source");
                load.errors.push(SourceError {
                    path: path.to_path_buf(),
                    message,
                });
            }
        }
    }
    Ok(load)
}

pub fn parse_source_file(path: &Path) -> Result<SourceDocument> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let slug = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(slugify)
        .filter(|slug| !slug.is_empty())
        .with_context(|| format!("cannot derive a slug from {}", path.display()))?;
    if is_reserved_slug(&slug) {
        bail!("slug `{slug}` is reserved for index and template files; rename the source");
    }
    parse_source(&text, path, slug)
}

fn parse_source(text: &str, path: &Path, slug: String) -> Result<SourceDocument> {
    let (raw_front_matter, body) = split_front_matter(text)?;
    let front_matter: FrontMatter = match raw_front_matter {
        Some(raw) if !raw.trim().is_empty() => {
            serde_yaml::from_str(raw).context("failed to parse front matter")?
        }
        _ => FrontMatter::default(),
    };

    let merge = |single: Option<OneOrMany>, many: Option<OneOrMany>| {
        let mut values = single.map(OneOrMany::into_vec).unwrap_or_default();
        values.extend(many.map(OneOrMany::into_vec).unwrap_or_default());
        let mut out: Vec<String> = Vec::new();
        for value in values {
            let value = value.trim().to_string();
            if !value.is_empty() && !out.contains(&value) {
                out.push(value);
            }
        }
        out
    };

    Ok(SourceDocument {
        path: path.to_path_buf(),
        slug,
        id: front_matter.id.unwrap_or(0),
        title: front_matter
            .title
            .map(|title| title.trim().to_string())
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| UNTITLED.to_string()),
        date: front_matter.date.unwrap_or_default().trim().to_string(),
        importance: front_matter
            .importance
            .as_deref()
            .map(Importance::parse)
            .unwrap_or_default(),
        excerpt: front_matter
            .excerpt
            .filter(|excerpt| !excerpt.trim().is_empty()),
        regions: merge(front_matter.region, front_matter.regions),
        categories: merge(front_matter.category, front_matter.categories),
        body: body.trim().to_string(),
    })
}

/// Split `---` delimited front matter from the body.
fn split_front_matter(text: &str) -> Result<(Option<&str>, &str)> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let Some(rest) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return Ok((None, text));
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return Ok((Some(&rest[..offset]), &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    bail!("missing closing front matter delimiter")
}

/// Lowercase ASCII alphanumerics joined by single hyphens; other scripts are kept as-is.
pub fn slugify(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_dash = false;
    for ch in value.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}
