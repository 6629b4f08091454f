use std::fmt;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Content strictly longer than this many characters counts as complete.
pub const COMPLETE_CONTENT_THRESHOLD: usize = 200;
/// Title used when a source or legacy page has none.
pub const UNTITLED: &str = "无标题";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    News,
    Tools,
    Guides,
}

impl ContentKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "news" => Ok(Self::News),
            "tools" | "tool" => Ok(Self::Tools),
            "guides" | "guide" => Ok(Self::Guides),
            other => bail!("unsupported content type: {other} (expected news|tools|guides)"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::News => "news",
            Self::Tools => "tools",
            Self::Guides => "guides",
        }
    }

    /// Name of the taxonomy that keys this kind's subdirectories.
    pub fn key_label(self) -> &'static str {
        match self {
            Self::News => "region",
            Self::Tools | Self::Guides => "category",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    #[default]
    Normal,
    Important,
    Critical,
}

impl Importance {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "critical" | "very_important" | "urgent" | "非常重要" | "紧急" => Self::Critical,
            "important" | "high" | "重要" => Self::Important,
            _ => Self::Normal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Important => "important",
            Self::Critical => "critical",
        }
    }

    pub fn css_class(self) -> &'static str {
        match self {
            Self::Normal => "importance-normal",
            Self::Important => "importance-important",
            Self::Critical => "importance-critical",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "Update",
            Self::Important => "Important",
            Self::Critical => "Critical",
        }
    }

    pub fn from_css_class(class: &str) -> Option<Self> {
        [Self::Normal, Self::Important, Self::Critical]
            .into_iter()
            .find(|item| item.css_class() == class)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Complete,
    Partial,
    #[default]
    Failed,
}

impl RecordStatus {
    pub fn from_content(content: &str) -> Self {
        let length = content.trim().chars().count();
        if length > COMPLETE_CONTENT_THRESHOLD {
            Self::Complete
        } else if length > 0 {
            Self::Partial
        } else {
            Self::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Which request produced a record. Only listing records are known to belong
/// to the key that was queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordOrigin {
    #[default]
    Listing,
    GapFill,
    Fallback,
}

/// One article or tool as delivered by the CMS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: u64,
    #[serde(default, deserialize_with = "rich_text")]
    pub title: String,
    #[serde(default, deserialize_with = "rich_text")]
    pub date: String,
    #[serde(default, deserialize_with = "rich_text")]
    pub content: String,
    #[serde(default, deserialize_with = "optional_rich_text")]
    pub excerpt: Option<String>,
    #[serde(default, deserialize_with = "optional_rich_text")]
    pub region: Option<String>,
    #[serde(default, deserialize_with = "optional_rich_text")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "importance")]
    pub importance: Importance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_content: Option<String>,
    /// Derived from `content`; the CMS's own `status` ("publish", ...) is ignored.
    #[serde(rename = "sync_status", skip_deserializing)]
    pub status: RecordStatus,
    #[serde(skip)]
    pub origin: RecordOrigin,
}

impl ContentRecord {
    pub fn new(id: u64, title: &str, content: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            date: String::new(),
            content: content.to_string(),
            excerpt: None,
            region: None,
            category: None,
            importance: Importance::Normal,
            processed_content: None,
            status: RecordStatus::from_content(content),
            origin: RecordOrigin::Listing,
        }
    }

    /// Decode a CMS payload; the status is derived from the payload's content shape.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut record: Self =
            serde_json::from_value(value).context("failed to decode CMS content record")?;
        record.refresh_status();
        Ok(record)
    }

    pub fn content_len(&self) -> usize {
        self.content.trim().chars().count()
    }

    pub fn is_complete(&self) -> bool {
        self.content_len() > COMPLETE_CONTENT_THRESHOLD
    }

    pub fn refresh_status(&mut self) {
        self.status = RecordStatus::from_content(&self.content);
    }

    /// Shallow merge: top-level fields of `fetched` replace this record's fields.
    pub fn merged_with(&self, fetched: &Value) -> Result<Self> {
        let Value::Object(fetched_fields) = fetched else {
            bail!("cannot merge non-object payload into record {}", self.id);
        };
        let mut base = serde_json::to_value(self).context("failed to encode content record")?;
        let Value::Object(base_fields) = &mut base else {
            bail!("content record {} did not encode as an object", self.id);
        };
        for (key, value) in fetched_fields {
            base_fields.insert(key.clone(), value.clone());
        }
        // The fetched payload describes the same record; never let it rename the id.
        base_fields.insert("id".to_string(), Value::from(self.id));
        let mut merged = Self::from_value(base)?;
        merged.origin = self.origin;
        Ok(merged)
    }
}

fn rich_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_to_text(&value).unwrap_or_default())
}

fn optional_rich_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_to_text(&value).filter(|text| !text.trim().is_empty()))
}

fn importance<'de, D>(deserializer: D) -> Result<Importance, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_to_text(&value)
        .map(|text| Importance::parse(&text))
        .unwrap_or_default())
}

/// Accepts `"text"`, `{"rendered": "text"}`, numbers, and lists (first element).
fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(items) => items.iter().find_map(value_to_text),
        Value::Object(fields) => fields
            .get("rendered")
            .or_else(|| fields.get("slug"))
            .or_else(|| fields.get("name"))
            .and_then(value_to_text),
    }
}
