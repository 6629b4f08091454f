use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "sitesync/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MAX_RETRIES: usize = 5;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 3_000;
pub const DEFAULT_PER_PAGE: usize = 100;
pub const DEFAULT_MAX_GAP_FILL: usize = 50;

const DEFAULT_NEWS_ENDPOINT: &str = "{base}/custom/v1/news?region={key}";
const DEFAULT_TOOLS_ENDPOINT: &str = "{base}/custom/v1/tools?category={key}";
const DEFAULT_POST_BY_ID_ENDPOINT: &str = "{base}/wp/v2/posts/{id}";
const DEFAULT_NEWS_BY_ID_ENDPOINT: &str = "{base}/custom/v1/news/{id}";
const DEFAULT_TOOL_BY_ID_ENDPOINT: &str = "{base}/custom/v1/tools/{id}";
const DEFAULT_FALLBACK_ENDPOINT: &str = "{base}/wp/v2/posts";

const DEFAULT_REGIONS: &[(&str, &str)] = &[
    ("north-america", "North America"),
    ("europe", "Europe"),
    ("asia-pacific", "Asia Pacific"),
    ("middle-east", "Middle East"),
    ("latin-america", "Latin America"),
];

const DEFAULT_CATEGORIES: &[(&str, &str)] = &[
    ("calculators", "Calculators"),
    ("documents", "Documents"),
    ("tracking", "Tracking"),
    ("regulations", "Regulations"),
];

/// On-disk shape of `config.toml`. Every field is optional so partial files load.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfigFile {
    #[serde(default)]
    pub cms: CmsSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub regions: Vec<Taxon>,
    #[serde(default)]
    pub categories: Vec<Taxon>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CmsSection {
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
    pub news_endpoint: Option<String>,
    pub tools_endpoint: Option<String>,
    pub post_by_id_endpoint: Option<String>,
    pub news_by_id_endpoint: Option<String>,
    pub tool_by_id_endpoint: Option<String>,
    pub fallback_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub per_page: Option<usize>,
    pub max_gap_fill: Option<usize>,
}

/// A region or tool category: the stable code used in paths and API queries plus a display name.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Taxon {
    pub code: String,
    pub name: Option<String>,
}

impl Taxon {
    pub fn new(code: &str, name: &str) -> Self {
        Self {
            code: code.to_string(),
            name: Some(name.to_string()),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub per_page: usize,
    pub max_gap_fill: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub base_url: String,
    pub news: String,
    pub tools: String,
    pub post_by_id: String,
    pub news_by_id: String,
    pub tool_by_id: String,
    pub fallback: String,
}

impl Endpoints {
    pub fn news_url(&self, region: &str) -> String {
        self.expand(&self.news, region, None)
    }

    pub fn tools_url(&self, category: &str) -> String {
        self.expand(&self.tools, category, None)
    }

    pub fn fallback_url(&self) -> String {
        self.expand(&self.fallback, "", None)
    }

    /// Candidate single-item URLs tried in order when a record's content is incomplete.
    pub fn item_candidates(&self, id: u64) -> Vec<String> {
        [&self.post_by_id, &self.news_by_id, &self.tool_by_id]
            .into_iter()
            .map(|template| self.expand(template, "", Some(id)))
            .collect()
    }

    fn expand(&self, template: &str, key: &str, id: Option<u64>) -> String {
        let mut out = template
            .replace("{base}", self.base_url.trim_end_matches('/'))
            .replace("{key}", key);
        if let Some(id) = id {
            out = out.replace("{id}", &id.to_string());
        }
        out
    }
}

/// Fully resolved, immutable configuration handed to every pipeline component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    pub endpoints: Endpoints,
    pub http: HttpSettings,
    pub regions: Vec<Taxon>,
    pub categories: Vec<Taxon>,
}

impl SiteConfig {
    pub fn from_file(file: &ConfigFile) -> Self {
        Self::from_file_with_lookup(file, |key| env::var(key).ok())
    }

    /// Resolve: env > config file > defaults.
    pub fn from_file_with_lookup<F>(file: &ConfigFile, lookup_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_string = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let env_u64 = |key: &str| env_string(key).and_then(|value| value.parse::<u64>().ok());
        let env_usize = |key: &str| env_string(key).and_then(|value| value.parse::<usize>().ok());

        let cms = &file.cms;
        let template = |value: &Option<String>, default: &str| {
            value.clone().unwrap_or_else(|| default.to_string())
        };
        let endpoints = Endpoints {
            base_url: env_string("SITESYNC_CMS_URL")
                .or_else(|| cms.base_url.clone())
                .unwrap_or_default(),
            news: template(&cms.news_endpoint, DEFAULT_NEWS_ENDPOINT),
            tools: template(&cms.tools_endpoint, DEFAULT_TOOLS_ENDPOINT),
            post_by_id: template(&cms.post_by_id_endpoint, DEFAULT_POST_BY_ID_ENDPOINT),
            news_by_id: template(&cms.news_by_id_endpoint, DEFAULT_NEWS_BY_ID_ENDPOINT),
            tool_by_id: template(&cms.tool_by_id_endpoint, DEFAULT_TOOL_BY_ID_ENDPOINT),
            fallback: template(&cms.fallback_endpoint, DEFAULT_FALLBACK_ENDPOINT),
        };

        let http = HttpSettings {
            user_agent: env_string("SITESYNC_USER_AGENT")
                .or_else(|| cms.user_agent.clone())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_ms: env_u64("SITESYNC_HTTP_TIMEOUT_MS")
                .or(file.http.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            max_retries: env_usize("SITESYNC_HTTP_RETRIES")
                .or(file.http.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_ms: env_u64("SITESYNC_HTTP_RETRY_DELAY_MS")
                .or(file.http.retry_delay_ms)
                .unwrap_or(DEFAULT_RETRY_DELAY_MS),
            per_page: file.http.per_page.unwrap_or(DEFAULT_PER_PAGE).max(1),
            max_gap_fill: file.http.max_gap_fill.unwrap_or(DEFAULT_MAX_GAP_FILL),
        };

        let defaults = |items: &[(&str, &str)]| {
            items
                .iter()
                .map(|(code, name)| Taxon::new(code, name))
                .collect::<Vec<_>>()
        };
        let regions = if file.regions.is_empty() {
            defaults(DEFAULT_REGIONS)
        } else {
            file.regions.clone()
        };
        let categories = if file.categories.is_empty() {
            defaults(DEFAULT_CATEGORIES)
        } else {
            file.categories.clone()
        };

        Self {
            endpoints,
            http,
            regions,
            categories,
        }
    }

    pub fn ensure_cms_configured(&self) -> Result<()> {
        if self.endpoints.base_url.trim().is_empty() {
            bail!(
                "CMS base URL is not configured.\nSet [cms].base_url in config.toml or export SITESYNC_CMS_URL."
            );
        }
        Ok(())
    }

    pub fn region(&self, code: &str) -> Option<&Taxon> {
        self.regions.iter().find(|taxon| taxon.code == code)
    }

    pub fn category(&self, code: &str) -> Option<&Taxon> {
        self.categories.iter().find(|taxon| taxon.code == code)
    }
}

/// Load and parse a config file. Returns defaults if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ConfigFile> {
    if !config_path.exists() {
        return Ok(ConfigFile::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    for taxon in parsed.regions.iter().chain(parsed.categories.iter()) {
        if taxon.code.trim().is_empty() {
            bail!(
                "region/category code cannot be empty in {}",
                config_path.display()
            );
        }
    }
    Ok(parsed)
}

/// Convenience: load the file and resolve it against the process environment.
pub fn load_site_config(config_path: &Path) -> Result<SiteConfig> {
    Ok(SiteConfig::from_file(&load_config(config_path)?))
}
