//! Orchestrates one sync run and the local rebuild commands.
//!
//! A sync run walks `Idle → Checking → (NoUpdates | Updates → Generating →
//! Verifying → [Fixing]) → Idle`. Each key (a news region or a tool category)
//! advances its last-seen id only when its fetch succeeded and every page for
//! it was written.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::client::{CmsApi, FetchOptions, fetch_complete_data, item_base_for};
use crate::completeness::{CompletenessOptions, ensure_complete_content};
use crate::config::{SiteConfig, Taxon};
use crate::index::{
    INDEX_FILENAME, IndexOptions, regenerate_index, scan_entries, sort_entries, update_widget,
};
use crate::metadata::is_up_to_date;
use crate::normalize::process_markdown_content;
use crate::page::{generate_page, page_path, record_hash};
use crate::record::{ContentKind, ContentRecord, RecordOrigin, RecordStatus};
use crate::runtime::ResolvedPaths;
use crate::source::load_markdown_sources;
use crate::state::{has_updates, load_last_update, save_last_update};
use crate::verify::{VerificationReport, verify_generated_page, verify_pages};

pub const TOOLS_WIDGET: &str = "tools";
pub const TOOLS_WIDGET_LIMIT: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Restrict the run to news or tools; `None` runs both.
    pub kind: Option<ContentKind>,
    /// Restrict the run to one region or category code.
    pub target: Option<String>,
    /// Treat every successfully fetched key as updated and rewrite all its pages.
    pub force_refresh: bool,
    /// Refetch every record from its item endpoint before rendering.
    pub force_full_data: bool,
    /// Fetch and plan without writing pages, indexes or state.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Checking,
    NoUpdates,
    Updates,
    Generating,
    Verifying,
    Fixing,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::NoUpdates => "no_updates",
            Self::Updates => "updates",
            Self::Generating => "generating",
            Self::Verifying => "verifying",
            Self::Fixing => "fixing",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub dry_run: bool,
    pub checked: usize,
    pub updated_keys: Vec<String>,
    pub generated: usize,
    pub skipped: usize,
    pub verification_failures: usize,
    pub fixed: usize,
    pub unfixed_pages: Vec<String>,
    pub errors: Vec<String>,
    pub request_count: usize,
    pub phases: Vec<RunPhase>,
}

impl SyncReport {
    fn enter(&mut self, phase: RunPhase) {
        let from = self.phases.last().copied().unwrap_or(RunPhase::Idle);
        info!(from = %from, to = %phase, "sync phase");
        self.phases.push(phase);
    }
}

struct KeyWork<'a> {
    kind: ContentKind,
    taxon: &'a Taxon,
    records: Vec<ContentRecord>,
    last_seen: u64,
    latest: u64,
}

impl KeyWork<'_> {
    fn label(&self) -> String {
        key_label(self.kind, &self.taxon.code)
    }
}

/// A page written in this run, kept for verification and the fix-up pass.
struct WrittenPage {
    path: PathBuf,
    kind: ContentKind,
    key: String,
    record: ContentRecord,
}

fn key_label(kind: ContentKind, key: &str) -> String {
    format!("{kind}/{key}")
}

/// One full check-and-regenerate pass against the CMS.
pub fn run_once<A: CmsApi>(
    paths: &ResolvedPaths,
    config: &SiteConfig,
    api: &mut A,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let selected = select_keys(config, options)?;
    let mut state = load_last_update(&paths.last_update_path)?;
    let mut report = SyncReport {
        dry_run: options.dry_run,
        phases: vec![RunPhase::Idle],
        ..SyncReport::default()
    };

    report.enter(RunPhase::Checking);
    let mut pending = Vec::new();
    for (kind, taxon) in selected {
        report.checked += 1;
        let url = match kind {
            ContentKind::News => config.endpoints.news_url(&taxon.code),
            _ => config.endpoints.tools_url(&taxon.code),
        };
        let fetch_options = FetchOptions {
            item_base: Some(item_base_for(&url)),
            ..FetchOptions::from_config(config)
        };
        let records = match fetch_complete_data(api, &url, &fetch_options) {
            Ok(records) => records,
            Err(error) => {
                warn!(key = %key_label(kind, &taxon.code), %error, "fetch failed; key left unchanged");
                report
                    .errors
                    .push(format!("{}: {error}", key_label(kind, &taxon.code)));
                continue;
            }
        };
        let records: Vec<_> = records
            .into_iter()
            .filter(|record| belongs_to(record, kind, taxon))
            .collect();
        let latest = records
            .iter()
            .filter(|record| record.origin == RecordOrigin::Listing)
            .map(|record| record.id)
            .max()
            .unwrap_or(0);
        let last_seen = state.last_seen(kind, &taxon.code);
        if options.force_refresh || has_updates(last_seen, latest) {
            info!(key = %key_label(kind, &taxon.code), last_seen, latest, "updates found");
            pending.push(KeyWork {
                kind,
                taxon,
                records,
                last_seen,
                latest,
            });
        } else {
            debug!(key = %key_label(kind, &taxon.code), last_seen, latest, "no updates");
        }
    }

    if pending.is_empty() {
        report.enter(RunPhase::NoUpdates);
        report.enter(RunPhase::Idle);
        report.request_count = api.request_count();
        report.success = report.errors.is_empty();
        return Ok(report);
    }

    report.enter(RunPhase::Updates);
    report.enter(RunPhase::Generating);
    let template = paths.page_template_path();
    let mut written = Vec::new();
    let mut clean_keys = Vec::new();
    for work in &mut pending {
        report.updated_keys.push(work.label());
        let candidates: Vec<_> = std::mem::take(&mut work.records)
            .into_iter()
            .filter(|record| options.force_refresh || record.id > work.last_seen)
            .collect();
        let (records, completeness) = ensure_complete_content(
            api,
            &config.endpoints,
            candidates,
            CompletenessOptions {
                force_full_data: options.force_full_data,
            },
        );
        debug!(key = %work.label(), ?completeness, "completeness resolved");

        let mut key_errors = 0usize;
        for record in records {
            match render_record(paths, &template, work.kind, &work.taxon.code, record, options) {
                Ok(RenderOutcome::Written(page)) => {
                    report.generated += 1;
                    written.push(page);
                }
                Ok(RenderOutcome::Planned) => report.generated += 1,
                Ok(RenderOutcome::Skipped) => report.skipped += 1,
                Err(error) => {
                    key_errors += 1;
                    report
                        .errors
                        .push(format!("{}: {error:#}", work.label()));
                }
            }
        }

        if !options.dry_run
            && let Err(error) = regenerate_key_index(paths, work.kind, work.taxon)
        {
            key_errors += 1;
            report.errors.push(format!("{}: {error:#}", work.label()));
        }
        if key_errors == 0 {
            clean_keys.push((work.kind, work.taxon.code.clone(), work.latest));
        } else {
            warn!(key = %work.label(), errors = key_errors, "key had errors; last-seen id not advanced");
        }
    }

    if !options.dry_run {
        match refresh_tools_widgets(paths, config) {
            Ok(updated) => debug!(updated, "tools widgets refreshed"),
            Err(error) => report.errors.push(format!("tools widget: {error:#}")),
        }
    }

    report.enter(RunPhase::Verifying);
    let verification = verify_pages(
        &written
            .iter()
            .map(|page| page.path.clone())
            .collect::<Vec<_>>(),
    );
    report.verification_failures = verification.failures.len();
    if !verification.is_ok() {
        report.enter(RunPhase::Fixing);
        fix_failed_pages(paths, config, api, &written, &verification, &mut report);
    }

    for (kind, key, latest) in clean_keys {
        state.advance(kind, &key, latest)?;
    }
    if options.dry_run {
        info!("dry run: last-update record not written");
    } else {
        save_last_update(&paths.last_update_path, &state)?;
    }

    report.enter(RunPhase::Idle);
    report.request_count = api.request_count();
    report.success = report.errors.is_empty();
    Ok(report)
}

fn select_keys<'a>(
    config: &'a SiteConfig,
    options: &SyncOptions,
) -> Result<Vec<(ContentKind, &'a Taxon)>> {
    let kinds = match options.kind {
        None => vec![ContentKind::News, ContentKind::Tools],
        Some(ContentKind::Guides) => {
            bail!("guides are built from local Markdown; use `sitesync build-local guides`")
        }
        Some(kind) => vec![kind],
    };

    let mut selected = Vec::new();
    for kind in kinds {
        let taxa = match kind {
            ContentKind::News => &config.regions,
            _ => &config.categories,
        };
        for taxon in taxa {
            if options
                .target
                .as_deref()
                .is_none_or(|target| target == taxon.code)
            {
                selected.push((kind, taxon));
            }
        }
    }
    if let Some(target) = options.target.as_deref()
        && selected.is_empty()
    {
        bail!("unknown region or category: {target}");
    }
    Ok(selected)
}

/// Listing records without a key belong to the queried key. Gap-filled and
/// fallback records must name this key explicitly.
fn belongs_to(record: &ContentRecord, kind: ContentKind, taxon: &Taxon) -> bool {
    let value = match kind {
        ContentKind::News => record.region.as_deref(),
        _ => record.category.as_deref(),
    };
    match value {
        None => record.origin == RecordOrigin::Listing,
        Some(value) => {
            let value = value.trim();
            value.eq_ignore_ascii_case(&taxon.code) || value.eq_ignore_ascii_case(taxon.display_name())
        }
    }
}

enum RenderOutcome {
    Written(WrittenPage),
    Planned,
    Skipped,
}

fn render_record(
    paths: &ResolvedPaths,
    template: &Path,
    kind: ContentKind,
    key: &str,
    mut record: ContentRecord,
    options: &SyncOptions,
) -> Result<RenderOutcome> {
    if record.status == RecordStatus::Failed {
        warn!(id = record.id, key, "record has no content; skipped");
        return Ok(RenderOutcome::Skipped);
    }
    let output = page_path(&paths.site_dir, kind, key, &record.id.to_string());
    if !options.force_refresh && is_up_to_date(&output, &record_hash(&record)) {
        debug!(id = record.id, "page already generated from identical content");
        return Ok(RenderOutcome::Skipped);
    }
    if options.dry_run {
        info!(id = record.id, page = %output.display(), "dry run: would generate page");
        return Ok(RenderOutcome::Planned);
    }

    let source = record.clone();
    record.processed_content = Some(process_markdown_content(&record.content));
    let page = generate_page(&record, template, &output, kind)?;
    debug!(id = record.id, page = %page.path.display(), "page generated");
    Ok(RenderOutcome::Written(WrittenPage {
        path: page.path,
        kind,
        key: key.to_string(),
        record: source,
    }))
}

/// One retry per failed page: refetch the full record, re-render and re-verify.
fn fix_failed_pages<A: CmsApi>(
    paths: &ResolvedPaths,
    config: &SiteConfig,
    api: &mut A,
    written: &[WrittenPage],
    verification: &VerificationReport,
    report: &mut SyncReport,
) {
    let template = paths.page_template_path();
    let mut touched = BTreeSet::new();
    for failure in &verification.failures {
        let Some(page) = written.iter().find(|page| page.path == failure.path) else {
            continue;
        };
        let (mut refreshed, _) = ensure_complete_content(
            api,
            &config.endpoints,
            vec![page.record.clone()],
            CompletenessOptions {
                force_full_data: true,
            },
        );
        let Some(mut record) = refreshed.pop() else {
            continue;
        };
        record.processed_content = Some(process_markdown_content(&record.content));
        let outcome = generate_page(&record, &template, &page.path, page.kind)
            .map(|_| verify_generated_page(&page.path));
        match outcome {
            Ok(recheck) if recheck.is_ok() => {
                info!(page = %page.path.display(), "page fixed");
                report.fixed += 1;
                touched.insert((page.kind, page.key.clone()));
            }
            Ok(recheck) => {
                warn!(page = %page.path.display(), problems = %recheck.problems.join("; "), "page still failing verification");
                report.unfixed_pages.push(page.path.display().to_string());
            }
            Err(error) => {
                report
                    .errors
                    .push(format!("{}: {error:#}", page.path.display()));
            }
        }
    }

    for (kind, key) in touched {
        let taxon = match kind {
            ContentKind::News => config.region(&key),
            _ => config.category(&key),
        };
        if let Some(taxon) = taxon
            && let Err(error) = regenerate_key_index(paths, kind, taxon)
        {
            report.errors.push(format!("{}: {error:#}", key_label(kind, &key)));
        }
    }
}

fn regenerate_key_index(paths: &ResolvedPaths, kind: ContentKind, taxon: &Taxon) -> Result<()> {
    let section_dir = paths.site_dir.join(kind.as_str()).join(&taxon.code);
    let report = regenerate_index(
        &section_dir,
        &paths.index_template_path(),
        &IndexOptions::new(taxon.display_name()),
    )?;
    for error in report.errors {
        warn!(%error, "index entry skipped");
    }
    Ok(())
}

/// Rewrite the tools panel on every region landing page. Returns how many pages changed.
pub fn refresh_tools_widgets(paths: &ResolvedPaths, config: &SiteConfig) -> Result<usize> {
    let tools_dir = paths.site_dir.join(ContentKind::Tools.as_str());
    let mut entries = Vec::new();
    for category in &config.categories {
        let prefix = format!("/{}/{}/", ContentKind::Tools.as_str(), category.code);
        entries.extend(scan_entries(&tools_dir.join(&category.code), &prefix)?.entries);
    }
    sort_entries(&mut entries);

    let news_dir = paths.site_dir.join(ContentKind::News.as_str());
    let mut updated = 0;
    for region in &config.regions {
        let landing = news_dir.join(&region.code).join(INDEX_FILENAME);
        if !landing.exists() {
            continue;
        }
        if update_widget(&landing, TOOLS_WIDGET, &entries, TOOLS_WIDGET_LIMIT)? {
            updated += 1;
        }
    }
    Ok(updated)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LocalBuildReport {
    pub documents: usize,
    pub generated: usize,
    pub skipped: usize,
    pub indexes: usize,
    pub errors: Vec<String>,
}

/// Render local Markdown sources (`news-md/` or `guides-md/`) into the site.
pub fn build_local(
    paths: &ResolvedPaths,
    config: &SiteConfig,
    kind: ContentKind,
    target: Option<&str>,
) -> Result<LocalBuildReport> {
    let source_dir = match kind {
        ContentKind::News => &paths.news_md_dir,
        ContentKind::Guides => &paths.guides_md_dir,
        ContentKind::Tools => bail!("tools come from the CMS; use `sitesync sync tools`"),
    };
    let load = load_markdown_sources(source_dir)?;
    let mut report = LocalBuildReport {
        documents: load.documents.len(),
        errors: load
            .errors
            .iter()
            .map(|error| format!("{}: {}", error.path.display(), error.message))
            .collect(),
        ..LocalBuildReport::default()
    };

    let template = paths.page_template_path();
    let mut touched: BTreeMap<String, String> = BTreeMap::new();
    for document in &load.documents {
        let keys = document.keys(kind);
        if keys.is_empty() {
            report.errors.push(format!(
                "{}: no {} in front matter",
                document.path.display(),
                kind.key_label()
            ));
            continue;
        }
        for key in keys {
            if target.is_some_and(|target| target != key.as_str()) {
                continue;
            }
            if kind == ContentKind::News && config.region(key).is_none() {
                warn!(path = %document.path.display(), region = %key, "region is not configured");
            }
            let record = document.to_record(key);
            let output = page_path(&paths.site_dir, kind, key, &document.slug);
            if is_up_to_date(&output, &record_hash(&record)) {
                report.skipped += 1;
                continue;
            }
            let mut record = record;
            record.processed_content = Some(process_markdown_content(&record.content));
            match generate_page(&record, &template, &output, kind) {
                Ok(_) => {
                    report.generated += 1;
                    touched.insert(key.clone(), display_name_for(config, kind, key));
                }
                Err(error) => report
                    .errors
                    .push(format!("{}: {error:#}", document.path.display())),
            }
        }
    }

    for (key, title) in &touched {
        let section_dir = paths.site_dir.join(kind.as_str()).join(key);
        match regenerate_index(&section_dir, &paths.index_template_path(), &IndexOptions::new(title)) {
            Ok(_) => report.indexes += 1,
            Err(error) => report.errors.push(format!("{}: {error:#}", key_label(kind, key))),
        }
    }
    if kind == ContentKind::News && !touched.is_empty() {
        refresh_tools_widgets(paths, config)?;
    }
    info!(
        kind = %kind,
        generated = report.generated,
        skipped = report.skipped,
        errors = report.errors.len(),
        "local build finished"
    );
    Ok(report)
}

fn display_name_for(config: &SiteConfig, kind: ContentKind, key: &str) -> String {
    let taxon = match kind {
        ContentKind::News => config.region(key),
        _ => config.category(key),
    };
    taxon
        .map(|taxon| taxon.display_name().to_string())
        .unwrap_or_else(|| key.to_string())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegenerateReport {
    pub indexes: Vec<PathBuf>,
    pub entries: usize,
    pub widgets_updated: usize,
    pub errors: Vec<String>,
}

/// Rebuild index pages (and the tools widgets) from what is already on disk.
pub fn regenerate(
    paths: &ResolvedPaths,
    config: &SiteConfig,
    kind: Option<ContentKind>,
    target: Option<&str>,
) -> Result<RegenerateReport> {
    let kinds = match kind {
        Some(kind) => vec![kind],
        None => vec![ContentKind::News, ContentKind::Tools, ContentKind::Guides],
    };
    let mut report = RegenerateReport::default();
    for kind in kinds {
        for key in section_keys(paths, config, kind)? {
            if target.is_some_and(|target| target != key) {
                continue;
            }
            let section_dir = paths.site_dir.join(kind.as_str()).join(&key);
            let title = display_name_for(config, kind, &key);
            match regenerate_index(&section_dir, &paths.index_template_path(), &IndexOptions::new(&title)) {
                Ok(index) => {
                    report.entries += index.entries.len();
                    report.errors.extend(index.errors);
                    report.indexes.push(index.index_path);
                }
                Err(error) => report.errors.push(format!("{}: {error:#}", key_label(kind, &key))),
            }
        }
    }
    report.widgets_updated = refresh_tools_widgets(paths, config)?;
    Ok(report)
}

/// Configured keys for news/tools; for guides, whatever category directories exist.
fn section_keys(paths: &ResolvedPaths, config: &SiteConfig, kind: ContentKind) -> Result<Vec<String>> {
    let taxa = match kind {
        ContentKind::News => &config.regions,
        ContentKind::Tools => &config.categories,
        ContentKind::Guides => {
            let dir = paths.site_dir.join(kind.as_str());
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir()
                    && let Some(name) = entry.file_name().to_str()
                {
                    keys.push(name.to_string());
                }
            }
            keys.sort();
            return Ok(keys);
        }
    };
    Ok(taxa.iter().map(|taxon| taxon.code.clone()).collect())
}

/// Verify every generated page under the site directory.
pub fn verify_all(paths: &ResolvedPaths) -> Result<VerificationReport> {
    let mut pages = Vec::new();
    if paths.site_dir.exists() {
        for entry in WalkDir::new(&paths.site_dir).sort_by_file_name() {
            let entry = entry?;
            let listable = {
                let name = entry.file_name().to_string_lossy();
                name.ends_with(".html") && name != INDEX_FILENAME && !name.contains("template")
            };
            if entry.file_type().is_file() && listable {
                pages.push(entry.into_path());
            }
        }
    }
    Ok(verify_pages(&pages))
}

/// Operator override for a key's last-seen id; may lower it. Returns the previous value.
pub fn reset_last_seen(
    paths: &ResolvedPaths,
    kind: ContentKind,
    key: &str,
    id: u64,
) -> Result<Option<u64>> {
    let mut state = load_last_update(&paths.last_update_path)?;
    let previous = state.set(kind, key, id)?;
    save_last_update(&paths.last_update_path, &state)?;
    info!(kind = %kind, key, id, ?previous, "last-seen id reset");
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::client::PageResponse;
    use crate::client::tests::{MockCms, item};
    use crate::config::ConfigFile;
    use crate::runtime::{InitOptions, init_layout};
    use crate::state::LastUpdateRecord;

    const NEWS_URL: &str = "https://cms/custom/v1/news?region=europe";
    const TOOLS_URL: &str = "https://cms/custom/v1/tools?category=calculators";

    fn setup() -> (tempfile::TempDir, ResolvedPaths, SiteConfig) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_project_root(temp.path());
        init_layout(&paths, &InitOptions::default()).expect("init");
        let file = ConfigFile {
            regions: vec![Taxon::new("europe", "Europe")],
            categories: vec![Taxon::new("calculators", "Calculators")],
            ..ConfigFile::default()
        };
        let mut config = SiteConfig::from_file_with_lookup(&file, |_| None);
        config.endpoints.base_url = "https://cms".to_string();
        (temp, paths, config)
    }

    fn body(id: u64) -> String {
        format!("## Port notice {id}\n\n{}", "Vessel schedules shift this week. ".repeat(10))
    }

    fn news_item(id: u64) -> serde_json::Value {
        let mut value = item(id, &body(id));
        value["region"] = json!("europe");
        value
    }

    fn page(items: Vec<serde_json::Value>) -> Vec<PageResponse> {
        vec![PageResponse {
            total_pages: Some(1),
            items,
        }]
    }

    #[test]
    fn generates_new_pages_and_advances_state() {
        let (_temp, paths, config) = setup();
        save_last_update(
            &paths.last_update_path,
            &LastUpdateRecord {
                news: BTreeMap::from([("europe".to_string(), 10)]),
                tools: BTreeMap::new(),
            },
        )
        .expect("seed state");
        let mut api = MockCms::default();
        api.pages.insert(
            NEWS_URL.to_string(),
            page(vec![news_item(10), news_item(11), news_item(12)]),
        );
        api.pages.insert(TOOLS_URL.to_string(), page(vec![]));

        let report = run_once(&paths, &config, &mut api, &SyncOptions::default()).expect("run");

        assert!(report.success, "{:?}", report.errors);
        assert_eq!(report.checked, 2);
        assert_eq!(report.updated_keys, vec!["news/europe"]);
        assert_eq!(report.generated, 2);
        assert_eq!(report.verification_failures, 0);
        assert!(paths.site_dir.join("news/europe/11.html").is_file());
        assert!(paths.site_dir.join("news/europe/12.json").is_file());
        assert!(!paths.site_dir.join("news/europe/10.html").exists());

        let index = fs::read_to_string(paths.site_dir.join("news/europe/index.html")).expect("index");
        assert_eq!(index.matches("<li class=\"article-item").count(), 2);

        let state = load_last_update(&paths.last_update_path).expect("state");
        assert_eq!(state.last_seen(ContentKind::News, "europe"), 12);
        assert_eq!(
            report.phases,
            vec![
                RunPhase::Idle,
                RunPhase::Checking,
                RunPhase::Updates,
                RunPhase::Generating,
                RunPhase::Verifying,
                RunPhase::Idle
            ]
        );
    }

    #[test]
    fn no_updates_short_circuits() {
        let (_temp, paths, config) = setup();
        save_last_update(
            &paths.last_update_path,
            &LastUpdateRecord {
                news: BTreeMap::from([("europe".to_string(), 12)]),
                tools: BTreeMap::new(),
            },
        )
        .expect("seed state");
        let mut api = MockCms::default();
        api.pages.insert(NEWS_URL.to_string(), page(vec![news_item(12)]));

        let options = SyncOptions {
            kind: Some(ContentKind::News),
            ..SyncOptions::default()
        };
        let report = run_once(&paths, &config, &mut api, &options).expect("run");
        assert!(report.success);
        assert!(report.updated_keys.is_empty());
        assert_eq!(report.phases[2], RunPhase::NoUpdates);
        assert!(!paths.site_dir.join("news/europe/12.html").exists());
    }

    #[test]
    fn fetch_failure_is_reported_and_state_kept() {
        let (_temp, paths, config) = setup();
        let mut api = MockCms::default();
        api.failing.insert(
            NEWS_URL.to_string(),
            crate::client::FetchError::RetriesExhausted {
                url: NEWS_URL.to_string(),
                attempts: 6,
                last: "HTTP 503".to_string(),
            },
        );
        api.pages.insert(TOOLS_URL.to_string(), page(vec![item(3, &body(3))]));

        let report = run_once(&paths, &config, &mut api, &SyncOptions::default()).expect("run");
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("news/europe"));
        assert_eq!(report.updated_keys, vec!["tools/calculators"]);

        let state = load_last_update(&paths.last_update_path).expect("state");
        assert_eq!(state.last_seen(ContentKind::News, "europe"), 0);
        assert_eq!(state.last_seen(ContentKind::Tools, "calculators"), 3);
    }

    #[test]
    fn keyless_fallback_and_gap_records_stay_out_of_the_region() {
        let (_temp, paths, config) = setup();
        let mut api = MockCms::default();
        api.pages.insert(
            NEWS_URL.to_string(),
            page(vec![news_item(10), news_item(12)]),
        );
        api.items.insert(
            "https://cms/custom/v1/news/11".to_string(),
            item(11, &body(11)),
        );
        let mut generic = item(99, &body(99));
        generic["status"] = json!("publish");
        let mut tagged = news_item(50);
        tagged["status"] = json!("publish");
        api.pages.insert(
            "https://cms/wp/v2/posts".to_string(),
            page(vec![generic, tagged]),
        );

        let options = SyncOptions {
            kind: Some(ContentKind::News),
            ..SyncOptions::default()
        };
        let report = run_once(&paths, &config, &mut api, &options).expect("run");

        assert!(report.success, "{:?}", report.errors);
        assert_eq!(report.generated, 3);
        assert!(paths.site_dir.join("news/europe/50.html").is_file());
        assert!(!paths.site_dir.join("news/europe/11.html").exists());
        assert!(!paths.site_dir.join("news/europe/99.html").exists());

        let state = load_last_update(&paths.last_update_path).expect("state");
        assert_eq!(state.last_seen(ContentKind::News, "europe"), 12);
    }

    #[test]
    fn fallback_ids_do_not_hide_newer_region_items() {
        let (_temp, paths, config) = setup();
        let mut api = MockCms::default();
        api.pages.insert(NEWS_URL.to_string(), page(vec![news_item(10)]));
        api.pages.insert(
            "https://cms/wp/v2/posts".to_string(),
            page(vec![item(99, &body(99))]),
        );
        let options = SyncOptions {
            kind: Some(ContentKind::News),
            ..SyncOptions::default()
        };
        run_once(&paths, &config, &mut api, &options).expect("first run");

        api.pages.insert(
            NEWS_URL.to_string(),
            page(vec![news_item(10), news_item(20)]),
        );
        let report = run_once(&paths, &config, &mut api, &options).expect("second run");
        assert_eq!(report.updated_keys, vec!["news/europe"]);
        assert!(paths.site_dir.join("news/europe/20.html").is_file());
        let state = load_last_update(&paths.last_update_path).expect("state");
        assert_eq!(state.last_seen(ContentKind::News, "europe"), 20);
    }

    #[test]
    fn failing_page_is_refetched_and_fixed() {
        let (_temp, paths, config) = setup();
        let mut api = MockCms::default();
        let mut broken = news_item(10);
        broken["content"] = json!({"rendered": format!("{} undefined", body(10))});
        api.pages.insert(NEWS_URL.to_string(), page(vec![broken]));
        let mut clean = item(10, &body(10));
        clean["status"] = json!("publish");
        api.items
            .insert("https://cms/wp/v2/posts/10".to_string(), clean);

        let options = SyncOptions {
            kind: Some(ContentKind::News),
            ..SyncOptions::default()
        };
        let report = run_once(&paths, &config, &mut api, &options).expect("run");

        assert!(report.success, "{:?}", report.errors);
        assert_eq!(report.verification_failures, 1);
        assert_eq!(report.fixed, 1);
        assert!(report.unfixed_pages.is_empty());
        assert!(report.phases.contains(&RunPhase::Fixing));
        assert!(api
            .item_requests
            .contains(&"https://cms/wp/v2/posts/10".to_string()));
        let html = fs::read_to_string(paths.site_dir.join("news/europe/10.html")).expect("page");
        assert!(!html.contains("undefined"));
        let state = load_last_update(&paths.last_update_path).expect("state");
        assert_eq!(state.last_seen(ContentKind::News, "europe"), 10);
    }

    #[test]
    fn page_that_stays_broken_is_listed_without_failing_the_run() {
        let (_temp, paths, config) = setup();
        let template = crate::runtime::embedded_page_template()
            .replace("<footer", "<div")
            .replace("</footer>", "</div>");
        fs::write(paths.page_template_path(), template).expect("write template");
        let mut api = MockCms::default();
        api.pages.insert(NEWS_URL.to_string(), page(vec![news_item(10)]));

        let options = SyncOptions {
            kind: Some(ContentKind::News),
            ..SyncOptions::default()
        };
        let report = run_once(&paths, &config, &mut api, &options).expect("run");

        assert!(report.success, "{:?}", report.errors);
        assert_eq!(report.verification_failures, 1);
        assert_eq!(report.fixed, 0);
        assert_eq!(report.unfixed_pages.len(), 1);
        assert!(report.unfixed_pages[0].ends_with("10.html"));
        assert_eq!(
            report.phases[report.phases.len() - 2..],
            [RunPhase::Fixing, RunPhase::Idle]
        );
    }

    #[test]
    fn failed_records_are_skipped_and_dry_run_writes_nothing() {
        let (_temp, paths, config) = setup();
        let mut api = MockCms::default();
        let mut empty = news_item(5);
        empty["content"] = json!({"rendered": ""});
        api.pages.insert(NEWS_URL.to_string(), page(vec![empty, news_item(6)]));

        let options = SyncOptions {
            kind: Some(ContentKind::News),
            target: Some("europe".to_string()),
            dry_run: true,
            ..SyncOptions::default()
        };
        let report = run_once(&paths, &config, &mut api, &options).expect("run");
        assert_eq!(report.skipped, 1);
        assert_eq!(report.generated, 1);
        assert!(!paths.site_dir.join("news/europe/6.html").exists());
        assert!(!paths.last_update_path.exists());
    }

    #[test]
    fn unchanged_content_is_not_rewritten_on_force_free_rerun() {
        let (_temp, paths, config) = setup();
        let mut api = MockCms::default();
        api.pages.insert(NEWS_URL.to_string(), page(vec![news_item(7)]));
        let options = SyncOptions {
            kind: Some(ContentKind::News),
            ..SyncOptions::default()
        };
        run_once(&paths, &config, &mut api, &options).expect("first run");

        reset_last_seen(&paths, ContentKind::News, "europe", 0).expect("reset");
        let report = run_once(&paths, &config, &mut api, &options).expect("second run");
        assert_eq!(report.generated, 0);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn unknown_target_and_guides_sync_are_rejected() {
        let (_temp, paths, config) = setup();
        let mut api = MockCms::default();
        let unknown = SyncOptions {
            target: Some("antarctica".to_string()),
            ..SyncOptions::default()
        };
        assert!(run_once(&paths, &config, &mut api, &unknown).is_err());
        let guides = SyncOptions {
            kind: Some(ContentKind::Guides),
            ..SyncOptions::default()
        };
        assert!(run_once(&paths, &config, &mut api, &guides).is_err());
    }

    #[test]
    fn reset_last_seen_can_lower_the_value() {
        let (_temp, paths, _config) = setup();
        reset_last_seen(&paths, ContentKind::Tools, "calculators", 40).expect("set");
        let previous = reset_last_seen(&paths, ContentKind::Tools, "calculators", 5).expect("lower");
        assert_eq!(previous, Some(40));
        let state = load_last_update(&paths.last_update_path).expect("state");
        assert_eq!(state.last_seen(ContentKind::Tools, "calculators"), 5);
    }

    #[test]
    fn build_local_renders_markdown_and_updates_widgets() {
        let (_temp, paths, config) = setup();
        fs::write(
            paths.news_md_dir.join("strike-update.md"),
            format!("---\ntitle: Strike update\ndate: 2025-03-02\nregion: europe\n---\n{}", body(1)),
        )
        .expect("write news source");
        fs::write(
            paths.guides_md_dir.join("incoterms.md"),
            format!("---\ntitle: Incoterms\ncategories: [documents]\n---\n{}", body(2)),
        )
        .expect("write guide source");

        let mut api = MockCms::default();
        api.pages.insert(
            TOOLS_URL.to_string(),
            page(vec![item(9, &body(9))]),
        );
        run_once(
            &paths,
            &config,
            &mut api,
            &SyncOptions {
                kind: Some(ContentKind::Tools),
                ..SyncOptions::default()
            },
        )
        .expect("sync tools");

        let news = build_local(&paths, &config, ContentKind::News, None).expect("build news");
        assert_eq!(news.generated, 1);
        assert!(news.errors.is_empty(), "{:?}", news.errors);
        let landing = fs::read_to_string(paths.site_dir.join("news/europe/index.html")).expect("landing");
        assert!(landing.contains("Strike update"));
        assert!(landing.contains("/tools/calculators/9.html"));

        let guides = build_local(&paths, &config, ContentKind::Guides, None).expect("build guides");
        assert_eq!(guides.generated, 1);
        assert!(paths.site_dir.join("guides/documents/incoterms.html").is_file());

        let again = build_local(&paths, &config, ContentKind::Guides, None).expect("rebuild guides");
        assert_eq!(again.skipped, 1);

        let regenerated = regenerate(&paths, &config, None, None).expect("regenerate");
        assert!(regenerated.errors.is_empty(), "{:?}", regenerated.errors);
        assert!(regenerated
            .indexes
            .contains(&paths.site_dir.join("guides/documents/index.html")));
        assert_eq!(regenerated.widgets_updated, 1);

        let verification = verify_all(&paths).expect("verify");
        assert_eq!(verification.checked, 3);
        assert!(verification.is_ok(), "{:?}", verification.failures);
    }
}
