use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

const EMBEDDED_PAGE_TEMPLATE: &str = include_str!("../../../config/default-page-template.html");
const EMBEDDED_INDEX_TEMPLATE: &str = include_str!("../../../config/default-index-template.html");

pub const STATE_DIR_NAME: &str = ".sitesync";
pub const PAGE_TEMPLATE_FILENAME: &str = "page.html";
pub const INDEX_TEMPLATE_FILENAME: &str = "index.html";
pub const LAST_UPDATE_FILENAME: &str = "last-update.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub site_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub news_md_dir: PathBuf,
    pub guides_md_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub config_path: PathBuf,
    pub last_update_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    /// Layout rooted at `project_root` with every path at its default location.
    pub fn for_project_root(project_root: &Path) -> Self {
        let state_dir = project_root.join(STATE_DIR_NAME);
        Self {
            project_root: project_root.to_path_buf(),
            site_dir: project_root.join("site"),
            templates_dir: project_root.join("templates"),
            news_md_dir: project_root.join("news-md"),
            guides_md_dir: project_root.join("guides-md"),
            logs_dir: state_dir.join("logs"),
            config_path: state_dir.join("config.toml"),
            last_update_path: state_dir.join(LAST_UPDATE_FILENAME),
            state_dir,
            root_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }

    pub fn page_template_path(&self) -> PathBuf {
        self.templates_dir.join(PAGE_TEMPLATE_FILENAME)
    }

    pub fn index_template_path(&self) -> PathBuf {
        self.templates_dir.join(INDEX_TEMPLATE_FILENAME)
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nsite_dir={}\ntemplates_dir={}\nnews_md_dir={}\nguides_md_dir={}\nstate_dir={}\nlogs_dir={}\nconfig_path={} ({})\nlast_update_path={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.site_dir),
            normalize_for_display(&self.templates_dir),
            normalize_for_display(&self.news_md_dir),
            normalize_for_display(&self.guides_md_dir),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.logs_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.last_update_path),
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub site_exists: bool,
    pub templates_exists: bool,
    pub page_template_exists: bool,
    pub index_template_exists: bool,
    pub state_dir_exists: bool,
    pub config_exists: bool,
    pub last_update_exists: bool,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let page_template_exists = paths.page_template_path().exists();
    let index_template_exists = paths.index_template_path().exists();
    let state_dir_exists = paths.state_dir.exists();
    let site_exists = paths.site_dir.exists();

    let mut warnings = Vec::new();
    if !page_template_exists || !index_template_exists {
        warnings.push(
            "templates/page.html or templates/index.html is missing; run `sitesync init` to materialize defaults"
                .to_string(),
        );
    }
    if !site_exists {
        warnings.push("site/ is missing; run `sitesync init` before sync commands".to_string());
    }
    if !state_dir_exists {
        warnings.push(".sitesync/ is missing; run `sitesync init` before sync commands".to_string());
    }

    Ok(RuntimeStatus {
        project_root_exists: paths.project_root.exists(),
        site_exists,
        templates_exists: paths.templates_dir.exists(),
        page_template_exists,
        index_template_exists,
        state_dir_exists,
        config_exists: paths.config_path.exists(),
        last_update_exists: paths.last_update_path.exists(),
        warnings,
    })
}

pub fn ensure_runtime_ready_for_sync(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if !status.site_exists || !status.state_dir_exists {
        bail!(
            "Runtime layout is not initialized for sync.\nMissing required paths:\n  - {}\n  - {}\nRun: sitesync init --project-root {}",
            if status.site_exists {
                "site/ (ok)"
            } else {
                "site/ (missing)"
            },
            if status.state_dir_exists {
                ".sitesync/ (ok)"
            } else {
                ".sitesync/ (missing)"
            },
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub materialize_templates: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            materialize_templates: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
    pub wrote_templates: usize,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;
    let mut paths = ResolvedPaths::for_project_root(&project_root);
    paths.root_source = root_source;

    if let Some(path) = overrides.config.as_deref() {
        paths.config_path = absolutize(path, &project_root);
        paths.config_source = ValueSource::Flag;
    } else if let Some(value) = lookup_env("SITESYNC_CONFIG")
        && !value.trim().is_empty()
    {
        paths.config_path = absolutize(Path::new(value.trim()), &project_root);
        paths.config_source = ValueSource::Env;
    }

    Ok(paths)
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let required_dirs = [
        paths.site_dir.clone(),
        paths.templates_dir.clone(),
        paths.news_md_dir.clone(),
        paths.guides_md_dir.clone(),
        paths.state_dir.clone(),
        paths.logs_dir.clone(),
    ];
    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(
            &paths.config_path,
            &render_materialized_config(paths),
            options.force,
        )?
    } else {
        false
    };

    let mut wrote_templates = 0;
    if options.materialize_templates {
        if write_text_file(
            &paths.page_template_path(),
            EMBEDDED_PAGE_TEMPLATE,
            options.force,
        )? {
            wrote_templates += 1;
        }
        if write_text_file(
            &paths.index_template_path(),
            EMBEDDED_INDEX_TEMPLATE,
            options.force,
        )? {
            wrote_templates += 1;
        }
    }

    Ok(InitReport {
        created_dirs,
        wrote_config,
        wrote_templates,
    })
}

pub fn embedded_page_template() -> &'static str {
    EMBEDDED_PAGE_TEMPLATE
}

pub fn embedded_index_template() -> &'static str {
    EMBEDDED_INDEX_TEMPLATE
}

pub fn render_materialized_config(paths: &ResolvedPaths) -> String {
    let site_dir = normalize_for_display(&paths.site_dir);
    format!(
        "# sitesync runtime configuration (materialized by `sitesync init`)\n# Output directory: {site_dir}\n\n[cms]\n# base_url = \"https://cms.example.com/wp-json\"\n# user_agent = \"sitesync/0.1\"\n# news_endpoint = \"{{base}}/custom/v1/news?region={{key}}\"\n# tools_endpoint = \"{{base}}/custom/v1/tools?category={{key}}\"\n# post_by_id_endpoint = \"{{base}}/wp/v2/posts/{{id}}\"\n# news_by_id_endpoint = \"{{base}}/custom/v1/news/{{id}}\"\n# tool_by_id_endpoint = \"{{base}}/custom/v1/tools/{{id}}\"\n# fallback_endpoint = \"{{base}}/wp/v2/posts\"\n\n[http]\ntimeout_ms = 60000\nmax_retries = 5\nretry_delay_ms = 3000\nper_page = 100\nmax_gap_fill = 50\n\n# Omit [[regions]] / [[categories]] to use the built-in lists.\n# [[regions]]\n# code = \"europe\"\n# name = \"Europe\"\n#\n# [[categories]]\n# code = \"calculators\"\n# name = \"Calculators\"\n",
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }

    if let Some(value) = lookup_env("SITESYNC_PROJECT_ROOT")
        && !value.trim().is_empty()
    {
        return Ok((
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        ));
    }

    Ok(detect_project_root_heuristic(
        &context.cwd,
        context.executable_dir.as_deref(),
    ))
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> (PathBuf, ValueSource) {
    let mut seen = HashSet::new();
    for candidate in candidate_roots(cwd, executable_dir) {
        let key = normalize_for_display(&candidate);
        if !seen.insert(key) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).exists() {
            return (candidate, ValueSource::Heuristic);
        }
    }
    (cwd.to_path_buf(), ValueSource::Default)
}

fn candidate_roots(cwd: &Path, executable_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = cwd.ancestors().map(Path::to_path_buf).collect();
    if let Some(exe_dir) = executable_dir {
        out.extend(exe_dir.ancestors().map(Path::to_path_buf));
    }
    out
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, ValueSource, ensure_runtime_ready_for_sync,
        init_layout, inspect_runtime, resolve_paths_with_lookup,
    };

    fn context_for(cwd: &std::path::Path) -> ResolutionContext {
        ResolutionContext {
            cwd: cwd.to_path_buf(),
            executable_dir: None,
        }
    }

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let env = HashMap::from([(
            "SITESYNC_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved =
            resolve_paths_with_lookup(&context_for(&cwd), &overrides, |key| env.get(key).cloned())
                .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(resolved.site_dir, from_flag.join("site"));
    }

    #[test]
    fn resolve_paths_detects_initialized_ancestor() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("site").join("news");
        fs::create_dir_all(root.join(".sitesync")).expect("state dir");
        fs::create_dir_all(&nested).expect("nested");

        let resolved =
            resolve_paths_with_lookup(&context_for(&nested), &PathOverrides::default(), |_| None)
                .expect("resolve");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn config_env_override_is_relative_to_project_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let env = HashMap::from([("SITESYNC_CONFIG".to_string(), "alt.toml".to_string())]);
        let resolved =
            resolve_paths_with_lookup(&context_for(&root), &overrides, |key| env.get(key).cloned())
                .expect("resolve");
        assert_eq!(resolved.config_path, root.join("alt.toml"));
        assert_eq!(resolved.config_source, ValueSource::Env);
    }

    #[test]
    fn init_layout_creates_expected_dirs_and_files() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths =
            resolve_paths_with_lookup(&context_for(&root), &overrides, |_| None).expect("resolve");

        let report = init_layout(&paths, &InitOptions::default()).expect("init");

        assert!(!report.created_dirs.is_empty());
        assert!(report.wrote_config);
        assert_eq!(report.wrote_templates, 2);
        assert!(paths.site_dir.exists());
        assert!(paths.news_md_dir.exists());
        assert!(paths.logs_dir.exists());
        assert!(paths.page_template_path().exists());
        assert!(paths.index_template_path().exists());

        let config = crate::config::load_config(&paths.config_path).expect("materialized config parses");
        assert_eq!(config.http.max_retries, Some(5));

        let again = init_layout(&paths, &InitOptions::default()).expect("init again");
        assert!(again.created_dirs.is_empty());
        assert!(!again.wrote_config);
        assert_eq!(again.wrote_templates, 0);
    }

    #[test]
    fn sync_readiness_fails_without_init() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths =
            resolve_paths_with_lookup(&context_for(&root), &overrides, |_| None).expect("resolve");
        let status = inspect_runtime(&paths).expect("inspect");
        assert!(!status.warnings.is_empty());
        let err = ensure_runtime_ready_for_sync(&paths, &status).expect_err("must fail");
        assert!(
            err.to_string()
                .contains("Runtime layout is not initialized for sync")
        );
    }
}
