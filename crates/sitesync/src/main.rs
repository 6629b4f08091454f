use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use sitesync_core::client::CmsClient;
use sitesync_core::config::load_site_config;
use sitesync_core::driver::{
    SyncOptions, build_local, regenerate, reset_last_seen, run_once, verify_all,
};
use sitesync_core::logging::init_logging;
use sitesync_core::normalize::process_markdown_content;
use sitesync_core::record::ContentKind;
use sitesync_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready_for_sync,
    init_layout, inspect_runtime, resolve_paths,
};
use sitesync_core::state::load_last_update;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(
    name = "sitesync",
    version,
    about = "Sync CMS content and regenerate the static logistics site"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Debug logging (RUST_LOG overrides)")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
    verbose: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            verbose: cli.verbose,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the runtime layout and default config/templates
    Init(InitArgs),
    /// Check the CMS for new content and regenerate affected pages
    Sync(SyncArgs),
    /// Render local Markdown sources (news-md/, guides-md/)
    #[command(name = "build-local")]
    BuildLocal(BuildLocalArgs),
    /// Rebuild index pages from the pages already on disk
    Regenerate(RegenerateArgs),
    /// Check every generated page for rendering problems
    Verify,
    /// Override the last-seen id for one region or category
    #[command(name = "reset-last-seen")]
    ResetLastSeen(ResetLastSeenArgs),
    /// Show runtime layout and last-seen ids
    Status,
    /// Print the normalized HTML for a Markdown or HTML file
    Normalize(NormalizeArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite existing config/template files")]
    force: bool,
    #[arg(long, help = "Skip writing .sitesync/config.toml")]
    no_config: bool,
    #[arg(long, help = "Skip writing templates/page.html and templates/index.html")]
    no_templates: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(value_name = "news|tools")]
    kind: Option<String>,
    #[arg(value_name = "TARGET", help = "Region or category code")]
    target: Option<String>,
    #[arg(long, help = "Regenerate every fetched record, ignoring last-seen ids")]
    force_refresh: bool,
    #[arg(long, help = "Refetch full content for every record")]
    force_full_data: bool,
    #[arg(long, help = "Fetch and plan without writing anything")]
    dry_run: bool,
    #[arg(long, help = "Print the run report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct BuildLocalArgs {
    #[arg(value_name = "news|guides")]
    kind: Option<String>,
    #[arg(value_name = "TARGET")]
    target: Option<String>,
}

#[derive(Debug, Args)]
struct RegenerateArgs {
    #[arg(value_name = "news|tools|guides")]
    kind: Option<String>,
    #[arg(value_name = "TARGET")]
    target: Option<String>,
}

#[derive(Debug, Args)]
struct ResetLastSeenArgs {
    #[arg(value_name = "news|tools")]
    kind: String,
    key: String,
    id: u64,
}

#[derive(Debug, Args)]
struct NormalizeArgs {
    file: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Sync(args)) => run_sync(&runtime, args),
        Some(Commands::BuildLocal(args)) => run_build_local(&runtime, args),
        Some(Commands::Regenerate(args)) => run_regenerate(&runtime, args),
        Some(Commands::Verify) => run_verify(&runtime),
        Some(Commands::ResetLastSeen(args)) => run_reset_last_seen(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Normalize(args)) => run_normalize(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            materialize_templates: !args.no_templates,
            force: args.force,
        },
    )?;
    start_logging(runtime, &paths)?;

    println!("Initialized sitesync runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("site_dir: {}", normalize_path(&paths.site_dir));
    println!("templates_dir: {}", normalize_path(&paths.templates_dir));
    println!("news_md_dir: {}", normalize_path(&paths.news_md_dir));
    println!("guides_md_dir: {}", normalize_path(&paths.guides_md_dir));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("wrote_templates: {}", report.wrote_templates);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_sync(runtime: &RuntimeOptions, args: SyncArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_sync(&paths, &status)?;
    start_logging(runtime, &paths)?;

    let (kind, target) = split_kind_and_target(args.kind, args.target)?;
    let config = load_site_config(&paths.config_path)?;
    config.ensure_cms_configured()?;
    let mut client = CmsClient::from_config(&config)?;

    let options = SyncOptions {
        kind,
        target,
        force_refresh: args.force_refresh,
        force_full_data: args.force_full_data,
        dry_run: args.dry_run,
    };
    let report = run_once(&paths, &config, &mut client, &options)?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode sync report")?
        );
    } else {
        println!("sync");
        println!("project_root: {}", normalize_path(&paths.project_root));
        println!("dry_run: {}", report.dry_run);
        println!("checked: {}", report.checked);
        println!(
            "updated_keys: {}",
            if report.updated_keys.is_empty() {
                "<none>".to_string()
            } else {
                report.updated_keys.join(", ")
            }
        );
        println!("generated: {}", report.generated);
        println!("skipped: {}", report.skipped);
        println!("verification_failures: {}", report.verification_failures);
        println!("fixed: {}", report.fixed);
        println!("requests: {}", report.request_count);
        print_list("unfixed_pages", &report.unfixed_pages);
        print_list("errors", &report.errors);
        print_diagnostics(runtime, &paths);
    }

    if !report.success {
        bail!("sync finished with {} error(s)", report.errors.len());
    }
    Ok(())
}

fn run_build_local(runtime: &RuntimeOptions, args: BuildLocalArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_sync(&paths, &status)?;
    start_logging(runtime, &paths)?;
    let config = load_site_config(&paths.config_path)?;

    let kinds = match args.kind.as_deref() {
        Some(kind) => vec![ContentKind::parse(kind)?],
        None => vec![ContentKind::News, ContentKind::Guides],
    };
    let mut failed = 0;
    for kind in kinds {
        let report = build_local(&paths, &config, kind, args.target.as_deref())?;
        println!("build-local {kind}");
        println!("documents: {}", report.documents);
        println!("generated: {}", report.generated);
        println!("skipped: {}", report.skipped);
        println!("indexes: {}", report.indexes);
        print_list("errors", &report.errors);
        failed += report.errors.len();
    }
    print_diagnostics(runtime, &paths);
    if failed > 0 {
        bail!("build-local finished with {failed} error(s)");
    }
    Ok(())
}

fn run_regenerate(runtime: &RuntimeOptions, args: RegenerateArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_sync(&paths, &status)?;
    start_logging(runtime, &paths)?;
    let config = load_site_config(&paths.config_path)?;

    let kind = args.kind.as_deref().map(ContentKind::parse).transpose()?;
    let report = regenerate(&paths, &config, kind, args.target.as_deref())?;

    println!("regenerate");
    println!("indexes: {}", report.indexes.len());
    for index in &report.indexes {
        println!("  - {}", normalize_path(index));
    }
    println!("entries: {}", report.entries);
    println!("widgets_updated: {}", report.widgets_updated);
    print_list("errors", &report.errors);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_verify(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    start_logging(runtime, &paths)?;
    let report = verify_all(&paths)?;

    println!("verify");
    println!("site_dir: {}", normalize_path(&paths.site_dir));
    println!("checked: {}", report.checked);
    println!("passed: {}", report.passed);
    println!("failed: {}", report.failures.len());
    for failure in &report.failures {
        println!("  - {}", normalize_path(&failure.path));
        for problem in &failure.problems {
            println!("      {problem}");
        }
    }
    print_diagnostics(runtime, &paths);
    if !report.is_ok() {
        bail!("{} page(s) failed verification", report.failures.len());
    }
    Ok(())
}

fn run_reset_last_seen(runtime: &RuntimeOptions, args: ResetLastSeenArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    start_logging(runtime, &paths)?;
    let kind = ContentKind::parse(&args.kind)?;
    let previous = reset_last_seen(&paths, kind, &args.key, args.id)?;

    println!("reset-last-seen");
    println!("key: {kind}/{}", args.key);
    println!(
        "previous: {}",
        previous
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<unset>".to_string())
    );
    println!("now: {}", args.id);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    start_logging(runtime, &paths)?;
    let status = inspect_runtime(&paths)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("project_root_exists: {}", format_flag(status.project_root_exists));
    println!("site_exists: {}", format_flag(status.site_exists));
    println!("templates_exists: {}", format_flag(status.templates_exists));
    println!("page_template_exists: {}", format_flag(status.page_template_exists));
    println!("index_template_exists: {}", format_flag(status.index_template_exists));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("last_update_exists: {}", format_flag(status.last_update_exists));

    let state = load_last_update(&paths.last_update_path)?;
    println!("last_seen:");
    for (kind, map) in [(ContentKind::News, &state.news), (ContentKind::Tools, &state.tools)] {
        if map.is_empty() {
            println!("  {kind}: <none>");
            continue;
        }
        for (key, id) in map {
            println!("  {kind}/{key}: {id}");
        }
    }
    print_list("warnings", &status.warnings);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_normalize(runtime: &RuntimeOptions, args: NormalizeArgs) -> Result<()> {
    init_logging(None, runtime.verbose)?;
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    println!("{}", process_markdown_content(&raw));
    Ok(())
}

/// `sync europe` reads as a target, not an unknown kind.
fn split_kind_and_target(
    kind: Option<String>,
    target: Option<String>,
) -> Result<(Option<ContentKind>, Option<String>)> {
    match (kind, target) {
        (None, target) => Ok((None, target)),
        (Some(kind), Some(target)) => Ok((Some(ContentKind::parse(&kind)?), Some(target))),
        (Some(kind), None) => match ContentKind::parse(&kind) {
            Ok(parsed) => Ok((Some(parsed), None)),
            Err(_) => Ok((None, Some(kind))),
        },
    }
}

/// File logging only once the state directory exists, so read-only commands
/// never create `.sitesync/` as a side effect.
fn start_logging(runtime: &RuntimeOptions, paths: &ResolvedPaths) -> Result<()> {
    let logs_dir = paths.state_dir.exists().then_some(paths.logs_dir.as_path());
    if let Some(log_path) = init_logging(logs_dir, runtime.verbose)? {
        debug!(log = %log_path.display(), "logging to file");
    }
    Ok(())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn print_list(label: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("{label}:");
    for item in items {
        println!("  - {item}");
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_sync_flags() {
        let cli = Cli::try_parse_from([
            "sitesync",
            "--project-root",
            "/srv/site",
            "sync",
            "news",
            "europe",
            "--force-refresh",
            "--json",
        ])
        .expect("parse");
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync command");
        };
        assert_eq!(args.kind.as_deref(), Some("news"));
        assert_eq!(args.target.as_deref(), Some("europe"));
        assert!(args.force_refresh);
        assert!(args.json);
        assert_eq!(cli.project_root, Some(PathBuf::from("/srv/site")));
    }

    #[test]
    fn lone_positional_is_kind_or_target() {
        let (kind, target) = split_kind_and_target(Some("tools".to_string()), None).expect("split");
        assert_eq!(kind, Some(ContentKind::Tools));
        assert_eq!(target, None);

        let (kind, target) = split_kind_and_target(Some("europe".to_string()), None).expect("split");
        assert_eq!(kind, None);
        assert_eq!(target.as_deref(), Some("europe"));

        assert!(split_kind_and_target(Some("blog".to_string()), Some("x".to_string())).is_err());
    }

    #[test]
    fn reset_last_seen_requires_numeric_id() {
        assert!(Cli::try_parse_from(["sitesync", "reset-last-seen", "news", "europe", "abc"]).is_err());
        let cli = Cli::try_parse_from(["sitesync", "reset-last-seen", "news", "europe", "12"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Some(Commands::ResetLastSeen(ResetLastSeenArgs { id: 12, .. }))
        ));
    }
}
