//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use site2docs_core::pipeline::{BuildConfig, BuildResult, ProgressReporter, build_documents};
use site2docs_renderer::{ChromiumBrowser, SnapshotBrowser};
use site2docs_shared::{
    AppConfig, RenderConfig, SmallClusterPolicy, init_config, load_config, load_config_from,
    validate_config,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// site2docs: turn archived HTML snapshots into clustered Markdown documents.
#[derive(Parser)]
#[command(
    name = "site2docs",
    version,
    about = "Turn archived HTML snapshots into clustered Markdown documents.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Render, cluster and write documents for a directory of snapshots.
    Build(BuildArgs),

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Flags for `site2docs build`. Each one overrides the config file.
#[derive(clap::Args, Debug)]
pub(crate) struct BuildArgs {
    /// Directory of archived HTML snapshots.
    #[arg(long)]
    pub input: PathBuf,

    /// Output directory for docs/, manifest.json and logs/.
    #[arg(long)]
    pub out: PathBuf,

    /// Config file (defaults to ~/.site2docs/site2docs.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Extra expand trigger phrases, comma-separated. Merged with the defaults.
    #[arg(long, value_delimiter = ',')]
    pub expand_texts: Vec<String>,

    /// Concurrent browser sessions (auto-derived when omitted).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub render_concurrency: Option<u64>,

    /// Use raw on-disk markup when rendering fails twice instead of aborting.
    #[arg(long)]
    pub allow_render_fallback: bool,

    /// Smallest cluster kept on its own.
    #[arg(long)]
    pub min_cluster_size: Option<usize>,

    /// Keep undersized clusters instead of merging them.
    #[arg(long)]
    pub keep_small_clusters: bool,

    /// Pages shorter than this are reported by the quality check.
    #[arg(long)]
    pub min_page_chars: Option<usize>,

    /// Skip the quality check and its report.
    #[arg(long)]
    pub no_quality_check: bool,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr; stdout carries the run summary.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "site2docs=info",
        1 => "site2docs=debug",
        _ => "site2docs=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Build(args) => cmd_build(args).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// build
// ---------------------------------------------------------------------------

async fn cmd_build(args: BuildArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    apply_overrides(&mut config, &args)?;
    validate_config(&config)?;
    check_paths(&args.input, &args.out)?;

    let mut render = RenderConfig::from(&config);
    render.add_expand_texts(&args.expand_texts);

    let build_config = BuildConfig {
        input_dir: args.input.clone(),
        output_dir: args.out.clone(),
        render: render.clone(),
        extract: config.extract.clone(),
        graph: config.graph.clone(),
        quality: config.quality.clone(),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    info!(
        input = %args.input.display(),
        out = %args.out.display(),
        allow_fallback = render.allow_fallback,
        "building documents"
    );

    let browser = Arc::new(ChromiumBrowser::launch(&render).await?);
    let reporter = Arc::new(CliProgress::new());
    let outcome = build_documents(
        &build_config,
        Arc::clone(&browser) as Arc<dyn SnapshotBrowser>,
        reporter.clone(),
    )
    .await;
    reporter.clear();

    match Arc::try_unwrap(browser) {
        Ok(browser) => {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "failed to shut down browser cleanly");
            }
        }
        Err(_) => warn!("browser still in use; leaving it to exit with the process"),
    }

    let result = outcome?;
    println!("{}", summary_json(&result));
    Ok(())
}

/// Fold command-line flags into the loaded config.
fn apply_overrides(config: &mut AppConfig, args: &BuildArgs) -> Result<()> {
    if let Some(n) = args.render_concurrency {
        let n = usize::try_from(n).map_err(|_| eyre!("--render-concurrency is too large"))?;
        config.render.concurrency = Some(n);
    }
    if args.allow_render_fallback {
        config.render.allow_fallback = true;
    }
    if let Some(n) = args.min_cluster_size {
        config.graph.min_cluster_size = n;
    }
    if args.keep_small_clusters {
        config.graph.small_cluster_policy = SmallClusterPolicy::Keep;
    }
    if let Some(n) = args.min_page_chars {
        config.quality.min_page_characters = n;
    }
    if args.no_quality_check {
        config.quality.enabled = false;
    }
    Ok(())
}

fn check_paths(input: &Path, out: &Path) -> Result<()> {
    if out.exists() && !out.is_dir() {
        return Err(eyre!(
            "output path '{}' exists and is not a directory",
            out.display()
        ));
    }
    if !input.is_dir() {
        return Err(eyre!(
            "input directory '{}' does not exist or is not a directory",
            input.display()
        ));
    }
    Ok(())
}

/// One-line JSON run summary printed to stdout.
fn summary_json(result: &BuildResult) -> serde_json::Value {
    serde_json::json!({
        "pages": result.pages,
        "clusters": result.clusters,
        "output": result.output_dir.display().to_string(),
        "render_fallback_pages": result.fallback_pages,
        "render_fallback_reasons": result.fallback_reasons,
        "findings": result.findings,
    })
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using indicatif spinners/bars.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn clear(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn page_rendered(&self, file: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Rendering [{current}/{total}] {file}"));
    }

    fn page_extracted(&self, file: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Extracting [{current}/{total}] {file}"));
    }

    fn done(&self, _result: &BuildResult) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn args(extra: &[&str]) -> BuildArgs {
        let mut argv = vec!["site2docs", "build", "--input", "in", "--out", "out"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::Build(args) => args,
            Command::Config { .. } => panic!("expected build"),
        }
    }

    #[test]
    fn flags_override_config() {
        let args = args(&[
            "--render-concurrency",
            "3",
            "--allow-render-fallback",
            "--min-cluster-size",
            "4",
            "--keep-small-clusters",
            "--min-page-chars",
            "50",
            "--no-quality-check",
            "--expand-texts",
            "Open all,Déplier",
        ]);
        let mut config = AppConfig::default();
        apply_overrides(&mut config, &args).unwrap();

        assert_eq!(config.render.concurrency, Some(3));
        assert!(config.render.allow_fallback);
        assert_eq!(config.graph.min_cluster_size, 4);
        assert_eq!(config.graph.small_cluster_policy, SmallClusterPolicy::Keep);
        assert_eq!(config.quality.min_page_characters, 50);
        assert!(!config.quality.enabled);
        assert_eq!(args.expand_texts, vec!["Open all", "Déplier"]);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let parsed = Cli::try_parse_from([
            "site2docs",
            "build",
            "--input",
            "in",
            "--out",
            "out",
            "--render-concurrency",
            "0",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn output_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("out.txt");
        std::fs::write(&file, "x").unwrap();
        let err = check_paths(tmp.path(), &file).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
        assert!(check_paths(tmp.path(), &tmp.path().join("fresh")).is_ok());
    }

    #[test]
    fn summary_has_expected_keys() {
        let result = BuildResult {
            run_id: Default::default(),
            output_dir: PathBuf::from("out"),
            manifest_path: PathBuf::from("out/manifest.json"),
            pages: 2,
            clusters: 1,
            documents: 1,
            fallback_pages: 1,
            fallback_reasons: BTreeMap::from([("render_timeout".to_string(), 1)]),
            findings: None,
            elapsed: std::time::Duration::ZERO,
        };
        let json = summary_json(&result);
        assert_eq!(json["pages"], 2);
        assert_eq!(json["clusters"], 1);
        assert_eq!(json["output"], "out");
        assert_eq!(json["render_fallback_pages"], 1);
        assert_eq!(json["render_fallback_reasons"]["render_timeout"], 1);
        assert!(json["findings"].is_null());
    }
}
