use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use picsift_core::{
    load_discovery_config, load_picsift_config, CancelToken, ConfigBundle, DiscoverOptions,
    DiscoveryError, DiscoveryOrchestrator, DownloadFilter, DownloadResult, PreviewResult,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] picsift_core::ConfigError),
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("nothing selected: pass --select <url> or --all")]
    EmptySelection,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "PicSift command-line discovery interface", long_about = None)]
pub struct Cli {
    /// Path to the main picsift.toml
    #[arg(long, default_value = "configs/picsift.toml")]
    pub config: PathBuf,
    /// Alternative path to discovery.toml
    #[arg(long)]
    pub discovery_config: Option<PathBuf>,
    /// Override for the discovery-logs directory
    #[arg(long)]
    pub logs_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover images for one or more topics and preview the results
    Discover(DiscoverArgs),
    /// Download a selection from a saved preview
    Download(DownloadArgs),
    /// Scrape images from a single page, bypassing search
    Scrape(ScrapeArgs),
    /// Run configuration and directory sanity checks
    Health,
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct DiscoverArgs {
    /// Topic keyword; repeat for multiple topics
    #[arg(long = "topic", required = true)]
    pub topics: Vec<String>,
    /// Maximum images collected per topic
    #[arg(long)]
    pub limit: Option<usize>,
    /// Skip robots.txt checks for result pages
    #[arg(long, default_value_t = false)]
    pub no_robots: bool,
    /// Abort discovery after this many seconds, keeping finished topics
    #[arg(long)]
    pub timeout_seconds: Option<u64>,
    /// Write the preview document to this file for a later download step
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Preview document produced by `discover --out`
    #[arg(long)]
    pub preview: PathBuf,
    /// Image URL to download; repeat for multiple
    #[arg(long = "select")]
    pub selection: Vec<String>,
    /// Download every previewed image
    #[arg(long, default_value_t = false)]
    pub all: bool,
    /// Minimum image width in pixels
    #[arg(long)]
    pub min_width: Option<u32>,
    /// Minimum image height in pixels
    #[arg(long)]
    pub min_height: Option<u32>,
    /// Only download from this host; repeat for multiple
    #[arg(long = "allow-domain")]
    pub allow_domains: Vec<String>,
    /// Never download from this host; repeat for multiple
    #[arg(long = "deny-domain")]
    pub deny_domains: Vec<String>,
    /// Output directory for saved images
    #[arg(long)]
    pub out_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct ScrapeArgs {
    /// Page URL to scrape
    #[arg(long)]
    pub url: String,
    /// Output directory for saved images
    #[arg(long)]
    pub out_dir: PathBuf,
    /// Maximum images to download
    #[arg(long)]
    pub limit: Option<usize>,
    /// Skip robots.txt checks
    #[arg(long, default_value_t = false)]
    pub no_robots: bool,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "picsiftctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Discover(args) => {
            let preview = context.discover(args).await?;
            if let Some(out) = &args.out {
                fs::write(out, serde_json::to_vec_pretty(&preview)?)?;
            }
            render(&preview, cli.format)?;
        }
        Commands::Download(args) => {
            let result = context.download(args).await?;
            render(&result, cli.format)?;
        }
        Commands::Scrape(args) => {
            let result = context.scrape(args).await?;
            render(&result, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions(_) => unreachable!("handled above"),
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    bundle: ConfigBundle,
    config_path: PathBuf,
    discovery_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut picsift = load_picsift_config(&config_path)?;

        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let discovery_path = cli
            .discovery_config
            .clone()
            .unwrap_or_else(|| config_dir.join("discovery.toml"));
        let discovery = load_discovery_config(&discovery_path)?;

        if let Some(logs_dir) = &cli.logs_dir {
            picsift.paths.discovery_logs_dir = logs_dir.display().to_string();
        }

        Ok(Self {
            bundle: ConfigBundle { picsift, discovery },
            config_path,
            discovery_path,
        })
    }

    fn orchestrator(&self) -> Result<DiscoveryOrchestrator> {
        Ok(DiscoveryOrchestrator::from_configs(
            &self.bundle.picsift,
            &self.bundle.discovery,
        )?)
    }

    async fn discover(&self, args: &DiscoverArgs) -> Result<PreviewResult> {
        let orchestrator = self.orchestrator()?;
        let limit = args
            .limit
            .unwrap_or(self.bundle.picsift.limits.default_image_limit);
        let (handle, cancel) = CancelToken::pair();
        if let Some(seconds) = args.timeout_seconds {
            handle.cancel_after(Duration::from_secs(seconds));
        }
        let options = DiscoverOptions {
            respect_robots: !args.no_robots,
            cancel,
        };
        Ok(orchestrator
            .discover_with_options(&args.topics, limit, options)
            .await?)
    }

    async fn download(&self, args: &DownloadArgs) -> Result<DownloadResult> {
        let raw = fs::read(&args.preview).map_err(|_| {
            AppError::MissingResource(format!("preview file {}", args.preview.display()))
        })?;
        let preview: PreviewResult = serde_json::from_slice(&raw)?;

        let selection: HashSet<String> = if args.all {
            preview
                .entries
                .iter()
                .map(|entry| entry.image_url.clone())
                .collect()
        } else {
            args.selection.iter().cloned().collect()
        };
        if selection.is_empty() {
            return Err(AppError::EmptySelection);
        }

        let filter = DownloadFilter {
            min_width: args.min_width,
            min_height: args.min_height,
            allow_domains: args.allow_domains.iter().cloned().collect(),
            deny_domains: args.deny_domains.iter().cloned().collect(),
        };
        let orchestrator = self.orchestrator()?;
        Ok(orchestrator
            .select_and_download(&preview, &selection, &filter, &args.out_dir)
            .await?)
    }

    async fn scrape(&self, args: &ScrapeArgs) -> Result<DownloadResult> {
        let orchestrator = self.orchestrator()?;
        let options = DiscoverOptions {
            respect_robots: !args.no_robots,
            cancel: CancelToken::never(),
        };
        Ok(orchestrator
            .scrape_page(&args.url, &args.out_dir, args.limit, options)
            .await?)
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(self.check_path("picsift.toml", &self.config_path));
        results.push(self.check_path("discovery.toml", &self.discovery_path));
        results.push(self.check_directory(
            "discovery_logs",
            Path::new(&self.bundle.picsift.paths.discovery_logs_dir),
        ));
        results.push(self.check_directory(
            "downloads",
            Path::new(&self.bundle.picsift.paths.downloads_dir),
        ));
        if self.bundle.discovery.providers.order.is_empty() {
            results.push(HealthEntry::error("providers", "no providers configured"));
        } else {
            results.push(HealthEntry::ok(
                "providers",
                self.bundle.discovery.providers.order.join(", "),
            ));
        }
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{} missing", path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(name, format!("{} is not a directory", path.display())),
            Err(_) => HealthEntry::warn(
                name,
                format!("{} not found (created on first run)", path.display()),
            ),
        }
    }
}

impl DisplayFallback for PreviewResult {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Run {} ({}): {} topic(s), {} found, {} after dedup",
            self.run_id,
            self.generated_at.format("%Y-%m-%d %H:%M:%SZ"),
            self.topics.len(),
            self.total_found,
            self.total_after_dedup
        )];
        for summary in &self.summaries {
            lines.push(format!(
                "  {} [{}] {} image(s)",
                summary.topic,
                summary.status.as_str(),
                summary.found
            ));
        }
        for entry in &self.entries {
            lines.push(format!(
                "  [{} {:.2}] {} <- {}",
                entry.relevance_tier, entry.relevance_score, entry.image_url, entry.source_page_url
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for DownloadResult {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Saved {} image(s), {} failed/skipped",
            self.saved.len(),
            self.failed.len()
        )];
        for saved in &self.saved {
            lines.push(format!("  {} -> {}", saved.image_url, saved.path.display()));
        }
        for failed in &self.failed {
            let detail = failed
                .detail
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default();
            lines.push(format!("  skipped {} [{}]{}", failed.url, failed.reason, detail));
        }
        lines.push(format!(
            "Provenance index: {}",
            self.provenance_index_path.display()
        ));
        lines.join("\n")
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| {
                format!(
                    "[{status}] {name}: {detail}",
                    status = entry.status,
                    name = entry.name,
                    detail = entry.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn prepare_test_context() -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let configs_dir = root.join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy("../configs/picsift.toml", configs_dir.join("picsift.toml")).unwrap();
        fs::copy(
            "../configs/discovery.toml",
            configs_dir.join("discovery.toml"),
        )
        .unwrap();

        let logs_dir = root.join("discovery_logs");
        fs::create_dir_all(&logs_dir).unwrap();

        let cli = Cli {
            config: configs_dir.join("picsift.toml"),
            discovery_config: None,
            logs_dir: Some(logs_dir),
            format: OutputFormat::Json,
            command: Commands::Health,
        };
        let context = AppContext::new(&cli)?;
        Ok((temp, context))
    }

    #[test]
    fn context_loads_fixture_configs() {
        let (_temp, context) = prepare_test_context().unwrap();
        assert_eq!(context.bundle.picsift.system.node_name, "picsift-primary");
        assert_eq!(context.bundle.discovery.providers.order.len(), 2);
    }

    #[test]
    fn logs_dir_override_is_applied() {
        let (temp, context) = prepare_test_context().unwrap();
        assert_eq!(
            PathBuf::from(&context.bundle.picsift.paths.discovery_logs_dir),
            temp.path().join("discovery_logs")
        );
    }

    #[test]
    fn health_check_reports_configs_and_providers() {
        let (_temp, context) = prepare_test_context().unwrap();
        let report = context.health_check();
        let configs_ok = report
            .iter()
            .filter(|entry| matches!(entry.status, CheckStatus::Ok))
            .count();
        assert!(configs_ok >= 3, "configs, logs dir and providers should pass");
        assert!(!report
            .iter()
            .any(|entry| matches!(entry.status, CheckStatus::Error)));
    }

    #[test]
    fn orchestrator_builds_from_fixture_configs() {
        let (_temp, context) = prepare_test_context().unwrap();
        assert!(context.orchestrator().is_ok());
    }
}
