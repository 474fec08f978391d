//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use memforge_artifacts::{ArtifactStore, DEFAULT_PREVIEW_LINES};
use memforge_core::{Pipeline, PipelineRun, PipelineState, ProgressReporter};
use memforge_shared::{
    AppConfig, ArtifactId, DecodePolicy, MemforgeError, RunId, UploadBatch, UploadFile,
    init_config, load_config, load_config_from,
};
use memforge_storage::ScratchStore;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// memforge — turn raw text into training datasets.
#[derive(Parser)]
#[command(
    name = "memforge",
    version,
    about = "Turn uploaded text files into a smart JSONL dataset and a fine-tune dataset.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.memforge/memforge.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Scratch directory holding uploads and artifacts.
    #[arg(long, env = "UPLOAD_DIR", global = true)]
    pub scratch_dir: Option<PathBuf>,

    /// Interpreter used to run the stage scripts.
    #[arg(long, env = "PYTHON_PATH", global = true)]
    pub python: Option<String>,

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
    /// Run files through both stages and print the download links.
    Process {
        /// Text files to upload, combined in the order given.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Replace invalid UTF-8 instead of rejecting the batch.
        #[arg(long)]
        lossy: bool,
    },

    /// Fetch an artifact by id or download path.
    Download {
        /// `<run-id>/<file>` or `/api/download/<run-id>/<file>`.
        id: String,

        /// Write to this file instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show the first records of an artifact.
    Preview {
        /// `<run-id>/<file>` or `/api/download/<run-id>/<file>`.
        id: String,

        /// Number of records to show.
        #[arg(short, long, default_value_t = DEFAULT_PREVIEW_LINES)]
        lines: usize,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
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

/// Initialize tracing based on CLI flags. Logs go to stderr; stdout carries
/// command output (download links, artifact bytes).
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "memforge=info",
        1 => "memforge=debug",
        _ => "memforge=trace",
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
    let config = resolve_config(&cli)?;

    match cli.command {
        Command::Process { files, lossy } => cmd_process(config, &files, lossy).await,
        Command::Download { id, out } => cmd_download(&config, &id, out.as_deref()).await,
        Command::Preview { id, lines } => cmd_preview(&config, &id, lines).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

/// Config file (or defaults), then flag/env overrides on top.
fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    apply_overrides(&mut config, cli);
    Ok(config)
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(dir) = &cli.scratch_dir {
        config.scratch.root = dir.to_string_lossy().into_owned();
    }
    if let Some(python) = &cli.python {
        config.stages.python = python.clone();
    }
}

fn open_store(config: &AppConfig) -> Result<ScratchStore> {
    ScratchStore::open(&config.scratch.root)
        .wrap_err_with(|| format!("cannot open scratch directory '{}'", config.scratch.root))
}

fn parse_artifact_id(raw: &str) -> Result<ArtifactId> {
    Ok(raw.parse::<ArtifactId>()?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_process(mut config: AppConfig, files: &[PathBuf], lossy: bool) -> Result<()> {
    if lossy {
        config.intake.decode = DecodePolicy::Lossy;
    }

    let mut uploads = Vec::with_capacity(files.len());
    for path in files {
        let content = tokio::fs::read(path)
            .await
            .wrap_err_with(|| format!("cannot read '{}'", path.display()))?;
        uploads.push(UploadFile::new(upload_name(path), content));
    }
    let batch = UploadBatch::new(uploads)?;

    let store = open_store(&config)?;
    let pipeline = Pipeline::from_config(store, &config);

    info!(
        files = batch.len(),
        bytes = batch.total_bytes(),
        python = %config.stages.python,
        "processing upload batch"
    );

    let reporter = CliProgress::new();
    let run = pipeline.process(&batch, &reporter).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&run.artifacts.download_links())?
    );
    Ok(())
}

fn upload_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn cmd_download(config: &AppConfig, raw_id: &str, out: Option<&Path>) -> Result<()> {
    let id = parse_artifact_id(raw_id)?;
    let artifacts = ArtifactStore::new(open_store(config)?);

    let stream = match artifacts.retrieve(&id).await {
        Ok(stream) => stream,
        Err(MemforgeError::NotFound { .. }) => return Err(eyre!("File not found: {id}")),
        Err(e) => return Err(e.into()),
    };

    let size = stream.len();
    let mut reader = stream.into_reader();

    match out {
        Some(path) => {
            let mut file = tokio::fs::File::create(path)
                .await
                .wrap_err_with(|| format!("cannot create '{}'", path.display()))?;
            tokio::io::copy(&mut reader, &mut file).await?;
            info!(artifact = %id, path = %path.display(), size, "artifact saved");
        }
        None => {
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout).await?;
        }
    }

    Ok(())
}

async fn cmd_preview(config: &AppConfig, raw_id: &str, lines: usize) -> Result<()> {
    let id = parse_artifact_id(raw_id)?;
    let artifacts = ArtifactStore::new(open_store(config)?);

    let records = match artifacts.preview(&id, lines).await {
        Ok(records) => records,
        Err(MemforgeError::NotFound { .. }) => return Err(eyre!("File not found: {id}")),
        Err(e) => return Err(e.into()),
    };

    for record in records {
        println!("{record}");
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner on stderr.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn state_changed(&self, run_id: RunId, state: PipelineState) {
        if state.is_terminal() {
            self.spinner.finish_and_clear();
        } else {
            self.spinner.set_message(format!("[{run_id}] {state}"));
        }
    }

    fn done(&self, run: &PipelineRun) {
        self.spinner.finish_and_clear();
        info!(
            run_id = %run.artifacts.run_id,
            elapsed_secs = run.elapsed.as_secs_f64(),
            "run complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_process() {
        let cli = Cli::try_parse_from(["memforge", "process", "a.txt", "b.txt", "--lossy"]).unwrap();
        match cli.command {
            Command::Process { files, lossy } => {
                assert_eq!(files, [PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
                assert!(lossy);
            }
            _ => panic!("expected process"),
        }
    }

    #[test]
    fn process_requires_files() {
        assert!(Cli::try_parse_from(["memforge", "process"]).is_err());
    }

    #[test]
    fn preview_defaults_to_ten_lines() {
        let cli = Cli::try_parse_from(["memforge", "preview", "x/memories.jsonl"]).unwrap();
        match cli.command {
            Command::Preview { lines, .. } => assert_eq!(lines, 10),
            _ => panic!("expected preview"),
        }
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "memforge",
            "--scratch-dir",
            "/tmp/mf-scratch",
            "--python",
            "/opt/venv/bin/python",
            "config",
            "show",
        ])
        .unwrap();

        let mut config = AppConfig::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.scratch.root, "/tmp/mf-scratch");
        assert_eq!(config.stages.python, "/opt/venv/bin/python");
    }

    #[test]
    fn upload_name_is_last_component() {
        assert_eq!(upload_name(Path::new("/data/notes/a.txt")), "a.txt");
    }

    #[test]
    fn artifact_id_accepts_download_path() {
        let run = RunId::new();
        let id = parse_artifact_id(&format!("/api/download/{run}/memories.jsonl")).unwrap();
        assert_eq!(id.run(), run);
        assert_eq!(id.file_name(), "memories.jsonl");
        assert!(parse_artifact_id(&format!("{run}/../secret")).is_err());
    }
}
