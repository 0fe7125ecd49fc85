//! lspcheck: run the code-action conformance scenario against a language
//! server binary.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{error, info, warn};
use url::Url;

use lspcheck::logging::init_tracing;
use lspcheck::side_channel::SERVER_LOG_TARGET;
use lspcheck::{ActionRange, Client, CodeActionScenario, LaunchConfig, Readiness, ScenarioConfig};

/// Where a locally built server usually ends up, relative to the project root.
const SERVER_CANDIDATES: &[&str] = &[
    "server/launcher/target/release/sc_launcher",
    "server/launcher/target/debug/sc_launcher",
    "target/release/sc_launcher",
    "target/debug/sc_launcher",
];

#[derive(Parser, Debug)]
#[command(name = "lspcheck", version, about = "Check code actions of a stdio language server")]
struct Args {
    /// Server binary. Located under the project root if omitted.
    #[arg(long, env = "LSPCHECK_SERVER")]
    server: Option<PathBuf>,

    /// Value passed to the server's --mode flag.
    #[arg(long, env = "LSPCHECK_MODE", default_value = "lsp")]
    mode: String,

    /// Extra argument for the server, after --mode. Repeatable.
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    server_args: Vec<String>,

    /// Root used to locate the server and the document.
    #[arg(long, env = "LSPCHECK_PROJECT_ROOT", default_value = ".")]
    project_root: PathBuf,

    /// Document to open, relative to the project root unless absolute.
    #[arg(long, env = "LSPCHECK_DOCUMENT", default_value = "tests/eval_test.scd")]
    document: PathBuf,

    #[arg(long, env = "LSPCHECK_LANGUAGE_ID", default_value = "supercollider")]
    language_id: String,

    /// Zero-based line to request code actions for.
    #[arg(long, env = "LSPCHECK_LINE", default_value_t = 6)]
    line: u32,

    #[arg(long, env = "LSPCHECK_START_CHARACTER", default_value_t = 0)]
    start_character: u32,

    #[arg(long, env = "LSPCHECK_END_CHARACTER", default_value_t = 20)]
    end_character: u32,

    /// Substring the title of at least one returned action must contain.
    #[arg(long, env = "LSPCHECK_EXPECT_TITLE", default_value = "Evaluate")]
    expect_title: String,

    /// Seconds to wait for each response.
    #[arg(long, short, env = "LSPCHECK_TIMEOUT", default_value = "60", value_parser = parse_secs)]
    timeout: Duration,

    /// Seconds the server gets to exit after SIGTERM before it is killed.
    #[arg(long, env = "LSPCHECK_GRACE", default_value = "5", value_parser = parse_secs)]
    grace: Duration,

    /// Seconds to let the server warm up after opening the document. With
    /// --ready-notification, the most to wait for that notification.
    #[arg(long, env = "LSPCHECK_READY_DELAY", default_value = "15", value_parser = parse_secs)]
    ready_delay: Duration,

    /// Notification method that signals the server is ready.
    #[arg(long, env = "LSPCHECK_READY_NOTIFICATION")]
    ready_notification: Option<String>,

    /// Debug logging here and verbose logging in the server.
    #[arg(long, short)]
    verbose: bool,

    /// Environment variable set to 1 in the server with --verbose.
    #[arg(long, env = "LSPCHECK_VERBOSE_ENV", default_value = "SC_LAUNCHER_VERBOSE")]
    verbose_env: String,
}

impl Args {
    fn readiness(&self) -> Readiness {
        match &self.ready_notification {
            Some(method) => Readiness::Notification {
                method: method.clone(),
                timeout: self.ready_delay,
            },
            None if self.ready_delay.is_zero() => Readiness::Immediate,
            None => Readiness::Delay(self.ready_delay),
        }
    }

    fn range(&self) -> ActionRange {
        ActionRange {
            line: self.line,
            start_character: self.start_character,
            end_character: self.end_character,
        }
    }
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{e}"))
}

/// First candidate that exists under `root`.
fn locate_server(root: &Path, candidates: &[&str]) -> Result<PathBuf> {
    let mut last = None;
    for candidate in candidates {
        let path = root.join(candidate);
        if path.exists() {
            return Ok(path);
        }
        last = Some(path);
    }
    match last {
        Some(path) => bail!(
            "server not found at {} (build it first or pass --server)",
            path.display()
        ),
        None => bail!("no server candidates to search"),
    }
}

/// Percent-encoded `file://` URI for an absolute path.
fn file_uri(path: &Path) -> Result<String> {
    Url::from_file_path(path)
        .map(String::from)
        .map_err(|()| anyhow::anyhow!("cannot express {} as a file URI", path.display()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(true) => {
            info!("ALL CHECKS PASSED");
            ExitCode::SUCCESS
        }
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<bool> {
    let project_root = args
        .project_root
        .canonicalize()
        .with_context(|| format!("project root {}", args.project_root.display()))?;

    let server = match &args.server {
        Some(server) => server.clone(),
        None => locate_server(&project_root, SERVER_CANDIDATES)?,
    };

    let document = project_root.join(&args.document);
    let text = tokio::fs::read_to_string(&document)
        .await
        .with_context(|| format!("failed to read document {}", document.display()))?;

    info!(
        server = %server.display(),
        document = %document.display(),
        "Starting code action check"
    );

    let mut launch = LaunchConfig::new(&server)
        .with_args(["--mode", args.mode.as_str()])
        .with_args(&args.server_args);
    if args.verbose {
        launch = launch.with_env(&args.verbose_env, "1");
    }

    let config = ScenarioConfig::new(file_uri(&document)?, text)
        .with_language_id(&args.language_id)
        .with_root_uri(file_uri(&project_root)?)
        .with_range(args.range())
        .with_expected_title(&args.expect_title)
        .with_timeout(args.timeout)
        .with_readiness(args.readiness());

    let mut client = Client::launch(launch)?;
    info!(pid = client.pid(), "Server running");

    let outcome = CodeActionScenario::new(config)
        .run(client.session())
        .await;

    let shutdown = client.shutdown(args.grace).await;
    info!(outcome = ?shutdown.outcome, "Server stopped");

    let passed = match outcome {
        Ok(report) => {
            info!(
                actions = report.actions.len(),
                initialize = ?report.initialize_elapsed,
                code_action = ?report.code_action_elapsed,
                "Code action check passed"
            );
            for line in &shutdown.stderr {
                tracing::debug!(target: SERVER_LOG_TARGET, "{}", line);
            }
            true
        }
        Err(e) => {
            error!(error = %e, transport = e.is_transport(), "Code action check failed");
            if !shutdown.stderr.is_empty() {
                warn!(lines = shutdown.stderr.len(), "Server stderr follows");
            }
            for line in &shutdown.stderr {
                warn!(target: SERVER_LOG_TARGET, "{}", line);
            }
            false
        }
    };

    Ok(passed)
}
