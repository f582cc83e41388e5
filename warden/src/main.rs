use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use sandbox::{BackendKind, ExecutionRequest, SandboxConfig};
use tracing::warn;
use tracing_subscriber::fmt::time::FormatTime;
use warden::{Registry, WardenConfig, WardenError, WardenResult};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "warden", version)]
struct Cli {
    /// Path to warden.yaml (built-in defaults apply when omitted)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a Python file in a fresh sandbox and print its output
    Run(RunArgs),
    /// Probe every backend on this host and report availability
    Doctor,
    /// Remove leftover sandbox directories under the configured root
    Clean,
}

#[derive(Args)]
struct RunArgs {
    /// Source file to execute
    file: PathBuf,
    /// Isolation backend
    #[arg(long, value_enum, default_value_t = BackendArg::IsolatedProcess)]
    backend: BackendArg,
    /// Wall-clock limit in seconds
    #[arg(long)]
    timeout: Option<u32>,
    /// Memory ceiling in MiB
    #[arg(long)]
    memory_mb: Option<u32>,
    /// Package to install into the environment (repeatable)
    #[arg(long = "package")]
    packages: Vec<String>,
    /// Keep the sandbox on disk instead of destroying it
    #[arg(long)]
    keep: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    PythonVenv,
    Container,
    IsolatedProcess,
    Basic,
}

impl From<BackendArg> for BackendKind {
    fn from(backend: BackendArg) -> Self {
        match backend {
            BackendArg::PythonVenv => Self::PythonVenv,
            BackendArg::Container => Self::Container,
            BackendArg::IsolatedProcess => Self::IsolatedProcess,
            BackendArg::Basic => Self::Basic,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Doctor => doctor(config).await,
        Command::Clean => clean(config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn load_config(path: Option<&Path>) -> WardenResult<WardenConfig> {
    match path {
        Some(path) => warden::config::load(path).await,
        None => Ok(WardenConfig::default()),
    }
}

async fn run(config: WardenConfig, args: RunArgs) -> WardenResult<ExitCode> {
    let source = tokio::fs::read_to_string(&args.file)
        .await
        .map_err(|e| WardenError::Config(format!("read {}: {e}", args.file.display())))?;

    let registry = Registry::new(config);

    let name = args
        .file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sandbox".to_string());
    let mut sandbox_config = SandboxConfig::new(name, args.backend.into());
    if let Some(timeout) = args.timeout {
        sandbox_config.restrictions.max_execution_secs = timeout;
    }
    if let Some(memory_mb) = args.memory_mb {
        sandbox_config.restrictions.max_memory_mb = memory_mb;
    }
    sandbox_config.environment.packages = args.packages;

    let id = registry.create_sandbox(sandbox_config).await?;
    let result = registry.execute(&id, &ExecutionRequest::new(source)).await;

    if args.keep {
        println!("sandbox kept: {id}");
    } else if let Err(e) = registry.destroy(&id).await {
        warn!(id = %id, error = %e, "destroy failed");
    }

    let result = result?;
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if let Some(failure) = result.failure {
        eprintln!("execution failed: {failure:?}");
    }
    Ok(u8::try_from(result.exit_code)
        .map(ExitCode::from)
        .unwrap_or(ExitCode::FAILURE))
}

async fn doctor(config: WardenConfig) -> WardenResult<ExitCode> {
    let registry = Registry::new(config);
    let mut all_ok = true;
    for (kind, result) in registry.probe_backends().await {
        match result {
            Ok(()) => println!("{kind}: ok"),
            Err(e) => {
                all_ok = false;
                println!("{kind}: unavailable ({e})");
            }
        }
    }
    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn clean(config: WardenConfig) -> WardenResult<ExitCode> {
    let root = &config.sandbox_root;
    if !root.exists() {
        println!("nothing to clean");
        return Ok(ExitCode::SUCCESS);
    }

    let mut removed = 0usize;
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "remove failed"),
        }
    }
    println!("removed {removed} sandbox directories");
    Ok(ExitCode::SUCCESS)
}
