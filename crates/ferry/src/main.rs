use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use ferry_common::{config::default_pidfile, Config};
use ferry_core::{AccessController, Supervisor};

mod maintenance;

use maintenance::{BackupArgs, MigrateArgs, RestoreArgs};

#[derive(Parser, Debug)]
#[command(version, about = "Synchronize repositories between clients through a passive relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Common {
    /// The path to the configuration file.
    #[arg(long = "config", value_name = "CONFIG", env = "FERRY_CONFIG_FILE")]
    config: Option<PathBuf>,
}

impl Common {
    fn config_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.config {
            return Ok(path.clone());
        }
        Config::global_config_path().context("no configuration directory available")
    }

    fn load_config(&self) -> anyhow::Result<Config> {
        let path = self.config_path()?;
        Config::from_file(&path).with_context(|| format!("error loading config file {path:?}"))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the synchronization daemon in the background
    Start(StartArgs),
    /// Stop a running daemon
    Stop(StopArgs),
    /// Run the synchronization workers in the foreground
    Run(RunArgs),
    /// Query or set per-file access modifiers
    Access(AccessArgs),
    /// Move a repository's remote side to another relay
    Migrate(MigrateArgs),
    /// Snapshot relay contents into a local archive directory
    Backup(BackupArgs),
    /// Push an archive directory back onto the relay
    Restore(RestoreArgs),
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Where to record the daemon's process id.
    #[arg(long, value_name = "PIDFILE")]
    pidfile: Option<PathBuf>,

    #[command(flatten)]
    common: Common,
}

impl StartArgs {
    fn run(self) -> anyhow::Result<ExitCode> {
        let pidfile = self.pidfile.unwrap_or_else(default_pidfile);
        if pidfile.exists() {
            eprintln!(
                "ferry is already running; if not, delete '{}'",
                pidfile.display()
            );
            return Ok(ExitCode::from(1));
        }
        // Fail on configuration problems here rather than in a detached
        // child nobody watches.
        self.common.load_config()?;

        let exe = std::env::current_exe().context("cannot locate the ferry executable")?;
        let mut command = std::process::Command::new(exe);
        command.arg("run");
        if let Some(config_path) = &self.common.config {
            command.arg("--config").arg(config_path);
        }
        let child = command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .context("failed to spawn the daemon")?;

        if let Some(parent) = pidfile.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&pidfile, child.id().to_string())
            .with_context(|| format!("failed to write pidfile '{}'", pidfile.display()))?;
        println!("ferry started (pid {})", child.id());
        Ok(ExitCode::SUCCESS)
    }
}

#[derive(Args, Debug)]
struct StopArgs {
    /// Where the daemon's process id is recorded.
    #[arg(long, value_name = "PIDFILE")]
    pidfile: Option<PathBuf>,
}

impl StopArgs {
    fn run(self) -> anyhow::Result<ExitCode> {
        let pidfile = self.pidfile.unwrap_or_else(default_pidfile);
        if !pidfile.exists() {
            eprintln!("ferry is not running");
            return Ok(ExitCode::from(1));
        }
        let pid: i32 = std::fs::read_to_string(&pidfile)?
            .trim()
            .parse()
            .with_context(|| format!("malformed pidfile '{}'", pidfile.display()))?;
        match sys::terminate(pid) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                eprintln!("ferry is not running (stale pidfile removed)");
                std::fs::remove_file(&pidfile)?;
                return Ok(ExitCode::from(1));
            }
            Err(err) => return Err(err).context("failed to terminate the daemon"),
        }
        std::fs::remove_file(&pidfile)?;
        println!("ferry stopped");
        Ok(ExitCode::SUCCESS)
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    common: Common,
}

impl RunArgs {
    async fn run(self) -> anyhow::Result<ExitCode> {
        let config = self.common.load_config()?;
        let mut supervisor = Supervisor::spawn(&config)
            .await
            .context("failed to start workers")?;
        let stop = supervisor.stop_handle();
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("shutting down");
                let _ = stop.send(true);
            }
            _ = supervisor.wait() => {}
        }
        supervisor.shutdown().await;
        Ok(ExitCode::SUCCESS)
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[derive(Args, Debug)]
struct AccessArgs {
    /// Modifiers like `r+w-` (`+` allow, `-` deny, `?` unset); with no
    /// modifiers the current ones are printed.
    #[arg(value_name = "MODIFIERS|PATH")]
    first: String,

    /// The file to query or modify.
    #[arg(value_name = "PATH")]
    second: Option<String>,

    /// Restrict the command to one repository.
    #[arg(long, short, value_name = "REPOSITORY")]
    repository: Option<String>,

    #[command(flatten)]
    common: Common,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Modifiers {
    read: Option<Option<bool>>,
    write: Option<Option<bool>>,
}

/// Parses modifier strings like `r+`, `w-`, `r+w-` or `rw` (bare letters
/// mean allow).
fn parse_modifiers(input: &str) -> anyhow::Result<Modifiers> {
    let mut modifiers = Modifiers::default();
    let mut chars = input.chars().peekable();
    while let Some(letter) = chars.next() {
        let value = match chars.peek() {
            Some('+') => {
                chars.next();
                Some(true)
            }
            Some('-') => {
                chars.next();
                Some(false)
            }
            Some('?') => {
                chars.next();
                None
            }
            _ => Some(true),
        };
        match letter {
            'r' => modifiers.read = Some(value),
            'w' => modifiers.write = Some(value),
            other => anyhow::bail!("unrecognized access modifier '{other}'"),
        }
    }
    Ok(modifiers)
}

fn modifier_symbol(value: Option<bool>) -> char {
    match value {
        None => '?',
        Some(true) => '+',
        Some(false) => '-',
    }
}

impl AccessArgs {
    fn run(self) -> anyhow::Result<ExitCode> {
        let (modifiers, resource) = match self.second {
            Some(path) => (Some(parse_modifiers(&self.first)?), path),
            None => (None, self.first),
        };
        let mut resource = PathBuf::from(resource);
        if resource.is_relative() && resource.exists() {
            resource = std::env::current_dir()?.join(resource);
        }

        let config = self.common.load_config()?;
        let repositories: Vec<&String> = match &self.repository {
            Some(name) => {
                config.repository(name)?;
                vec![name]
            }
            None => config.repositories.keys().collect(),
        };

        let mut matched = Vec::new();
        let mut current = None;
        for name in repositories {
            let cfg = config.repository(name)?;
            let store_path = cfg.access_store_path(name);
            if modifiers.is_none() && !store_path.as_deref().is_some_and(Path::exists) {
                continue;
            }
            let controller = AccessController::new(
                name.as_str(),
                &cfg.path,
                cfg.mode,
                store_path,
                modifiers.is_some(),
            )?;
            match &modifiers {
                Some(set) => {
                    let mut applied = false;
                    if let Some(value) = set.read {
                        match controller.set_readability(&resource, value) {
                            Ok(()) => applied = true,
                            Err(ferry_common::Error::NotInRepository(_)) => {}
                            Err(err) => return Err(err.into()),
                        }
                    }
                    if let Some(value) = set.write {
                        match controller.set_writability(&resource, value) {
                            Ok(()) => applied = true,
                            Err(ferry_common::Error::NotInRepository(_)) => {}
                            Err(err) => return Err(err.into()),
                        }
                    }
                    if applied {
                        matched.push(name.clone());
                    }
                }
                None => {
                    let (Ok(read), Ok(write)) = (
                        controller.get_readability(&resource),
                        controller.get_writability(&resource),
                    ) else {
                        continue;
                    };
                    matched.push(name.clone());
                    current = Some((read, write));
                }
            }
        }

        if matched.is_empty() {
            anyhow::bail!("cannot find file '{}' in any repository", resource.display());
        }
        if let Some((read, write)) = current {
            if matched.len() > 1 {
                anyhow::bail!(
                    "'{}' found in multiple repositories: {}",
                    resource.display(),
                    matched.join(", ")
                );
            }
            println!("r{}w{}", modifier_symbol(read), modifier_symbol(write));
        }
        Ok(ExitCode::SUCCESS)
    }
}

#[cfg(unix)]
mod sys {
    use std::io::{Error, ErrorKind, Result};

    pub(super) fn terminate(pid: i32) -> Result<()> {
        let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
        if ret == 0 {
            return Ok(());
        }
        let err = Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Err(Error::new(ErrorKind::NotFound, "no such process"))
        } else {
            Err(err)
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io::{Error, ErrorKind, Result};

    pub(super) fn terminate(_pid: i32) -> Result<()> {
        Err(Error::new(
            ErrorKind::Unsupported,
            "stopping the daemon is only supported on unix",
        ))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Start(args) => args.run(),
        Commands::Stop(args) => args.run(),
        Commands::Run(args) => args.run().await,
        Commands::Access(args) => args.run(),
        Commands::Migrate(args) => args.run().await,
        Commands::Backup(args) => args.run().await,
        Commands::Restore(args) => args.run().await,
    };
    match outcome {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifier_strings_parse() {
        assert_eq!(
            parse_modifiers("r+w-").unwrap(),
            Modifiers {
                read: Some(Some(true)),
                write: Some(Some(false)),
            }
        );
        assert_eq!(
            parse_modifiers("w?").unwrap(),
            Modifiers {
                read: None,
                write: Some(None),
            }
        );
        // Bare letters mean allow.
        assert_eq!(
            parse_modifiers("rw").unwrap(),
            Modifiers {
                read: Some(Some(true)),
                write: Some(Some(true)),
            }
        );
        assert!(parse_modifiers("x+").is_err());
    }
}
