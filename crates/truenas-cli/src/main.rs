//! `truenas`: call a TrueNAS middleware method from the command line.
//!
//! Prints the response (or, with `--job`, the job result) as pretty JSON on
//! stdout. Progress and logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use directories::ProjectDirs;
use serde_json::Value;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use truenas_rpc::{Client, ClientConfig, Credentials, JobCallback, JobProgress};

#[derive(Parser)]
#[command(name = "truenas")]
#[command(about = "Call TrueNAS middleware methods over JSON-RPC")]
#[command(version)]
#[command(after_help = "\
Examples:
  truenas --uri wss://nas/websocket -U root -P secret --method system.info
  truenas --method pool.query --params '[[[\"name\", \"=\", \"tank\"]]]'
  truenas --method app.upgrade --params '[\"myapp\"]' --job --timeout 600")]
struct Cli {
    /// WebSocket endpoint, e.g. wss://nas.local/websocket
    #[arg(long, env = "TRUENAS_URL")]
    uri: Option<String>,

    /// Method to call
    #[arg(short, long)]
    method: String,

    /// Method parameters as a JSON array
    #[arg(long, default_value = "[]")]
    params: String,

    /// Seconds to wait for the response (and for the job, with --job)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Verify the server's TLS certificate
    #[arg(long, value_name = "BOOL")]
    verify_tls: Option<bool>,

    /// The method starts a job; wait for it and print its result
    #[arg(long)]
    job: bool,

    #[arg(short = 'U', long, env = "TRUENAS_USERNAME")]
    username: Option<String>,

    #[arg(short = 'P', long, env = "TRUENAS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "TRUENAS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Config file [default: ~/.config/truenas/config.json]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "truenas").map(|dirs| dirs.config_dir().join("config.json"))
}

/// Flags and environment override the config file, which overrides defaults.
fn resolve_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => {
                debug!("Using config file {}", path.display());
                ClientConfig::load(&path)?
            }
            None => ClientConfig::default(),
        },
    };

    if let Some(uri) = &cli.uri {
        config.url.clone_from(uri);
    }
    if let Some(verify_tls) = cli.verify_tls {
        config.verify_tls = verify_tls;
    }
    if let Some(secs) = cli.timeout {
        config.call_timeout = Duration::from_secs(secs);
    }

    if config.url.is_empty() {
        bail!("No server given: pass --uri, set TRUENAS_URL, or add \"url\" to the config file");
    }
    config.validate()?;
    Ok(config)
}

/// `None` when no credentials were given at all.
fn resolve_credentials(cli: &Cli) -> Result<Option<Credentials>> {
    if cli.username.is_none() && cli.password.is_none() && cli.api_key.is_none() {
        return Ok(None);
    }
    let credentials = Credentials::from_parts(
        cli.username.as_deref(),
        cli.password.as_deref(),
        cli.api_key.as_deref(),
    )?;
    Ok(Some(credentials))
}

fn setup_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("truenas={level},truenas_rpc={level}")));

    let Some(path) = log_file else {
        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbose);
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(filter)
            .init();
        return Ok(None);
    };

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", path.display()))?;

    let file_appender = tracing_appender::rolling::never(dir, name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(filter)
        .init();

    Ok(Some(guard))
}

fn print_progress(progress: &JobProgress) {
    if progress.description.is_empty() {
        eprintln!("[{:>5.1}%] {}", progress.percent, progress.state);
    } else {
        eprintln!(
            "[{:>5.1}%] {} {}",
            progress.percent, progress.state, progress.description
        );
    }
}

async fn run_job(client: &Client, method: &str, params: Value, timeout: Duration) -> Result<Value> {
    client
        .subscribe_to_jobs()
        .await
        .context("Failed to subscribe to job updates")?;

    let callback: JobCallback = Arc::new(print_progress);
    let job = client
        .call_with_job(method, params, Some(callback))
        .await
        .with_context(|| format!("Failed to start {method}"))?;
    info!("Started job {}", job.id());

    let result = tokio::time::timeout(timeout, job.wait())
        .await
        .with_context(|| format!("Job {} did not finish within {timeout:?}", job.id()))??;
    Ok(result)
}

async fn run_call(client: &Client, method: &str, params: Value, timeout: Duration) -> Result<Value> {
    let response = client.call(method, timeout, params).await?;
    let envelope = response.envelope()?;
    if let Some(error) = envelope.error {
        println!("{}", serde_json::to_string_pretty(&response.to_value()?)?);
        bail!("{method} failed: {error}");
    }
    Ok(response.to_value()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.verbose, cli.log_file.as_deref())?;

    let params: Value = serde_json::from_str(&cli.params).context("--params is not valid JSON")?;
    let config = resolve_config(&cli)?;
    let credentials = resolve_credentials(&cli)?;

    let client = Client::connect(&config).await?;
    debug!("Connected to {}", config.url);

    if let Some(credentials) = &credentials {
        client.login(credentials).await.context("Login failed")?;
    }

    let outcome = if cli.job {
        run_job(&client, &cli.method, params, config.call_timeout).await
    } else {
        run_call(&client, &cli.method, params, config.call_timeout).await
    };

    if let Err(e) = client.close().await {
        debug!("Error while closing connection: {e}");
    }

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("truenas").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_defaults() {
        let cli = parse(&["--method", "core.ping", "--uri", "ws://nas/websocket"]);
        assert_eq!(cli.params, "[]");
        assert!(!cli.job);
        assert!(cli.verify_tls.is_none());
        assert!(cli.timeout.is_none());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = std::env::temp_dir().join(format!("truenas-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(
            &path,
            r#"{"url": "ws://from-file/websocket", "verifyTls": false, "callTimeoutSecs": 30}"#,
        )
        .unwrap();
        let config_arg = path.to_str().unwrap();

        let cli = parse(&["-m", "core.ping", "--config", config_arg]);
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.url, "ws://from-file/websocket");
        assert!(!config.verify_tls);
        assert_eq!(config.call_timeout, Duration::from_secs(30));

        let cli = parse(&[
            "-m",
            "core.ping",
            "--config",
            config_arg,
            "--uri",
            "wss://from-flag/websocket",
            "--verify-tls",
            "true",
            "--timeout",
            "5",
        ]);
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.url, "wss://from-flag/websocket");
        assert!(config.verify_tls);
        assert_eq!(config.call_timeout, Duration::from_secs(5));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_credentials_resolution() {
        let cli = parse(&["-m", "core.ping", "-U", "root", "-P", "secret"]);
        assert!(matches!(
            resolve_credentials(&cli).unwrap(),
            Some(Credentials::Password { .. })
        ));

        let cli = parse(&["-m", "core.ping", "-U", "root"]);
        assert!(resolve_credentials(&cli).is_err());
    }
}
