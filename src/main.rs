//! FerroDB server entry point

use std::io::Write;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ferrodb::auth::AuthManager;
use ferrodb::defaults::DEFAULT_MAX_CONNECTIONS;
use ferrodb::{client, Config, Server};

#[derive(Parser)]
#[command(name = "ferrodb", version, about = "Key-value and vector database server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server in the background
    Start {
        port: u16,
        max_connections: Option<usize>,
    },
    /// Stop a background server
    Stop,
    /// Run the server in the foreground
    Run {
        port: u16,
        max_connections: Option<usize>,
    },
    /// Open an interactive session against a local server
    Connect { port: u16 },
    /// Talk to the management endpoint of a local server
    Manager {
        port: u16,
        #[command(subcommand)]
        command: ManagerCommand,
    },
}

#[derive(Subcommand)]
enum ManagerCommand {
    /// Server health
    Health,
    /// Connection and runtime statistics
    Stats,
    /// Current connection limit
    Limit,
    /// Replace the connection limit
    SetLimit { limit: usize },
    /// Raise the connection limit
    Increase { amount: Option<usize> },
    /// Lower the connection limit
    Decrease { amount: Option<usize> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,ferrodb=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            port,
            max_connections,
        } => run_foreground(port, max_connections).await,
        Command::Start {
            port,
            max_connections,
        } => start_background(port, max_connections),
        Command::Stop => stop_background(),
        Command::Connect { port } => client::run(port).await,
        Command::Manager { port, command } => manager(port, command).await,
    }
}

async fn run_foreground(port: u16, max_connections: Option<usize>) -> anyhow::Result<()> {
    let config = Config::for_port(port, max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))?;
    let server = Server::new(config)?;
    ensure_admin(server.auth())?;

    let running = server.start().await?;
    running.wait_for_signals().await
}

/// Seed the first admin on an empty user store, from the environment for
/// unattended runs or from the controlling terminal otherwise
fn ensure_admin(auth: &AuthManager) -> anyhow::Result<()> {
    if auth.has_users() {
        return Ok(());
    }

    let (username, password) = match (
        std::env::var("FERRODB_ADMIN_USER"),
        std::env::var("FERRODB_ADMIN_PASS"),
    ) {
        (Ok(username), Ok(password)) => (username, password),
        _ => {
            println!("No users found. Create admin user.");
            (prompt("Enter admin username: ")?, prompt("Enter admin password: ")?)
        }
    };

    anyhow::ensure!(!username.is_empty(), "admin username must not be empty");
    anyhow::ensure!(!password.is_empty(), "admin password must not be empty");
    auth.bootstrap_admin(&username, &password)?;
    Ok(())
}

fn prompt(label: &str) -> anyhow::Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn start_background(port: u16, max_connections: Option<usize>) -> anyhow::Result<()> {
    let config = Config::for_port(port, max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))?;

    if let Some(pid) = running_pid(&config) {
        anyhow::bail!("server already running (pid {pid})");
    }

    std::fs::create_dir_all(&config.log_dir)?;
    let log_path = config.log_dir.join("ferrodb.log");
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let mut command = std::process::Command::new(std::env::current_exe()?);
    command
        .arg("run")
        .arg(port.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log);
    if let Some(max) = max_connections {
        command.arg(max.to_string());
    }

    let child = command.spawn()?;
    std::fs::write(&config.pid_path, child.id().to_string())?;

    println!("ferrodb started on port {port} (pid {}), logs at {}", child.id(), log_path.display());
    Ok(())
}

fn stop_background() -> anyhow::Result<()> {
    let config = Config::for_port(9090, DEFAULT_MAX_CONNECTIONS)?;
    let Some(pid) = running_pid(&config) else {
        anyhow::bail!("server is not running");
    };

    let status = std::process::Command::new("kill")
        .arg(pid.to_string())
        .status()?;
    anyhow::ensure!(status.success(), "failed to signal pid {pid}");

    std::fs::remove_file(&config.pid_path).ok();
    println!("ferrodb (pid {pid}) stopped");
    Ok(())
}

/// Pid from the pid file when the process is still alive
fn running_pid(config: &Config) -> Option<u32> {
    let pid: u32 = std::fs::read_to_string(&config.pid_path)
        .ok()?
        .trim()
        .parse()
        .ok()?;

    // Signal 0 probes for existence
    let alive = std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    alive.then_some(pid)
}

async fn manager(port: u16, command: ManagerCommand) -> anyhow::Result<()> {
    let base = format!(
        "http://127.0.0.1:{}",
        port.checked_add(1000)
            .ok_or_else(|| anyhow::anyhow!("port {port} leaves no room for the management port"))?
    );
    let client = reqwest::Client::new();

    let response = match command {
        ManagerCommand::Health => client.get(format!("{base}/health")).send().await?,
        ManagerCommand::Stats => client.get(format!("{base}/stats")).send().await?,
        ManagerCommand::Limit => client.get(format!("{base}/limit")).send().await?,
        ManagerCommand::SetLimit { limit } => {
            client
                .put(format!("{base}/limit"))
                .json(&serde_json::json!({"limit": limit}))
                .send()
                .await?
        }
        ManagerCommand::Increase { amount } => {
            client
                .post(format!("{base}/limit/increase"))
                .json(&serde_json::json!({"amount": amount}))
                .send()
                .await?
        }
        ManagerCommand::Decrease { amount } => {
            client
                .post(format!("{base}/limit/decrease"))
                .json(&serde_json::json!({"amount": amount}))
                .send()
                .await?
        }
    };

    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    anyhow::ensure!(status.is_success(), "management request failed ({status})");
    Ok(())
}
