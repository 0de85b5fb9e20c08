//! # txc-runner
//!
//! Command line entry point: runs the connector proxy and offers a few tools
//! to talk to the connector directly or through a proxy.
//!
//! # Usage
//!
//! ```bash
//! txc-runner --lib C:\txc proxy 5555
//! txc-runner client --addr 127.0.0.1:5555 '<command id="get_connector_version"/>'
//! txc-runner --lib C:\txc bench --count 10000
//! ```

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use txc_connector::{InitOptions, Stream, TransaqConnector};
use txc_core::LogLevel;
use txc_core::config::{AppConfig, Isolation};
use txc_core::latency::LatencyHistogram;
use txc_proxy::{
    DylibLoader, ProxyClient, ProxyServer, SessionCommand, SessionMode, SessionSettings,
};

/// Environment override for the connector log level of proxy sessions.
const PROXY_LOG_LEVEL_ENV: &str = "TXC_PROXY_LOG_LEVEL";

const VERSION_COMMAND: &[u8] = b"<command id=\"get_connector_version\"/>\0";

/// TRANSAQ XML Connector proxy and tools.
#[derive(Parser)]
#[command(name = "txc-runner", about = "TRANSAQ XML Connector proxy and tools")]
struct Cli {
    /// Configuration file path (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Optional log directory for file output.
    #[arg(long, global = true)]
    log_dir: Option<String>,

    /// Connector library, or the directory holding it.
    #[arg(long, global = true, env = "TXC_LIB")]
    lib: Option<PathBuf>,

    /// Connector log directory (root of per-session directories for the proxy).
    #[arg(long, global = true, env = "TXC_LOG_DIR")]
    connector_log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the proxy server.
    Proxy {
        /// Control port (overrides the config).
        port: Option<u16>,

        /// Serve sessions inside this process, one at a time.
        #[arg(long)]
        in_process: bool,
    },

    /// Serve one client socket inherited from a proxy.
    #[command(hide = true)]
    Session,

    /// Send commands through a running proxy.
    Client {
        #[arg(long, default_value = "127.0.0.1:5555")]
        addr: SocketAddr,

        /// How long to keep printing messages after the last reply.
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,

        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Load the connector in this process and send commands.
    Send {
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,

        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Measure get_connector_version round trips.
    Bench {
        #[arg(long, default_value_t = 1000)]
        count: usize,

        /// Go through a proxy instead of loading the connector.
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Configuration, with command line overrides
    let mut config = match &cli.config {
        Some(path) => txc_core::config::load_config(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(lib) = &cli.lib {
        config.connector.lib_path = Some(lib.clone());
    }
    if let Some(dir) = &cli.connector_log_dir {
        config.connector.session_dir = Some(dir.clone());
    }
    let level_override = proxy_log_level(&cli.command, std::env::var(PROXY_LOG_LEVEL_ENV).ok());

    // 2. Logging
    let log_level = cli
        .log_level
        .clone()
        .or_else(|| config.logging.as_ref().and_then(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let log_dir =
        cli.log_dir.clone().or_else(|| config.logging.as_ref().and_then(|l| l.dir.clone()));
    let prefix = match cli.command {
        Cmd::Proxy { .. } => "txc-proxy",
        Cmd::Session => "txc-session",
        _ => "txc-runner",
    };
    txc_core::logging::init_logging(&log_level, log_dir.as_deref(), prefix);

    if let Some(raw) = level_override {
        match raw.parse::<LogLevel>() {
            Ok(level) => config.connector.log_level = Some(level),
            Err(e) => warn!("ignoring {PROXY_LOG_LEVEL_ENV}={raw}: {e}"),
        }
    }

    // 3. Dispatch
    let child_args = cli_passthrough(&cli, &log_level);
    match cli.command {
        Cmd::Proxy { port, in_process } => {
            let isolation = if in_process {
                Isolation::InProcess
            } else {
                config.proxy.effective_isolation()
            };
            run_proxy(&child_args, &config, port, isolation).await
        }
        Cmd::Session => {
            let loader = DylibLoader::new(config.connector.effective_lib_path());
            txc_proxy::serve_inherited(&loader, &SessionSettings::from_config(&config)).await
        }
        Cmd::Client { addr, wait_ms, commands } => {
            run_client(addr, &commands, Duration::from_millis(wait_ms)).await
        }
        Cmd::Send { wait_ms, commands } => {
            let wait = Duration::from_millis(wait_ms);
            tokio::task::spawn_blocking(move || run_send(&config, &commands, wait)).await?
        }
        Cmd::Bench { count, addr: Some(addr) } => bench_proxy(addr, count).await,
        Cmd::Bench { count, addr: None } => {
            tokio::task::spawn_blocking(move || bench_local(&config, count)).await?
        }
    }
}

/// `TXC_PROXY_LOG_LEVEL` value, honoured by proxy sessions only.
fn proxy_log_level(command: &Cmd, raw: Option<String>) -> Option<String> {
    match command {
        Cmd::Proxy { .. } | Cmd::Session => raw,
        _ => None,
    }
}

/// Global flags repeated for session children.
fn cli_passthrough(cli: &Cli, log_level: &str) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--log-level".into(), log_level.into()];
    if let Some(path) = &cli.config {
        args.extend(["--config".into(), path.into()]);
    }
    if let Some(dir) = &cli.log_dir {
        args.extend(["--log-dir".into(), dir.into()]);
    }
    if let Some(lib) = &cli.lib {
        args.extend(["--lib".into(), lib.into()]);
    }
    if let Some(dir) = &cli.connector_log_dir {
        args.extend(["--connector-log-dir".into(), dir.into()]);
    }
    args.push("session".into());
    args
}

async fn run_proxy(
    child_args: &[OsString],
    config: &AppConfig,
    port: Option<u16>,
    isolation: Isolation,
) -> Result<()> {
    let settings = SessionSettings::from_config(config);
    std::fs::create_dir_all(&settings.session_dir)
        .with_context(|| format!("create session dir {}", settings.session_dir.display()))?;

    let lib = config.connector.effective_lib_path();
    let mode = match isolation {
        Isolation::Process => {
            SessionMode::Process(SessionCommand::current_exe(child_args.to_vec())?)
        }
        Isolation::InProcess => SessionMode::InProcess(Arc::new(DylibLoader::new(lib.clone()))),
    };
    let port = port.unwrap_or_else(|| config.proxy.effective_control_port());
    info!(
        "txc proxy starting, lib={}, sessions in {}, connector log level {}",
        lib.display(),
        settings.session_dir.display(),
        settings.log_level
    );

    let server = ProxyServer::bind(config.proxy.effective_bind(), port, mode, settings).await?;
    info!("control port {}, press Ctrl+C to stop", server.local_addr()?.port());
    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
}

async fn run_client(addr: SocketAddr, commands: &[String], wait: Duration) -> Result<()> {
    let mut client =
        ProxyClient::connect(addr).await.with_context(|| format!("connect to {addr}"))?;
    info!("connected to {addr}, data port {}", client.data_port());

    for cmd in commands {
        let reply = client.send(cmd.as_bytes()).await?;
        println!("{}", String::from_utf8_lossy(&reply));
    }

    let deadline = tokio::time::Instant::now() + wait;
    while let Ok(msg) = tokio::time::timeout_at(deadline, client.next_message()).await {
        match msg? {
            Some(msg) => println!("{}", String::from_utf8_lossy(&msg)),
            None => break,
        }
    }
    Ok(())
}

fn init_options(config: &AppConfig) -> Result<InitOptions> {
    let dir = config.connector.effective_session_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create connector log dir {}", dir.display()))?;
    Ok(InitOptions::new(dir)
        .log_level(config.connector.effective_log_level())
        .logfile_lifetime(config.connector.logfile_lifetime))
}

fn connect_local(config: &AppConfig) -> Result<TransaqConnector> {
    let lib = config.connector.effective_lib_path();
    Ok(TransaqConnector::new(&lib, &init_options(config)?)?)
}

fn run_send(config: &AppConfig, commands: &[String], wait: Duration) -> Result<()> {
    let mut txc = connect_local(config)?;
    txc.input_stream()
        .map(|buf| buf.to_string_lossy().into_owned())
        .subscribe(|msg| println!("{msg}"))?;

    let sender = txc.sender();
    for cmd in commands {
        match sender.send(cmd) {
            Ok(reply) => println!("{reply}"),
            Err(e) => match e.connector_text() {
                Some(text) => println!("{text}"),
                None => println!("{e}"),
            },
        }
    }
    std::thread::sleep(wait);
    txc.uninitialize()?;
    Ok(())
}

fn bench_local(config: &AppConfig, count: usize) -> Result<()> {
    let mut txc = connect_local(config)?;
    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    txc.input_stream()
        .filter(|buf| buf.to_bytes().starts_with(b"<connector_version"))
        .subscribe(move |_| {
            let _ = tx.try_send(());
        })?;

    let sender = txc.sender();
    let mut hist = LatencyHistogram::default();
    for _ in 0..count {
        let t0 = Instant::now();
        drop(sender.send(VERSION_COMMAND)?);
        rx.recv_timeout(Duration::from_secs(5)).context("no connector_version message")?;
        hist.record(t0.elapsed());
    }
    report(&hist, "in-process");
    txc.uninitialize()?;
    Ok(())
}

async fn bench_proxy(addr: SocketAddr, count: usize) -> Result<()> {
    let mut client =
        ProxyClient::connect(addr).await.with_context(|| format!("connect to {addr}"))?;
    let mut hist = LatencyHistogram::default();
    for _ in 0..count {
        let t0 = Instant::now();
        let reply = client.send(VERSION_COMMAND).await?;
        if !reply.starts_with(b"<result success=\"true\"") {
            bail!("unexpected reply: {}", String::from_utf8_lossy(&reply));
        }
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next_message())
                .await
                .context("no connector_version message")??
                .context("proxy closed the data socket")?;
            if msg.starts_with(b"<connector_version") {
                break;
            }
        }
        hist.record(t0.elapsed());
    }
    report(&hist, &addr.to_string());
    Ok(())
}

fn report(hist: &LatencyHistogram, target: &str) {
    match hist.stats() {
        Some(stats) => {
            info!("round trip via {target}: {stats}");
            println!("{stats}");
        }
        None => warn!("no samples recorded"),
    }
}
