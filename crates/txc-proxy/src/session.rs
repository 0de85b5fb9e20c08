//! One client session: a connector instance bound to a control socket and a
//! data socket.
//!
//! ```text
//! client ──control──► read_frame ─► Sender::send (blocking pool) ─► reply\0
//! connector thread ─► callback ─► crossbeam queue ─► forwarder thread ─► data\0
//! ```

use std::io::{BufWriter, Write};
use std::net::{IpAddr, Shutdown};
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, TrySendError};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use txc_connector::{InitOptions, Sender, TCStr, TransaqConnector};
use txc_core::config::AppConfig;
use txc_core::{LogLevel, TxcError};

use crate::frame::{self, Frame};
use crate::loader::ConnectorLoader;

/// Per-session parameters, shared by every session of a server.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Address the data listener binds to.
    pub bind: IpAddr,
    /// Connector logs go to `<session_dir>/<data_port>`.
    pub session_dir: PathBuf,
    pub log_level: LogLevel,
    pub logfile_lifetime: Option<u32>,
    pub data_accept_timeout: Duration,
    /// Bound on each blocking write to the data socket.
    pub data_write_timeout: Duration,
    pub max_command_len: usize,
    pub forward_queue: usize,
    pub forward_cpu_core: Option<i32>,
}

impl SessionSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            bind: cfg.proxy.effective_bind(),
            session_dir: cfg.connector.effective_session_dir(),
            log_level: cfg.connector.effective_log_level(),
            logfile_lifetime: cfg.connector.logfile_lifetime,
            data_accept_timeout: cfg.proxy.effective_data_accept_timeout(),
            data_write_timeout: cfg.proxy.effective_data_write_timeout(),
            max_command_len: cfg.proxy.effective_max_command_len(),
            forward_queue: cfg.proxy.effective_forward_queue(),
            forward_cpu_core: cfg.proxy.forward_cpu_core,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Serve one client until it closes the control socket.
pub async fn run_session(
    mut control: TcpStream,
    loader: &dyn ConnectorLoader,
    settings: &SessionSettings,
) -> Result<()> {
    let listener = TcpListener::bind((settings.bind, 0)).await.context("bind data listener")?;
    let data_port = listener.local_addr()?.port();
    let label = format!("session {data_port}");

    // load before announcing the port so a broken library fails the session early
    let api = loader.load().context("load connector library")?;
    control.write_all(&data_port.to_le_bytes()).await?;

    let (data, peer) = tokio::time::timeout(settings.data_accept_timeout, listener.accept())
        .await
        .map_err(|_| {
            anyhow!("[{label}] data socket not opened within {:?}", settings.data_accept_timeout)
        })??;
    drop(listener);
    info!("[{label}] data socket connected from {peer}");

    let data = data.into_std()?;
    data.set_nonblocking(false)?;
    data.shutdown(Shutdown::Read)?;
    data.set_write_timeout(Some(settings.data_write_timeout))?;

    let log_dir = settings.session_dir.join(data_port.to_string());
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("create session log dir {}", log_dir.display()))?;
    let opts = InitOptions::new(&log_dir)
        .log_level(settings.log_level)
        .logfile_lifetime(settings.logfile_lifetime);

    let mut txc =
        tokio::task::spawn_blocking(move || TransaqConnector::with_api(api, &opts)).await??;

    let (tx, rx) = crossbeam_channel::bounded::<TCStr>(settings.forward_queue);
    let forwarder = spawn_forwarder(label.clone(), data, rx, settings.forward_cpu_core)?;
    let queue_label = label.clone();
    let installed = txc.install_callback(move |buf| {
        if let Err(TrySendError::Full(buf)) = tx.try_send(buf) {
            warn!("[{queue_label}] forward queue full");
            let _ = tx.send(buf);
        }
    });

    let served = match installed {
        Ok(()) => command_loop(&mut control, txc.sender(), settings, &label).await,
        Err(e) => Err(e.into()),
    };

    // uninitialize first: afterwards no callback can hold the queue open
    tokio::task::spawn_blocking(move || drop(txc)).await?;
    tokio::task::spawn_blocking(move || forwarder.join())
        .await?
        .map_err(|_| anyhow!("[{label}] forwarder thread panicked"))?;
    info!("[{label}] closed");
    served
}

async fn command_loop(
    control: &mut TcpStream,
    sender: Sender,
    settings: &SessionSettings,
    label: &str,
) -> Result<()> {
    let (rd, mut wr) = control.split();
    let mut reader = BufReader::new(rd);
    let mut frame = Vec::with_capacity(4096);

    loop {
        match frame::read_frame(&mut reader, &mut frame, settings.max_command_len).await? {
            Frame::Complete => {}
            Frame::Eof => {
                debug!("[{label}] control socket closed by client");
                return Ok(());
            }
            Frame::TooLong => {
                let limit = settings.max_command_len;
                warn!("[{label}] command longer than {limit} bytes, closing");
                let msg = format!("<error>command exceeds {limit} bytes</error>");
                frame::write_frame(&mut wr, msg.as_bytes()).await?;
                return Ok(());
            }
        }

        let sender = sender.clone();
        let command = std::mem::take(&mut frame);
        let (reply, command) = tokio::task::spawn_blocking(move || {
            let reply = sender.send(&command);
            (reply, command)
        })
        .await?;
        frame = command;

        match reply {
            Ok(buf) => frame::write_frame(&mut wr, buf.to_bytes()).await?,
            Err(e) => {
                debug!("[{label}] command failed: {e}");
                frame::write_frame(&mut wr, error_reply(&e).as_bytes()).await?
            }
        }
    }
}

/// Text returned to the client for a failed command.
fn error_reply(e: &TxcError) -> String {
    match e.connector_text() {
        Some(text) => text.to_owned(),
        None => format!("<error>{}</error>", xml_escape(&e.to_string())),
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Data forwarding
// ---------------------------------------------------------------------------

fn spawn_forwarder(
    label: String,
    data: std::net::TcpStream,
    rx: Receiver<TCStr>,
    cpu_core: Option<i32>,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("txc-forward".into())
        .spawn(move || run_forward_loop(&label, data, rx, cpu_core))?;
    Ok(handle)
}

/// Write queued messages to the data socket until the queue closes.
///
/// Flushes whenever the queue runs empty. A write failure, including the
/// write timeout of a client that stopped reading, stops forwarding; later
/// messages are dropped by the closed queue.
fn run_forward_loop(
    label: &str,
    data: std::net::TcpStream,
    rx: Receiver<TCStr>,
    cpu_core: Option<i32>,
) {
    txc_core::cpu_affinity::maybe_pin(cpu_core);
    info!("[{label}] forwarder started");

    let mut out = BufWriter::with_capacity(1 << 16, data);
    let mut forwarded: u64 = 0;
    while let Ok(buf) = rx.recv() {
        let written = out
            .write_all(buf.to_bytes())
            .and_then(|_| out.write_all(&[frame::TERMINATOR]))
            .and_then(|_| if rx.is_empty() { out.flush() } else { Ok(()) });
        drop(buf);
        if let Err(e) = written {
            error!("[{label}] data socket write failed: {e}");
            drop(rx);
            // a plain drop would retry the flush and block again
            let (_data, unsent) = out.into_parts();
            debug!("[{label}] discarded {} buffered bytes", unsent.map_or(0, |b| b.len()));
            info!("[{label}] forwarder stopped after {forwarded} messages");
            return;
        }
        forwarded += 1;
    }
    if let Err(e) = out.flush() {
        debug!("[{label}] final flush failed: {e}");
    }
    info!("[{label}] forwarder exited after {forwarded} messages");
}
