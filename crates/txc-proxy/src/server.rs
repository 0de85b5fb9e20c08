//! Control port listener.
//!
//! Every accepted connection becomes a session. With process isolation the
//! socket is handed to a fresh child (`txc-runner session`) which owns its
//! own copy of the connector library; otherwise sessions run one at a time
//! inside this process.

use std::ffi::OsString;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::handoff;
use crate::loader::ConnectorLoader;
use crate::session::{self, SessionSettings};

/// How to start a session child.
#[derive(Debug, Clone)]
pub struct SessionCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl SessionCommand {
    /// The running executable with `args`.
    pub fn current_exe(args: Vec<OsString>) -> Result<Self> {
        let program = std::env::current_exe().context("locate current executable")?;
        Ok(Self { program, args })
    }
}

/// Where sessions run.
#[derive(Clone)]
pub enum SessionMode {
    Process(SessionCommand),
    InProcess(Arc<dyn ConnectorLoader>),
}

impl std::fmt::Debug for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Process(cmd) => f.debug_tuple("Process").field(cmd).finish(),
            SessionMode::InProcess(_) => f.write_str("InProcess"),
        }
    }
}

pub struct ProxyServer {
    listener: TcpListener,
    mode: SessionMode,
    settings: Arc<SessionSettings>,
}

impl ProxyServer {
    /// Bind the control port; when it is taken, any free port is used.
    pub async fn bind(
        addr: IpAddr,
        port: u16,
        mode: SessionMode,
        settings: SessionSettings,
    ) -> Result<Self> {
        let listener = match TcpListener::bind((addr, port)).await {
            Ok(l) => l,
            Err(e) if port != 0 => {
                warn!("control port {port} unavailable ({e}), falling back to a free port");
                TcpListener::bind((addr, 0)).await.context("bind control listener")?
            }
            Err(e) => return Err(e).context("bind control listener"),
        };
        let server = Self { listener, mode, settings: Arc::new(settings) };
        info!("proxy listening on {} ({:?})", server.local_addr()?, server.mode);
        Ok(server)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("proxy shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    info!("client {peer} connected");
                    self.dispatch(stream, peer).await;
                }
            }
        }
    }

    async fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        match &self.mode {
            SessionMode::Process(cmd) => {
                if let Err(e) = spawn_session(cmd, stream, peer).await {
                    error!("client {peer}: failed to start session process: {e:#}");
                }
            }
            SessionMode::InProcess(loader) => {
                let served = session::run_session(stream, loader.as_ref(), &self.settings).await;
                if let Err(e) = served {
                    error!("client {peer}: session failed: {e:#}");
                }
            }
        }
    }
}

async fn spawn_session(cmd: &SessionCommand, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let stream = stream.into_std()?;
    let mut command = Command::new(&cmd.program);
    command.args(&cmd.args);
    let mut child = handoff::spawn_with_socket(command, &stream).await?;
    // the child owns the connection now
    drop(stream);

    let pid = child.id().unwrap_or_default();
    info!("client {peer}: session process {pid} started");
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => info!("session process {pid} exited"),
            Ok(status) => warn!("session process {pid} exited with {status}"),
            Err(e) => error!("session process {pid}: wait failed: {e}"),
        }
    });
    Ok(())
}

/// Child side of process isolation: serve the inherited client socket.
pub async fn serve_inherited(
    loader: &dyn ConnectorLoader,
    settings: &SessionSettings,
) -> Result<()> {
    let stream = handoff::take_session_stream()?
        .context("no session socket was handed to this process")?;
    stream.set_nonblocking(true)?;
    let stream = TcpStream::from_std(stream)?;
    session::run_session(stream, loader, settings).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProxyClient;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use txc_connector::{Api, mock};

    const WAIT: Duration = Duration::from_secs(5);
    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn in_process() -> SessionMode {
        SessionMode::InProcess(Arc::new(mock::api as fn() -> Arc<Api>))
    }

    fn settings(name: &str) -> SessionSettings {
        let dir = std::env::temp_dir().join(format!("txc-server-{name}-{}", std::process::id()));
        SessionSettings { session_dir: dir, ..SessionSettings::default() }
    }

    #[tokio::test]
    async fn busy_port_falls_back() {
        let taken = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let server =
            ProxyServer::bind(LOCALHOST, port, in_process(), settings("busy")).await.unwrap();
        let got = server.local_addr().unwrap().port();
        assert_ne!(got, port);
        assert_ne!(got, 0);
    }

    #[tokio::test]
    async fn in_process_sessions_run_back_to_back() {
        let _g = mock::lock();
        let settings = settings("seq");
        let dir = settings.session_dir.clone();
        let server = ProxyServer::bind(LOCALHOST, 0, in_process(), settings).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(async {
            let _ = stop_rx.await;
        }));

        for _ in 0..2 {
            let mut client =
                tokio::time::timeout(WAIT, ProxyClient::connect(addr)).await.unwrap().unwrap();
            let reply = client.send(br#"<command id="get_connector_version"/>"#).await.unwrap();
            assert_eq!(reply, br#"<result success="true"/>"#);
            let msg =
                tokio::time::timeout(WAIT, client.next_message()).await.unwrap().unwrap().unwrap();
            let version =
                format!("<connector_version>{}</connector_version>", mock::CONNECTOR_VERSION);
            assert_eq!(msg, version.as_bytes());
            drop(client);
        }

        let _ = stop_tx.send(());
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(mock::live_buffers(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }
}
