use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::frame::{self, Frame};

/// Client side of the proxy protocol.
///
/// ```no_run
/// # async fn f() -> std::io::Result<()> {
/// let mut client = txc_proxy::ProxyClient::connect("127.0.0.1:5555".parse().unwrap()).await?;
/// let reply = client.send(br#"<command id="server_status"/>"#).await?;
/// while let Some(msg) = client.next_message().await? {
///     println!("{}", String::from_utf8_lossy(&msg));
/// }
/// # Ok(()) }
/// ```
pub struct ProxyClient {
    control_rd: BufReader<OwnedReadHalf>,
    control_wr: OwnedWriteHalf,
    data: BufReader<TcpStream>,
    data_port: u16,
    buf: Vec<u8>,
}

impl ProxyClient {
    /// Connect to the control port, then to the data port it announces.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let mut control = TcpStream::connect(addr).await?;
        control.set_nodelay(true)?;
        let data_port = control.read_u16_le().await?;
        let data = TcpStream::connect((addr.ip(), data_port)).await?;
        debug!("connected to {addr}, data port {data_port}");

        let (rd, wr) = control.into_split();
        Ok(Self {
            control_rd: BufReader::new(rd),
            control_wr: wr,
            data: BufReader::new(data),
            data_port,
            buf: Vec::with_capacity(4096),
        })
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    /// Send one command and wait for its reply (terminator stripped).
    ///
    /// A trailing `\0` is accepted; any other `\0` is `InvalidInput`, since
    /// the proxy would read it as two commands.
    pub async fn send(&mut self, command: &[u8]) -> io::Result<Vec<u8>> {
        let command = frame::payload(command);
        if command.contains(&frame::TERMINATOR) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "command contains an interior NUL",
            ));
        }
        frame::write_frame(&mut self.control_wr, command).await?;
        match frame::read_frame(&mut self.control_rd, &mut self.buf, usize::MAX).await? {
            Frame::Complete => Ok(frame::payload(&self.buf).to_vec()),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the control socket",
            )),
        }
    }

    /// Next asynchronous message, `None` once the session is over.
    pub async fn next_message(&mut self) -> io::Result<Option<Vec<u8>>> {
        match frame::read_frame(&mut self.data, &mut self.buf, usize::MAX).await? {
            Frame::Complete => Ok(Some(frame::payload(&self.buf).to_vec())),
            _ => Ok(None),
        }
    }
}
