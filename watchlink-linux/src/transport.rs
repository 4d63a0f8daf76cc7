//! Watch transport: RFCOMM serial device or TCP bridge, framed I/O, reconnect.

use std::path::Path;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use watchlink_core::wire::encode_frame;
use watchlink_core::{CommandError, OutboundAction, TransportError, WatchConnection};

use crate::config::Config;
use crate::control::{self, Command, Output};

const READ_BUF_LEN: usize = 4096;
const TICK: Duration = Duration::from_secs(1);

/// Input to the link task.
#[derive(Debug)]
pub enum Request {
    Command(Command),
    Shutdown,
}

/// Why a session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Shutdown,
    Lost(String),
}

pub type WatchReader = Box<dyn AsyncRead + Unpin + Send>;
pub type WatchWriter = Box<dyn AsyncWrite + Unpin + Send>;

async fn connect(cfg: &Config) -> std::io::Result<(WatchReader, WatchWriter)> {
    if let Some(addr) = &cfg.tcp_addr {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(%addr, "connected to tcp bridge");
        let (rd, wr) = stream.into_split();
        let rd: WatchReader = Box::new(rd);
        let wr: WatchWriter = Box::new(wr);
        return Ok((rd, wr));
    }
    let (rd, wr) = open_serial(&cfg.device, &cfg.device).await?;
    info!(device = %cfg.device.display(), "opened serial device");
    let rd: WatchReader = Box::new(rd);
    let wr: WatchWriter = Box::new(wr);
    Ok((rd, wr))
}

/// One handle per direction. A `File` runs a single blocking operation at a time, so a
/// shared handle would park every write behind the pending tty read.
async fn open_serial(read_path: &Path, write_path: &Path) -> std::io::Result<(File, File)> {
    let rd = OpenOptions::new().read(true).open(read_path).await?;
    let wr = OpenOptions::new().write(true).open(write_path).await?;
    Ok((rd, wr))
}

/// Own the connection for the life of the daemon: connect, run a session, wait, retry.
pub async fn run_link(
    cfg: Config,
    mut requests: mpsc::Receiver<Request>,
    outputs: mpsc::UnboundedSender<Output>,
) {
    let mut conn = WatchConnection::new(cfg.link_config());
    loop {
        match connect(&cfg).await {
            Ok((rd, wr)) => match run_session(&mut conn, rd, wr, &mut requests, &outputs).await {
                SessionEnd::Shutdown => return,
                SessionEnd::Lost(reason) => warn!("watch link lost: {reason}"),
            },
            Err(e) => warn!("connect failed: {e}"),
        }
        if wait_offline(&mut conn, cfg.reconnect_delay(), &mut requests, &outputs).await {
            return;
        }
    }
}

/// Sit out the reconnect delay while still accepting commands. Returns true on shutdown.
async fn wait_offline(
    conn: &mut WatchConnection,
    delay: Duration,
    requests: &mut mpsc::Receiver<Request>,
    outputs: &mpsc::UnboundedSender<Output>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            req = requests.recv() => match req {
                Some(Request::Command(cmd)) => {
                    let actions = apply_command(conn, cmd, outputs);
                    emit_offline(actions, outputs);
                }
                Some(Request::Shutdown) | None => {
                    emit_offline(conn.shutdown(), outputs);
                    return true;
                }
            },
        }
    }
}

enum Input {
    Read(std::io::Result<usize>),
    Request(Option<Request>),
    Tick,
}

/// Pump one open transport until it fails or shutdown is requested.
/// The connection is closed (handlers notified) before this returns.
pub async fn run_session<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    conn: &mut WatchConnection,
    mut rd: R,
    mut wr: W,
    requests: &mut mpsc::Receiver<Request>,
    outputs: &mpsc::UnboundedSender<Output>,
) -> SessionEnd {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut buf = vec![0u8; READ_BUF_LEN];
    let mut actions = conn.on_transport_opened();
    loop {
        if let Err(reason) = execute(actions, &mut wr, outputs).await {
            emit_offline(conn.on_transport_closed(), outputs);
            return SessionEnd::Lost(reason);
        }
        let input = tokio::select! {
            r = rd.read(&mut buf) => Input::Read(r),
            req = requests.recv() => Input::Request(req),
            _ = ticker.tick() => Input::Tick,
        };
        actions = match input {
            Input::Read(Ok(0)) => {
                emit_offline(conn.on_transport_closed(), outputs);
                return SessionEnd::Lost("watch closed the stream".to_string());
            }
            Input::Read(Ok(n)) => conn.on_bytes_received(&buf[..n]),
            Input::Read(Err(e)) => {
                emit_offline(conn.on_transport_closed(), outputs);
                return SessionEnd::Lost(format!("read failed: {e}"));
            }
            Input::Request(Some(Request::Command(cmd))) => apply_command(conn, cmd, outputs),
            Input::Request(Some(Request::Shutdown)) | Input::Request(None) => {
                emit_offline(conn.shutdown(), outputs);
                let _ = wr.shutdown().await;
                return SessionEnd::Shutdown;
            }
            Input::Tick => conn.tick(),
        };
    }
}

fn apply_command(
    conn: &mut WatchConnection,
    cmd: Command,
    outputs: &mpsc::UnboundedSender<Output>,
) -> Vec<OutboundAction> {
    match control::apply(conn, cmd) {
        Ok(actions) => actions,
        Err(e) => {
            warn!("command rejected: {e}");
            let _ = outputs.send(Output::CommandFailed(e));
            Vec::new()
        }
    }
}

/// Carry out actions against an open transport. Err means the session must end.
/// A payload too large to frame is reported and skipped; nothing of it reaches the stream.
async fn execute<W: AsyncWrite + Unpin>(
    actions: Vec<OutboundAction>,
    wr: &mut W,
    outputs: &mpsc::UnboundedSender<Output>,
) -> Result<(), String> {
    if actions.is_empty() {
        return Ok(());
    }
    for action in actions {
        match action {
            OutboundAction::Send { endpoint, payload } => {
                debug!(endpoint, len = payload.len(), "send frame");
                let frame = match encode_frame(endpoint, &payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(endpoint, "frame not sent: {e}");
                        let err = CommandError::Transport(TransportError::Encode(e));
                        let _ = outputs.send(Output::CommandFailed(err));
                        continue;
                    }
                };
                wr.write_all(&frame)
                    .await
                    .map_err(|e| format!("write failed: {e}"))?;
            }
            OutboundAction::Emit(event) => {
                let _ = outputs.send(Output::Event(event));
            }
            OutboundAction::Disconnect(reason) => return Err(reason),
        }
    }
    wr.flush().await.map_err(|e| format!("flush failed: {e}"))
}

/// With no transport only events can be delivered.
fn emit_offline(actions: Vec<OutboundAction>, outputs: &mpsc::UnboundedSender<Output>) {
    for action in actions {
        match action {
            OutboundAction::Emit(event) => {
                let _ = outputs.send(Output::Event(event));
            }
            other => debug!(?other, "dropped while offline"),
        }
    }
}
