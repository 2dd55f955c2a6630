//! Stream channel over an established link
//!
//! One TCP connection at a time, either accepted (listener mode) or opened
//! (connector mode) on the well-known port. A dedicated task reads
//! newline-terminated lines and reports `ChannelClosed` exactly once when it
//! stops after opening. A writer task beside it drains the outgoing queue in
//! order, so a peer that stops reading never stalls the read side.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nanlink_core::{Event, EventSender, StreamConfig, StreamError, StreamId};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ActiveStream {
    id: StreamId,
    outgoing: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    closed: bool,
}

/// Owns at most one stream connection
pub struct StreamChannel {
    config: StreamConfig,
    events: EventSender,
    next_id: u64,
    active: Option<ActiveStream>,
}

impl StreamChannel {
    pub fn new(config: StreamConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            next_id: 0,
            active: None,
        }
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.active.as_ref().map(|a| a.id)
    }

    pub fn is_current(&self, stream: StreamId) -> bool {
        self.stream_id() == Some(stream)
    }

    /// Whether a connection is established and its task still running
    pub fn is_open(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| !a.closed && a.connected.load(Ordering::Acquire))
    }

    fn allocate(&mut self) -> Result<StreamId, StreamError> {
        if self.active.is_some() {
            return Err(StreamError::AlreadyOpen);
        }
        self.next_id += 1;
        Ok(StreamId::new(self.next_id))
    }

    // ---- Opening ----

    /// Bind the well-known port and accept one connection in the background
    pub async fn listen(&mut self) -> Result<StreamId, StreamError> {
        let id = self.allocate()?;
        let local = SocketAddr::new(self.config.listen_address, self.config.port);
        let listener = TcpListener::bind(local).await?;
        info!("{} listening on {}", id, local);

        let (outgoing, queue) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));
        let events = self.events.clone();
        let flag = connected.clone();

        let task = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;
            let accepted = tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!("{} closed before a peer connected", id);
                    return;
                }
                accepted = listener.accept() => accepted,
            };
            // Further inbound attempts are refused
            drop(listener);

            match accepted {
                Ok((socket, remote)) => {
                    serve(id, socket, Some(remote), queue, flag, shutdown_rx, events).await;
                }
                Err(e) => {
                    warn!("{} accept failed: {}", id, e);
                    let _ = events.send(Event::StreamFailed {
                        stream: id,
                        error: StreamError::from(e).to_string(),
                    });
                }
            }
        });

        self.active = Some(ActiveStream {
            id,
            outgoing,
            connected,
            shutdown,
            task,
            closed: false,
        });
        Ok(id)
    }

    /// Connect to `peer` on the well-known port in the background. A failed
    /// attempt reports `StreamFailed`; retrying is up to the caller.
    pub fn connect(&mut self, peer: IpAddr) -> Result<StreamId, StreamError> {
        let id = self.allocate()?;
        let remote = SocketAddr::new(peer, self.config.port);
        debug!("{} connecting to {}", id, remote);

        let (outgoing, queue) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));
        let events = self.events.clone();
        let flag = connected.clone();

        let task = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;
            let attempt = tokio::select! {
                _ = shutdown_rx.changed() => return,
                attempt = TcpStream::connect(remote) => attempt,
            };

            match attempt {
                Ok(socket) => {
                    serve(id, socket, Some(remote), queue, flag, shutdown_rx, events).await;
                }
                Err(e) => {
                    let error = StreamError::ConnectFailed {
                        addr: remote.to_string(),
                        reason: e.to_string(),
                    };
                    debug!("{} {}", id, error);
                    let _ = events.send(Event::StreamFailed {
                        stream: id,
                        error: error.to_string(),
                    });
                }
            }
        });

        self.active = Some(ActiveStream {
            id,
            outgoing,
            connected,
            shutdown,
            task,
            closed: false,
        });
        Ok(id)
    }

    // ---- Task reports ----

    /// Forget a stream whose open attempt failed; false if stale
    pub fn on_failed(&mut self, stream: StreamId) -> bool {
        if !self.is_current(stream) {
            return false;
        }
        self.active = None;
        true
    }

    /// Note that the stream task has stopped; false if stale or repeated
    pub fn on_closed(&mut self, stream: StreamId) -> bool {
        match self.active.as_mut() {
            Some(active) if active.id == stream && !active.closed => {
                active.closed = true;
                true
            }
            _ => false,
        }
    }

    // ---- Sending ----

    /// Queue one line for writing. Blank lines are dropped silently. The
    /// outcome arrives later as `Event::SendCompleted`.
    pub fn send(&self, line: &str) -> Result<(), StreamError> {
        if line.trim().is_empty() {
            debug!("Dropping blank outgoing line");
            return Ok(());
        }
        let active = self.active.as_ref().ok_or(StreamError::NotConnected)?;
        if active.closed || !active.connected.load(Ordering::Acquire) {
            return Err(StreamError::NotConnected);
        }
        active
            .outgoing
            .send(line.to_string())
            .map_err(|_| StreamError::NotConnected)
    }

    // ---- Closing ----

    /// Stop the stream task and wait for it. Idempotent; returns the id of
    /// the stream that was held.
    pub async fn close(&mut self) -> Option<StreamId> {
        let active = self.active.take()?;
        debug!("Closing {}", active.id);
        let _ = active.shutdown.send(true);

        let mut task = active.task;
        match tokio::time::timeout(self.config.close_timeout(), &mut task).await {
            Ok(_) => {}
            Err(_) => {
                warn!("{} did not stop in time, aborting", active.id);
                task.abort();
            }
        }
        Some(active.id)
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.shutdown.send(true);
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Task
// ----------------------------------------------------------------------------

async fn serve(
    id: StreamId,
    socket: TcpStream,
    remote: Option<SocketAddr>,
    queue: mpsc::UnboundedReceiver<String>,
    connected: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
    events: EventSender,
) {
    let (read_half, write_half) = socket.into_split();
    connected.store(true, Ordering::Release);
    info!("{} open (remote {:?})", id, remote);
    let _ = events.send(Event::StreamOpened { stream: id, remote });

    // Writes never hold up reading; the writer stops when the reader does
    let (stop, stop_rx) = watch::channel(false);
    let writer = tokio::spawn(write_loop(id, write_half, queue, stop_rx, events.clone()));

    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => break None,
            read = read_line(&mut reader, &mut buf) => match read {
                Ok(Some(line)) => {
                    let _ = events.send(Event::LineReceived { stream: id, line });
                }
                Ok(None) => {
                    debug!("{} reached end of stream", id);
                    break None;
                }
                Err(e) => {
                    warn!("{} read failed: {}", id, e);
                    break Some(StreamError::from(e).to_string());
                }
            },
        }
    };

    connected.store(false, Ordering::Release);
    let _ = stop.send(true);
    if let Err(e) = writer.await {
        warn!("{} writer task failed: {}", id, e);
    }
    info!("{} closed", id);
    let _ = events.send(Event::ChannelClosed { stream: id, reason });
}

/// Write queued lines in order until told to stop or the queue closes
async fn write_loop(
    id: StreamId,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<String>,
    mut stop: watch::Receiver<bool>,
    events: EventSender,
) {
    loop {
        let line = tokio::select! {
            _ = stop.changed() => break,
            line = queue.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let result = tokio::select! {
            _ = stop.changed() => {
                debug!("{} stopped with a write in flight", id);
                break;
            }
            written = write_line(&mut writer, &line) => written.map_err(|e| e.to_string()),
        };
        let _ = events.send(Event::SendCompleted {
            stream: id,
            line,
            result,
        });
    }
    let _ = writer.shutdown().await;
}

/// Next newline-terminated line, decoded lossily. `None` at end of stream.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(decode_line(buf)))
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<(), StreamError> {
    let mut framed = String::with_capacity(line.len() + 1);
    framed.push_str(line);
    framed.push('\n');
    writer.write_all(framed.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
