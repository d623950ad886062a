//! Message transport between the debugger and the IDE.
//!
//! The facade only needs two things from a transport: a way to send an
//! [`OutboundMessage`] and a callback receiving each [`TransportEvent`]. The
//! callback sees every decoded [`InboundMessage`] and, last of all, a
//! [`TransportEvent::Closed`] once the IDE goes away. [`TcpConnector`] speaks
//! the EmmyLua line framing over TCP; [`ChannelConnector`] keeps both ends in
//! process for embedding and tests.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::DebuggerError;
use crate::protocol::{InboundMessage, OutboundMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The IDE side ended the connection. Delivered at most once.
    Closed,
}

/// Invoked on the transport's receive thread for every event.
pub type EventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

pub trait Transport: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> Result<(), DebuggerError>;

    /// Stops the receive path. Calling it twice is harmless.
    fn close(&self) -> Result<(), DebuggerError>;
}

pub trait Connector: Send + Sync {
    fn connect(
        &self,
        host: &str,
        port: u16,
        handler: EventHandler,
    ) -> Result<Arc<dyn Transport>, DebuggerError>;
}

/// Reads one `cmd\njson\n` frame. Returns `None` at end of stream.
pub fn read_frame(reader: &mut impl BufRead) -> io::Result<Option<(i32, String)>> {
    let mut cmd_line = String::new();
    loop {
        cmd_line.clear();
        if reader.read_line(&mut cmd_line)? == 0 {
            return Ok(None);
        }
        if !cmd_line.trim().is_empty() {
            break;
        }
    }
    let cmd = cmd_line.trim().parse::<i32>().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid command id {:?}: {}", cmd_line.trim(), e),
        )
    })?;

    let mut payload = String::new();
    if reader.read_line(&mut payload)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended before message payload",
        ));
    }
    Ok(Some((cmd, payload.trim_end().to_string())))
}

pub fn write_frame(writer: &mut impl Write, cmd: i32, payload: &str) -> io::Result<()> {
    write!(writer, "{}\n{}\n", cmd, payload)?;
    writer.flush()
}

/// Opens TCP connections to an IDE listening for the debugger.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        handler: EventHandler,
    ) -> Result<Arc<dyn Transport>, DebuggerError> {
        let addr = format!("{}:{}", host, port);
        let connection_error = |source: io::Error| DebuggerError::Connection {
            addr: addr.clone(),
            source,
        };

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(connection_error)?
            .next()
            .ok_or_else(|| {
                connection_error(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "host did not resolve",
                ))
            })?;
        let stream =
            TcpStream::connect_timeout(&socket_addr, self.connect_timeout).map_err(connection_error)?;
        stream.set_nodelay(true).map_err(connection_error)?;
        let reader = stream.try_clone().map_err(connection_error)?;

        debug!(addr = %addr, "Connected to IDE");

        thread::Builder::new()
            .name("emmy-transport-recv".to_string())
            .spawn(move || receive_loop(BufReader::new(reader), handler))
            .map_err(connection_error)?;

        Ok(Arc::new(TcpTransport {
            stream: Mutex::new(stream),
        }))
    }
}

fn receive_loop(mut reader: impl BufRead, handler: EventHandler) {
    loop {
        match read_frame(&mut reader) {
            Ok(Some((cmd, payload))) => match InboundMessage::decode(cmd, &payload) {
                Ok(message) => handler(TransportEvent::Message(message)),
                Err(e) => warn!(error = %e, "Dropping malformed message"),
            },
            Ok(None) => {
                debug!("IDE closed the connection");
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(error = %e, "Dropping malformed frame");
            }
            Err(e) => {
                debug!(error = %e, "Receive loop stopped");
                break;
            }
        }
    }
    handler(TransportEvent::Closed);
}

pub struct TcpTransport {
    stream: Mutex<TcpStream>,
}

impl Transport for TcpTransport {
    fn send(&self, message: &OutboundMessage) -> Result<(), DebuggerError> {
        let payload = message.encode()?;
        let mut stream = self.stream.lock();
        write_frame(&mut *stream, message.cmd(), &payload)?;
        Ok(())
    }

    fn close(&self) -> Result<(), DebuggerError> {
        match self.stream.lock().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process connector: the IDE side is a [`ChannelPeer`].
#[derive(Clone)]
pub struct ChannelConnector {
    peer_tx: Sender<ChannelPeer>,
    refuse: bool,
}

impl ChannelConnector {
    /// Returns the connector and a receiver yielding one peer per connection.
    pub fn new() -> (Self, Receiver<ChannelPeer>) {
        let (peer_tx, peer_rx) = crossbeam_channel::unbounded();
        (
            Self {
                peer_tx,
                refuse: false,
            },
            peer_rx,
        )
    }

    /// A connector whose every connection attempt is refused.
    pub fn refusing() -> Self {
        let (mut connector, _) = Self::new();
        connector.refuse = true;
        connector
    }
}

impl Connector for ChannelConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        handler: EventHandler,
    ) -> Result<Arc<dyn Transport>, DebuggerError> {
        if self.refuse {
            return Err(DebuggerError::Connection {
                addr: format!("{}:{}", host, port),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }

        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
        let transport: Arc<dyn Transport> = Arc::new(ChannelTransport {
            outbound_tx: Mutex::new(Some(outbound_tx)),
        });
        let peer = ChannelPeer {
            handler,
            outbound_rx,
        };
        self.peer_tx.send(peer).map_err(|_| DebuggerError::Connection {
            addr: format!("{}:{}", host, port),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "no peer is listening"),
        })?;
        Ok(transport)
    }
}

struct ChannelTransport {
    outbound_tx: Mutex<Option<Sender<OutboundMessage>>>,
}

impl Transport for ChannelTransport {
    fn send(&self, message: &OutboundMessage) -> Result<(), DebuggerError> {
        match self.outbound_tx.lock().as_ref() {
            Some(tx) => tx
                .send(message.clone())
                .map_err(|_| DebuggerError::Protocol("peer disconnected".to_string())),
            None => Err(DebuggerError::NotConnected),
        }
    }

    fn close(&self) -> Result<(), DebuggerError> {
        self.outbound_tx.lock().take();
        Ok(())
    }
}

/// IDE end of a [`ChannelConnector`] connection.
pub struct ChannelPeer {
    handler: EventHandler,
    outbound_rx: Receiver<OutboundMessage>,
}

impl ChannelPeer {
    /// Delivers a message to the debugger on the calling thread.
    pub fn send(&self, message: InboundMessage) {
        (self.handler)(TransportEvent::Message(message));
    }

    /// Hangs up the IDE end, as a socket closed by the IDE would.
    pub fn disconnect(self) {
        (self.handler)(TransportEvent::Closed);
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<OutboundMessage, RecvTimeoutError> {
        self.outbound_rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<OutboundMessage> {
        self.outbound_rx.try_recv().ok()
    }

    /// True once the debugger side closed the transport and the queue is drained.
    pub fn is_closed(&self) -> bool {
        matches!(
            self.outbound_rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        )
    }
}

impl std::fmt::Debug for ChannelPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPeer").finish_non_exhaustive()
    }
}
