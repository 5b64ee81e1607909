use core::fmt;

use crate::wire::Ipv4Address;

/// Handle to a TCP connection owned by a [`TcpProto`].
///
/// Handles are generational: after the connection dies (peer reset, abort,
/// full close) the handle goes stale and every engine call with it becomes
/// a no-op or returns `None`. A handle must not be used after an
/// [`TcpEvent::Aborted`] for it has been delivered.
///
/// [`TcpProto`]: struct.TcpProto.html
/// [`TcpEvent::Aborted`]: enum.TcpEvent.html#variant.Aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpConnection {
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}

/// Handle to a passive socket owned by a [`TcpProto`].
///
/// [`TcpProto`]: struct.TcpProto.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpListener {
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}

/// Connection lifecycle notifications, drained through
/// `TcpProto::dispatch_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpEvent {
    /// A handshake completed on a listener. The connection must be adopted
    /// with `TcpProto::accept` from within this event's callback, or it is
    /// reset once the callback returns.
    ConnectionRequest {
        listener: TcpListener,
        conn: TcpConnection,
    },
    /// An active open completed.
    Connected { conn: TcpConnection },
    /// `len` new bytes are readable from the receive buffer.
    DataReceived { conn: TcpConnection, len: usize },
    /// The peer closed its send side (FIN received). Data already received
    /// remains readable; nothing past the FIN will ever be delivered.
    EndReceived { conn: TcpConnection },
    /// Every submitted byte has been acknowledged.
    SendBufEmpty { conn: TcpConnection },
    /// The connection is gone: peer reset, timeout, or fatal path error.
    /// The handle is stale once this has been delivered.
    Aborted { conn: TcpConnection },
}

impl TcpEvent {
    /// The connection the event concerns.
    pub fn conn(&self) -> TcpConnection {
        match *self {
            TcpEvent::ConnectionRequest { conn, .. }
            | TcpEvent::Connected { conn }
            | TcpEvent::DataReceived { conn, .. }
            | TcpEvent::EndReceived { conn }
            | TcpEvent::SendBufEmpty { conn }
            | TcpEvent::Aborted { conn } => conn,
        }
    }
}

/// Reasons `TcpProto::connect` can fail synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// No free port in the ephemeral range.
    NoPortAvailable,
    /// The PCB table is full.
    NoPcbAvailable,
    /// No route to the remote address.
    NoRoute,
    /// The path-MTU cache is full of referenced entries.
    NoMtuRefAvailable,
    /// The requested four-tuple is already in use.
    AddrInUse,
}

impl std::error::Error for ConnectError {}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectError::NoPortAvailable => write!(f, "no local port available"),
            ConnectError::NoPcbAvailable => write!(f, "connection table full"),
            ConnectError::NoRoute => write!(f, "no route to host"),
            ConnectError::NoMtuRefAvailable => write!(f, "path-MTU cache full"),
            ConnectError::AddrInUse => write!(f, "address already in use"),
        }
    }
}

/// Reasons `TcpProto::listen` can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenError {
    /// The listener table is full.
    NoListenerAvailable,
    /// A listener for this port and address already exists.
    AddrInUse,
}

impl std::error::Error for ListenError {}

impl fmt::Display for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ListenError::NoListenerAvailable => write!(f, "listener table full"),
            ListenError::AddrInUse => write!(f, "address already in use"),
        }
    }
}

/// A passive socket: SYNs matching it spawn embryonic connections.
#[derive(Debug)]
pub(crate) struct Listener {
    /// `None` listens on every local address.
    pub local_addr: Option<Ipv4Address>,
    pub local_port: u16,
    /// Bound on simultaneously embryonic (not yet adopted) connections.
    pub backlog: usize,
    /// Current embryonic connection count.
    pub num_pending: usize,
    /// Window advertised before the user attaches buffers. A non-zero
    /// value obliges the user to attach a receive buffer at least this
    /// large when adopting.
    pub initial_rcv_wnd: u32,
}
