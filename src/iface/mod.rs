/*! Interfaces toward the IP layer.

The TCP engine does not parse or build IPv4 headers; it consumes
[Ipv4RxInfo] describing a received datagram and hands finished segments to
an [IpSender]. The IP layer (routing, ARP, driver glue) lives behind that
trait.

[Ipv4RxInfo]: struct.Ipv4RxInfo.html
[IpSender]: trait.IpSender.html
*/

pub mod pmtu;

use core::fmt;

use crate::event::Observable;
use crate::storage::BufRef;
use crate::wire::{IpProtocol, Ipv4Address};

/// Errors from the IP send path.
///
/// All of these are handled inside the engine; none surface to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpErr {
    /// The driver transmit buffer is full; the caller may subscribe for a
    /// retry notification.
    BufferFull,
    /// Link-layer address resolution is in progress; the caller may
    /// subscribe for a retry notification.
    ArpPending,
    /// No route to the destination.
    NoRoute,
    /// The datagram exceeds the interface MTU and may not be fragmented.
    PacketTooLarge,
    /// Any other driver failure.
    HardwareError,
}

impl std::error::Error for IpErr {}

impl fmt::Display for IpErr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpErr::BufferFull => write!(f, "transmit buffer full"),
            IpErr::ArpPending => write!(f, "address resolution in progress"),
            IpErr::NoRoute => write!(f, "no route to destination"),
            IpErr::PacketTooLarge => write!(f, "datagram exceeds MTU"),
            IpErr::HardwareError => write!(f, "hardware error"),
        }
    }
}

/// Flags for [`IpSender::send_ip4`].
///
/// [`IpSender::send_ip4`]: trait.IpSender.html#tymethod.send_ip4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpSendFlags(u8);

impl IpSendFlags {
    /// Set the Don't Fragment bit in the IPv4 header.
    pub const DONT_FRAG: IpSendFlags = IpSendFlags(0b0001);

    pub const fn empty() -> IpSendFlags {
        IpSendFlags(0)
    }

    pub const fn contains(self, other: IpSendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for IpSendFlags {
    type Output = IpSendFlags;

    fn bitor(self, rhs: IpSendFlags) -> IpSendFlags {
        IpSendFlags(self.0 | rhs.0)
    }
}

/// Receive metadata of an IPv4 datagram handed to the engine.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4RxInfo {
    pub src_addr: Ipv4Address,
    pub dst_addr: Ipv4Address,
    pub ttl: u8,
}

/// Send metadata of an IPv4 datagram produced by the engine.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4SendMeta {
    pub src_addr: Ipv4Address,
    pub dst_addr: Ipv4Address,
    pub protocol: IpProtocol,
    pub ttl: u8,
    pub flags: IpSendFlags,
}

/// Routing answer for a destination address.
#[derive(Debug, Clone, Copy)]
pub struct RouteInfo {
    /// Source address to use toward the destination.
    pub local_addr: Ipv4Address,
    /// MTU of the outgoing interface.
    pub mtu: u16,
}

/// Opaque subscription token for driver retry notification.
///
/// The engine hands one to [`IpSender::send_ip4`] on transient failures;
/// the driver queues it on its [SendRetryList] and the glue feeds drained
/// tokens back through `TcpProto::retry_sending`.
///
/// [`IpSender::send_ip4`]: trait.IpSender.html#tymethod.send_ip4
/// [SendRetryList]: type.SendRetryList.html
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryToken(pub(crate) u64);

/// Retry subscriptions awaiting "transmit buffer drained" or "ARP query
/// resolved".
pub type SendRetryList = Observable<RetryToken>;

/// The send half of the IP layer, as seen by the transport engine.
pub trait IpSender {
    /// Resolve the source address and interface MTU toward `dst_addr`.
    fn route(&self, dst_addr: Ipv4Address) -> Option<RouteInfo>;

    /// Transmit one IPv4 datagram. `dgram` is the transport header and
    /// payload as a buffer chain; the implementation serializes it after
    /// the IPv4 header it builds from `meta`.
    ///
    /// On [`IpErr::BufferFull`] or [`IpErr::ArpPending`] the
    /// implementation should queue `retry`, if given, for dispatch once
    /// the condition clears.
    ///
    /// [`IpErr::BufferFull`]: enum.IpErr.html#variant.BufferFull
    /// [`IpErr::ArpPending`]: enum.IpErr.html#variant.ArpPending
    fn send_ip4(
        &mut self,
        meta: &Ipv4SendMeta,
        dgram: BufRef<'_>,
        retry: Option<RetryToken>,
    ) -> Result<(), IpErr>;
}
