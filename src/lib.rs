/*! Event-loop driven IPv4 TCP protocol engine.

The crate provides the transport core of an IPv4 network stack: zero-copy
chained buffers, a single-threaded event loop with one-shot timers, a
path-MTU cache, and a TCP protocol engine with NewReno congestion control.
Link-layer framing, ARP and the IPv4/ICMP codecs are external collaborators:
the engine consumes parsed receive metadata and hands finished datagrams to
an [`iface::IpSender`].

The `wire` module deals with packet *representation* and provides two levels
of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens through the
   `Packet` family of structures, e.g. [TcpPacket].
 * Second, in cases where the space of valid field values is much smaller
   than the space of possible field values, it provides a compact, high-level
   representation of packet data that can be parsed from and emitted into a
   sequence of octets. This happens through the `Repr` family of structs,
   e.g. [TcpRepr].

[TcpPacket]: wire/struct.TcpPacket.html
[TcpRepr]: wire/struct.TcpRepr.html
*/

#[macro_use]
mod macros;

mod config;
mod rand;

pub mod event;
pub mod iface;
pub mod storage;
pub mod tcp;
pub mod time;
pub mod wire;
