/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*. It provides two
levels of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens through the
   `Packet` family of structures, e.g. [TcpPacket].
 * Second, in cases where the space of valid field values is much smaller
   than the space of possible field values, it provides a compact,
   high-level representation of packet data that can be parsed from and
   emitted into a sequence of octets. This happens through the `Repr`
   family of structs, e.g. [TcpRepr].

[TcpPacket]: struct.TcpPacket.html
[TcpRepr]: struct.TcpRepr.html

The `Packet` family of data structures guarantees that, if the
`Packet::check_len()` method returned `Ok(())`, then no accessor or setter
method will panic. When parsing untrusted input, it is *necessary* to use
`Packet::new_checked()`; so long as the buffer is not modified, no accessor
will fail.
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
}

use core::fmt;

pub(crate) mod ip;
pub use self::ip::{checksum, Protocol as IpProtocol};

pub(crate) mod ipv4;
pub(crate) use self::ipv4::AddressExt as Ipv4AddressExt;
pub use self::ipv4::{
    Address as Ipv4Address, HEADER_LEN as IPV4_HEADER_LEN, MIN_MTU as IPV4_MIN_MTU,
};

pub(crate) mod tcp;
pub use self::tcp::{
    Control as TcpControl, Packet as TcpPacket, Repr as TcpRepr, SeqNumber as TcpSeqNumber,
    TcpOptions, HEADER_LEN as TCP_HEADER_LEN, MAX_OPTIONS_LEN as TCP_MAX_OPTIONS_LEN,
};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
