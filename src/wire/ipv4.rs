pub use core::net::Ipv4Addr as Address;

pub const ADDR_SIZE: usize = 4;

/// Length of the fixed IPv4 header. Options are never emitted by this stack.
pub const HEADER_LEN: usize = 20;

/// Minimum MTU every IPv4 path is assumed to support.
///
/// Path-MTU estimates are never lowered below this.
pub const MIN_MTU: usize = 576;

pub(crate) trait AddressExt {
    /// Construct an IPv4 address from a sequence of octets, in big-endian.
    ///
    /// # Panics
    /// The function panics if `data` is not four octets long.
    #[allow(unused)]
    fn from_bytes(data: &[u8]) -> Self;

    /// Query whether the address is an unicast address.
    ///
    /// `x_` prefix is to avoid a collision with the still-unstable method in `core::ip`.
    fn x_is_unicast(&self) -> bool;
}

impl AddressExt for Address {
    fn from_bytes(data: &[u8]) -> Address {
        let mut bytes = [0; ADDR_SIZE];
        bytes.copy_from_slice(data);
        Address::from_bits(u32::from_be_bytes(bytes))
    }

    /// Query whether the address is an unicast address.
    fn x_is_unicast(&self) -> bool {
        !(self.is_broadcast() || self.is_multicast() || self.is_unspecified())
    }
}
