use byteorder::{ByteOrder, NetworkEndian};
use core::{fmt, ops};

use super::{Error, Result};
use crate::wire::ip::checksum;
use crate::wire::ip::Protocol as IpProtocol;
use crate::wire::ipv4::Address as Ipv4Address;

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo
/// 2<sup>32</sup>. Sequence numbers do not have a discontinuity when
/// compared pairwise across a signed overflow.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub u32);

impl SeqNumber {
    /// Whether `a <= b` in the sequence space anchored at `self`.
    pub fn ref_lte(self, a: SeqNumber, b: SeqNumber) -> bool {
        a - self <= b - self
    }

    /// Whether `a < b` in the sequence space anchored at `self`.
    pub fn ref_lt(self, a: SeqNumber, b: SeqNumber) -> bool {
        a - self < b - self
    }

    /// Whether `self` precedes `other` under the symmetric modular order.
    pub fn mod_lt(self, other: SeqNumber) -> bool {
        self - other >= 1 << 31
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ops::Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl ops::AddAssign<u32> for SeqNumber {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl ops::Sub<u32> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs))
    }
}

impl ops::Sub<SeqNumber> for SeqNumber {
    type Output = u32;

    /// The distance from `rhs` forward to `self`, modulo 2<sup>32</sup>.
    fn sub(self, rhs: SeqNumber) -> u32 {
        self.0.wrapping_sub(rhs.0)
    }
}

/// A read/write wrapper around a Transmission Control Protocol packet buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WIN_SIZE: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;

    pub const fn OPTIONS(length: u8) -> Field {
        URGENT.end..(length as usize)
    }

    pub const FLG_FIN: u16 = 0x001;
    pub const FLG_SYN: u16 = 0x002;
    pub const FLG_RST: u16 = 0x004;
    pub const FLG_PSH: u16 = 0x008;
    pub const FLG_ACK: u16 = 0x010;
    pub const FLG_URG: u16 = 0x020;

    pub const OPT_END: u8 = 0x00;
    pub const OPT_NOP: u8 = 0x01;
    pub const OPT_MSS: u8 = 0x02;
    pub const OPT_WS: u8 = 0x03;
}

/// Length of the fixed TCP header.
pub const HEADER_LEN: usize = field::URGENT.end;

/// Largest option block this stack emits (MSS and Window Scale).
pub const MAX_OPTIONS_LEN: usize = 8;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TCP packet structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error)` if the buffer is too short.
    ///
    /// The result of this check is invalidated by calling [set_header_len].
    ///
    /// [set_header_len]: #method.set_header_len
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            Err(Error)
        } else {
            let header_len = self.header_len() as usize;
            if len < header_len || header_len < HEADER_LEN {
                Err(Error)
            } else {
                Ok(())
            }
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_u32(&data[field::SEQ_NUM]))
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_u32(&data[field::ACK_NUM]))
    }

    #[inline]
    fn flags(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::FLAGS])
    }

    /// Return the FIN flag.
    #[inline]
    pub fn fin(&self) -> bool {
        self.flags() & field::FLG_FIN != 0
    }

    /// Return the SYN flag.
    #[inline]
    pub fn syn(&self) -> bool {
        self.flags() & field::FLG_SYN != 0
    }

    /// Return the RST flag.
    #[inline]
    pub fn rst(&self) -> bool {
        self.flags() & field::FLG_RST != 0
    }

    /// Return the PSH flag.
    #[inline]
    pub fn psh(&self) -> bool {
        self.flags() & field::FLG_PSH != 0
    }

    /// Return the ACK flag.
    #[inline]
    pub fn ack(&self) -> bool {
        self.flags() & field::FLG_ACK != 0
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        let data = self.buffer.as_ref();
        ((data[field::FLAGS.start] >> 4) * 4) as u8
    }

    /// Return the window size field.
    #[inline]
    pub fn window_len(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::CHECKSUM])
    }

    /// Validate the packet checksum over the pseudo-header and the whole
    /// buffer.
    pub fn verify_checksum(&self, src_addr: &Ipv4Address, dst_addr: &Ipv4Address) -> bool {
        let data = self.buffer.as_ref();
        checksum::combine(&[
            checksum::pseudo_header_v4(src_addr, dst_addr, IpProtocol::Tcp, data.len() as u32),
            checksum::data(data),
        ]) == !0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return the options, as a raw byte sequence.
    #[inline]
    pub fn options(&self) -> &'a [u8] {
        let header_len = self.header_len();
        let data = self.buffer.as_ref();
        &data[field::OPTIONS(header_len)]
    }

    /// Return a pointer to the payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let header_len = self.header_len() as usize;
        let data = self.buffer.as_ref();
        &data[header_len..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::ACK_NUM], value.0)
    }

    /// Clear the entire flags field.
    #[inline]
    pub fn clear_flags(&mut self) {
        let data = self.buffer.as_mut();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        let raw = raw & !0x0fff;
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
    }

    fn set_flag(&mut self, flag: u16, value: bool) {
        let data = self.buffer.as_mut();
        let mut raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        if value {
            raw |= flag;
        } else {
            raw &= !flag;
        }
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
    }

    /// Set the FIN flag.
    #[inline]
    pub fn set_fin(&mut self, value: bool) {
        self.set_flag(field::FLG_FIN, value)
    }

    /// Set the SYN flag.
    #[inline]
    pub fn set_syn(&mut self, value: bool) {
        self.set_flag(field::FLG_SYN, value)
    }

    /// Set the RST flag.
    #[inline]
    pub fn set_rst(&mut self, value: bool) {
        self.set_flag(field::FLG_RST, value)
    }

    /// Set the PSH flag.
    #[inline]
    pub fn set_psh(&mut self, value: bool) {
        self.set_flag(field::FLG_PSH, value)
    }

    /// Set the ACK flag.
    #[inline]
    pub fn set_ack(&mut self, value: bool) {
        self.set_flag(field::FLG_ACK, value)
    }

    /// Set the header length, in octets.
    #[inline]
    pub fn set_header_len(&mut self, value: u8) {
        debug_assert!(value % 4 == 0);
        let data = self.buffer.as_mut();
        data[field::FLAGS.start] =
            (data[field::FLAGS.start] & 0x0f) | (((value as usize / 4) as u8) << 4);
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    #[inline]
    pub fn set_urgent_at(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::URGENT], value)
    }

    /// Return a mutable pointer to the options.
    #[inline]
    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        let data = self.buffer.as_mut();
        &mut data[field::OPTIONS(header_len)]
    }

    /// Compute and fill in the header checksum over the pseudo-header and
    /// the whole buffer.
    pub fn fill_checksum(&mut self, src_addr: &Ipv4Address, dst_addr: &Ipv4Address) {
        self.set_checksum(0);
        let checksum = {
            let data = self.buffer.as_ref();
            !checksum::combine(&[
                checksum::pseudo_header_v4(src_addr, dst_addr, IpProtocol::Tcp, data.len() as u32),
                checksum::data(data),
            ])
        };
        self.set_checksum(checksum)
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// The TCP options this stack understands.
///
/// Unknown option kinds are skipped by the parser; a malformed option
/// length ends the scan without failing the segment.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub wnd_scale: Option<u8>,
}

impl TcpOptions {
    pub const fn none() -> TcpOptions {
        TcpOptions {
            mss: None,
            wnd_scale: None,
        }
    }

    /// Scan an option block.
    ///
    /// The scan never fails: anything it cannot make sense of merely
    /// terminates it.
    pub fn parse(data: &[u8]) -> TcpOptions {
        let mut opts = TcpOptions::none();
        let mut rest = data;
        loop {
            let kind = match rest.first() {
                Some(&kind) => kind,
                None => break,
            };
            rest = &rest[1..];
            match kind {
                field::OPT_END => break,
                field::OPT_NOP => continue,
                _ => (),
            }
            let length = match rest.first() {
                Some(&length) => length,
                None => break,
            };
            rest = &rest[1..];
            if length < 2 {
                break;
            }
            let data_len = (length - 2) as usize;
            if rest.len() < data_len {
                break;
            }
            match kind {
                field::OPT_MSS if data_len == 2 => {
                    opts.mss = Some(NetworkEndian::read_u16(&rest[..2]));
                }
                field::OPT_WS if data_len == 1 => {
                    opts.wnd_scale = Some(rest[0]);
                }
                _ => (),
            }
            rest = &rest[data_len..];
        }
        opts
    }

    /// Length of the emitted option block. Always a multiple of 4.
    pub const fn buffer_len(&self) -> usize {
        let mut len = 0;
        if self.mss.is_some() {
            len += 4;
        }
        if self.wnd_scale.is_some() {
            len += 4;
        }
        len
    }

    /// Emit the options into `buffer`, which must be exactly
    /// [buffer_len] long.
    ///
    /// [buffer_len]: #method.buffer_len
    pub fn emit(&self, buffer: &mut [u8]) {
        debug_assert_eq!(buffer.len(), self.buffer_len());
        let mut at = 0;
        if let Some(mss) = self.mss {
            buffer[at] = field::OPT_MSS;
            buffer[at + 1] = 4;
            NetworkEndian::write_u16(&mut buffer[at + 2..at + 4], mss);
            at += 4;
        }
        if let Some(shift) = self.wnd_scale {
            // padded with a leading NOP to keep 4-byte alignment
            buffer[at] = field::OPT_NOP;
            buffer[at + 1] = field::OPT_WS;
            buffer[at + 2] = 3;
            buffer[at + 3] = shift;
        }
    }
}

/// The control flags of a Transmission Control Protocol packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Control {
    None,
    Psh,
    Syn,
    Fin,
    Rst,
}

impl Control {
    /// Return the length of the control flag, in terms of sequence space.
    pub const fn len(self) -> usize {
        match self {
            Control::Syn | Control::Fin => 1,
            _ => 0,
        }
    }
}

/// A high-level representation of a Transmission Control Protocol packet
/// header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_port: u16,
    pub dst_port: u16,
    pub control: Control,
    pub seq_number: SeqNumber,
    pub ack_number: Option<SeqNumber>,
    pub window_len: u16,
    pub options: TcpOptions,
}

impl Repr {
    /// Parse a Transmission Control Protocol packet header and return a
    /// high-level representation.
    ///
    /// The checksum is not validated here; callers fold it over the whole
    /// buffer chain before parsing.
    pub fn parse<T>(packet: &Packet<&T>) -> Result<Repr>
    where
        T: AsRef<[u8]> + ?Sized,
    {
        packet.check_len()?;

        // Source and destination ports must be present.
        if packet.src_port() == 0 {
            return Err(Error);
        }
        if packet.dst_port() == 0 {
            return Err(Error);
        }

        let control = match (packet.syn(), packet.fin(), packet.rst(), packet.psh()) {
            (false, false, false, false) => Control::None,
            (false, false, false, true) => Control::Psh,
            (true, false, false, _) => Control::Syn,
            (false, true, false, _) => Control::Fin,
            (false, false, true, _) => Control::Rst,
            _ => return Err(Error),
        };
        let ack_number = match packet.ack() {
            true => Some(packet.ack_number()),
            false => None,
        };

        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            control,
            seq_number: packet.seq_number(),
            ack_number,
            window_len: packet.window_len(),
            options: TcpOptions::parse(packet.options()),
        })
    }

    /// Return the length of the header that will be emitted from this
    /// high-level representation.
    pub const fn header_len(&self) -> usize {
        HEADER_LEN + self.options.buffer_len()
    }

    /// Emit a high-level representation into a Transmission Control
    /// Protocol packet header.
    ///
    /// The checksum field is zeroed; the caller folds the checksum over
    /// the finished segment chain.
    pub fn emit<T>(&self, packet: &mut Packet<&mut T>)
    where
        T: AsRef<[u8]> + AsMut<[u8]> + ?Sized,
    {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_window_len(self.window_len);
        packet.set_header_len(self.header_len() as u8);
        packet.clear_flags();
        match self.control {
            Control::None => (),
            Control::Psh => packet.set_psh(true),
            Control::Syn => packet.set_syn(true),
            Control::Fin => packet.set_fin(true),
            Control::Rst => packet.set_rst(true),
        }
        packet.set_ack(self.ack_number.is_some());
        packet.set_urgent_at(0);
        packet.set_checksum(0);
        self.options.emit(packet.options_mut());
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> fmt::Display for Packet<&'a T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TCP src={} dst={} seq={} ack={} win={}",
            self.src_port(),
            self.dst_port(),
            self.seq_number(),
            self.ack_number(),
            self.window_len(),
        )?;
        if self.syn() {
            write!(f, " syn")?;
        }
        if self.fin() {
            write!(f, " fin")?;
        }
        if self.rst() {
            write!(f, " rst")?;
        }
        if self.psh() {
            write!(f, " psh")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_seq_ref_order() {
        let cases: &[(u32, u32, u32)] = &[
            (0, 1, 2),
            (100, 100, 200),
            (0xffff_fff0, 0xffff_fffe, 4),
            (0x7fff_ffff, 0x8000_0000, 0x8000_0001),
        ];
        for &(r, x, y) in cases {
            let r = SeqNumber(r);
            let (x, y) = (SeqNumber(x), SeqNumber(y));
            assert!(r.ref_lte(x, y));
            assert_eq!(r.ref_lte(x, y), (x - r) <= (y - r));
            assert!(r.ref_lt(x, y) || x == y);
            assert!(!r.ref_lt(y, x));
        }
    }

    #[test]
    fn test_seq_mod_order() {
        assert!(SeqNumber(1).mod_lt(SeqNumber(2)));
        assert!(!SeqNumber(2).mod_lt(SeqNumber(1)));
        assert!(SeqNumber(0xffff_ffff).mod_lt(SeqNumber(3)));
        assert!(!SeqNumber(3).mod_lt(SeqNumber(0xffff_ffff)));
    }

    #[test]
    fn test_seq_wrapping_arith() {
        assert_eq!(SeqNumber(0xffff_ffff) + 2, SeqNumber(1));
        assert_eq!(SeqNumber(1) - SeqNumber(0xffff_ffff), 2);
        assert_eq!(SeqNumber(1) - 2, SeqNumber(0xffff_ffff));
    }

    #[test]
    fn test_options_idempotent() {
        let all = [
            TcpOptions::none(),
            TcpOptions {
                mss: Some(1460),
                wnd_scale: None,
            },
            TcpOptions {
                mss: None,
                wnd_scale: Some(6),
            },
            TcpOptions {
                mss: Some(536),
                wnd_scale: Some(14),
            },
        ];
        for opts in all {
            let mut buffer = vec![0u8; opts.buffer_len()];
            opts.emit(&mut buffer);
            assert_eq!(TcpOptions::parse(&buffer), opts);
        }
    }

    #[test]
    fn test_options_skip_unknown() {
        // SACK-permitted (kind 4, len 2), then MSS
        let data = [4, 2, 2, 4, 0x05, 0xb4];
        let opts = TcpOptions::parse(&data);
        assert_eq!(opts.mss, Some(1460));
        assert_eq!(opts.wnd_scale, None);
    }

    #[test]
    fn test_options_malformed_length_stops_scan() {
        // window scale, then an option with an impossible length
        let data = [1, 3, 3, 6, 8, 1, 2, 4];
        let opts = TcpOptions::parse(&data);
        assert_eq!(opts.wnd_scale, Some(6));
        assert_eq!(opts.mss, None);

        // truncated option data
        let data = [2, 4, 5];
        assert_eq!(TcpOptions::parse(&data), TcpOptions::none());
    }

    static SYN_BYTES: [u8; 28] = [
        0xbf, 0x00, 0x00, 0x50, 0x00, 0x00, 0x03, 0xe8, 0x00, 0x00, 0x00, 0x00, 0x70, 0x02, 0x27,
        0x10, 0x00, 0x00, 0x00, 0x00, 0x02, 0x04, 0x05, 0xb4, 0x01, 0x03, 0x03, 0x06,
    ];

    #[test]
    fn test_parse_syn() {
        let packet = Packet::new_checked(&SYN_BYTES[..]).unwrap();
        assert_eq!(packet.src_port(), 48896);
        assert_eq!(packet.dst_port(), 80);
        assert_eq!(packet.seq_number(), SeqNumber(1000));
        assert!(packet.syn());
        assert!(!packet.ack());
        assert_eq!(packet.header_len(), 28);
        assert_eq!(packet.window_len(), 10000);

        let repr = Repr::parse(&packet).unwrap();
        assert_eq!(repr.control, Control::Syn);
        assert_eq!(repr.ack_number, None);
        assert_eq!(repr.options.mss, Some(1460));
        assert_eq!(repr.options.wnd_scale, Some(6));
    }

    #[test]
    fn test_emit_syn() {
        let repr = Repr {
            src_port: 48896,
            dst_port: 80,
            control: Control::Syn,
            seq_number: SeqNumber(1000),
            ack_number: None,
            window_len: 10000,
            options: TcpOptions {
                mss: Some(1460),
                wnd_scale: Some(6),
            },
        };
        let mut bytes = vec![0xa5; repr.header_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        assert_eq!(&bytes[..], &SYN_BYTES[..]);
    }

    #[test]
    fn test_checksum_roundtrip() {
        let src = Ipv4Address::new(10, 0, 0, 1);
        let dst = Ipv4Address::new(10, 0, 0, 2);
        let mut bytes = SYN_BYTES;
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        packet.fill_checksum(&src, &dst);
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert!(packet.verify_checksum(&src, &dst));
        assert!(!packet.verify_checksum(&dst, &src));
    }
}
