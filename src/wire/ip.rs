use core::fmt;

/// IP protocol numbers carried in the IPv4 `protocol` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    Unknown(u8),
}

impl From<u8> for Protocol {
    fn from(value: u8) -> Protocol {
        match value {
            0x01 => Protocol::Icmp,
            0x06 => Protocol::Tcp,
            0x11 => Protocol::Udp,
            other => Protocol::Unknown(other),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(value: Protocol) -> u8 {
        match value {
            Protocol::Icmp => 0x01,
            Protocol::Tcp => 0x06,
            Protocol::Udp => 0x11,
            Protocol::Unknown(other) => other,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Unknown(id) => write!(f, "0x{id:02x}"),
        }
    }
}

pub mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::Protocol;
    use crate::storage::BufRef;
    use crate::wire::ipv4::Address as Ipv4Address;

    const fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0;

        // For each 32-byte chunk...
        const CHUNK_SIZE: usize = 32;
        while data.len() >= CHUNK_SIZE {
            let mut d = &data[..CHUNK_SIZE];
            // ... take by 2 bytes and sum them.
            while d.len() >= 2 {
                accum += NetworkEndian::read_u16(d) as u32;
                d = &d[2..];
            }

            data = &data[CHUNK_SIZE..];
        }

        // Sum the rest that does not fit the last 32-byte chunk,
        // taking by 2 bytes.
        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        // Add the last remaining odd byte, if any.
        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// Fold a buffer chain into an RFC 1071 checksum, honoring the byte
    /// parity across span boundaries.
    pub fn buf_ref(buf: &BufRef<'_>) -> u16 {
        let mut accum: u32 = 0;
        let mut odd = false;
        for chunk in buf.chunks() {
            for &byte in chunk {
                if odd {
                    accum += byte as u32;
                } else {
                    accum += (byte as u32) << 8;
                }
                odd = !odd;
            }
        }
        propagate_carries(accum)
    }

    pub fn pseudo_header_v4(
        src_addr: &Ipv4Address,
        dst_addr: &Ipv4Address,
        next_header: Protocol,
        length: u32,
    ) -> u16 {
        let mut proto_len = [0u8; 4];
        proto_len[1] = next_header.into();
        NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

        combine(&[
            data(&src_addr.octets()),
            data(&dst_addr.octets()),
            data(&proto_len[..]),
        ])
    }

    #[cfg(test)]
    mod test {
        use super::*;
        use crate::storage::BufNode;

        #[test]
        fn test_buf_ref_matches_data() {
            let bytes: Vec<u8> = (0..57u8).collect();
            for split in 0..bytes.len() {
                let second = BufNode::new(&bytes[split..]);
                let first = BufNode::with_next(&bytes[..split], &second);
                let all = BufRef::new(&first, 0, bytes.len());
                assert_eq!(buf_ref(&all), data(&bytes));
            }
        }

        #[test]
        fn test_combine_carries() {
            assert_eq!(combine(&[0xffff, 0x0001]), 0x0001);
            assert_eq!(combine(&[0x8000, 0x8000]), 0x0001);
        }
    }
}
