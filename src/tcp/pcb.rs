use core::fmt;

use super::index::PcbKey;
use crate::iface::pmtu::MtuRef;
use crate::storage::Ring;
use crate::time::{Duration, Instant};
use crate::wire::TcpSeqNumber as SeqNumber;

/// The state of a TCP connection, according to [RFC 793].
///
/// The discriminants are crafted so that the state predicates below
/// compile to single bit tests.
///
/// `FinWait2TimeWait` is not a standard state: it is used transiently
/// when a FIN arrives in `FinWait2`, so that entry into `TimeWait` can be
/// deferred until after the user callback has run.
///
/// [RFC 793]: https://tools.ietf.org/html/rfc793
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum State {
    Established = 0b0000,
    CloseWait = 0b0001,
    FinWait1 = 0b0010,
    FinWait2 = 0b0100,
    Closed = 0b0101,
    LastAck = 0b1000,
    Closing = 0b1011,
    SynRcvd = 0b1100,
    SynSent = 0b1101,
    TimeWait = 0b1110,
    FinWait2TimeWait = 0b1111,
}

impl State {
    /// A SYN is in flight.
    pub fn is_syn_sent_or_rcvd(self) -> bool {
        (self as u8) >> 1 == 0b110
    }

    /// Data from the peer is still deliverable (no FIN received).
    pub fn is_accepting_data(self) -> bool {
        self as u8 & 0b1001 == 0
    }

    /// Data or FIN may still be transmitted.
    pub fn can_output(self) -> bool {
        self as u8 & 0b0100 == 0
    }

    /// The send side has not been closed by the user.
    pub fn is_snd_open(self) -> bool {
        (self as u8) >> 1 == 0
    }

    /// Sequence numbers are synchronized with the peer; a premature drop
    /// of the connection warrants an RST.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, State::Closed | State::SynSent)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::SynSent => "SYN-SENT",
            State::SynRcvd => "SYN-RCVD",
            State::Established => "ESTABLISHED",
            State::CloseWait => "CLOSE-WAIT",
            State::LastAck => "LAST-ACK",
            State::FinWait1 => "FIN-WAIT-1",
            State::FinWait2 => "FIN-WAIT-2",
            State::FinWait2TimeWait => "FIN-WAIT-2*",
            State::Closing => "CLOSING",
            State::TimeWait => "TIME-WAIT",
        };
        write!(f, "{name}")
    }
}

/// PCB flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Flags(u16);

impl Flags {
    /// An ACK should be sent at the end of input processing.
    pub const ACK_PENDING: Flags = Flags(1 << 0);
    /// Output should be attempted at the end of input processing.
    pub const OUT_PENDING: Flags = Flags(1 << 1);
    /// A FIN was sent at least once and is included in `snd_nxt`.
    pub const FIN_SENT: Flags = Flags(1 << 2);
    /// A FIN is queued for sending.
    pub const FIN_PENDING: Flags = Flags(1 << 3);
    /// A round-trip time measurement is in progress.
    pub const RTT_PENDING: Flags = Flags(1 << 4);
    /// The round-trip time estimator has left its initial state.
    pub const RTT_VALID: Flags = Flags(1 << 5);
    /// `cwnd` has been increased this round trip.
    pub const CWND_INCRD: Flags = Flags(1 << 6);
    /// A segment has been retransmitted and not yet acknowledged.
    pub const RTX_ACTIVE: Flags = Flags(1 << 7);
    /// The `recover` variable is valid (and `>= snd_una`).
    pub const RECOVER: Flags = Flags(1 << 8);
    /// If the retransmission timer runs, it is in idle-timeout mode.
    pub const IDLE_TIMER: Flags = Flags(1 << 9);
    /// Window scaling is in use.
    pub const WND_SCALE: Flags = Flags(1 << 10);
    /// The current `cwnd` is the initial window.
    pub const CWND_INIT: Flags = Flags(1 << 11);
    /// If the aux timer runs, it is an output-retry timer.
    pub const OUT_RETRY: Flags = Flags(1 << 12);
    /// The advertised window should be refreshed before the next segment.
    pub const RCV_WND_UPD: Flags = Flags(1 << 13);

    pub fn has(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn set(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Flags({:#016b})", self.0)
    }
}

/// Retransmission times are kept in a coarser unit than the platform
/// clock: microseconds shifted right by this amount, giving a granularity
/// of ~1 ms and a 16-bit range over a minute.
pub(crate) const RTT_SHIFT: u32 = 10;

pub(crate) fn ticks_from_duration(duration: Duration) -> u16 {
    (duration.total_micros() >> RTT_SHIFT).clamp(1, u16::MAX as u64) as u16
}

pub(crate) fn duration_from_ticks(ticks: u16) -> Duration {
    Duration::from_micros((ticks as u64) << RTT_SHIFT)
}

/// Jacobson round-trip estimator, in tick units.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RttEstimator {
    pub srtt: u16,
    pub rttvar: u16,
    pub rto: u16,
}

impl RttEstimator {
    pub fn new(initial_rto: u16) -> RttEstimator {
        RttEstimator {
            srtt: 0,
            rttvar: 0,
            rto: initial_rto,
        }
    }

    /// Fold in a measurement. `first` selects the initialization step of
    /// the estimator; the caller tracks it in the PCB flags.
    pub fn sample(&mut self, first: bool, measured: u16, min_rto: u16, max_rto: u16) {
        if first {
            self.srtt = measured;
            self.rttvar = measured / 2;
        } else {
            let delta = self.srtt.abs_diff(measured);
            self.rttvar = ((3 * self.rttvar as u32 + delta as u32) / 4) as u16;
            self.srtt = ((7 * self.srtt as u32 + measured as u32) / 8) as u16;
        }
        let var_term = (4 * self.rttvar as u32).max(1);
        let rto = (self.srtt as u32 + var_term).min(u16::MAX as u32) as u16;
        self.rto = rto.clamp(min_rto, max_rto);
    }

    /// Exponential backoff after a timeout.
    pub fn backoff(&mut self, max_rto: u16) {
        self.rto = (self.rto as u32 * 2).min(max_rto as u32) as u16;
    }
}

/// A one-shot timer value polled by the engine.
///
/// The engine surfaces the earliest pending deadline through
/// `TcpProto::poll_at`; the driver glue mirrors it into one event-loop
/// timer.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PcbTimer {
    time: Instant,
    armed: bool,
}

impl PcbTimer {
    pub fn set_at(&mut self, time: Instant) {
        self.time = time;
        self.armed = true;
    }

    pub fn unset(&mut self) {
        self.armed = false;
    }

    pub fn is_set(&self) -> bool {
        self.armed
    }

    pub fn set_time(&self) -> Option<Instant> {
        self.armed.then_some(self.time)
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.armed && self.time <= now
    }
}

/// The user-owned buffers of an adopted connection.
#[derive(Debug)]
pub(crate) struct ConnBufs<'a> {
    pub snd: Ring<'a>,
    pub rcv: Ring<'a>,
}

/// Protocol Control Block: the complete per-connection state.
#[derive(Debug)]
pub(crate) struct Pcb<'a> {
    pub key: PcbKey,
    pub state: State,
    pub flags: Flags,

    /// Multipurpose timer: SYN-SENT/SYN-RCVD timeout, TIME-WAIT expiry,
    /// abandoned-connection abort, output retry.
    pub aux_timer: PcbTimer,
    pub rtx_timer: PcbTimer,

    pub mtu_ref: MtuRef,
    /// MTU of the outgoing interface.
    pub route_mtu: u16,
    /// Current path-MTU estimate for the remote.
    pub pmtu: u16,

    // send side
    pub snd_una: SeqNumber,
    pub snd_nxt: SeqNumber,
    /// Peer's advertised window, after scaling.
    pub snd_wnd: u32,
    pub snd_wl1: SeqNumber,
    pub snd_wl2: SeqNumber,
    /// Effective MSS: bounded by the peer's MSS and the path MTU.
    pub snd_mss: u16,
    /// Peer's MSS bound, before the path MTU is applied.
    pub base_snd_mss: u16,
    pub snd_wnd_shift: u8,

    // congestion control
    pub cwnd: u32,
    pub ssthresh: u32,
    pub recover: SeqNumber,
    pub num_dupack: u8,

    // round-trip estimation
    pub rtt: RttEstimator,
    /// Sequence number just past the timed segment.
    pub rtt_test_seq: SeqNumber,
    pub rtt_test_time: Instant,

    // receive side
    pub rcv_nxt: SeqNumber,
    /// Currently advertised receive window.
    pub rcv_ann_wnd: u32,
    pub rcv_wnd_shift: u8,

    /// Absent until the user adopts the connection (passive open).
    pub bufs: Option<ConnBufs<'a>>,
    /// The user still holds the connection handle.
    pub attached: bool,
    /// Listener awaiting adoption of this connection.
    pub pending_accept: Option<super::conn::TcpListener>,
}

impl<'a> Pcb<'a> {
    /// Bytes submitted by the user and not yet acknowledged.
    pub fn snd_queue_len(&self) -> u32 {
        self.bufs.as_ref().map_or(0, |b| b.snd.len() as u32)
    }

    /// Sequence units in flight (includes a sent FIN).
    pub fn seq_in_flight(&self) -> u32 {
        self.snd_nxt - self.snd_una
    }

    /// Data bytes sent and not yet acknowledged.
    pub fn data_in_flight(&self) -> u32 {
        let fin = if self.flags.has(Flags::FIN_SENT) { 1 } else { 0 };
        self.seq_in_flight() - fin
    }

    /// Data bytes submitted but not yet sent.
    pub fn snd_not_sent(&self) -> u32 {
        self.snd_queue_len() - self.data_in_flight()
    }

    /// Unacknowledged data or an unacknowledged FIN exists.
    pub fn has_snd_outstanding(&self) -> bool {
        self.snd_queue_len() > 0
            || self.flags.has(Flags::FIN_PENDING)
            || (self.flags.has(Flags::FIN_SENT) && self.seq_in_flight() > 0)
    }

    /// Effective scale shift applied to windows we announce.
    pub fn ann_wnd_shift(&self) -> u8 {
        if self.flags.has(Flags::WND_SCALE) {
            self.rcv_wnd_shift
        } else {
            0
        }
    }

    #[cfg(test)]
    pub fn check_invariants(&self) {
        // snd_una <= snd_nxt <= snd_una + queue + fin, anchored at snd_una
        let fin = if self.flags.has(Flags::FIN_SENT) { 1 } else { 0 };
        let limit = self.snd_una + (self.snd_queue_len() + fin);
        assert!(self.snd_una.ref_lte(self.snd_una, self.snd_nxt));
        assert!(self.snd_una.ref_lte(self.snd_nxt, limit));
        assert!(self.rcv_ann_wnd <= super::MAX_WINDOW);
        if !self.state.is_syn_sent_or_rcvd() {
            assert!(self.snd_mss >= super::MIN_MSS);
        }
    }
}
