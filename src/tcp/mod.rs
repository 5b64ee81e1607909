/*! TCP protocol engine.

A [TcpProto] owns every Protocol Control Block, the four-tuple index, the
listener table and a path-MTU cache. It is driven from a single thread:

 - the IP glue feeds received datagrams through [`receive`];
 - a loop timer mirrors [`poll_at`] and calls [`handle_timers`];
 - ICMP "fragmentation needed" notifications arrive through
   [`handle_frag_needed`];
 - drained driver retry tokens come back through [`retry_sending`];
 - after any of the above, [`dispatch_events`] delivers connection
   callbacks. The callback receives the engine back, so it may re-enter it
   freely; calling [`abort`] from inside a receive callback is safe. A
   connection handle must not be used after its `Aborted` event.

Users own the send and receive buffer storage; the engine borrows it for
the life of the connection. Data is written directly into [`send_buf`] and
published with [`extend_send`]; received data is read from [`recv_buf`]
and released with [`consume_recv`].

[TcpProto]: struct.TcpProto.html
[`receive`]: struct.TcpProto.html#method.receive
[`poll_at`]: struct.TcpProto.html#method.poll_at
[`handle_timers`]: struct.TcpProto.html#method.handle_timers
[`handle_frag_needed`]: struct.TcpProto.html#method.handle_frag_needed
[`retry_sending`]: struct.TcpProto.html#method.retry_sending
[`dispatch_events`]: struct.TcpProto.html#method.dispatch_events
[`abort`]: struct.TcpProto.html#method.abort
[`send_buf`]: struct.TcpProto.html#method.send_buf
[`extend_send`]: struct.TcpProto.html#method.extend_send
[`recv_buf`]: struct.TcpProto.html#method.recv_buf
[`consume_recv`]: struct.TcpProto.html#method.consume_recv
*/

mod conn;
mod index;
mod input;
mod output;
mod pcb;

pub use self::conn::{
    ConnectError, ListenError, TcpConnection, TcpEvent, TcpListener,
};
pub use self::pcb::State;

use std::collections::VecDeque;

use managed::ManagedSlice;

use self::conn::Listener;
use self::index::{PcbIndex, PcbKey};
use self::pcb::{ticks_from_duration, ConnBufs, Flags, Pcb, PcbTimer, RttEstimator};
use crate::iface::pmtu::{MtuRef, PmtuCache};
use crate::iface::{IpSender, RetryToken};
use crate::rand::Rand;
use crate::storage::Ring;
use crate::time::{Duration, Instant};
use crate::wire::{
    Ipv4Address, TcpSeqNumber as SeqNumber, IPV4_HEADER_LEN, IPV4_MIN_MTU, TCP_HEADER_LEN,
};

/// Smallest effective MSS; peers may not lower it further.
pub const MIN_MSS: u16 = (IPV4_MIN_MTU - IPV4_HEADER_LEN - TCP_HEADER_LEN) as u16;

/// Largest window either side may use (RFC 1323 bound).
pub(crate) const MAX_WINDOW: u32 = 0x3fff_ffff;

/// How far behind `snd_una` an ACK may lag and still be honored
/// (MAX.SND.WND in RFC 5961).
pub(crate) const MAX_ACK_BEFORE: u32 = 0xffff;

const EPHEMERAL_FIRST: u16 = 49152;

fn calc_snd_mss(pmtu: u16, base: u16) -> Option<u16> {
    let mss = base.min(pmtu.saturating_sub((IPV4_HEADER_LEN + TCP_HEADER_LEN) as u16));
    (mss >= MIN_MSS).then_some(mss)
}

/// Runtime tunables of the engine, fixed at construction.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Hard cap on simultaneous connections.
    pub max_pcbs: usize,
    /// Hard cap on passive sockets.
    pub max_listeners: usize,
    /// Window scale shift (0..=14) advertised on SYN.
    pub rcv_wnd_shift: u8,
    /// Window advertised by listeners before the user attaches buffers.
    /// A non-zero value obliges `accept` callers to attach a receive
    /// buffer at least this large.
    pub initial_rcv_wnd: u32,
    /// Silly-window threshold: window increases below it are withheld.
    pub wnd_update_threshold: u32,
    /// Upper bound on the effective MSS regardless of peer and path.
    pub mss_cap: u16,
    /// TTL of emitted segments.
    pub ttl: u8,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    pub syn_rcvd_timeout: Duration,
    pub syn_sent_timeout: Duration,
    pub time_wait_duration: Duration,
    pub abandoned_timeout: Duration,
    /// Retry delay after the driver reported a full buffer or a pending
    /// ARP query.
    pub output_retry_short: Duration,
    /// Retry delay after other transient send errors.
    pub output_retry_long: Duration,
    /// Duplicate ACKs that trigger fast retransmit.
    pub fast_rtx_dup_acks: u8,
    /// Further duplicate ACKs that still inflate the window.
    pub max_additional_dup_acks: u8,
}

impl Default for TcpConfig {
    fn default() -> TcpConfig {
        TcpConfig {
            max_pcbs: 64,
            max_listeners: 4,
            rcv_wnd_shift: 6,
            initial_rcv_wnd: 0,
            wnd_update_threshold: 2700,
            mss_cap: u16::MAX,
            ttl: 64,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(250),
            max_rto: Duration::from_secs(60),
            syn_rcvd_timeout: Duration::from_secs(20),
            syn_sent_timeout: Duration::from_secs(30),
            time_wait_duration: Duration::from_secs(120),
            abandoned_timeout: Duration::from_secs(30),
            output_retry_short: Duration::from_micros(500),
            output_retry_long: Duration::from_secs(2),
            fast_rtx_dup_acks: 3,
            max_additional_dup_acks: 32,
        }
    }
}

pub(crate) struct PcbSlot<'a> {
    pub gen: u32,
    pub pcb: Option<Pcb<'a>>,
}

/// The TCP engine.
pub struct TcpProto<'a> {
    pub(crate) config: TcpConfig,
    pub(crate) pcbs: Vec<PcbSlot<'a>>,
    pub(crate) index: PcbIndex,
    pub(crate) listeners: Vec<(u32, Option<Listener>)>,
    pub(crate) pmtu: PmtuCache,
    pub(crate) events: VecDeque<TcpEvent>,
    pub(crate) rand: Rand,
    pub(crate) next_ephemeral: u16,
    pub(crate) now: Instant,
}

impl<'a> TcpProto<'a> {
    /// Create an engine.
    ///
    /// The random seed does not need to be cryptographically secure, but
    /// it is strongly recommended to seed it differently on each boot to
    /// avoid problems with port and sequence number collisions.
    pub fn new(config: TcpConfig, random_seed: u64) -> TcpProto<'a> {
        assert!(config.rcv_wnd_shift <= 14, "window shift limited to 14");
        let mut rand = Rand::new(random_seed);
        let next_ephemeral = rand.rand_port();
        TcpProto {
            pcbs: (0..config.max_pcbs)
                .map(|_| PcbSlot { gen: 0, pcb: None })
                .collect(),
            index: PcbIndex::new(config.max_pcbs),
            listeners: (0..config.max_listeners).map(|_| (0, None)).collect(),
            pmtu: PmtuCache::new(),
            events: VecDeque::new(),
            rand,
            next_ephemeral,
            now: Instant::ZERO,
            config,
        }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    fn conn_handle(&self, slot: usize) -> TcpConnection {
        TcpConnection {
            slot: slot as u32,
            gen: self.pcbs[slot].gen,
        }
    }

    fn retry_token_for(&self, slot: usize) -> RetryToken {
        RetryToken(((slot as u64) << 32) | self.pcbs[slot].gen as u64)
    }

    fn valid_slot(&self, conn: TcpConnection) -> Option<usize> {
        let slot = conn.slot as usize;
        let entry = self.pcbs.get(slot)?;
        (entry.gen == conn.gen && entry.pcb.is_some()).then_some(slot)
    }

    fn alloc_pcb_slot(&self) -> Option<usize> {
        self.pcbs.iter().position(|entry| entry.pcb.is_none())
    }

    fn free_pcb(&mut self, slot: usize) {
        let mut pcb = match self.pcbs[slot].pcb.take() {
            Some(pcb) => pcb,
            None => return,
        };
        self.index.remove(&pcb.key);
        pcb.mtu_ref.reset(&mut self.pmtu);
        if let Some(listener) = pcb.pending_accept.take() {
            if let Some((gen, Some(l))) = self.listeners.get_mut(listener.slot as usize) {
                if *gen == listener.gen {
                    l.num_pending -= 1;
                }
            }
        }
        self.pcbs[slot].gen = self.pcbs[slot].gen.wrapping_add(1);
    }

    fn alloc_local_port(
        &mut self,
        remote_addr: Ipv4Address,
        remote_port: u16,
        local_addr: Ipv4Address,
    ) -> Option<u16> {
        let range = (u16::MAX - EPHEMERAL_FIRST) as u32 + 1;
        for _ in 0..range {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == u16::MAX {
                EPHEMERAL_FIRST
            } else {
                port + 1
            };
            let key = PcbKey {
                remote_port,
                remote_addr,
                local_port: port,
                local_addr,
            };
            if !self.index.contains(&key) {
                return Some(port);
            }
        }
        None
    }

    /// Open a connection to `remote_addr:remote_port`.
    ///
    /// The local address comes from the route; the local port is chosen
    /// from the ephemeral range unless given. `rx_buffer` and `tx_buffer`
    /// become the connection's receive and send buffers. The SYN goes out
    /// immediately; completion is reported by a [`TcpEvent::Connected`].
    ///
    /// [`TcpEvent::Connected`]: enum.TcpEvent.html#variant.Connected
    #[allow(clippy::too_many_arguments)]
    pub fn connect<R, T>(
        &mut self,
        sender: &mut dyn IpSender,
        now: Instant,
        remote_addr: Ipv4Address,
        remote_port: u16,
        local_port: Option<u16>,
        rx_buffer: R,
        tx_buffer: T,
    ) -> Result<TcpConnection, ConnectError>
    where
        R: Into<ManagedSlice<'a, u8>>,
        T: Into<ManagedSlice<'a, u8>>,
    {
        self.now = now;
        debug_assert!(remote_port != 0);
        let route = sender.route(remote_addr).ok_or(ConnectError::NoRoute)?;
        let local_addr = route.local_addr;
        let local_port = match local_port {
            Some(port) => {
                let key = PcbKey {
                    remote_port,
                    remote_addr,
                    local_port: port,
                    local_addr,
                };
                if self.index.contains(&key) {
                    return Err(ConnectError::AddrInUse);
                }
                port
            }
            None => self
                .alloc_local_port(remote_addr, remote_port, local_addr)
                .ok_or(ConnectError::NoPortAvailable)?,
        };
        let slot = self.alloc_pcb_slot().ok_or(ConnectError::NoPcbAvailable)?;
        let mut mtu_ref = MtuRef::new();
        let pmtu = match mtu_ref.setup(&mut self.pmtu, remote_addr, route.mtu, now) {
            Some(pmtu) => pmtu,
            None => return Err(ConnectError::NoMtuRefAvailable),
        };

        let key = PcbKey {
            remote_port,
            remote_addr,
            local_port,
            local_addr,
        };
        if self.index.insert(key, slot).is_err() {
            mtu_ref.reset(&mut self.pmtu);
            return Err(ConnectError::AddrInUse);
        }

        let iss = SeqNumber(self.rand.rand_u32());
        let rcv = Ring::new(rx_buffer);
        let snd = Ring::new(tx_buffer);
        let cfg = &self.config;
        // the window field of our SYN is not scaled
        let rcv_ann_wnd = (rcv.free() as u32).min(0xffff);
        self.pcbs[slot].pcb = Some(Pcb {
            key,
            state: State::SynSent,
            flags: Flags::default(),
            aux_timer: PcbTimer::default(),
            rtx_timer: PcbTimer::default(),
            mtu_ref,
            route_mtu: route.mtu,
            pmtu,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_wl1: iss,
            snd_wl2: iss,
            snd_mss: MIN_MSS,
            base_snd_mss: MIN_MSS,
            snd_wnd_shift: 0,
            cwnd: 0,
            ssthresh: MAX_WINDOW,
            recover: iss,
            num_dupack: 0,
            rtt: RttEstimator::new(ticks_from_duration(cfg.initial_rto)),
            rtt_test_seq: iss,
            rtt_test_time: now,
            rcv_nxt: SeqNumber(0),
            rcv_ann_wnd,
            rcv_wnd_shift: cfg.rcv_wnd_shift,
            bufs: Some(ConnBufs { snd, rcv }),
            attached: true,
            pending_accept: None,
        });

        net_debug!(
            "tcp: connecting {}:{} -> {}:{}",
            local_addr,
            local_port,
            remote_addr,
            remote_port
        );
        let retry = Some(self.retry_token_for(slot));
        let TcpProto { config, pcbs, .. } = self;
        let pcb = pcbs[slot].pcb.as_mut().unwrap();
        let _ = output::pcb_send_syn(config, pcb, sender, retry);
        pcb.snd_nxt = iss + 1;
        pcb.aux_timer.set_at(now + config.syn_sent_timeout);
        pcb.rtx_timer.set_at(now + output::rto_duration(pcb));
        Ok(self.conn_handle(slot))
    }

    /// Start listening on `local_port`, optionally bound to one local
    /// address. Up to `backlog` handshakes may be in flight at once.
    pub fn listen(
        &mut self,
        local_addr: Option<Ipv4Address>,
        local_port: u16,
        backlog: usize,
    ) -> Result<TcpListener, ListenError> {
        debug_assert!(local_port != 0);
        let taken = self.listeners.iter().any(|(_, l)| {
            l.as_ref()
                .is_some_and(|l| l.local_port == local_port && l.local_addr == local_addr)
        });
        if taken {
            return Err(ListenError::AddrInUse);
        }
        let slot = self
            .listeners
            .iter()
            .position(|(_, l)| l.is_none())
            .ok_or(ListenError::NoListenerAvailable)?;
        self.listeners[slot].1 = Some(Listener {
            local_addr,
            local_port,
            backlog,
            num_pending: 0,
            initial_rcv_wnd: self.config.initial_rcv_wnd.min(MAX_WINDOW),
        });
        Ok(TcpListener {
            slot: slot as u32,
            gen: self.listeners[slot].0,
        })
    }

    /// Stop listening. Embryonic connections of this listener are reset.
    pub fn close_listener(&mut self, sender: &mut dyn IpSender, listener: TcpListener) {
        let slot = listener.slot as usize;
        match self.listeners.get(slot) {
            Some((gen, Some(_))) if *gen == listener.gen => (),
            _ => return,
        }
        for pcb_slot in 0..self.pcbs.len() {
            let matches = self.pcbs[pcb_slot]
                .pcb
                .as_ref()
                .is_some_and(|p| p.pending_accept == Some(listener));
            if matches {
                {
                    let TcpProto { config, pcbs, .. } = self;
                    let pcb = pcbs[pcb_slot].pcb.as_mut().unwrap();
                    output::pcb_send_rst(config, pcb, sender);
                }
                self.free_pcb(pcb_slot);
            }
        }
        self.listeners[slot].0 = self.listeners[slot].0.wrapping_add(1);
        self.listeners[slot].1 = None;
    }

    /// Adopt a connection delivered by [`TcpEvent::ConnectionRequest`],
    /// attaching its buffers. Only valid from within that event's
    /// callback; returns whether adoption happened.
    ///
    /// If the listener advertised a non-zero initial window, `rx_buffer`
    /// must be at least that large.
    ///
    /// [`TcpEvent::ConnectionRequest`]: enum.TcpEvent.html#variant.ConnectionRequest
    pub fn accept<R, T>(
        &mut self,
        sender: &mut dyn IpSender,
        conn: TcpConnection,
        rx_buffer: R,
        tx_buffer: T,
    ) -> bool
    where
        R: Into<ManagedSlice<'a, u8>>,
        T: Into<ManagedSlice<'a, u8>>,
    {
        let now = self.now;
        let slot = match self.valid_slot(conn) {
            Some(slot) => slot,
            None => return false,
        };
        let retry = Some(self.retry_token_for(slot));
        let TcpProto {
            config,
            pcbs,
            listeners,
            ..
        } = self;
        let pcb = pcbs[slot].pcb.as_mut().unwrap();
        let listener = match pcb.pending_accept.take() {
            Some(listener) => listener,
            None => return false,
        };
        if let Some((gen, Some(l))) = listeners.get_mut(listener.slot as usize) {
            if *gen == listener.gen {
                l.num_pending -= 1;
            }
        }
        let rcv = Ring::new(rx_buffer);
        let snd = Ring::new(tx_buffer);
        debug_assert!(
            rcv.capacity() as u32 >= pcb.rcv_ann_wnd,
            "receive buffer smaller than the advertised window"
        );
        pcb.bufs = Some(ConnBufs { snd, rcv });
        pcb.attached = true;
        // announce the real window
        pcb.flags.set(Flags::RCV_WND_UPD);
        pcb.flags.set(Flags::ACK_PENDING);
        output::pcb_output(config, pcb, sender, retry, now);
        true
    }

    /// Close the send side gracefully. Receiving continues until the
    /// peer's FIN arrives; the handle stays valid.
    pub fn close(&mut self, sender: &mut dyn IpSender, now: Instant, conn: TcpConnection) {
        self.now = now;
        let slot = match self.valid_slot(conn) {
            Some(slot) => slot,
            None => return,
        };
        let retry = Some(self.retry_token_for(slot));
        let free = {
            let TcpProto { config, pcbs, .. } = self;
            let pcb = pcbs[slot].pcb.as_mut().unwrap();
            match pcb.state {
                State::SynSent => true,
                State::Established => {
                    pcb.state = State::FinWait1;
                    pcb.flags.set(Flags::FIN_PENDING);
                    output::pcb_output(config, pcb, sender, retry, now);
                    false
                }
                State::CloseWait => {
                    pcb.state = State::LastAck;
                    pcb.flags.set(Flags::FIN_PENDING);
                    output::pcb_output(config, pcb, sender, retry, now);
                    false
                }
                _ => false,
            }
        };
        if free {
            self.free_pcb(slot);
        }
    }

    /// Tear the connection down with an RST. No event follows; the handle
    /// is stale afterwards.
    pub fn abort(&mut self, sender: &mut dyn IpSender, now: Instant, conn: TcpConnection) {
        self.now = now;
        let slot = match self.valid_slot(conn) {
            Some(slot) => slot,
            None => return,
        };
        {
            let TcpProto { config, pcbs, .. } = self;
            let pcb = pcbs[slot].pcb.as_mut().unwrap();
            if pcb.state.is_synchronized() {
                output::pcb_send_rst(config, pcb, sender);
            }
        }
        self.free_pcb(slot);
    }

    /// Abandon the connection handle.
    ///
    /// Outstanding data (and a FIN, if the send side was still open) is
    /// still delivered, bounded by the abandoned timeout; afterwards the
    /// PCB is reset. No further events are delivered.
    pub fn release(&mut self, sender: &mut dyn IpSender, now: Instant, conn: TcpConnection) {
        self.now = now;
        let slot = match self.valid_slot(conn) {
            Some(slot) => slot,
            None => return,
        };
        let retry = Some(self.retry_token_for(slot));
        let free = {
            let TcpProto { config, pcbs, .. } = self;
            let pcb = pcbs[slot].pcb.as_mut().unwrap();
            pcb.attached = false;
            match pcb.state {
                State::SynSent => true,
                State::TimeWait | State::FinWait2TimeWait => false,
                _ => {
                    // the send side closes as if by `close`
                    if pcb.state == State::Established {
                        pcb.state = State::FinWait1;
                        pcb.flags.set(Flags::FIN_PENDING);
                    } else if pcb.state == State::CloseWait {
                        pcb.state = State::LastAck;
                        pcb.flags.set(Flags::FIN_PENDING);
                    }
                    if pcb.state.is_accepting_data() {
                        // let the peer's FIN through even though nobody
                        // consumes data anymore
                        let target = pcb.rcv_ann_wnd.max(u16::MAX as u32).min(MAX_WINDOW);
                        if target > pcb.rcv_ann_wnd {
                            pcb.rcv_ann_wnd = target;
                            pcb.flags.set(Flags::ACK_PENDING);
                        }
                    }
                    // bound the lingering close
                    pcb.flags.clear(Flags::OUT_RETRY);
                    pcb.aux_timer.set_at(now + config.abandoned_timeout);
                    output::pcb_output(config, pcb, sender, retry, now);
                    false
                }
            }
        };
        if free {
            self.free_pcb(slot);
        }
    }

    /// The writable free region of the send buffer.
    pub fn send_buf(&mut self, conn: TcpConnection) -> Option<(&mut [u8], &mut [u8])> {
        let slot = self.valid_slot(conn)?;
        let pcb = self.pcbs[slot].pcb.as_mut().unwrap();
        if !pcb.state.is_snd_open() && pcb.state != State::SynSent {
            return None;
        }
        pcb.bufs.as_mut().map(|bufs| bufs.snd.free_slices())
    }

    /// Free space in the send buffer.
    pub fn send_free(&self, conn: TcpConnection) -> Option<usize> {
        let slot = self.valid_slot(conn)?;
        let pcb = self.pcbs[slot].pcb.as_ref().unwrap();
        pcb.bufs.as_ref().map(|bufs| bufs.snd.free())
    }

    /// Publish `len` bytes previously written through [`send_buf`].
    ///
    /// [`send_buf`]: #method.send_buf
    pub fn extend_send(
        &mut self,
        sender: &mut dyn IpSender,
        now: Instant,
        conn: TcpConnection,
        len: usize,
    ) {
        self.now = now;
        let slot = match self.valid_slot(conn) {
            Some(slot) => slot,
            None => return,
        };
        let retry = Some(self.retry_token_for(slot));
        let TcpProto { config, pcbs, .. } = self;
        let pcb = pcbs[slot].pcb.as_mut().unwrap();
        let bufs = match &mut pcb.bufs {
            Some(bufs) => bufs,
            None => return,
        };
        debug_assert!(len <= bufs.snd.free(), "extend past the free region");
        bufs.snd.commit(len);
        pcb.flags.set(Flags::OUT_PENDING);
        output::pcb_output(config, pcb, sender, retry, now);
    }

    /// The readable region of the receive buffer.
    pub fn recv_buf(&self, conn: TcpConnection) -> Option<(&[u8], &[u8])> {
        let slot = self.valid_slot(conn)?;
        let pcb = self.pcbs[slot].pcb.as_ref().unwrap();
        pcb.bufs
            .as_ref()
            .map(|bufs| bufs.rcv.peek_slices(0, bufs.rcv.len()))
    }

    /// Bytes ready in the receive buffer.
    pub fn recv_ready(&self, conn: TcpConnection) -> Option<usize> {
        let slot = self.valid_slot(conn)?;
        let pcb = self.pcbs[slot].pcb.as_ref().unwrap();
        pcb.bufs.as_ref().map(|bufs| bufs.rcv.len())
    }

    /// Release `len` consumed bytes of the receive buffer back to the
    /// window.
    pub fn consume_recv(
        &mut self,
        sender: &mut dyn IpSender,
        now: Instant,
        conn: TcpConnection,
        len: usize,
    ) {
        self.now = now;
        let slot = match self.valid_slot(conn) {
            Some(slot) => slot,
            None => return,
        };
        let retry = Some(self.retry_token_for(slot));
        let TcpProto { config, pcbs, .. } = self;
        let pcb = pcbs[slot].pcb.as_mut().unwrap();
        let bufs = match &mut pcb.bufs {
            Some(bufs) => bufs,
            None => return,
        };
        debug_assert!(len <= bufs.rcv.len(), "consume past the ready region");
        bufs.rcv.dequeue(len);
        let before = pcb.rcv_ann_wnd;
        output::pcb_refresh_ann_wnd(config, pcb);
        if pcb.rcv_ann_wnd > before {
            pcb.flags.set(Flags::ACK_PENDING);
            output::pcb_output(config, pcb, sender, retry, now);
        } else {
            // fold the update into the next segment
            pcb.flags.set(Flags::RCV_WND_UPD);
        }
    }

    /// Current connection state, while the handle is live.
    pub fn state(&self, conn: TcpConnection) -> Option<State> {
        let slot = self.valid_slot(conn)?;
        Some(self.pcbs[slot].pcb.as_ref().unwrap().state)
    }

    /// Earliest instant at which [`handle_timers`] has work to do.
    ///
    /// [`handle_timers`]: #method.handle_timers
    pub fn poll_at(&self) -> Option<Instant> {
        let pcb_min = self
            .pcbs
            .iter()
            .filter_map(|entry| entry.pcb.as_ref())
            .flat_map(|pcb| [pcb.aux_timer.set_time(), pcb.rtx_timer.set_time()])
            .flatten()
            .min();
        [pcb_min, self.pmtu.poll_at()].into_iter().flatten().min()
    }

    /// Fire every expired PCB timer and run path-MTU aging.
    pub fn handle_timers(&mut self, sender: &mut dyn IpSender, now: Instant) {
        self.now = now;
        for slot in 0..self.pcbs.len() {
            let aux = self.pcbs[slot]
                .pcb
                .as_ref()
                .is_some_and(|pcb| pcb.aux_timer.expired(now));
            if aux {
                self.aux_timer_expired(sender, slot);
            }
            let rtx = self.pcbs[slot]
                .pcb
                .as_ref()
                .is_some_and(|pcb| pcb.rtx_timer.expired(now));
            if rtx {
                self.rtx_timer_expired(sender, slot);
            }
        }
        if self.pmtu.poll_at().is_some_and(|at| at <= now) {
            let mut raised: Vec<(Ipv4Address, u16)> = Vec::new();
            self.pmtu.age(now, |addr, mtu| raised.push((addr, mtu)));
            for (addr, mtu) in raised {
                self.apply_pmtu(sender, addr, mtu);
            }
        }
    }

    fn aux_timer_expired(&mut self, sender: &mut dyn IpSender, slot: usize) {
        let now = self.now;
        let conn = self.conn_handle(slot);
        let retry = Some(self.retry_token_for(slot));
        let free = {
            let TcpProto {
                config,
                pcbs,
                events,
                ..
            } = self;
            let pcb = pcbs[slot].pcb.as_mut().unwrap();
            pcb.aux_timer.unset();
            match pcb.state {
                State::SynSent => {
                    net_debug!(
                        "tcp: connect to {}:{} timed out",
                        pcb.key.remote_addr,
                        pcb.key.remote_port
                    );
                    if pcb.attached {
                        events.push_back(TcpEvent::Aborted { conn });
                    }
                    true
                }
                State::SynRcvd => {
                    output::pcb_send_rst(config, pcb, sender);
                    true
                }
                State::TimeWait => true,
                _ => {
                    if pcb.flags.has(Flags::OUT_RETRY) {
                        pcb.flags.clear(Flags::OUT_RETRY);
                        pcb.flags.set(Flags::OUT_PENDING);
                        output::pcb_output(config, pcb, sender, retry, now);
                        false
                    } else if !pcb.attached {
                        // abandoned deadline
                        output::pcb_send_rst(config, pcb, sender);
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if free {
            self.free_pcb(slot);
        }
    }

    fn rtx_timer_expired(&mut self, sender: &mut dyn IpSender, slot: usize) {
        let now = self.now;
        let retry = Some(self.retry_token_for(slot));
        let TcpProto { config, pcbs, .. } = self;
        let pcb = pcbs[slot].pcb.as_mut().unwrap();
        pcb.rtx_timer.unset();
        match pcb.state {
            State::SynSent | State::SynRcvd => {
                let _ = output::pcb_send_syn(config, pcb, sender, retry);
                pcb.rtt.backoff(ticks_from_duration(config.max_rto));
                pcb.rtx_timer.set_at(now + output::rto_duration(pcb));
            }
            state if state.can_output() => {
                output::pcb_rto_event(config, pcb, sender, now);
            }
            _ => (),
        }
    }

    /// Apply an ICMP "fragmentation needed" report for `remote_addr`.
    pub fn handle_frag_needed(
        &mut self,
        sender: &mut dyn IpSender,
        now: Instant,
        remote_addr: Ipv4Address,
        next_hop_mtu: u16,
    ) {
        self.now = now;
        if let Some(new_mtu) = self.pmtu.handle_frag_needed(remote_addr, next_hop_mtu, now) {
            self.apply_pmtu(sender, remote_addr, new_mtu);
        }
    }

    fn apply_pmtu(&mut self, sender: &mut dyn IpSender, remote_addr: Ipv4Address, new_mtu: u16) {
        for slot in 0..self.pcbs.len() {
            let affected = self.pcbs[slot]
                .pcb
                .as_ref()
                .is_some_and(|pcb| pcb.mtu_ref.remote() == Some(remote_addr));
            if !affected {
                continue;
            }
            let conn = self.conn_handle(slot);
            let free = {
                let TcpProto {
                    config,
                    pcbs,
                    events,
                    ..
                } = self;
                let pcb = pcbs[slot].pcb.as_mut().unwrap();
                pcb.pmtu = new_mtu;
                match calc_snd_mss(new_mtu, pcb.base_snd_mss) {
                    Some(mss) => {
                        // in-flight data is unaffected; retransmissions
                        // use the new size
                        pcb.snd_mss = mss;
                        false
                    }
                    None => {
                        output::pcb_send_rst(config, pcb, sender);
                        if pcb.attached {
                            events.push_back(TcpEvent::Aborted { conn });
                        }
                        true
                    }
                }
            };
            if free {
                self.free_pcb(slot);
            }
        }
    }

    /// Resume output for a connection whose send was deferred by the
    /// driver; `token` comes from the driver's retry list.
    pub fn retry_sending(&mut self, sender: &mut dyn IpSender, now: Instant, token: RetryToken) {
        self.now = now;
        let conn = TcpConnection {
            slot: (token.0 >> 32) as u32,
            gen: token.0 as u32,
        };
        let slot = match self.valid_slot(conn) {
            Some(slot) => slot,
            None => return,
        };
        let TcpProto { config, pcbs, .. } = self;
        let pcb = pcbs[slot].pcb.as_mut().unwrap();
        if pcb.flags.has(Flags::OUT_RETRY) {
            pcb.flags.clear(Flags::OUT_RETRY);
            pcb.aux_timer.unset();
        }
        if pcb.state.is_syn_sent_or_rcvd() {
            // the SYN retransmission timer takes care of it
            return;
        }
        pcb.flags.set(Flags::OUT_PENDING);
        output::pcb_output(config, pcb, sender, Some(token), now);
    }

    /// Deliver queued events to `handler`, which receives the engine and
    /// the IP sender back and may re-enter both.
    pub fn dispatch_events<F>(&mut self, sender: &mut dyn IpSender, mut handler: F)
    where
        F: FnMut(&mut TcpProto<'a>, &mut dyn IpSender, TcpEvent),
    {
        while let Some(event) = self.events.pop_front() {
            handler(self, &mut *sender, event);
            match event {
                TcpEvent::ConnectionRequest { conn, .. } => {
                    let not_adopted = self
                        .valid_slot(conn)
                        .and_then(|slot| self.pcbs[slot].pcb.as_ref())
                        .is_some_and(|pcb| pcb.pending_accept.is_some());
                    if not_adopted {
                        // nobody wanted it
                        let now = self.now;
                        self.abort(sender, now, conn);
                    }
                }
                TcpEvent::EndReceived { conn } => {
                    if let Some(slot) = self.valid_slot(conn) {
                        let now = self.now;
                        let wait = self.config.time_wait_duration;
                        let pcb = self.pcbs[slot].pcb.as_mut().unwrap();
                        if pcb.state == State::FinWait2TimeWait {
                            // deferred entry, now that the callback ran
                            pcb.state = State::TimeWait;
                            pcb.aux_timer.set_at(now + wait);
                            pcb.rtx_timer.unset();
                            pcb.flags.clear(Flags::OUT_RETRY);
                        }
                    }
                }
                _ => (),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::output::initial_cwnd;
    use super::*;
    use crate::iface::{IpErr, IpSendFlags, Ipv4RxInfo, Ipv4SendMeta, RouteInfo, SendRetryList};
    use crate::storage::{BufNode, BufRef};
    use crate::wire::{TcpControl, TcpOptions, TcpPacket, TcpRepr};

    const LOCAL: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
    const REMOTE: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
    const REMOTE_PORT: u16 = 80;

    struct Mock {
        mtu: u16,
        frames: Vec<Vec<u8>>,
        fail_with: Option<IpErr>,
        retries: SendRetryList,
    }

    impl Mock {
        fn new() -> Mock {
            Mock {
                mtu: 1500,
                frames: Vec::new(),
                fail_with: None,
                retries: SendRetryList::new(),
            }
        }

        fn take_frames(&mut self) -> Vec<Vec<u8>> {
            core::mem::take(&mut self.frames)
        }
    }

    impl IpSender for Mock {
        fn route(&self, _dst_addr: Ipv4Address) -> Option<RouteInfo> {
            Some(RouteInfo {
                local_addr: LOCAL,
                mtu: self.mtu,
            })
        }

        fn send_ip4(
            &mut self,
            meta: &Ipv4SendMeta,
            dgram: BufRef<'_>,
            retry: Option<RetryToken>,
        ) -> Result<(), IpErr> {
            assert!(meta.flags.contains(IpSendFlags::DONT_FRAG));
            if let Some(err) = self.fail_with {
                if matches!(err, IpErr::BufferFull | IpErr::ArpPending) {
                    if let Some(token) = retry {
                        self.retries.subscribe(token);
                    }
                }
                return Err(err);
            }
            let mut buf = vec![0u8; dgram.len()];
            dgram.copy_out(&mut buf);
            self.frames.push(buf);
            Ok(())
        }
    }

    fn parse(frame: &[u8]) -> (TcpRepr, Vec<u8>) {
        let packet = TcpPacket::new_checked(frame).unwrap();
        assert!(packet.verify_checksum(&LOCAL, &REMOTE));
        let repr = TcpRepr::parse(&packet).unwrap();
        (repr, frame[packet.header_len() as usize..].to_vec())
    }

    #[allow(clippy::too_many_arguments)]
    fn seg_bytes(
        local_port: u16,
        seq: SeqNumber,
        ack: Option<SeqNumber>,
        control: TcpControl,
        wnd: u16,
        options: TcpOptions,
        payload: &[u8],
    ) -> Vec<u8> {
        let repr = TcpRepr {
            src_port: REMOTE_PORT,
            dst_port: local_port,
            control,
            seq_number: seq,
            ack_number: ack,
            window_len: wnd,
            options,
        };
        let mut buf = vec![0u8; repr.header_len() + payload.len()];
        let hdr_len = repr.header_len();
        repr.emit(&mut TcpPacket::new_unchecked(&mut buf[..]));
        buf[hdr_len..].copy_from_slice(payload);
        let mut packet = TcpPacket::new_unchecked(&mut buf[..]);
        packet.fill_checksum(&REMOTE, &LOCAL);
        buf
    }

    fn deliver(proto: &mut TcpProto<'static>, mock: &mut Mock, now: Instant, bytes: &[u8]) {
        let node = BufNode::new(bytes);
        let info = Ipv4RxInfo {
            src_addr: REMOTE,
            dst_addr: LOCAL,
            ttl: 64,
        };
        proto.receive(mock, now, &info, BufRef::whole(&node));
    }

    fn drain_events(proto: &mut TcpProto<'static>, mock: &mut Mock) -> Vec<TcpEvent> {
        let mut out = Vec::new();
        proto.dispatch_events(mock, |_, _, ev| out.push(ev));
        out
    }

    fn pcb<'r>(proto: &'r TcpProto<'static>, conn: TcpConnection) -> &'r Pcb<'static> {
        proto.pcbs[conn.slot as usize].pcb.as_ref().unwrap()
    }

    struct Endpoint {
        proto: TcpProto<'static>,
        conn: TcpConnection,
        local_port: u16,
        /// Next sequence number we (the fake peer) will use.
        peer_nxt: SeqNumber,
        /// Our ISS plus one.
        snd_base: SeqNumber,
        peer_wnd: u16,
    }

    impl Endpoint {
        fn ack_of(&self, extra: u32) -> Option<SeqNumber> {
            Some(self.snd_base + extra)
        }

        fn send_ack(&mut self, mock: &mut Mock, now: Instant, acked: u32) {
            let bytes = seg_bytes(
                self.local_port,
                self.peer_nxt,
                self.ack_of(acked),
                TcpControl::None,
                self.peer_wnd,
                TcpOptions::none(),
                &[],
            );
            deliver(&mut self.proto, mock, now, &bytes);
        }

        fn queue_data(&mut self, mock: &mut Mock, now: Instant, len: usize) {
            {
                let (a, b) = self.proto.send_buf(self.conn).unwrap();
                let fill = a.len().min(len);
                for byte in a[..fill].iter_mut() {
                    *byte = 0x42;
                }
                for byte in b[..len - fill].iter_mut() {
                    *byte = 0x42;
                }
            }
            self.proto.extend_send(mock, now, self.conn, len);
        }
    }

    /// Three-way handshake from the active side against a scripted peer.
    fn establish(
        mock: &mut Mock,
        peer_mss: u16,
        peer_ws: Option<u8>,
        peer_wnd: u16,
        buf_size: usize,
    ) -> Endpoint {
        let mut proto = TcpProto::new(TcpConfig::default(), 0x1234_5678_9abc_def0);
        let now = Instant::ZERO;
        let conn = proto
            .connect(
                mock,
                now,
                REMOTE,
                REMOTE_PORT,
                None,
                vec![0u8; buf_size],
                vec![0u8; buf_size],
            )
            .unwrap();

        let frames = mock.take_frames();
        assert_eq!(frames.len(), 1);
        let (syn, _) = parse(&frames[0]);
        assert_eq!(syn.control, TcpControl::Syn);
        assert_eq!(syn.ack_number, None);
        assert_eq!(syn.options.mss, Some(1460));
        assert_eq!(syn.options.wnd_scale, Some(6));
        let local_port = syn.src_port;
        let iss = syn.seq_number;

        let peer_iss = SeqNumber(2000);
        let synack = seg_bytes(
            local_port,
            peer_iss,
            Some(iss + 1),
            TcpControl::Syn,
            peer_wnd,
            TcpOptions {
                mss: Some(peer_mss),
                wnd_scale: peer_ws,
            },
            &[],
        );
        deliver(&mut proto, mock, now, &synack);

        assert_eq!(proto.state(conn), Some(State::Established));
        let events = drain_events(&mut proto, mock);
        assert_eq!(events, [TcpEvent::Connected { conn }]);

        // the handshake ACK
        let frames = mock.take_frames();
        assert_eq!(frames.len(), 1);
        let (ack, _) = parse(&frames[0]);
        assert_eq!(ack.control, TcpControl::None);
        assert_eq!(ack.seq_number, iss + 1);
        assert_eq!(ack.ack_number, Some(peer_iss + 1));

        Endpoint {
            proto,
            conn,
            local_port,
            peer_nxt: peer_iss + 1,
            snd_base: iss + 1,
            peer_wnd,
        }
    }

    #[test]
    fn test_handshake_negotiation() {
        let mut mock = Mock::new();
        let ep = establish(&mut mock, 1460, Some(6), 10000, 16384);
        let pcb = pcb(&ep.proto, ep.conn);
        pcb.check_invariants();
        assert_eq!(pcb.snd_mss, 1460);
        assert!(pcb.flags.has(Flags::WND_SCALE));
        assert_eq!(pcb.snd_wnd_shift, 6);
        // the SYN window field is unscaled
        assert_eq!(pcb.snd_wnd, 10000);
    }

    #[test]
    fn test_handshake_without_peer_wscale() {
        let mut mock = Mock::new();
        let ep = establish(&mut mock, 1460, None, 4096, 16384);
        let pcb = pcb(&ep.proto, ep.conn);
        assert!(!pcb.flags.has(Flags::WND_SCALE));
        assert_eq!(pcb.ann_wnd_shift(), 0);
    }

    #[test]
    fn test_bulk_transfer_slow_start() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 10000, 16384);
        let now = Instant::ZERO;
        assert_eq!(pcb(&ep.proto, ep.conn).cwnd, initial_cwnd(1000));
        assert_eq!(initial_cwnd(1000), 4000);

        ep.queue_data(&mut mock, now, 10000);
        // cwnd 4000 admits exactly four segments
        let frames = mock.take_frames();
        assert_eq!(frames.len(), 4);
        for (i, frame) in frames.iter().enumerate() {
            let (repr, payload) = parse(frame);
            assert_eq!(repr.seq_number, ep.snd_base + (i as u32 * 1000));
            assert_eq!(payload.len(), 1000);
        }

        // ACK for the first 2000 bytes: cwnd grows by one MSS, the window
        // admits up to 5000 in flight
        ep.send_ack(&mut mock, now, 2000);
        assert_eq!(pcb(&ep.proto, ep.conn).cwnd, 5000);
        let frames = mock.take_frames();
        assert_eq!(frames.len(), 3);
        let (repr, _) = parse(&frames[0]);
        assert_eq!(repr.seq_number, ep.snd_base + 4000);
        pcb(&ep.proto, ep.conn).check_invariants();
    }

    #[test]
    fn test_fast_retransmit_and_recovery() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 10000, 16384);
        let now = Instant::ZERO;

        ep.queue_data(&mut mock, now, 5000);
        assert_eq!(mock.take_frames().len(), 4);
        // first segment arrives; the fifth goes out
        ep.send_ack(&mut mock, now, 1000);
        assert_eq!(mock.take_frames().len(), 1);

        // three duplicate ACKs
        for _ in 0..2 {
            ep.send_ack(&mut mock, now, 1000);
            assert!(mock.take_frames().is_empty());
        }
        ep.send_ack(&mut mock, now, 1000);

        let frames = mock.take_frames();
        assert_eq!(frames.len(), 1, "fast retransmit expected");
        let (repr, payload) = parse(&frames[0]);
        assert_eq!(repr.seq_number, ep.snd_base + 1000);
        assert_eq!(payload.len(), 1000);
        {
            let pcb = pcb(&ep.proto, ep.conn);
            // 4000 bytes were in flight
            assert_eq!(pcb.ssthresh, 2000);
            assert_eq!(pcb.cwnd, 2000 + 3 * 1000);
            assert!(pcb.flags.has(Flags::RECOVER));
            assert_eq!(pcb.recover, ep.snd_base + 5000);
        }

        // additional duplicate ACKs inflate the window
        ep.send_ack(&mut mock, now, 1000);
        assert_eq!(pcb(&ep.proto, ep.conn).cwnd, 6000);

        // the cumulative ACK past `recover` deflates to ssthresh
        ep.send_ack(&mut mock, now, 5000);
        let pcb = pcb(&ep.proto, ep.conn);
        assert_eq!(pcb.cwnd, 2000);
        assert!(!pcb.flags.has(Flags::RECOVER));
        assert_eq!(pcb.num_dupack, 0);
        pcb.check_invariants();
    }

    #[test]
    fn test_rto_backoff_schedule() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 10000, 16384);
        let mut now = Instant::ZERO;

        ep.queue_data(&mut mock, now, 1000);
        assert_eq!(mock.take_frames().len(), 1);

        let initial_rto = pcb(&ep.proto, ep.conn).rtt.rto;
        let max_rto = super::pcb::ticks_from_duration(ep.proto.config.max_rto);

        let mut observed = Vec::new();
        for _ in 0..9 {
            let at = ep.proto.poll_at().unwrap();
            assert!(at > now);
            now = at;
            ep.proto.handle_timers(&mut mock, now);
            let frames = mock.take_frames();
            assert_eq!(frames.len(), 1, "one retransmission per timeout");
            let (repr, _) = parse(&frames[0]);
            assert_eq!(repr.seq_number, ep.snd_base);
            let pcb = pcb(&ep.proto, ep.conn);
            assert_eq!(pcb.cwnd, 1000);
            observed.push(pcb.rtt.rto);
        }
        // rto = min(max, initial * 2^k)
        for (k, rto) in observed.iter().enumerate() {
            let expected = ((initial_rto as u32) << (k + 1)).min(max_rto as u32);
            assert_eq!(*rto as u32, expected);
        }
    }

    #[test]
    fn test_pmtu_shrink_lowers_mss_silently() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1460, Some(6), 40000, 65536);
        let now = Instant::ZERO;
        assert_eq!(pcb(&ep.proto, ep.conn).snd_mss, 1460);

        ep.proto.handle_frag_needed(&mut mock, now, REMOTE, 576);
        assert_eq!(pcb(&ep.proto, ep.conn).snd_mss, 536);
        assert!(drain_events(&mut ep.proto, &mut mock).is_empty());

        ep.queue_data(&mut mock, now, 2000);
        for frame in mock.take_frames() {
            let (_, payload) = parse(&frame);
            assert!(payload.len() <= 536);
        }
    }

    #[test]
    fn test_graceful_close() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 10000, 16384);
        let mut now = Instant::ZERO;

        ep.proto.close(&mut mock, now, ep.conn);
        assert_eq!(ep.proto.state(ep.conn), Some(State::FinWait1));
        let frames = mock.take_frames();
        assert_eq!(frames.len(), 1);
        let (fin, _) = parse(&frames[0]);
        assert_eq!(fin.control, TcpControl::Fin);
        assert_eq!(fin.seq_number, ep.snd_base);

        // peer acknowledges our FIN
        ep.send_ack(&mut mock, now, 1);
        assert_eq!(ep.proto.state(ep.conn), Some(State::FinWait2));

        // peer sends its FIN
        let peer_fin = seg_bytes(
            ep.local_port,
            ep.peer_nxt,
            ep.ack_of(1),
            TcpControl::Fin,
            ep.peer_wnd,
            TcpOptions::none(),
            &[],
        );
        deliver(&mut ep.proto, &mut mock, now, &peer_fin);
        // TIME-WAIT entry is deferred until the callback has run
        assert_eq!(ep.proto.state(ep.conn), Some(State::FinWait2TimeWait));
        let events = drain_events(&mut ep.proto, &mut mock);
        assert_eq!(events, [TcpEvent::EndReceived { conn: ep.conn }]);
        assert_eq!(ep.proto.state(ep.conn), Some(State::TimeWait));

        // the peer FIN was acknowledged
        let frames = mock.take_frames();
        let (ack, _) = parse(frames.last().unwrap());
        assert_eq!(ack.ack_number, Some(ep.peer_nxt + 1));

        // 2MSL later the PCB is gone
        now += ep.proto.config.time_wait_duration;
        ep.proto.handle_timers(&mut mock, now);
        assert_eq!(ep.proto.state(ep.conn), None);
    }

    #[test]
    fn test_receive_in_order_data() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 10000, 16384);
        let now = Instant::ZERO;

        let data = seg_bytes(
            ep.local_port,
            ep.peer_nxt,
            ep.ack_of(0),
            TcpControl::Psh,
            ep.peer_wnd,
            TcpOptions::none(),
            b"hello stack",
        );
        deliver(&mut ep.proto, &mut mock, now, &data);
        ep.peer_nxt += 11;

        let events = drain_events(&mut ep.proto, &mut mock);
        assert_eq!(
            events,
            [TcpEvent::DataReceived {
                conn: ep.conn,
                len: 11
            }]
        );
        let (a, b) = ep.proto.recv_buf(ep.conn).unwrap();
        let mut got = Vec::new();
        got.extend_from_slice(a);
        got.extend_from_slice(b);
        assert_eq!(&got, b"hello stack");
        // in-order data was acknowledged immediately
        let frames = mock.take_frames();
        let (ack, _) = parse(frames.last().unwrap());
        assert_eq!(ack.ack_number, Some(ep.peer_nxt));
        ep.proto.consume_recv(&mut mock, now, ep.conn, 11);
        pcb(&ep.proto, ep.conn).check_invariants();
    }

    #[test]
    fn test_out_of_order_elicits_dup_ack() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 10000, 16384);
        let now = Instant::ZERO;

        let data = seg_bytes(
            ep.local_port,
            ep.peer_nxt + 100,
            ep.ack_of(0),
            TcpControl::Psh,
            ep.peer_wnd,
            TcpOptions::none(),
            b"future",
        );
        deliver(&mut ep.proto, &mut mock, now, &data);

        // nothing delivered, rcv_nxt unchanged, duplicate ACK emitted
        assert!(drain_events(&mut ep.proto, &mut mock).is_empty());
        assert_eq!(ep.proto.recv_ready(ep.conn), Some(0));
        let frames = mock.take_frames();
        assert_eq!(frames.len(), 1);
        let (ack, payload) = parse(&frames[0]);
        assert!(payload.is_empty());
        assert_eq!(ack.ack_number, Some(ep.peer_nxt));
    }

    #[test]
    fn test_ack_idempotence() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 10000, 16384);
        let now = Instant::ZERO;

        ep.queue_data(&mut mock, now, 3000);
        mock.take_frames();
        ep.send_ack(&mut mock, now, 1000);
        mock.take_frames();

        let before = {
            let pcb = pcb(&ep.proto, ep.conn);
            (pcb.snd_una, pcb.snd_nxt, pcb.cwnd, pcb.ssthresh, pcb.rcv_nxt)
        };
        ep.send_ack(&mut mock, now, 1000);
        let pcb = pcb(&ep.proto, ep.conn);
        let after = (pcb.snd_una, pcb.snd_nxt, pcb.cwnd, pcb.ssthresh, pcb.rcv_nxt);
        assert_eq!(before, after);
        assert_eq!(pcb.num_dupack, 1);
    }

    #[test]
    fn test_zero_window_probe() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 1000, 16384);
        let mut now = Instant::ZERO;

        // the peer closes its window entirely
        ep.peer_wnd = 0;
        ep.send_ack(&mut mock, now, 0);
        assert_eq!(pcb(&ep.proto, ep.conn).snd_wnd, 0);

        ep.queue_data(&mut mock, now, 500);
        assert!(mock.take_frames().is_empty(), "no window, no data");

        let at = ep.proto.poll_at().unwrap();
        now = at;
        ep.proto.handle_timers(&mut mock, now);
        let frames = mock.take_frames();
        assert_eq!(frames.len(), 1);
        let (probe, payload) = parse(&frames[0]);
        assert_eq!(payload.len(), 1, "one-byte probe");
        assert_eq!(probe.seq_number, ep.snd_base);

        // window opens: the queued data flows
        ep.peer_wnd = 1000;
        ep.send_ack(&mut mock, now, 0);
        let frames = mock.take_frames();
        assert!(!frames.is_empty());
        let (repr, payload) = parse(&frames[0]);
        assert_eq!(repr.seq_number, ep.snd_base);
        assert_eq!(payload.len(), 500);
    }

    #[test]
    fn test_peer_rst_aborts() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 10000, 16384);
        let now = Instant::ZERO;

        let rst = seg_bytes(
            ep.local_port,
            ep.peer_nxt,
            ep.ack_of(0),
            TcpControl::Rst,
            0,
            TcpOptions::none(),
            &[],
        );
        deliver(&mut ep.proto, &mut mock, now, &rst);
        let events = drain_events(&mut ep.proto, &mut mock);
        assert_eq!(events, [TcpEvent::Aborted { conn: ep.conn }]);
        // the handle is stale
        assert_eq!(ep.proto.state(ep.conn), None);
        assert!(ep.proto.send_free(ep.conn).is_none());
    }

    #[test]
    fn test_listener_accept_flow() {
        let mut mock = Mock::new();
        let mut proto = TcpProto::new(TcpConfig::default(), 7);
        let now = Instant::ZERO;
        let listener = proto.listen(None, 80, 4).unwrap();

        let syn = {
            let repr = TcpRepr {
                src_port: 45000,
                dst_port: 80,
                control: TcpControl::Syn,
                seq_number: SeqNumber(1000),
                ack_number: None,
                window_len: 10000,
                options: TcpOptions {
                    mss: Some(1460),
                    wnd_scale: Some(6),
                },
            };
            let mut buf = vec![0u8; repr.header_len()];
            repr.emit(&mut TcpPacket::new_unchecked(&mut buf[..]));
            let mut packet = TcpPacket::new_unchecked(&mut buf[..]);
            packet.fill_checksum(&REMOTE, &LOCAL);
            buf
        };
        deliver(&mut proto, &mut mock, now, &syn);

        let frames = mock.take_frames();
        assert_eq!(frames.len(), 1);
        let (synack, _) = parse(&frames[0]);
        assert_eq!(synack.control, TcpControl::Syn);
        assert_eq!(synack.ack_number, Some(SeqNumber(1001)));
        assert_eq!(synack.options.mss, Some(1460));
        assert_eq!(synack.options.wnd_scale, Some(6));
        let server_iss = synack.seq_number;

        // handshake ACK
        let hs_ack = {
            let repr = TcpRepr {
                src_port: 45000,
                dst_port: 80,
                control: TcpControl::None,
                seq_number: SeqNumber(1001),
                ack_number: Some(server_iss + 1),
                window_len: 10000,
                options: TcpOptions::none(),
            };
            let mut buf = vec![0u8; repr.header_len()];
            repr.emit(&mut TcpPacket::new_unchecked(&mut buf[..]));
            let mut packet = TcpPacket::new_unchecked(&mut buf[..]);
            packet.fill_checksum(&REMOTE, &LOCAL);
            buf
        };
        deliver(&mut proto, &mut mock, now, &hs_ack);

        let mut accepted = None;
        proto.dispatch_events(&mut mock, |proto, sender, ev| match ev {
            TcpEvent::ConnectionRequest { listener: l, conn } => {
                assert_eq!(l, listener);
                assert!(proto.accept(sender, conn, vec![0u8; 16384], vec![0u8; 16384]));
                accepted = Some(conn);
            }
            other => panic!("unexpected event {other:?}"),
        });
        let conn = accepted.unwrap();
        assert_eq!(proto.state(conn), Some(State::Established));
        // adopting announced a window
        let frames = mock.take_frames();
        let (upd, _) = parse(frames.last().unwrap());
        assert!(upd.window_len > 0);
    }

    #[test]
    fn test_unaccepted_connection_is_reset() {
        let mut mock = Mock::new();
        let mut proto = TcpProto::new(TcpConfig::default(), 7);
        let now = Instant::ZERO;
        proto.listen(None, 80, 4).unwrap();

        let syn = {
            let repr = TcpRepr {
                src_port: 45000,
                dst_port: 80,
                control: TcpControl::Syn,
                seq_number: SeqNumber(1000),
                ack_number: None,
                window_len: 10000,
                options: TcpOptions {
                    mss: Some(1460),
                    wnd_scale: None,
                },
            };
            let mut buf = vec![0u8; repr.header_len()];
            repr.emit(&mut TcpPacket::new_unchecked(&mut buf[..]));
            let mut packet = TcpPacket::new_unchecked(&mut buf[..]);
            packet.fill_checksum(&REMOTE, &LOCAL);
            buf
        };
        deliver(&mut proto, &mut mock, now, &syn);
        let frames = mock.take_frames();
        let (synack, _) = parse(&frames[0]);
        let server_iss = synack.seq_number;

        let hs_ack = {
            let repr = TcpRepr {
                src_port: 45000,
                dst_port: 80,
                control: TcpControl::None,
                seq_number: SeqNumber(1001),
                ack_number: Some(server_iss + 1),
                window_len: 10000,
                options: TcpOptions::none(),
            };
            let mut buf = vec![0u8; repr.header_len()];
            repr.emit(&mut TcpPacket::new_unchecked(&mut buf[..]));
            let mut packet = TcpPacket::new_unchecked(&mut buf[..]);
            packet.fill_checksum(&REMOTE, &LOCAL);
            buf
        };
        deliver(&mut proto, &mut mock, now, &hs_ack);

        // the handler ignores the request: the engine resets it
        proto.dispatch_events(&mut mock, |_, _, _| {});
        let frames = mock.take_frames();
        assert_eq!(frames.len(), 1);
        let (rst, _) = parse(&frames[0]);
        assert_eq!(rst.control, TcpControl::Rst);
    }

    #[test]
    fn test_unknown_segment_draws_rst() {
        let mut mock = Mock::new();
        let mut proto = TcpProto::new(TcpConfig::default(), 7);
        let now = Instant::ZERO;

        let stray = {
            let repr = TcpRepr {
                src_port: 45000,
                dst_port: 9999,
                control: TcpControl::None,
                seq_number: SeqNumber(5000),
                ack_number: Some(SeqNumber(77)),
                window_len: 100,
                options: TcpOptions::none(),
            };
            let mut buf = vec![0u8; repr.header_len()];
            repr.emit(&mut TcpPacket::new_unchecked(&mut buf[..]));
            let mut packet = TcpPacket::new_unchecked(&mut buf[..]);
            packet.fill_checksum(&REMOTE, &LOCAL);
            buf
        };
        deliver(&mut proto, &mut mock, now, &stray);
        let frames = mock.take_frames();
        assert_eq!(frames.len(), 1);
        let (rst, _) = parse(&frames[0]);
        assert_eq!(rst.control, TcpControl::Rst);
        assert_eq!(rst.seq_number, SeqNumber(77));
    }

    #[test]
    fn test_corrupt_checksum_dropped_silently() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 10000, 16384);
        let now = Instant::ZERO;

        let mut data = seg_bytes(
            ep.local_port,
            ep.peer_nxt,
            ep.ack_of(0),
            TcpControl::Psh,
            ep.peer_wnd,
            TcpOptions::none(),
            b"corrupted payload",
        );
        let last = data.len() - 1;
        data[last] ^= 0xff;
        deliver(&mut ep.proto, &mut mock, now, &data);

        assert!(mock.take_frames().is_empty());
        assert!(drain_events(&mut ep.proto, &mut mock).is_empty());
        assert_eq!(ep.proto.recv_ready(ep.conn), Some(0));
    }

    #[test]
    fn test_connect_resource_errors() {
        let mut mock = Mock::new();
        let config = TcpConfig {
            max_pcbs: 1,
            ..TcpConfig::default()
        };
        let mut proto = TcpProto::new(config, 7);
        let now = Instant::ZERO;

        let first = proto
            .connect(
                &mut mock,
                now,
                REMOTE,
                REMOTE_PORT,
                Some(40000),
                vec![0u8; 1024],
                vec![0u8; 1024],
            )
            .unwrap();
        assert_eq!(
            proto
                .connect(
                    &mut mock,
                    now,
                    REMOTE,
                    REMOTE_PORT,
                    Some(40000),
                    vec![0u8; 1024],
                    vec![0u8; 1024],
                )
                .unwrap_err(),
            ConnectError::AddrInUse
        );
        assert_eq!(
            proto
                .connect(
                    &mut mock,
                    now,
                    REMOTE,
                    REMOTE_PORT,
                    None,
                    vec![0u8; 1024],
                    vec![0u8; 1024],
                )
                .unwrap_err(),
            ConnectError::NoPcbAvailable
        );
        proto.abort(&mut mock, now, first);
    }

    #[test]
    fn test_buffer_full_arms_retry() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 10000, 16384);
        let now = Instant::ZERO;

        mock.fail_with = Some(IpErr::BufferFull);
        ep.queue_data(&mut mock, now, 1000);
        assert!(mock.take_frames().is_empty());
        assert!(mock.retries.has_observers());
        // the backup timer is armed
        assert!(pcb(&ep.proto, ep.conn).aux_timer.is_set());
        assert!(pcb(&ep.proto, ep.conn).flags.has(Flags::OUT_RETRY));

        // driver drains: the retry list releases the connection
        mock.fail_with = None;
        let tokens = mock.retries.take_all();
        for token in tokens {
            ep.proto.retry_sending(&mut mock, now, token);
        }
        let frames = mock.take_frames();
        assert_eq!(frames.len(), 1);
        let (repr, payload) = parse(&frames[0]);
        assert_eq!(repr.seq_number, ep.snd_base);
        assert_eq!(payload.len(), 1000);
        assert!(!pcb(&ep.proto, ep.conn).flags.has(Flags::OUT_RETRY));
    }

    #[test]
    fn test_window_update_threshold() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 10000, 16384);
        let now = Instant::ZERO;

        let payload = vec![0x55u8; 4000];
        let data = seg_bytes(
            ep.local_port,
            ep.peer_nxt,
            ep.ack_of(0),
            TcpControl::Psh,
            ep.peer_wnd,
            TcpOptions::none(),
            &payload,
        );
        deliver(&mut ep.proto, &mut mock, now, &data);
        ep.peer_nxt += 4000;
        drain_events(&mut ep.proto, &mut mock);
        mock.take_frames();

        let edge_before = {
            let pcb = pcb(&ep.proto, ep.conn);
            pcb.rcv_nxt + pcb.rcv_ann_wnd
        };
        // consuming a sliver is not announced
        ep.proto.consume_recv(&mut mock, now, ep.conn, 100);
        assert!(mock.take_frames().is_empty());
        // consuming the rest clears the threshold and is announced
        ep.proto.consume_recv(&mut mock, now, ep.conn, 3900);
        let frames = mock.take_frames();
        assert_eq!(frames.len(), 1);
        let edge_after = {
            let pcb = pcb(&ep.proto, ep.conn);
            pcb.rcv_nxt + pcb.rcv_ann_wnd
        };
        // the right edge never moves left
        assert!(edge_before.ref_lte(edge_before, edge_after));
    }

    #[test]
    fn test_release_abandons_with_deadline() {
        let mut mock = Mock::new();
        let mut ep = establish(&mut mock, 1000, None, 10000, 16384);
        let mut now = Instant::ZERO;

        ep.queue_data(&mut mock, now, 500);
        mock.take_frames();
        ep.proto.release(&mut mock, now, ep.conn);
        // the send side closed behind the user
        let state = ep.proto.state(ep.conn);
        assert_eq!(state, Some(State::FinWait1));
        assert!(pcb(&ep.proto, ep.conn).aux_timer.is_set());

        // no FIN from the peer: the abort deadline reclaims the PCB
        now += ep.proto.config.abandoned_timeout;
        ep.proto.handle_timers(&mut mock, now);
        assert_eq!(ep.proto.state(ep.conn), None);
        let frames = mock.take_frames();
        let (rst, _) = parse(frames.last().unwrap());
        assert_eq!(rst.control, TcpControl::Rst);
        // abandonment produces no events
        assert!(drain_events(&mut ep.proto, &mut mock).is_empty());
    }

    #[test]
    fn test_syn_sent_timeout_aborts() {
        let mut mock = Mock::new();
        let mut proto = TcpProto::new(TcpConfig::default(), 7);
        let mut now = Instant::ZERO;
        let conn = proto
            .connect(
                &mut mock,
                now,
                REMOTE,
                REMOTE_PORT,
                None,
                vec![0u8; 1024],
                vec![0u8; 1024],
            )
            .unwrap();
        mock.take_frames();

        now += proto.config.syn_sent_timeout;
        proto.handle_timers(&mut mock, now);
        let events = drain_events(&mut proto, &mut mock);
        assert_eq!(events, [TcpEvent::Aborted { conn }]);
        assert_eq!(proto.state(conn), None);
    }
}
