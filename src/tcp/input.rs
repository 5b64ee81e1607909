//! Inbound segment processing.

use std::collections::VecDeque;

use super::conn::{TcpConnection, TcpEvent, TcpListener};
use super::index::PcbKey;
use super::output;
use super::pcb::{ticks_from_duration, Flags, Pcb, PcbTimer, State};
use super::{TcpConfig, TcpProto, MAX_ACK_BEFORE, MAX_WINDOW, MIN_MSS};
use crate::iface::pmtu::MtuRef;
use crate::iface::{IpSender, Ipv4RxInfo, RetryToken};
use crate::storage::BufRef;
use crate::time::Instant;
use crate::wire::ip::checksum;
use crate::wire::{
    IpProtocol, Ipv4AddressExt, TcpControl as Control, TcpOptions, TcpPacket, TcpRepr,
    TcpSeqNumber as SeqNumber, TCP_HEADER_LEN,
};

/// A received segment after header parsing, while its payload still lives
/// in the driver's buffer chain.
pub(super) struct SegmentIn<'p> {
    seq: SeqNumber,
    ack: Option<SeqNumber>,
    wnd: u16,
    syn: bool,
    fin: bool,
    rst: bool,
    opts: TcpOptions,
    payload: BufRef<'p>,
}

impl SegmentIn<'_> {
    fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + self.syn as u32 + self.fin as u32
    }
}

/// What should happen to the PCB once the borrow ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PcbFate {
    Keep,
    Free,
}

impl<'a> TcpProto<'a> {
    /// Process one received TCP datagram.
    ///
    /// `dgram` covers the TCP header and payload; the caller has stripped
    /// the IPv4 header and provides its addressing in `info`. Corrupt
    /// segments are dropped silently.
    pub fn receive(
        &mut self,
        sender: &mut dyn IpSender,
        now: Instant,
        info: &Ipv4RxInfo,
        dgram: BufRef<'_>,
    ) {
        self.now = now;
        if !info.src_addr.x_is_unicast() || !info.dst_addr.x_is_unicast() {
            return;
        }
        let len = dgram.len();
        if len < TCP_HEADER_LEN {
            net_trace!("tcp: truncated segment from {}", info.src_addr);
            return;
        }

        let folded = checksum::combine(&[
            checksum::pseudo_header_v4(&info.src_addr, &info.dst_addr, IpProtocol::Tcp, len as u32),
            checksum::buf_ref(&dgram),
        ]);
        if folded != 0xffff {
            net_trace!("tcp: bad checksum from {}", info.src_addr);
            return;
        }

        let mut hdr = [0u8; 60];
        dgram.copy_out(&mut hdr[..TCP_HEADER_LEN]);
        let hdr_len = ((hdr[12] >> 4) as usize) * 4;
        if hdr_len < TCP_HEADER_LEN || hdr_len > len {
            net_trace!("tcp: bad data offset from {}", info.src_addr);
            return;
        }
        dgram.copy_out(&mut hdr[..hdr_len]);
        let packet = TcpPacket::new_unchecked(&hdr[..hdr_len]);
        let repr = match TcpRepr::parse(&packet) {
            Ok(repr) => repr,
            Err(_) => {
                net_trace!("tcp: malformed header from {}", info.src_addr);
                return;
            }
        };

        let seg = SegmentIn {
            seq: repr.seq_number,
            ack: repr.ack_number,
            wnd: repr.window_len,
            syn: repr.control == Control::Syn,
            fin: repr.control == Control::Fin,
            rst: repr.control == Control::Rst,
            opts: repr.options,
            payload: dgram.sub(hdr_len, len - hdr_len),
        };
        let key = PcbKey {
            remote_port: repr.src_port,
            remote_addr: info.src_addr,
            local_port: repr.dst_port,
            local_addr: info.dst_addr,
        };

        if let Some(slot) = self.index.find(&key) {
            self.pcb_input(sender, slot, seg);
        } else if seg.syn && seg.ack.is_none() {
            self.listener_input(sender, key, seg);
        } else if !seg.rst {
            // no PCB, no listener: refuse
            match seg.ack {
                Some(ack) => output::send_rst_reply(
                    &self.config,
                    sender,
                    key.local_addr,
                    key.remote_addr,
                    key.local_port,
                    key.remote_port,
                    ack,
                    None,
                ),
                None => output::send_rst_reply(
                    &self.config,
                    sender,
                    key.local_addr,
                    key.remote_addr,
                    key.local_port,
                    key.remote_port,
                    SeqNumber(0),
                    Some(seg.seq + seg.seq_len()),
                ),
            }
        }
    }

    fn pcb_input(&mut self, sender: &mut dyn IpSender, slot: usize, seg: SegmentIn<'_>) {
        let now = self.now;
        let conn = self.conn_handle(slot);
        let retry = Some(self.retry_token_for(slot));
        let fate = {
            let TcpProto {
                config,
                pcbs,
                events,
                ..
            } = self;
            let pcb = pcbs[slot].pcb.as_mut().expect("indexed slot is live");
            pcb_segment(config, pcb, sender, events, conn, retry, now, seg)
        };
        if fate == PcbFate::Free {
            self.free_pcb(slot);
        }
    }

    fn listener_input(&mut self, sender: &mut dyn IpSender, key: PcbKey, seg: SegmentIn<'_>) {
        let now = self.now;
        let find = |wildcard: bool| {
            self.listeners.iter().position(|(_, l)| match l {
                Some(l) => {
                    l.local_port == key.local_port
                        && if wildcard {
                            l.local_addr.is_none()
                        } else {
                            l.local_addr == Some(key.local_addr)
                        }
                }
                None => false,
            })
        };
        let lslot = match find(false).or_else(|| find(true)) {
            Some(lslot) => lslot,
            None => {
                output::send_rst_reply(
                    &self.config,
                    sender,
                    key.local_addr,
                    key.remote_addr,
                    key.local_port,
                    key.remote_port,
                    SeqNumber(0),
                    Some(seg.seq + seg.seq_len()),
                );
                return;
            }
        };

        let (backlog_free, initial_rcv_wnd) = {
            let listener = self.listeners[lslot].1.as_ref().unwrap();
            (
                listener.num_pending < listener.backlog,
                listener.initial_rcv_wnd.min(MAX_WINDOW),
            )
        };
        if !backlog_free {
            net_debug!("tcp: backlog full on port {}", key.local_port);
            return;
        }
        let route = match sender.route(key.remote_addr) {
            Some(route) => route,
            None => return,
        };
        let slot = match self.alloc_pcb_slot() {
            Some(slot) => slot,
            None => {
                net_debug!("tcp: out of PCBs, dropping SYN");
                return;
            }
        };
        let mut mtu_ref = MtuRef::new();
        let pmtu = match mtu_ref.setup(&mut self.pmtu, key.remote_addr, route.mtu, now) {
            Some(pmtu) => pmtu,
            None => return,
        };

        let iss = SeqNumber(self.rand.rand_u32());
        let cfg = &self.config;
        let mut pcb = Pcb {
            key,
            state: State::SynRcvd,
            flags: Flags::default(),
            aux_timer: PcbTimer::default(),
            rtx_timer: PcbTimer::default(),
            mtu_ref,
            route_mtu: route.mtu,
            pmtu,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: seg.wnd as u32,
            snd_wl1: seg.seq,
            snd_wl2: iss,
            snd_mss: MIN_MSS,
            base_snd_mss: MIN_MSS,
            snd_wnd_shift: 0,
            cwnd: 0,
            ssthresh: MAX_WINDOW,
            recover: iss,
            num_dupack: 0,
            rtt: super::pcb::RttEstimator::new(ticks_from_duration(cfg.initial_rto)),
            rtt_test_seq: iss,
            rtt_test_time: now,
            rcv_nxt: seg.seq + 1,
            rcv_ann_wnd: initial_rcv_wnd,
            rcv_wnd_shift: cfg.rcv_wnd_shift,
            bufs: None,
            attached: false,
            pending_accept: Some(TcpListener {
                slot: lslot as u32,
                gen: self.listeners[lslot].0,
            }),
        };
        if !pcb_negotiate(cfg, &mut pcb, seg.opts.mss, seg.opts.wnd_scale, pmtu) {
            pcb.mtu_ref.reset(&mut self.pmtu);
            return;
        }

        self.index
            .insert(key, slot)
            .expect("active lookup missed an indexed tuple");
        self.pcbs[slot].pcb = Some(pcb);
        self.listeners[lslot].1.as_mut().unwrap().num_pending += 1;

        let retry = Some(self.retry_token_for(slot));
        let TcpProto { config, pcbs, .. } = self;
        let pcb = pcbs[slot].pcb.as_mut().unwrap();
        net_debug!(
            "tcp: SYN from {}:{}, entering SYN-RCVD",
            key.remote_addr,
            key.remote_port
        );
        let _ = output::pcb_send_syn(config, pcb, sender, retry);
        pcb.snd_nxt = iss + 1;
        pcb.aux_timer.set_at(now + config.syn_rcvd_timeout);
        pcb.rtx_timer.set_at(now + output::rto_duration(pcb));
    }
}

/// Negotiate the effective MSS and window scaling from the peer's SYN
/// options. Returns false when no usable MSS exists on this path.
pub(super) fn pcb_negotiate(
    cfg: &TcpConfig,
    pcb: &mut Pcb<'_>,
    peer_mss: Option<u16>,
    peer_ws: Option<u8>,
    pmtu: u16,
) -> bool {
    let base = peer_mss
        .unwrap_or(MIN_MSS)
        .max(MIN_MSS)
        .min(cfg.mss_cap.max(MIN_MSS));
    let mss = match super::calc_snd_mss(pmtu, base) {
        Some(mss) => mss,
        None => return false,
    };
    pcb.base_snd_mss = base;
    pcb.snd_mss = mss;
    match peer_ws {
        Some(ws) => {
            pcb.flags.set(Flags::WND_SCALE);
            pcb.snd_wnd_shift = ws.min(14);
        }
        None => {
            // scaling is only used if both sides sent the option
            pcb.snd_wnd_shift = 0;
            pcb.rcv_wnd_shift = 0;
        }
    }
    true
}

fn pcb_enter_established(pcb: &mut Pcb<'_>) {
    pcb.state = State::Established;
    pcb.cwnd = output::initial_cwnd(pcb.snd_mss);
    pcb.flags.set(Flags::CWND_INIT);
    pcb.ssthresh = MAX_WINDOW;
}

fn pcb_enter_time_wait(cfg: &TcpConfig, pcb: &mut Pcb<'_>, now: Instant) {
    pcb.state = State::TimeWait;
    pcb.aux_timer.set_at(now + cfg.time_wait_duration);
    pcb.rtx_timer.unset();
    pcb.flags.clear(Flags::OUT_RETRY);
}

/// Trim `seg` to the receive window. Returns false for unacceptable
/// segments (nothing of them falls inside the window).
fn pcb_trim_to_window(pcb: &Pcb<'_>, seg: &mut SegmentIn<'_>) -> bool {
    let wnd = pcb.rcv_ann_wnd;
    let seq_len = seg.seq_len();
    let off = seg.seq - pcb.rcv_nxt;

    let acceptable = if seq_len == 0 {
        if wnd == 0 {
            off == 0
        } else {
            off < wnd
        }
    } else if wnd == 0 {
        false
    } else {
        let last = off.wrapping_add(seq_len - 1);
        off < wnd || last < wnd
    };
    if !acceptable {
        return false;
    }

    // drop the sequence units preceding rcv_nxt
    if off >= 1 << 31 {
        let mut amount = 0u32.wrapping_sub(off);
        if seg.syn && amount > 0 {
            seg.syn = false;
            seg.seq += 1;
            amount -= 1;
        }
        let data_trim = amount.min(seg.payload.len() as u32);
        seg.payload.skip(data_trim as usize);
        seg.seq += data_trim;
        amount -= data_trim;
        if amount > 0 && seg.fin {
            seg.fin = false;
            seg.seq += 1;
            amount -= 1;
        }
        debug_assert_eq!(amount, 0);
    }

    // cut everything past the right window edge
    let off = seg.seq - pcb.rcv_nxt;
    debug_assert!(off <= wnd);
    let space = wnd - off;
    let payload_len = seg.payload.len() as u32;
    if payload_len > space {
        seg.payload = seg.payload.sub(0, space as usize);
        seg.fin = false;
    } else if seg.fin && off + payload_len >= wnd {
        seg.fin = false;
    }
    true
}

/// The full receive-processing pipeline for one segment on one PCB.
#[allow(clippy::too_many_arguments)]
fn pcb_segment(
    cfg: &TcpConfig,
    pcb: &mut Pcb<'_>,
    sender: &mut dyn IpSender,
    events: &mut VecDeque<TcpEvent>,
    conn: TcpConnection,
    retry: Option<RetryToken>,
    now: Instant,
    mut seg: SegmentIn<'_>,
) -> PcbFate {
    if pcb.state == State::SynSent {
        return pcb_syn_sent_input(cfg, pcb, sender, events, conn, retry, now, seg);
    }

    // sequence validation and trimming
    if !pcb_trim_to_window(pcb, &mut seg) {
        if !seg.rst {
            let _ = output::pcb_send_empty_ack(cfg, pcb, sender);
        }
        return PcbFate::Keep;
    }

    // an in-window RST terminates the connection
    if seg.rst {
        net_debug!(
            "tcp: RST from {}:{} in {}",
            pcb.key.remote_addr,
            pcb.key.remote_port,
            pcb.state
        );
        if pcb.attached {
            events.push_back(TcpEvent::Aborted { conn });
        }
        return PcbFate::Free;
    }

    // an in-window SYN after synchronization draws a challenge ACK
    if seg.syn {
        let _ = output::pcb_send_empty_ack(cfg, pcb, sender);
        return PcbFate::Keep;
    }

    if pcb.state == State::TimeWait {
        // a retransmitted FIN restarts the 2MSL wait; everything gets
        // re-acknowledged
        if seg.fin {
            pcb.aux_timer.set_at(now + cfg.time_wait_duration);
        }
        let _ = output::pcb_send_empty_ack(cfg, pcb, sender);
        return PcbFate::Keep;
    }

    // segments without ACK carry nothing further for a synchronized
    // connection
    let ack = match seg.ack {
        Some(ack) => ack,
        None => return PcbFate::Keep,
    };

    if pcb.state == State::SynRcvd {
        if ack != pcb.snd_nxt {
            output::send_rst_reply(
                cfg,
                sender,
                pcb.key.local_addr,
                pcb.key.remote_addr,
                pcb.key.local_port,
                pcb.key.remote_port,
                ack,
                None,
            );
            return PcbFate::Keep;
        }
        pcb.aux_timer.unset();
        pcb.rtx_timer.unset();
        pcb.snd_una = ack;
        pcb.snd_wl1 = seg.seq;
        pcb.snd_wl2 = ack;
        pcb_enter_established(pcb);
        net_debug!(
            "tcp: {}:{} established (passive)",
            pcb.key.remote_addr,
            pcb.key.remote_port
        );
        events.push_back(TcpEvent::ConnectionRequest {
            listener: pcb.pending_accept.expect("SYN-RCVD PCB has a listener"),
            conn,
        });
    }

    // ACK age validation: not older than MAX_ACK_BEFORE behind snd_una,
    // not beyond snd_nxt
    let anchor = pcb.snd_una - MAX_ACK_BEFORE;
    if !anchor.ref_lte(ack, pcb.snd_nxt) {
        if pcb.snd_nxt.mod_lt(ack) {
            // ahead of everything we sent
            let _ = output::pcb_send_empty_ack(cfg, pcb, sender);
        }
        return PcbFate::Keep;
    }

    // window update, newest segment wins
    let old_wnd = pcb.snd_wnd;
    let new_wnd = (seg.wnd as u32) << pcb.snd_wnd_shift;
    let is_dup = seg.payload.is_empty()
        && !seg.fin
        && ack == pcb.snd_una
        && new_wnd == old_wnd
        && pcb.seq_in_flight() > 0;
    if pcb.snd_wl1.mod_lt(seg.seq)
        || (pcb.snd_wl1 == seg.seq && (pcb.snd_wl2 == ack || pcb.snd_wl2.mod_lt(ack)))
    {
        pcb.snd_wnd = new_wnd;
        pcb.snd_wl1 = seg.seq;
        pcb.snd_wl2 = ack;
        if old_wnd == 0 && new_wnd > 0 {
            pcb.flags.set(Flags::OUT_PENDING);
        }
    }

    let acked = ack - pcb.snd_una;
    if acked > 0 {
        let fin_acked = pcb.flags.has(Flags::FIN_SENT) && ack == pcb.snd_nxt;
        let data_acked = acked - fin_acked as u32;
        if let Some(bufs) = &mut pcb.bufs {
            bufs.snd.dequeue(data_acked as usize);
        }
        let old_una = pcb.snd_una;
        pcb.snd_una = ack;

        // RTT sample once the timed segment is fully covered
        if pcb.flags.has(Flags::RTT_PENDING)
            && old_una.ref_lte(pcb.rtt_test_seq, ack)
        {
            let elapsed = now - pcb.rtt_test_time;
            let measured = ticks_from_duration(elapsed);
            let first = !pcb.flags.has(Flags::RTT_VALID);
            let min_rto = ticks_from_duration(cfg.min_rto);
            let max_rto = ticks_from_duration(cfg.max_rto);
            pcb.rtt.sample(first, measured, min_rto, max_rto);
            pcb.flags.set(Flags::RTT_VALID);
            pcb.flags.clear(Flags::RTT_PENDING);
        }

        if pcb.flags.has(Flags::RECOVER) || pcb.flags.has(Flags::RTX_ACTIVE) {
            let past_recover = !pcb.flags.has(Flags::RECOVER)
                || pcb.recover == ack
                || pcb.recover.mod_lt(ack);
            if past_recover {
                pcb.cwnd = pcb.ssthresh;
                pcb.flags.clear(Flags::RECOVER);
                pcb.flags.clear(Flags::RTX_ACTIVE);
            } else {
                // partial ACK during recovery: the next segment was lost
                // as well
                output::pcb_retransmit_one(cfg, pcb, sender, None);
                pcb.cwnd = pcb
                    .cwnd
                    .saturating_sub(data_acked)
                    .max(pcb.snd_mss as u32)
                    + pcb.snd_mss as u32;
                output::pcb_arm_rtx(pcb, now);
            }
        } else if pcb.cwnd < pcb.ssthresh {
            // slow start
            pcb.cwnd = (pcb.cwnd + pcb.snd_mss as u32).min(MAX_WINDOW);
            pcb.flags.clear(Flags::CWND_INIT);
        } else {
            // congestion avoidance: at most one MSS per round trip
            if !pcb.flags.has(Flags::CWND_INCRD) {
                pcb.cwnd = (pcb.cwnd + pcb.snd_mss as u32).min(MAX_WINDOW);
                pcb.flags.set(Flags::CWND_INCRD);
            }
            pcb.flags.clear(Flags::CWND_INIT);
        }
        pcb.num_dupack = 0;

        if fin_acked {
            match pcb.state {
                State::FinWait1 => pcb.state = State::FinWait2,
                State::Closing => pcb_enter_time_wait(cfg, pcb, now),
                State::LastAck => {
                    net_debug!(
                        "tcp: {}:{} closed",
                        pcb.key.remote_addr,
                        pcb.key.remote_port
                    );
                    return PcbFate::Free;
                }
                _ => (),
            }
        }

        // the retransmission timer restarts on every ACK covering new data
        if pcb.seq_in_flight() > 0 || pcb.flags.has(Flags::FIN_PENDING) {
            output::pcb_arm_rtx(pcb, now);
        } else if pcb.state.can_output() {
            output::pcb_arm_idle(pcb, now);
        } else {
            pcb.rtx_timer.unset();
        }

        if pcb.attached && data_acked > 0 && pcb.snd_queue_len() == 0 {
            events.push_back(TcpEvent::SendBufEmpty { conn });
        }
        pcb.flags.set(Flags::OUT_PENDING);
    } else if is_dup {
        let limit = cfg.fast_rtx_dup_acks + cfg.max_additional_dup_acks;
        if pcb.num_dupack < limit {
            pcb.num_dupack += 1;
            if pcb.num_dupack == cfg.fast_rtx_dup_acks {
                if !pcb.flags.has(Flags::RECOVER) {
                    output::pcb_fast_retransmit(cfg, pcb, sender, now);
                }
            } else if pcb.num_dupack > cfg.fast_rtx_dup_acks {
                // window inflation for segments that left the network
                pcb.cwnd = (pcb.cwnd + pcb.snd_mss as u32).min(MAX_WINDOW);
                pcb.flags.set(Flags::OUT_PENDING);
            }
        }
    }

    // in-order data lands in the receive buffer; anything else only
    // provokes a duplicate ACK
    let payload_len = seg.payload.len();
    if payload_len > 0 {
        let in_order = seg.seq == pcb.rcv_nxt;
        if pcb.state.is_accepting_data() && in_order {
            if pcb.attached {
                let bufs = pcb.bufs.as_mut().expect("attached PCB has buffers");
                for chunk in seg.payload.chunks() {
                    let copied = bufs.rcv.enqueue_copy(chunk);
                    debug_assert_eq!(copied, chunk.len());
                }
                pcb.rcv_nxt += payload_len as u32;
                pcb.rcv_ann_wnd -= payload_len as u32;
                events.push_back(TcpEvent::DataReceived {
                    conn,
                    len: payload_len,
                });
            } else if pcb.pending_accept.is_some() {
                // not yet adopted: leave unacknowledged, the peer will
                // retransmit
            } else {
                // abandoned: swallow the data so the peer's FIN can reach us
                pcb.rcv_nxt += payload_len as u32;
                pcb.rcv_ann_wnd -= payload_len as u32;
            }
        }
        pcb.flags.set(Flags::ACK_PENDING);
    }

    // an in-order FIN advances the state machine
    if seg.fin && seg.seq + seg.payload.len() as u32 == pcb.rcv_nxt {
        pcb.rcv_nxt += 1;
        pcb.flags.set(Flags::ACK_PENDING);
        match pcb.state {
            State::Established => {
                pcb.state = State::CloseWait;
                if pcb.attached {
                    events.push_back(TcpEvent::EndReceived { conn });
                }
            }
            State::FinWait1 => {
                pcb.state = State::Closing;
                if pcb.attached {
                    events.push_back(TcpEvent::EndReceived { conn });
                }
            }
            State::FinWait2 => {
                if pcb.attached {
                    // entry into TIME-WAIT is deferred until the user
                    // callback has run
                    pcb.state = State::FinWait2TimeWait;
                    events.push_back(TcpEvent::EndReceived { conn });
                } else {
                    pcb_enter_time_wait(cfg, pcb, now);
                }
            }
            _ => (),
        }
    }

    if pcb.flags.has(Flags::ACK_PENDING) || pcb.flags.has(Flags::OUT_PENDING) {
        output::pcb_output(cfg, pcb, sender, retry, now);
    }
    PcbFate::Keep
}

#[allow(clippy::too_many_arguments)]
fn pcb_syn_sent_input(
    cfg: &TcpConfig,
    pcb: &mut Pcb<'_>,
    sender: &mut dyn IpSender,
    events: &mut VecDeque<TcpEvent>,
    conn: TcpConnection,
    retry: Option<RetryToken>,
    now: Instant,
    seg: SegmentIn<'_>,
) -> PcbFate {
    if seg.rst {
        // connection refused, if the RST acknowledges our SYN
        if seg.ack == Some(pcb.snd_nxt) {
            net_debug!(
                "tcp: connection to {}:{} refused",
                pcb.key.remote_addr,
                pcb.key.remote_port
            );
            if pcb.attached {
                events.push_back(TcpEvent::Aborted { conn });
            }
            return PcbFate::Free;
        }
        return PcbFate::Keep;
    }
    if !seg.syn {
        return PcbFate::Keep;
    }
    let ack = match seg.ack {
        // simultaneous open is not supported
        Some(ack) => ack,
        None => return PcbFate::Keep,
    };
    if ack != pcb.snd_nxt {
        output::send_rst_reply(
            cfg,
            sender,
            pcb.key.local_addr,
            pcb.key.remote_addr,
            pcb.key.local_port,
            pcb.key.remote_port,
            ack,
            None,
        );
        return PcbFate::Keep;
    }

    pcb.rcv_nxt = seg.seq + 1;
    pcb.snd_una = ack;
    // the window field of a SYN is never scaled
    pcb.snd_wnd = seg.wnd as u32;
    pcb.snd_wl1 = seg.seq;
    pcb.snd_wl2 = ack;
    pcb.aux_timer.unset();
    pcb.rtx_timer.unset();
    if !pcb_negotiate(cfg, pcb, seg.opts.mss, seg.opts.wnd_scale, pcb.pmtu) {
        if pcb.attached {
            events.push_back(TcpEvent::Aborted { conn });
        }
        return PcbFate::Free;
    }
    pcb_enter_established(pcb);
    net_debug!(
        "tcp: {}:{} established (active), mss {}",
        pcb.key.remote_addr,
        pcb.key.remote_port,
        pcb.snd_mss
    );
    if pcb.attached {
        events.push_back(TcpEvent::Connected { conn });
    }
    pcb.flags.set(Flags::ACK_PENDING);
    output::pcb_output(cfg, pcb, sender, retry, now);
    PcbFate::Keep
}
