//! Segment emission and the send-side timer actions.

use super::pcb::{duration_from_ticks, ticks_from_duration, Flags, Pcb, State};
use super::TcpConfig;
use crate::iface::{IpErr, IpSendFlags, IpSender, Ipv4SendMeta, RetryToken};
use crate::storage::{BufNode, BufRef};
use crate::time::Instant;
use crate::wire::ip::checksum;
use crate::wire::{
    IpProtocol, Ipv4Address, TcpControl as Control, TcpOptions, TcpPacket, TcpRepr,
    TcpSeqNumber as SeqNumber, TCP_HEADER_LEN, TCP_MAX_OPTIONS_LEN,
};

/// RFC 3390 initial congestion window.
pub(super) fn initial_cwnd(mss: u16) -> u32 {
    let mss = mss as u32;
    (4 * mss).min((2 * mss).max(4380))
}

pub(super) fn rto_duration(pcb: &Pcb<'_>) -> crate::time::Duration {
    duration_from_ticks(pcb.rtt.rto)
}

/// Raise the advertised window toward the current free buffer space, if
/// the increase clears the silly-window threshold. The right edge never
/// moves left.
pub(super) fn pcb_refresh_ann_wnd(cfg: &TcpConfig, pcb: &mut Pcb<'_>) {
    let free = match &pcb.bufs {
        Some(bufs) => bufs.rcv.free() as u32,
        None => return,
    };
    if !pcb.attached {
        // nobody will consume; the window was widened at abandonment
        return;
    }
    let capacity = pcb.bufs.as_ref().unwrap().rcv.capacity() as u32;
    let target = free.min(super::MAX_WINDOW);
    if target <= pcb.rcv_ann_wnd {
        return;
    }
    let threshold = cfg
        .wnd_update_threshold
        .min((pcb.snd_mss as u32).min(capacity / 2));
    if target - pcb.rcv_ann_wnd >= threshold || target == capacity {
        pcb.rcv_ann_wnd = target;
    }
}

/// The value for the window field, with the store-back that keeps
/// `rcv_ann_wnd` equal to what was actually announced.
fn pcb_ann_wnd_field(pcb: &mut Pcb<'_>, syn: bool) -> u16 {
    if syn {
        // window scaling never applies to the SYN's own window field
        let field = pcb.rcv_ann_wnd.min(0xffff) as u16;
        pcb.rcv_ann_wnd = field as u32;
        field
    } else {
        let shift = pcb.ann_wnd_shift();
        let field = (pcb.rcv_ann_wnd >> shift).min(0xffff) as u16;
        pcb.rcv_ann_wnd = (field as u32) << shift;
        field
    }
}

/// Build and transmit one segment. `payload_off`/`payload_len` select
/// bytes of the send ring; the header is checksummed together with them
/// over the assembled buffer chain.
pub(super) fn send_segment(
    cfg: &TcpConfig,
    pcb: &mut Pcb<'_>,
    sender: &mut dyn IpSender,
    seq: SeqNumber,
    control: Control,
    ack: Option<SeqNumber>,
    payload_off: u32,
    payload_len: u32,
    options: TcpOptions,
    retry: Option<RetryToken>,
) -> Result<(), IpErr> {
    if pcb.flags.has(Flags::RCV_WND_UPD) {
        pcb_refresh_ann_wnd(cfg, pcb);
        pcb.flags.clear(Flags::RCV_WND_UPD);
    }
    let window_len = pcb_ann_wnd_field(pcb, control == Control::Syn);

    let repr = TcpRepr {
        src_port: pcb.key.local_port,
        dst_port: pcb.key.remote_port,
        control,
        seq_number: seq,
        ack_number: ack,
        window_len,
        options,
    };
    let hdr_len = repr.header_len();
    let mut hdr = [0u8; TCP_HEADER_LEN + TCP_MAX_OPTIONS_LEN];
    repr.emit(&mut TcpPacket::new_unchecked(&mut hdr[..hdr_len]));

    let (part_a, part_b) = match &pcb.bufs {
        Some(bufs) if payload_len > 0 => bufs
            .snd
            .peek_slices(payload_off as usize, payload_len as usize),
        _ => (&[][..], &[][..]),
    };
    let tot_len = hdr_len + payload_len as usize;

    let folded = {
        let tail = BufNode::new(part_b);
        let mid = BufNode::with_next(part_a, &tail);
        let head = BufNode::with_next(&hdr[..hdr_len], &mid);
        let dgram = BufRef::new(&head, 0, tot_len);
        checksum::combine(&[
            checksum::pseudo_header_v4(
                &pcb.key.local_addr,
                &pcb.key.remote_addr,
                IpProtocol::Tcp,
                tot_len as u32,
            ),
            checksum::buf_ref(&dgram),
        ])
    };
    hdr[16..18].copy_from_slice(&(!folded).to_be_bytes());

    let tail = BufNode::new(part_b);
    let mid = BufNode::with_next(part_a, &tail);
    let head = BufNode::with_next(&hdr[..hdr_len], &mid);
    let dgram = BufRef::new(&head, 0, tot_len);

    let meta = Ipv4SendMeta {
        src_addr: pcb.key.local_addr,
        dst_addr: pcb.key.remote_addr,
        protocol: IpProtocol::Tcp,
        ttl: cfg.ttl,
        flags: IpSendFlags::DONT_FRAG,
    };
    sender.send_ip4(&meta, dgram, retry)
}

/// Transmit a pure ACK at `rcv_nxt`.
pub(super) fn pcb_send_empty_ack(
    cfg: &TcpConfig,
    pcb: &mut Pcb<'_>,
    sender: &mut dyn IpSender,
) -> Result<(), IpErr> {
    let (seq, ack) = (pcb.snd_nxt, pcb.rcv_nxt);
    send_segment(
        cfg,
        pcb,
        sender,
        seq,
        Control::None,
        Some(ack),
        0,
        0,
        TcpOptions::none(),
        None,
    )
}

/// Transmit an RST for a connection whose sequence state is known.
pub(super) fn pcb_send_rst(cfg: &TcpConfig, pcb: &mut Pcb<'_>, sender: &mut dyn IpSender) {
    let (seq, ack) = (pcb.snd_nxt, pcb.rcv_nxt);
    let _ = send_segment(
        cfg,
        pcb,
        sender,
        seq,
        Control::Rst,
        Some(ack),
        0,
        0,
        TcpOptions::none(),
        None,
    );
}

/// Transmit an RST in response to a segment without a PCB.
#[allow(clippy::too_many_arguments)]
pub(super) fn send_rst_reply(
    cfg: &TcpConfig,
    sender: &mut dyn IpSender,
    local_addr: Ipv4Address,
    remote_addr: Ipv4Address,
    local_port: u16,
    remote_port: u16,
    seq: SeqNumber,
    ack: Option<SeqNumber>,
) {
    let repr = TcpRepr {
        src_port: local_port,
        dst_port: remote_port,
        control: Control::Rst,
        seq_number: seq,
        ack_number: ack,
        window_len: 0,
        options: TcpOptions::none(),
    };
    let mut hdr = [0u8; TCP_HEADER_LEN];
    repr.emit(&mut TcpPacket::new_unchecked(&mut hdr[..]));

    let folded = {
        let node = BufNode::new(&hdr);
        let dgram = BufRef::whole(&node);
        checksum::combine(&[
            checksum::pseudo_header_v4(
                &local_addr,
                &remote_addr,
                IpProtocol::Tcp,
                TCP_HEADER_LEN as u32,
            ),
            checksum::buf_ref(&dgram),
        ])
    };
    hdr[16..18].copy_from_slice(&(!folded).to_be_bytes());

    let node = BufNode::new(&hdr);
    let meta = Ipv4SendMeta {
        src_addr: local_addr,
        dst_addr: remote_addr,
        protocol: IpProtocol::Tcp,
        ttl: cfg.ttl,
        flags: IpSendFlags::DONT_FRAG,
    };
    let _ = sender.send_ip4(&meta, BufRef::whole(&node), None);
}

/// The options carried on SYN and SYN-ACK segments: our MSS offer derived
/// from the route MTU, and our window scale shift. A SYN-ACK echoes the
/// scale option only if the peer's SYN carried one.
pub(super) fn syn_options(cfg: &TcpConfig, pcb: &Pcb<'_>) -> TcpOptions {
    let wnd_scale = if pcb.state == State::SynSent {
        Some(cfg.rcv_wnd_shift)
    } else if pcb.flags.has(Flags::WND_SCALE) {
        Some(pcb.rcv_wnd_shift)
    } else {
        None
    };
    TcpOptions {
        mss: Some(pcb.route_mtu.saturating_sub(40).max(super::MIN_MSS)),
        wnd_scale,
    }
}

/// (Re)transmit the SYN or SYN-ACK of a connection being established.
pub(super) fn pcb_send_syn(
    cfg: &TcpConfig,
    pcb: &mut Pcb<'_>,
    sender: &mut dyn IpSender,
    retry: Option<RetryToken>,
) -> Result<(), IpErr> {
    let options = syn_options(cfg, pcb);
    let seq = pcb.snd_una;
    let ack = match pcb.state {
        State::SynSent => None,
        _ => Some(pcb.rcv_nxt),
    };
    send_segment(
        cfg, pcb, sender, seq, Control::Syn, ack, 0, 0, options, retry,
    )
}

/// Arm the aux timer for an output retry, unless it is holding a state
/// deadline (SYN timeouts, TIME-WAIT, abandoned abort).
fn pcb_arm_output_retry(cfg: &TcpConfig, pcb: &mut Pcb<'_>, now: Instant, err: IpErr) {
    if !pcb.attached || pcb.state.is_syn_sent_or_rcvd() || pcb.state == State::TimeWait {
        return;
    }
    let delay = match err {
        IpErr::BufferFull | IpErr::ArpPending => cfg.output_retry_short,
        _ => cfg.output_retry_long,
    };
    pcb.flags.set(Flags::OUT_RETRY);
    pcb.aux_timer.set_at(now + delay);
}

/// Start or reset the retransmission timer for in-flight data.
pub(super) fn pcb_arm_rtx(pcb: &mut Pcb<'_>, now: Instant) {
    pcb.flags.clear(Flags::IDLE_TIMER);
    pcb.rtx_timer.set_at(now + rto_duration(pcb));
}

/// Park the retransmission timer in idle-restart mode.
pub(super) fn pcb_arm_idle(pcb: &mut Pcb<'_>, now: Instant) {
    pcb.flags.set(Flags::IDLE_TIMER);
    pcb.rtx_timer.set_at(now + rto_duration(pcb));
}

/// Produce segments while data, window and Nagle permit; finish with a
/// pure ACK if one is still owed.
pub(super) fn pcb_output(
    cfg: &TcpConfig,
    pcb: &mut Pcb<'_>,
    sender: &mut dyn IpSender,
    retry: Option<RetryToken>,
    now: Instant,
) {
    pcb.flags.clear(Flags::OUT_PENDING);

    if pcb.state.can_output() {
        loop {
            let queue = pcb.snd_queue_len();
            let sent = pcb.data_in_flight();
            let avail = queue - sent;
            let usable = pcb
                .snd_wnd
                .min(pcb.cwnd)
                .saturating_sub(pcb.seq_in_flight());
            let mut seg_len = avail.min(usable).min(pcb.snd_mss as u32);

            // Nagle: while anything is outstanding, hold back a final
            // sub-MSS segment
            let is_tail = seg_len == avail;
            let fin_ready = pcb.flags.has(Flags::FIN_PENDING) && is_tail && seg_len == avail;
            if seg_len > 0
                && seg_len < pcb.snd_mss as u32
                && is_tail
                && pcb.seq_in_flight() > 0
                && !fin_ready
            {
                seg_len = 0;
            }

            if seg_len == 0 && !fin_ready {
                break;
            }

            let seq = pcb.snd_nxt;
            let control = if fin_ready {
                Control::Fin
            } else if sent + seg_len == queue {
                Control::Psh
            } else {
                Control::None
            };
            let ack = pcb.rcv_nxt;
            match send_segment(
                cfg,
                pcb,
                sender,
                seq,
                control,
                Some(ack),
                sent,
                seg_len,
                TcpOptions::none(),
                retry,
            ) {
                Ok(()) => {
                    if seg_len > 0 && !pcb.flags.has(Flags::RTT_PENDING) {
                        pcb.flags.set(Flags::RTT_PENDING);
                        pcb.flags.clear(Flags::CWND_INCRD);
                        pcb.rtt_test_seq = seq + seg_len;
                        pcb.rtt_test_time = now;
                    }
                    pcb.snd_nxt = seq + seg_len;
                    if fin_ready {
                        pcb.snd_nxt += 1;
                        pcb.flags.clear(Flags::FIN_PENDING);
                        pcb.flags.set(Flags::FIN_SENT);
                    }
                    pcb.flags.clear(Flags::ACK_PENDING);
                    if pcb.flags.has(Flags::IDLE_TIMER) || !pcb.rtx_timer.is_set() {
                        pcb_arm_rtx(pcb, now);
                    }
                    if fin_ready {
                        break;
                    }
                }
                Err(err) => {
                    net_trace!("tcp: send deferred: {}", err);
                    pcb_arm_output_retry(cfg, pcb, now, err);
                    return;
                }
            }
        }
    }

    if pcb.flags.has(Flags::ACK_PENDING) {
        if let Err(err) = pcb_send_empty_ack(cfg, pcb, sender) {
            net_trace!("tcp: ack deferred: {}", err);
            pcb_arm_output_retry(cfg, pcb, now, err);
            return;
        }
        pcb.flags.clear(Flags::ACK_PENDING);
    }

    // zero-window probing runs off the retransmission timer
    if pcb.state.can_output()
        && pcb.snd_wnd == 0
        && pcb.snd_not_sent() > 0
        && !pcb.rtx_timer.is_set()
    {
        pcb_arm_rtx(pcb, now);
    }
}

/// Retransmit one segment from `snd_una`, never longer than one MSS.
pub(super) fn pcb_retransmit_one(
    cfg: &TcpConfig,
    pcb: &mut Pcb<'_>,
    sender: &mut dyn IpSender,
    probe_len: Option<u32>,
) {
    let queue = pcb.snd_queue_len();
    let data_len = match probe_len {
        Some(limit) => queue.min(limit),
        None => queue.min(pcb.snd_mss as u32),
    };
    let fin = probe_len.is_none() && pcb.flags.has(Flags::FIN_SENT) && data_len == queue;
    if data_len == 0 && !fin {
        return;
    }
    let control = if fin {
        Control::Fin
    } else if data_len == queue {
        Control::Psh
    } else {
        Control::None
    };
    let (seq, ack) = (pcb.snd_una, pcb.rcv_nxt);
    let _ = send_segment(
        cfg,
        pcb,
        sender,
        seq,
        control,
        Some(ack),
        0,
        data_len,
        TcpOptions::none(),
        None,
    );
    // retransmission invalidates the running RTT measurement
    pcb.flags.clear(Flags::RTT_PENDING);
}

/// Congestion response shared by timeout and fast retransmit: halve the
/// threshold against the amount in flight.
pub(super) fn pcb_halve_ssthresh(pcb: &mut Pcb<'_>) {
    let flight = pcb.data_in_flight();
    pcb.ssthresh = (flight / 2).max(2 * pcb.snd_mss as u32);
}

/// Retransmission timeout action.
pub(super) fn pcb_rto_event(
    cfg: &TcpConfig,
    pcb: &mut Pcb<'_>,
    sender: &mut dyn IpSender,
    now: Instant,
) {
    let max_rto = ticks_from_duration(cfg.max_rto);

    if pcb.flags.has(Flags::IDLE_TIMER) {
        // connection went idle for a full RTO: restart from the initial
        // window
        pcb.flags.clear(Flags::IDLE_TIMER);
        if !pcb.flags.has(Flags::CWND_INIT) {
            pcb.cwnd = initial_cwnd(pcb.snd_mss);
            pcb.flags.set(Flags::CWND_INIT);
        }
        return;
    }

    if pcb.snd_wnd == 0 && pcb.snd_queue_len() > 0 {
        // zero-window probe, on the same backoff schedule
        net_trace!("tcp: zero-window probe to {}", pcb.key.remote_addr);
        pcb_retransmit_one(cfg, pcb, sender, Some(1));
        pcb.rtt.backoff(max_rto);
        pcb_arm_rtx(pcb, now);
        return;
    }

    if !pcb.has_snd_outstanding() {
        return;
    }

    net_debug!(
        "tcp: rto, {}:{} -> {}:{}",
        pcb.key.local_addr,
        pcb.key.local_port,
        pcb.key.remote_addr,
        pcb.key.remote_port
    );
    pcb_halve_ssthresh(pcb);
    pcb.cwnd = pcb.snd_mss as u32;
    pcb.flags.clear(Flags::CWND_INIT);
    pcb.flags.clear(Flags::CWND_INCRD);
    pcb.flags.set(Flags::RTX_ACTIVE);
    pcb.recover = pcb.snd_nxt;
    pcb.flags.set(Flags::RECOVER);
    pcb.num_dupack = 0;
    pcb.rtt.backoff(max_rto);
    pcb_retransmit_one(cfg, pcb, sender, None);
    pcb_arm_rtx(pcb, now);
}

/// Triple-duplicate-ACK action: enter fast recovery.
pub(super) fn pcb_fast_retransmit(
    cfg: &TcpConfig,
    pcb: &mut Pcb<'_>,
    sender: &mut dyn IpSender,
    now: Instant,
) {
    net_debug!(
        "tcp: fast retransmit, {}:{} -> {}:{}",
        pcb.key.local_addr,
        pcb.key.local_port,
        pcb.key.remote_addr,
        pcb.key.remote_port
    );
    pcb_halve_ssthresh(pcb);
    pcb.cwnd = pcb.ssthresh + 3 * pcb.snd_mss as u32;
    pcb.flags.clear(Flags::CWND_INIT);
    pcb.recover = pcb.snd_nxt;
    pcb.flags.set(Flags::RECOVER);
    pcb_retransmit_one(cfg, pcb, sender, None);
    pcb_arm_rtx(pcb, now);
}
