use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::ack_ranges::AckRangeSet;
use crate::buffers::big_buffer::BigBufferPool;
use crate::buffers::frame_pool::{FrameBuf, FrameBufferPool, QueueFrameMeta};
use crate::channel::{TransportChannel, WriteOutcome};
use crate::config::TunnelStreamConfig;
use crate::cos::{AuthenticationKind, ClassOfService, FlowControlKind, GuaranteeKind};
use crate::error::TunnelError;
use crate::fragment::{next_msg_id, OutboundFragmentation, Reassembler};
use crate::frame::{self, AckFlags, FragmentHeader, Frame};
use crate::listener::{StreamStatus, TunnelStreamListener};
use crate::persist::PersistenceLog;
use crate::queue_msg::{Expiry, QueueMsg};
use crate::seq_num::SeqNum;
use crate::substream::TunnelSubstream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotOpen,
    /// open request built but not yet accepted by the transport
    SendRequest,
    WaitingRefresh,
    StreamOpen,
    /// FIN due but not yet accepted by the transport
    SendFin,
    WaitFinAck,
    /// both close conditions met, final FIN-ACK not yet accepted by the transport
    SendFinalFinAck,
    WaitFinalFinAck,
}

struct TunnelStreamInner {
    config: Arc<TunnelStreamConfig>,
    /// requested until the refresh arrives, negotiated afterwards
    cos: ClassOfService,
    state: StreamState,

    channel: Arc<dyn TransportChannel>,
    listener: Arc<dyn TunnelStreamListener>,
    frame_pool: Arc<FrameBufferPool>,
    big_buffer_pool: Arc<BigBufferPool>,

    /// last sequence number handed out to a frame
    send_last_seq_num: SeqNum,
    send_last_seq_num_acked: SeqNum,
    /// last sequence number received in order
    recv_last_seq_num: SeqNum,
    recv_last_seq_num_ack_sent: SeqNum,

    bytes_in_flight: u32,
    peer_recv_window: u32,

    transmit_queue: VecDeque<FrameBuf>,
    /// a frame the transport refused with WriteAgain; retried before everything else
    write_again: Option<FrameBuf>,
    ack_wait: BTreeMap<u32, FrameBuf>,

    nak_ranges_pending: AckRangeSet,
    ack_pending: bool,

    pending_fragmentation: VecDeque<OutboundFragmentation>,
    next_msg_id: u16,
    reassembler: Reassembler,

    substreams: FxHashMap<u16, TunnelSubstream>,
    next_substream_id: u16,

    /// the FIN consumes a sequence number of its own so the peer's cumulative ack covers it
    fin_seq_num: Option<SeqNum>,
    received_fin: bool,
    received_own_fin_ack: bool,
    received_final_fin_ack: bool,
    locally_initiated_close: bool,
    suppress_terminal_event: bool,
    terminal_event_sent: bool,
    retry_attempts: u32,

    /// set while the first post-open frame may bypass the flow control window for the login
    auth_bypass_pending: bool,

    response_timer_handle: Option<tokio::task::JoinHandle<()>>,
    retry_timer_handle: Option<tokio::task::JoinHandle<()>>,
    /// armed for the earliest absolute queue-message deadline still waiting to transmit
    expiry_timer_handle: Option<tokio::task::JoinHandle<()>>,

    weak_self: Weak<RwLock<TunnelStreamInner>>,
}

impl TunnelStreamInner {
    fn flow_control_active(&self) -> bool {
        self.cos.flow_control == FlowControlKind::Bidirectional
    }

    /// A reopened stream is a fresh session: numbering restarts at 1 on both sides and
    ///  nothing negotiated or in flight survives from the previous one.
    fn reset_transfer_state(&mut self) {
        self.cos = self.config.cos.clone();
        self.send_last_seq_num = SeqNum::ZERO;
        self.send_last_seq_num_acked = SeqNum::ZERO;
        self.recv_last_seq_num = SeqNum::ZERO;
        self.recv_last_seq_num_ack_sent = SeqNum::ZERO;
        self.bytes_in_flight = 0;
        self.peer_recv_window = self.config.cos.send_window_size;
        self.next_msg_id = 0;
        self.next_substream_id = 0;
        self.auth_bypass_pending = false;
    }

    fn open_request_frame(&self) -> Frame {
        Frame::OpenRequest {
            stream_id: self.config.stream_id,
            domain_type: self.config.domain_type,
            service_id: self.config.service_id,
            cos: self.config.cos.clone(),
        }
    }

    /// Send a frame that is not tracked for retransmission (handshake frames, acks). Returns
    ///  false on transport pushback; the caller's state machine re-attempts next pass.
    async fn send_transient_frame(&mut self, frame: &Frame) -> Result<bool, TunnelError> {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);

        match self.channel.write_frame(&buf).await {
            WriteOutcome::Written => Ok(true),
            WriteOutcome::WriteAgain => Ok(false),
            WriteOutcome::Error(msg) => {
                error!("transport failure on stream {}: {}", self.config.stream_id, msg);
                self.fully_close();
                Err(TunnelError::Channel(msg))
            }
        }
    }

    /// The ACK/NAK frame for the current receive state. Received-in-order data is covered by
    ///  the cumulative number; there is no reorder buffer, so there are never selective-ack
    ///  ranges above it to report.
    fn ack_frame(&self, flags: AckFlags, seq_num: SeqNum) -> Frame {
        Frame::Ack {
            seq_num,
            recv_window: self.cos.recv_window_size,
            flags,
            ack_ranges: AckRangeSet::new(),
            nak_ranges: self.nak_ranges_pending.clone(),
        }
    }

    async fn flush_ack_if_pending(&mut self) -> Result<(), TunnelError> {
        let advanced = self.recv_last_seq_num != self.recv_last_seq_num_ack_sent;
        if !advanced && !self.ack_pending && self.nak_ranges_pending.is_empty() {
            return Ok(());
        }

        let frame = self.ack_frame(AckFlags::empty(), self.recv_last_seq_num);
        if self.send_transient_frame(&frame).await? {
            trace!("stream {}: sent ack {} with {} nak ranges",
                self.config.stream_id, self.recv_last_seq_num, self.nak_ranges_pending.len());
            self.recv_last_seq_num_ack_sent = self.recv_last_seq_num;
            self.ack_pending = false;
        }
        Ok(())
    }

    /// Put one frame on the wire. A fresh frame gets its sequence number here, at transmit
    ///  time; a retransmit keeps the one it had. Returns false if the transport pushed back,
    ///  in which case the frame is parked for the next pass.
    async fn transmit_frame(&mut self, mut frame: FrameBuf) -> Result<bool, TunnelError> {
        if frame.seq_num.is_none() {
            let seq_num = self.send_last_seq_num.next();
            self.send_last_seq_num = seq_num;
            frame::patch_seq_num(frame.buf.as_mut(), seq_num);
            frame.seq_num = Some(seq_num);
        }
        let seq_num = frame.seq_num.unwrap_or(self.send_last_seq_num);

        match self.channel.write_frame(frame.buf.as_ref()).await {
            WriteOutcome::Written => {}
            WriteOutcome::WriteAgain => {
                trace!("stream {}: transport pushed back, parking frame {}", self.config.stream_id, seq_num);
                self.write_again = Some(frame);
                return Ok(false);
            }
            WriteOutcome::Error(msg) => {
                error!("transport failure on stream {}: {}", self.config.stream_id, msg);
                self.frame_pool.return_to_pool(frame);
                self.fully_close();
                return Err(TunnelError::Channel(msg));
            }
        }

        if !frame.ever_transmitted {
            frame.ever_transmitted = true;
            self.bytes_in_flight += frame.buf.len() as u32;

            if let Some(meta) = &frame.queue_meta {
                if let Some(substream) = self.substreams.get(&meta.substream_id) {
                    substream
                        .on_transmitted(meta.queue_seq)
                        .map_err(|e| TunnelError::Channel(format!("persistence failure: {}", e)))?;
                }
            }
        }

        trace!("stream {}: sent data frame {}", self.config.stream_id, seq_num);
        self.ack_wait.insert(seq_num.to_raw(), frame);
        Ok(true)
    }

    fn window_allows(&self, frame: &FrameBuf) -> bool {
        if !self.flow_control_active() || frame.bypass_flow_control {
            return true;
        }
        // a retransmit's bytes are already part of the in-flight count
        if frame.ever_transmitted {
            return true;
        }
        self.bytes_in_flight + frame.buf.len() as u32 <= self.peer_recv_window
    }

    /// move chunks of pending big messages into the transmit queue while frame buffers last
    fn refill_from_fragmentation(&mut self) {
        while let Some(mut outbound) = self.pending_fragmentation.pop_front() {
            while !outbound.is_done() {
                match self.frame_pool.try_get() {
                    Ok(mut frame) => {
                        let (header, msg_complete, chunk) =
                            outbound.next_chunk(self.cos.max_fragment_size as usize);
                        frame::ser_data_header(&mut frame.buf, SeqNum::ZERO, false, msg_complete, Some(header));
                        frame.buf.put_slice(chunk);
                        frame.bypass_flow_control = outbound.bypass_flow_control();
                        self.transmit_queue.push_back(frame);
                    }
                    Err(_) => {
                        // out of frame buffers: checkpoint and resume on a later pass
                        self.pending_fragmentation.push_front(outbound);
                        return;
                    }
                }
            }
            self.big_buffer_pool.return_to_pool(outbound.into_buf());
        }
    }

    async fn drain_transmit_queue(&mut self) -> Result<(), TunnelError> {
        if let Some(frame) = self.write_again.take() {
            if !self.transmit_frame(frame).await? {
                return Ok(());
            }
        }

        self.refill_from_fragmentation();

        while let Some(frame) = self.transmit_queue.pop_front() {
            if !self.window_allows(&frame) {
                trace!("stream {}: flow control window exhausted ({} bytes in flight, window {})",
                    self.config.stream_id, self.bytes_in_flight, self.peer_recv_window);
                self.transmit_queue.push_front(frame);
                break;
            }
            if !self.transmit_frame(frame).await? {
                break;
            }
            self.refill_from_fragmentation();
        }
        Ok(())
    }

    /// Retransmit-only drain for the close-handshake wait states: a frame that already
    ///  carries a sequence number must still reach the peer or its gap never heals, but no
    ///  fresh numbering happens once the FIN has consumed its number.
    async fn drain_retransmits(&mut self) -> Result<(), TunnelError> {
        if let Some(frame) = self.write_again.take() {
            if !self.transmit_frame(frame).await? {
                return Ok(());
            }
        }

        // requeued retransmits sit at the front of the transmit queue
        while self.transmit_queue.front().is_some_and(|frame| frame.seq_num.is_some()) {
            let Some(frame) = self.transmit_queue.pop_front() else {
                break;
            };
            if !self.transmit_frame(frame).await? {
                break;
            }
        }
        Ok(())
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Expire queued, never-transmitted queue messages: absolute deadlines that passed, and
    ///  (at the end of a pass) immediate-expiry messages that could not go out.
    fn expire_queued_messages(&mut self, include_immediate: bool) -> Vec<QueueMsg> {
        let now = Self::now_millis();
        let mut dead_letters = Vec::new();

        let mut remaining = VecDeque::with_capacity(self.transmit_queue.len());
        while let Some(frame) = self.transmit_queue.pop_front() {
            let expired = frame.seq_num.is_none()
                && match &frame.queue_meta {
                    Some(meta) => match meta.expiry {
                        Expiry::None => false,
                        Expiry::Immediate => include_immediate,
                        Expiry::At(deadline) => deadline <= now,
                    },
                    None => false,
                };

            if !expired {
                remaining.push_back(frame);
                continue;
            }

            let meta = frame.queue_meta.clone();
            self.frame_pool.return_to_pool(frame);
            if let Some(meta) = meta {
                if let Some(dead_letter) = self.expire_queue_frame(&meta) {
                    dead_letters.push(dead_letter);
                }
            }
        }
        self.transmit_queue = remaining;
        dead_letters
    }

    fn expire_queue_frame(&mut self, meta: &QueueFrameMeta) -> Option<QueueMsg> {
        let substream = self.substreams.get_mut(&meta.substream_id)?;
        match substream.expire_local(meta.queue_seq, meta.identifier, meta.dest_name.clone(), false) {
            Ok(dead_letter) => {
                debug!("stream {}: queue message {} on substream {} expired locally",
                    self.config.stream_id, meta.queue_seq, meta.substream_id);
                Some(dead_letter)
            }
            Err(e) => {
                warn!("failed to expire queue message {}: {}", meta.queue_seq, e);
                None
            }
        }
    }

    /// One cooperative pass: flush pending acks and NAKs, advance the open / close
    ///  handshakes, drain the transmit queue within the window, expire what could not go out.
    async fn dispatch(&mut self) -> Result<(), TunnelError> {
        match self.state {
            StreamState::NotOpen | StreamState::WaitingRefresh => return Ok(()),
            StreamState::SendRequest => {
                let request = self.open_request_frame();
                if self.send_transient_frame(&request).await? {
                    debug!("stream {}: open request sent", self.config.stream_id);
                    self.state = StreamState::WaitingRefresh;
                }
                return Ok(());
            }
            _ => {}
        }

        let deadline_dead_letters = self.expire_queued_messages(false);
        self.emit_dead_letters(deadline_dead_letters);

        self.flush_ack_if_pending().await?;

        match self.state {
            StreamState::SendFin => self.send_fin().await?,
            StreamState::SendFinalFinAck => self.send_final_fin_ack().await?,
            StreamState::StreamOpen => {
                self.drain_transmit_queue().await?;
                let immediate_dead_letters = self.expire_queued_messages(true);
                self.emit_dead_letters(immediate_dead_letters);
                self.arm_expiry_timer();
            }
            _ => {}
        }

        // a NAK arriving after the close started still gets its retransmit
        if matches!(self.state, StreamState::WaitFinAck | StreamState::WaitFinalFinAck) {
            self.drain_retransmits().await?;
        }
        Ok(())
    }

    fn emit_dead_letters(&mut self, dead_letters: Vec<QueueMsg>) {
        for dead_letter in dead_letters {
            self.listener.on_queue_expired(&dead_letter);
        }
    }

    // ---- close handshake ----------------------------------------------------------------

    async fn send_fin(&mut self) -> Result<(), TunnelError> {
        let fin_seq = match self.fin_seq_num {
            Some(seq) => seq,
            None => {
                let seq = self.send_last_seq_num.next();
                self.send_last_seq_num = seq;
                self.fin_seq_num = Some(seq);
                seq
            }
        };

        // a FIN-flagged frame carries the FIN's own sequence number so the peer can
        //  acknowledge it cumulatively
        let frame = self.ack_frame(AckFlags::FIN, fin_seq);
        if self.send_transient_frame(&frame).await? {
            debug!("stream {}: FIN {} sent", self.config.stream_id, fin_seq);
            self.state = StreamState::WaitFinAck;
        }
        Ok(())
    }

    async fn send_final_fin_ack(&mut self) -> Result<(), TunnelError> {
        let frame = self.ack_frame(AckFlags::FINAL_FIN_ACK, self.recv_last_seq_num);
        if self.send_transient_frame(&frame).await? {
            debug!("stream {}: final FIN-ACK sent", self.config.stream_id);
            if self.received_final_fin_ack {
                if self.locally_initiated_close {
                    // tell the peer it can release without a terminal event of its own
                    let _ = self
                        .send_transient_frame(&Frame::Close { stream_id: self.config.stream_id })
                        .await;
                }
                self.fully_close();
            }
            else {
                self.state = StreamState::WaitFinalFinAck;
            }
        }
        Ok(())
    }

    fn close_conditions_met(&self) -> bool {
        self.received_fin && self.received_own_fin_ack
    }

    async fn advance_close_handshake(&mut self) -> Result<(), TunnelError> {
        if self.state == StreamState::WaitFinAck && self.close_conditions_met() {
            self.retry_attempts = 0;
            self.state = StreamState::SendFinalFinAck;
            self.send_final_fin_ack().await?;
        }
        else if self.state == StreamState::WaitFinalFinAck && self.received_final_fin_ack {
            if self.locally_initiated_close {
                let _ = self
                    .send_transient_frame(&Frame::Close { stream_id: self.config.stream_id })
                    .await;
            }
            self.fully_close();
        }
        Ok(())
    }

    /// Final teardown: everything pooled goes back, substreams close, exactly one terminal
    ///  status event goes to the application (unless suppressed at close time).
    fn fully_close(&mut self) {
        if self.state == StreamState::NotOpen {
            return;
        }
        debug!("stream {}: fully closing", self.config.stream_id);
        self.state = StreamState::NotOpen;

        if let Some(handle) = self.response_timer_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.retry_timer_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.expiry_timer_handle.take() {
            handle.abort();
        }

        if let Some(frame) = self.write_again.take() {
            self.frame_pool.return_to_pool(frame);
        }
        while let Some(frame) = self.transmit_queue.pop_front() {
            self.frame_pool.return_to_pool(frame);
        }
        while let Some((_, frame)) = self.ack_wait.pop_first() {
            self.frame_pool.return_to_pool(frame);
        }
        while let Some(outbound) = self.pending_fragmentation.pop_front() {
            self.big_buffer_pool.return_to_pool(outbound.into_buf());
        }
        for buf in self.reassembler.drain() {
            self.big_buffer_pool.return_to_pool(buf);
        }

        for (substream_id, _) in self.substreams.drain() {
            self.listener.on_substream_status(substream_id, false);
        }

        self.bytes_in_flight = 0;
        self.nak_ranges_pending.clear();
        self.ack_pending = false;

        if !self.terminal_event_sent && !self.suppress_terminal_event {
            self.terminal_event_sent = true;
            self.listener.on_status(StreamStatus::Closed);
        }
    }

    // ---- inbound frames -----------------------------------------------------------------

    fn handle_open_refresh(&mut self, ok: bool, received: ClassOfService) {
        if self.state != StreamState::WaitingRefresh {
            debug!("stream {}: discarding refresh in state {:?}", self.config.stream_id, self.state);
            return;
        }
        if let Some(handle) = self.response_timer_handle.take() {
            handle.abort();
        }

        if !ok {
            warn!("stream {}: open request rejected by peer", self.config.stream_id);
            self.open_failed();
            return;
        }
        if let Err(e) = self.config.cos.check_received(&received) {
            warn!("stream {}: unusable class of service in refresh: {}", self.config.stream_id, e);
            self.open_failed();
            return;
        }

        self.peer_recv_window = received.recv_window_size;
        self.cos = received;
        self.state = StreamState::StreamOpen;
        self.retry_attempts = 0;
        self.auth_bypass_pending = self.cos.authentication != AuthenticationKind::None;

        debug!("stream {} open", self.config.stream_id);
        self.listener.on_status(StreamStatus::Open);
    }

    fn open_failed(&mut self) {
        self.state = StreamState::NotOpen;
        self.listener.on_status(StreamStatus::ClosedRecoverable);
    }

    async fn handle_open_request(
        &mut self,
        stream_id: i32,
        requested: ClassOfService,
    ) -> Result<(), TunnelError> {
        let gates_match = requested.flow_control == self.config.cos.flow_control
            && requested.guarantee == self.config.cos.guarantee
            && requested.authentication == self.config.cos.authentication;

        if self.state != StreamState::NotOpen || stream_id != self.config.stream_id || !gates_match {
            warn!("stream {}: rejecting open request", stream_id);
            let refusal = Frame::OpenRefresh {
                stream_id,
                ok: false,
                cos: self.config.cos.clone(),
            };
            self.send_transient_frame(&refusal).await?;
            return Ok(());
        }

        // negotiate down to the smaller of both sides
        let mut negotiated = requested.clone();
        negotiated.stream_version = u8::min(requested.stream_version, self.config.cos.stream_version);
        negotiated.max_fragment_size = u32::min(requested.max_fragment_size, self.config.cos.max_fragment_size);

        let refresh = Frame::OpenRefresh {
            stream_id,
            ok: true,
            cos: negotiated.clone(),
        };
        self.send_transient_frame(&refresh).await?;

        self.reset_transfer_state();
        self.peer_recv_window = requested.recv_window_size;
        self.cos = negotiated;
        self.state = StreamState::StreamOpen;
        self.terminal_event_sent = false;
        self.auth_bypass_pending = self.cos.authentication != AuthenticationKind::None;

        debug!("stream {} accepted", self.config.stream_id);
        self.listener.on_status(StreamStatus::Open);
        Ok(())
    }

    fn handle_data_frame(
        &mut self,
        seq_num: SeqNum,
        msg_complete: bool,
        fragment: Option<FragmentHeader>,
        payload: Vec<u8>,
    ) -> Result<(), TunnelError> {
        if !matches!(self.state, StreamState::StreamOpen | StreamState::SendFin | StreamState::WaitFinAck) {
            debug!("stream {}: discarding data frame in state {:?}", self.config.stream_id, self.state);
            return Ok(());
        }

        if seq_num.is_at_or_before(self.recv_last_seq_num) {
            // retransmit of something already delivered
            debug!("stream {}: discarding duplicate frame {}", self.config.stream_id, seq_num);
            return Ok(());
        }

        let expected = self.recv_last_seq_num.next();
        if seq_num != expected {
            // a gap: there is no reorder buffer, so the frame is dropped and NAKed together
            //  with the gap in front of it
            debug!("stream {}: gap {}..{} detected", self.config.stream_id, expected, seq_num);
            let (start, end) = (expected.to_raw(), seq_num.to_raw());
            if start <= end {
                self.nak_ranges_pending.insert(start, end);
            }
            else {
                // the gap straddles the numbering wrap point; the range set is over raw u32s
                self.nak_ranges_pending.insert(start, u32::MAX);
                self.nak_ranges_pending.insert(0, end);
            }
            self.ack_pending = true;
            return Ok(());
        }

        self.recv_last_seq_num = seq_num;
        self.nak_ranges_pending.remove_up_to(seq_num.to_raw());
        self.ack_pending = true;

        match fragment {
            None => {
                let _ = msg_complete; // a non-fragmented frame is always a complete message
                self.deliver_payload(&payload)?;
            }
            Some(header) => {
                let pool = self.big_buffer_pool.clone();
                if let Some((buf, _container_type)) =
                    self.reassembler.on_fragment(&header, &payload, &pool)?
                {
                    self.deliver_payload(buf.as_ref())?;
                    pool.return_to_pool(buf);
                }
            }
        }
        Ok(())
    }

    fn deliver_payload(&mut self, payload: &[u8]) -> Result<(), TunnelError> {
        if self.cos.guarantee == GuaranteeKind::PersistentQueue {
            let mut buf: &[u8] = payload;
            let msg = QueueMsg::deser(&mut buf)
                .map_err(|e| TunnelError::Protocol(format!("undecodable queue message: {}", e)))?;
            self.route_queue_msg(msg)
        }
        else {
            self.listener.on_data(payload);
            Ok(())
        }
    }

    async fn handle_ack_frame(
        &mut self,
        seq_num: SeqNum,
        recv_window: u32,
        flags: AckFlags,
        ack_ranges: AckRangeSet,
        nak_ranges: AckRangeSet,
    ) -> Result<(), TunnelError> {
        self.peer_recv_window = recv_window;

        if flags.contains(AckFlags::FINAL_FIN_ACK) {
            self.received_final_fin_ack = true;
        }

        let is_fin = flags.contains(AckFlags::FIN);

        // a FIN's sequence number is the FIN's own, not a cumulative ack point
        if !is_fin && seq_num.is_after(self.send_last_seq_num_acked) {
            self.send_last_seq_num_acked = seq_num;

            let acked: Vec<u32> = self.ack_wait
                .keys()
                .filter(|&&raw| SeqNum::from_raw(raw).is_at_or_before(seq_num))
                .copied()
                .collect();
            for raw in acked {
                self.free_acked_frame(raw);
            }
        }

        for (start, end) in ack_ranges.iter() {
            let acked: Vec<u32> = self.ack_wait
                .keys()
                .filter(|&&raw| in_wrapping_range(raw, start, end))
                .copied()
                .collect();
            for raw in acked {
                self.free_acked_frame(raw);
            }
        }

        for (start, end) in nak_ranges.iter() {
            let naked: Vec<u32> = self.ack_wait
                .keys()
                .filter(|&&raw| in_wrapping_range(raw, start, end))
                .copied()
                .collect();
            for raw in naked {
                if let Some(mut frame) = self.ack_wait.remove(&raw) {
                    debug!("stream {}: NAK for frame {}, requeueing retransmit", self.config.stream_id, raw);
                    frame::set_retransmit_opcode(frame.buf.as_mut());
                    self.requeue_preserving_order(frame);
                }
            }
        }

        if is_fin {
            // the FIN's sequence number slots into the regular receive numbering
            if seq_num == self.recv_last_seq_num.next() {
                self.recv_last_seq_num = seq_num;
            }
            self.ack_pending = true;
            self.received_fin = true;

            if self.state == StreamState::StreamOpen {
                debug!("stream {}: peer initiated close", self.config.stream_id);
                self.state = StreamState::SendFin;
                self.retry_attempts = 0;
                self.arm_close_retry_timer();
            }
            return self.advance_close_handshake().await;
        }

        if let Some(fin_seq) = self.fin_seq_num {
            if fin_seq.is_at_or_before(self.send_last_seq_num_acked) {
                self.received_own_fin_ack = true;
            }
        }
        self.advance_close_handshake().await
    }

    fn free_acked_frame(&mut self, raw_seq: u32) {
        if let Some(frame) = self.ack_wait.remove(&raw_seq) {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(frame.buf.len() as u32);
            self.frame_pool.return_to_pool(frame);
        }
    }

    /// retransmits go to the front of the transmit queue, in sequence order among themselves
    fn requeue_preserving_order(&mut self, frame: FrameBuf) {
        let seq = frame.seq_num;
        let insert_at = self.transmit_queue
            .iter()
            .take_while(|queued| match (queued.seq_num, seq) {
                (Some(queued_seq), Some(seq)) => queued_seq.is_at_or_before(seq),
                // frames without an assigned number were never sent and sort after all
                //  retransmits
                _ => false,
            })
            .count();
        self.transmit_queue.insert(insert_at, frame);
    }

    fn handle_close_frame(&mut self, stream_id: i32) {
        debug!("stream {}: peer sent final close", stream_id);
        self.suppress_terminal_event = true;
        self.fully_close();
    }

    // ---- queue layer --------------------------------------------------------------------

    fn route_queue_msg(&mut self, msg: QueueMsg) -> Result<(), TunnelError> {
        let substream_id = msg.substream_id();
        match &msg {
            QueueMsg::Request { source_name, .. } => {
                if self.substreams.contains_key(&substream_id) {
                    self.queue_protocol_msg(QueueMsg::Status { substream_id, open: false }, None)?;
                    return Ok(());
                }
                let (substream, refresh) = TunnelSubstream::accept(substream_id, source_name.clone(), None)
                    .map_err(|e| TunnelError::Protocol(e.to_string()))?;
                self.substreams.insert(substream_id, substream);
                self.queue_protocol_msg(refresh, None)?;
                self.listener.on_substream_status(substream_id, true);
            }
            QueueMsg::Refresh { last_in_seq_num, .. } => {
                let Some(substream) = self.substreams.get_mut(&substream_id) else {
                    debug!("refresh for unknown substream {}", substream_id);
                    return Ok(());
                };
                let actions = substream
                    .handle_refresh(*last_in_seq_num)
                    .map_err(|e| TunnelError::Protocol(e.to_string()))?;

                for ack in &actions.synthesized_acks {
                    self.listener.on_queue_ack(ack);
                }
                for retransmit in actions.retransmits {
                    // already in the log from the previous connection, so no second append
                    let meta = queue_meta_of(&retransmit);
                    self.queue_protocol_msg(retransmit, meta)?;
                }
                self.listener.on_substream_status(substream_id, true);
            }
            QueueMsg::Status { open, .. } => {
                if !open && self.substreams.remove(&substream_id).is_some() {
                    self.listener.on_substream_status(substream_id, false);
                }
            }
            QueueMsg::Data { seq_num, .. } => {
                let Some(substream) = self.substreams.get_mut(&substream_id) else {
                    debug!("queue data for unknown substream {}", substream_id);
                    return Ok(());
                };
                let (deliver, ack) = substream
                    .handle_data(&msg)
                    .map_err(|e| TunnelError::Protocol(e.to_string()))?;
                trace!("substream {}: queue data {} received, deliver={}", substream_id, seq_num, deliver);
                if deliver {
                    self.listener.on_queue_msg(&msg);
                }
                self.queue_protocol_msg(ack, None)?;
            }
            QueueMsg::Ack { seq_num, .. } => {
                if let Some(substream) = self.substreams.get_mut(&substream_id) {
                    substream
                        .handle_ack(*seq_num)
                        .map_err(|e| TunnelError::Protocol(e.to_string()))?;
                }
                self.listener.on_queue_ack(&msg);
            }
            QueueMsg::DeadLetter { seq_num, .. } => {
                if let Some(substream) = self.substreams.get_mut(&substream_id) {
                    substream
                        .handle_dead_letter(*seq_num)
                        .map_err(|e| TunnelError::Protocol(e.to_string()))?;
                }
                self.listener.on_queue_expired(&msg);
            }
            QueueMsg::Close { .. } => {
                if self.substreams.remove(&substream_id).is_some() {
                    self.listener.on_substream_status(substream_id, false);
                }
            }
        }
        Ok(())
    }

    /// frame a queue protocol message as a regular data frame in the transmit queue
    fn queue_protocol_msg(&mut self, msg: QueueMsg, meta: Option<QueueFrameMeta>) -> Result<(), TunnelError> {
        let mut payload = BytesMut::new();
        msg.ser(&mut payload);
        self.enqueue_data_frame(&payload, true, None, meta, false)
    }

    fn enqueue_data_frame(
        &mut self,
        payload: &[u8],
        msg_complete: bool,
        fragment: Option<FragmentHeader>,
        queue_meta: Option<QueueFrameMeta>,
        bypass_flow_control: bool,
    ) -> Result<(), TunnelError> {
        let header_len = if fragment.is_some() { frame::DATA_FRAG_HEADER_LEN } else { frame::DATA_HEADER_LEN };
        let mut frame = self.frame_pool.try_get()?;
        if header_len + payload.len() > frame.buf.capacity() {
            self.frame_pool.return_to_pool(frame);
            return Err(TunnelError::Validation(format!(
                "serialized message of {} bytes does not fit a single frame",
                payload.len()
            )));
        }
        frame::ser_data_header(&mut frame.buf, SeqNum::ZERO, false, msg_complete, fragment);
        frame.buf.put_slice(payload);
        frame.queue_meta = queue_meta;
        frame.bypass_flow_control = bypass_flow_control;
        self.transmit_queue.push_back(frame);
        Ok(())
    }

    // ---- timers -------------------------------------------------------------------------

    fn backoff_delay(&self) -> Duration {
        self.config.retransmit_timeout * 2u32.saturating_pow(self.retry_attempts)
    }

    fn arm_close_retry_timer(&mut self) {
        if let Some(arc) = self.weak_self.upgrade() {
            if let Some(handle) = self.retry_timer_handle.take() {
                handle.abort();
            }
            self.retry_timer_handle = Some(spawn_close_retry_timer(arc));
        }
    }

    fn arm_response_timer(&mut self) {
        if let Some(arc) = self.weak_self.upgrade() {
            if let Some(handle) = self.response_timer_handle.take() {
                handle.abort();
            }
            let delay = self.config.response_timeout;
            self.response_timer_handle = Some(spawn_response_timer(arc, delay));
        }
    }

    fn earliest_expiry_deadline(&self) -> Option<i64> {
        self.transmit_queue
            .iter()
            .filter(|frame| frame.seq_num.is_none())
            .filter_map(|frame| match &frame.queue_meta {
                Some(QueueFrameMeta { expiry: Expiry::At(deadline), .. }) => Some(*deadline),
                _ => None,
            })
            .min()
    }

    /// (Re-)arm the expiry timer for the earliest absolute deadline among queued messages,
    ///  so a dead letter fires even on a stream with no further dispatch activity.
    fn arm_expiry_timer(&mut self) {
        if let Some(handle) = self.expiry_timer_handle.take() {
            handle.abort();
        }
        let Some(deadline) = self.earliest_expiry_deadline() else {
            return;
        };
        if let Some(arc) = self.weak_self.upgrade() {
            let delay = Duration::from_millis(deadline.saturating_sub(Self::now_millis()).max(0) as u64);
            self.expiry_timer_handle = Some(spawn_expiry_timer(arc, delay));
        }
    }
}

fn in_wrapping_range(raw: u32, start: u32, end: u32) -> bool {
    raw.wrapping_sub(start) <= end.wrapping_sub(start)
}

fn queue_meta_of(msg: &QueueMsg) -> Option<QueueFrameMeta> {
    match msg {
        QueueMsg::Data { substream_id, seq_num, identifier, dest_name, expiry, .. } => Some(QueueFrameMeta {
            substream_id: *substream_id,
            queue_seq: *seq_num,
            identifier: *identifier,
            dest_name: dest_name.clone(),
            expiry: *expiry,
        }),
        _ => None,
    }
}

/// An unanswered open request is re-sent with doubling delays until the retry budget is
///  spent, then the open fails as recoverable.
fn spawn_response_timer(
    inner_arc: Arc<RwLock<TunnelStreamInner>>,
    delay: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        time::sleep(delay).await;

        let mut inner = inner_arc.write().await;
        if inner.state != StreamState::WaitingRefresh && inner.state != StreamState::SendRequest {
            return;
        }

        if inner.retry_attempts < inner.config.max_retransmit_attempts {
            inner.retry_attempts += 1;
            debug!("stream {}: open request unanswered, retry {}", inner.config.stream_id, inner.retry_attempts);
            inner.state = StreamState::SendRequest;
            if inner.dispatch().await.is_err() {
                return;
            }
            inner.response_timer_handle = Some(spawn_response_timer(inner_arc.clone(), delay * 2));
        }
        else {
            warn!("stream {}: open timed out", inner.config.stream_id);
            inner.open_failed();
        }
    })
}

/// Fires the dead letters for queue messages whose absolute deadline passed while they were
///  still waiting for window or buffer space, then re-arms for the next deadline.
fn spawn_expiry_timer(
    inner_arc: Arc<RwLock<TunnelStreamInner>>,
    delay: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        time::sleep(delay).await;

        let mut inner = inner_arc.write().await;
        let dead_letters = inner.expire_queued_messages(false);
        inner.emit_dead_letters(dead_letters);
        inner.expiry_timer_handle = None;
        inner.arm_expiry_timer();
    })
}

/// Re-sends the outstanding close-handshake frame with exponential backoff; once the retry
///  budget is spent the stream force-closes.
fn spawn_close_retry_timer(inner_arc: Arc<RwLock<TunnelStreamInner>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let delay = inner_arc.read().await.backoff_delay();
        time::sleep(delay).await;

        let mut inner = inner_arc.write().await;
        let resend_state = match inner.state {
            StreamState::SendFin | StreamState::WaitFinAck => StreamState::SendFin,
            StreamState::SendFinalFinAck | StreamState::WaitFinalFinAck => StreamState::SendFinalFinAck,
            _ => return,
        };

        if inner.retry_attempts >= inner.config.max_retransmit_attempts {
            warn!("stream {}: close handshake retries exhausted, force closing", inner.config.stream_id);
            inner.fully_close();
            return;
        }
        inner.retry_attempts += 1;
        inner.state = resend_state;
        if inner.dispatch().await.is_err() {
            return;
        }
        inner.retry_timer_handle = Some(spawn_close_retry_timer(inner_arc.clone()));
    })
}

/// A reliable, ordered, flow-controlled, fragmenting logical stream over an unreliable
///  message-oriented transport, with an optional guaranteed-delivery queue layer on top.
///
/// All mutable state lives behind one lock; `submit`/`close` calls from the application are
///  serialized against the I/O-driven `on_frame`/`dispatch` calls. No method blocks beyond
///  lock acquisition: transport pushback parks the frame for the next dispatch pass.
pub struct TunnelStream {
    inner: Arc<RwLock<TunnelStreamInner>>,
}

impl TunnelStream {
    pub fn new(
        config: TunnelStreamConfig,
        channel: Arc<dyn TransportChannel>,
        listener: Arc<dyn TunnelStreamListener>,
    ) -> anyhow::Result<TunnelStream> {
        config.validate()?;
        let config = Arc::new(config);

        let frame_pool = Arc::new(FrameBufferPool::new(
            config.frame_buf_size(),
            config.guaranteed_output_buffers,
        ));
        let big_buffer_pool = Arc::new(BigBufferPool::new(
            config.cos.max_fragment_size as usize,
            config.guaranteed_output_buffers,
        ));

        let inner = Arc::new_cyclic(|weak| {
            RwLock::new(TunnelStreamInner {
                config: config.clone(),
                cos: config.cos.clone(),
                state: StreamState::NotOpen,
                channel,
                listener,
                frame_pool,
                big_buffer_pool,
                send_last_seq_num: SeqNum::ZERO,
                send_last_seq_num_acked: SeqNum::ZERO,
                recv_last_seq_num: SeqNum::ZERO,
                recv_last_seq_num_ack_sent: SeqNum::ZERO,
                bytes_in_flight: 0,
                peer_recv_window: config.cos.send_window_size,
                transmit_queue: VecDeque::new(),
                write_again: None,
                ack_wait: BTreeMap::new(),
                nak_ranges_pending: AckRangeSet::new(),
                ack_pending: false,
                pending_fragmentation: VecDeque::new(),
                next_msg_id: 0,
                reassembler: Reassembler::new(),
                substreams: FxHashMap::default(),
                next_substream_id: 0,
                fin_seq_num: None,
                received_fin: false,
                received_own_fin_ack: false,
                received_final_fin_ack: false,
                locally_initiated_close: false,
                suppress_terminal_event: false,
                terminal_event_sent: false,
                retry_attempts: 0,
                auth_bypass_pending: false,
                response_timer_handle: None,
                retry_timer_handle: None,
                expiry_timer_handle: None,
                weak_self: weak.clone(),
            })
        });

        Ok(TunnelStream { inner })
    }

    pub async fn state(&self) -> StreamState {
        self.inner.read().await.state
    }

    /// Consumer side: send the open request and wait for the peer's refresh (driven by
    ///  `on_frame`). Unanswered requests are re-sent with exponential backoff; once the
    ///  retry budget is spent the open fails with a recoverable status event.
    pub async fn open(&self) -> Result<(), TunnelError> {
        let mut inner = self.inner.write().await;
        if inner.state != StreamState::NotOpen {
            return Err(TunnelError::Validation("stream is already open or opening".to_string()));
        }
        inner.reset_transfer_state();
        inner.state = StreamState::SendRequest;
        inner.terminal_event_sent = false;
        inner.suppress_terminal_event = false;
        inner.locally_initiated_close = false;
        inner.fin_seq_num = None;
        inner.received_fin = false;
        inner.received_own_fin_ack = false;
        inner.received_final_fin_ack = false;
        inner.retry_attempts = 0;
        inner.dispatch().await?;
        inner.arm_response_timer();
        Ok(())
    }

    /// Asynchronous close: starts the FIN handshake and returns. Resources are released and
    ///  the terminal status event emitted once the handshake completes or its retry budget
    ///  runs out.
    pub async fn close(&self, suppress_terminal_event: bool) -> Result<(), TunnelError> {
        let mut inner = self.inner.write().await;
        inner.suppress_terminal_event = suppress_terminal_event;
        inner.locally_initiated_close = true;

        match inner.state {
            StreamState::NotOpen => Ok(()),
            StreamState::SendRequest | StreamState::WaitingRefresh => {
                // nothing reliable is in flight yet
                inner.fully_close();
                Ok(())
            }
            StreamState::StreamOpen => {
                inner.state = StreamState::SendFin;
                inner.retry_attempts = 0;
                inner.dispatch().await?;
                inner.arm_close_retry_timer();
                Ok(())
            }
            _ => Ok(()), // close already in progress
        }
    }

    /// Submit one application payload. Anything larger than the negotiated fragment size is
    ///  fragmented; anything larger than the negotiated message size is rejected.
    pub async fn submit(&self, payload: &[u8], container_type: u8) -> Result<(), TunnelError> {
        let mut inner = self.inner.write().await;
        if inner.state != StreamState::StreamOpen {
            return Err(TunnelError::Validation("stream is not open".to_string()));
        }
        if payload.len() > inner.cos.max_msg_size as usize {
            return Err(TunnelError::Validation(format!(
                "payload of {} bytes exceeds the negotiated message size of {}",
                payload.len(),
                inner.cos.max_msg_size
            )));
        }

        let bypass = inner.auth_bypass_pending;

        if payload.len() <= inner.cos.max_fragment_size as usize {
            inner.enqueue_data_frame(payload, true, None, None, bypass)?;
        }
        else {
            let mut big = inner.big_buffer_pool.try_get(payload.len())?;
            big.put_slice(payload);
            let msg_id = next_msg_id(inner.next_msg_id);
            inner.next_msg_id = msg_id;
            inner.pending_fragmentation.push_back(OutboundFragmentation::new(big, msg_id, container_type, bypass));
        }

        inner.auth_bypass_pending = false;
        inner.dispatch().await
    }

    /// Open a named substream on a persistent-queue stream. Returns the substream id.
    pub async fn open_substream(
        &self,
        queue_name: &str,
        persistence: Option<Arc<dyn PersistenceLog>>,
    ) -> Result<u16, TunnelError> {
        let mut inner = self.inner.write().await;
        if inner.state != StreamState::StreamOpen {
            return Err(TunnelError::Validation("stream is not open".to_string()));
        }
        if inner.cos.guarantee != GuaranteeKind::PersistentQueue {
            return Err(TunnelError::Validation("stream has no persistent queue guarantee".to_string()));
        }
        if queue_name.is_empty() || queue_name.len() > u8::MAX as usize {
            return Err(TunnelError::Validation("queue name must be 1..=255 bytes".to_string()));
        }
        if inner.substreams.values().any(|s| s.queue_name() == queue_name) {
            return Err(TunnelError::Validation(format!("queue name {:?} is already open", queue_name)));
        }

        inner.next_substream_id += 1;
        let substream_id = inner.next_substream_id;

        let (substream, request) = TunnelSubstream::open(substream_id, queue_name.to_string(), persistence)
            .map_err(|e| TunnelError::Validation(e.to_string()))?;
        inner.substreams.insert(substream_id, substream);
        inner.queue_protocol_msg(request, None)?;
        inner.dispatch().await?;
        Ok(substream_id)
    }

    /// Submit a guaranteed queue message on an open substream.
    pub async fn submit_queue_data(
        &self,
        substream_id: u16,
        dest_name: &str,
        identifier: i64,
        expiry: Expiry,
        payload: &[u8],
    ) -> Result<(), TunnelError> {
        let mut inner = self.inner.write().await;
        if inner.state != StreamState::StreamOpen {
            return Err(TunnelError::Validation("stream is not open".to_string()));
        }

        let Some(substream) = inner.substreams.get_mut(&substream_id) else {
            return Err(TunnelError::Validation(format!("no substream with id {}", substream_id)));
        };
        if !substream.is_open() {
            return Err(TunnelError::Validation(format!("substream {} is not open", substream_id)));
        }

        let msg = substream
            .next_data_msg(dest_name.to_string(), identifier, expiry, payload.to_vec())
            .map_err(|e| TunnelError::Validation(e.to_string()))?;
        let meta = queue_meta_of(&msg);
        inner.queue_protocol_msg(msg, meta)?;
        inner.dispatch().await
    }

    /// Close a substream, telling the peer to drop its side too.
    pub async fn close_substream(&self, substream_id: u16) -> Result<(), TunnelError> {
        let mut inner = self.inner.write().await;
        let Some(mut substream) = inner.substreams.remove(&substream_id) else {
            return Err(TunnelError::Validation(format!("no substream with id {}", substream_id)));
        };
        let close = substream.close_msg();
        inner.queue_protocol_msg(close, None)?;
        inner.listener.on_substream_status(substream_id, false);
        inner.dispatch().await
    }

    /// Feed one raw frame received from the transport into the engine.
    pub async fn on_frame(&self, raw: &[u8]) -> Result<(), TunnelError> {
        let mut buf: &[u8] = raw;
        let frame = Frame::deser(&mut buf)
            .map_err(|e| TunnelError::Protocol(format!("undecodable frame: {}", e)))?;

        let mut inner = self.inner.write().await;
        match frame {
            Frame::OpenRequest { stream_id, cos, .. } => {
                inner.handle_open_request(stream_id, cos).await?;
            }
            Frame::OpenRefresh { ok, cos, .. } => {
                inner.handle_open_refresh(ok, cos);
            }
            Frame::Data { seq_num, msg_complete, fragment, payload, .. } => {
                inner.handle_data_frame(seq_num, msg_complete, fragment, payload)?;
            }
            Frame::Ack { seq_num, recv_window, flags, ack_ranges, nak_ranges } => {
                inner.handle_ack_frame(seq_num, recv_window, flags, ack_ranges, nak_ranges).await?;
            }
            Frame::Close { stream_id } => {
                inner.handle_close_frame(stream_id);
            }
        }
        inner.dispatch().await
    }

    /// One cooperative dispatch pass, to be driven by the owning event loop: flushes acks
    ///  and NAKs, advances the close handshake, drains the transmit queue and expires
    ///  overdue queue messages.
    pub async fn dispatch(&self) -> Result<(), TunnelError> {
        self.inner.write().await.dispatch().await
    }
}
