#[cfg(test)]
mod messenger_test;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use fxhash::FxHashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::coerce::Timestamp;
use crate::config::{Config, MAX_MESSAGE_ID, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use crate::packet::{Content, Control, Packet, PacketHeader, PACKET_HEADER_SIZE};
use crate::queue::inbox::Inbox;
use crate::queue::outbox::{Outbox, OutboxItem};

/// Snapshot of the six clock values, for logging and assertions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugClocks {
    pub clock_self: u32,
    pub clock_other: u32,
    pub clock_out_of_order: Vec<u32>,
    pub other_clock_self: u32,
    pub other_clock_other: u32,
    pub other_clock_out_of_order: Vec<u32>,
}

impl fmt::Display for DebugClocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "self={}/{} ooo={:?} other={}/{} ooo={:?}",
            self.clock_self,
            self.clock_other,
            self.clock_out_of_order,
            self.other_clock_self,
            self.other_clock_other,
            self.other_clock_out_of_order
        )
    }
}

/// Advances the cached dense-prefix cursor over the inbox: the smallest
/// index whose slot has no message yet.
fn scan_clock_other(inbox: &Inbox, cached: &mut u32) -> u32 {
    let mut i = *cached;
    while inbox
        .get(i as usize)
        .map_or(false, |item| item.message.is_some())
    {
        i += 1;
    }
    debug_assert!(i >= *cached);
    *cached = i;
    i
}

/// Advances the cached dense-prefix cursor over the outbox: the smallest
/// index whose entry is not acked yet.
fn scan_other_clock_self(outbox: &Outbox, cached: &mut u32) -> u32 {
    let mut i = *cached;
    while outbox
        .get(i as usize)
        .map_or(false, |item| item.acked.is_some())
    {
        i += 1;
    }
    debug_assert!(i >= *cached);
    *cached = i;
    i
}

/// Message ids present in the inbox above the contiguous prefix.
fn inbox_out_of_order(inbox: &Inbox, clock_other: u32) -> Vec<u32> {
    let mut ids = vec![];
    for (i, item) in inbox.iter().enumerate().skip(clock_other as usize) {
        if item.message.is_some() {
            ids.push(i as u32 + 1);
        }
    }
    ids
}

/// Outbox ids acked above the contiguously acked prefix.
fn outbox_out_of_order(outbox: &Outbox, other_clock_self: u32) -> Vec<u32> {
    let mut ids = vec![];
    for (i, item) in outbox.iter().enumerate().skip(other_clock_self as usize) {
        if item.acked.is_some() {
            ids.push(i as u32 + 1);
        }
    }
    ids
}

/// Messenger is the Layer-1 state machine for one peer pair.
///
/// It owns the outbox and inbox, computes the control block carried in
/// every packet, applies selective acknowledgements, requests
/// retransmissions by NACKing foreign packet ids, and fades those NACKs
/// after a bounded number of retransmissions. All methods except
/// `append_outbox_data` assume serialized invocation by the controller;
/// appends are serialized by an internal mutex so other threads may hand
/// over data at any time.
pub struct Messenger {
    self_uuid: Uuid,
    other_uuid: Uuid,
    config: Config,

    outbox: Mutex<Outbox>,
    inbox: Inbox,

    nack_ids: BTreeSet<u32>,
    sent_nack_ids: FxHashMap<u32, u32>,

    num_sent_packets: u32,

    cached_clock_other: u32,
    cached_other_clock_self: u32,
}

impl Messenger {
    pub fn new(self_uuid: Uuid, other_uuid: Uuid, config: Config) -> Self {
        Messenger {
            self_uuid,
            other_uuid,
            config,
            outbox: Mutex::new(Outbox::default()),
            inbox: Inbox::default(),
            nack_ids: BTreeSet::new(),
            sent_nack_ids: FxHashMap::default(),
            num_sent_packets: 0,
            cached_clock_other: 0,
            cached_other_clock_self: 0,
        }
    }

    pub fn self_uuid(&self) -> Uuid {
        self.self_uuid
    }

    pub fn other_uuid(&self) -> Uuid {
        self.other_uuid
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub(crate) fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A clone of the outbox entry at `index`, if it exists.
    pub fn outbox_item(&self, index: usize) -> Option<OutboxItem> {
        self.outbox().get(index).cloned()
    }

    /// Highest message id this side has produced.
    pub fn clock_self(&self) -> u32 {
        self.outbox().len() as u32
    }

    /// Length of the densely received inbox prefix.
    pub fn clock_other(&mut self) -> u32 {
        scan_clock_other(&self.inbox, &mut self.cached_clock_other)
    }

    /// Message ids received beyond the contiguous prefix.
    pub fn clock_out_of_order(&mut self) -> Vec<u32> {
        let clock_other = self.clock_other();
        inbox_out_of_order(&self.inbox, clock_other)
    }

    /// How much of our outbox the peer has acked contiguously.
    pub fn other_clock_self(&mut self) -> u32 {
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        scan_other_clock_self(&outbox, &mut self.cached_other_clock_self)
    }

    /// The peer's highest message id we know about locally.
    pub fn other_clock_other(&self) -> u32 {
        self.inbox.len() as u32
    }

    /// Outbox ids acked beyond the contiguously acked prefix.
    pub fn other_clock_out_of_order(&mut self) -> Vec<u32> {
        let other_clock_self = self.other_clock_self();
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        outbox_out_of_order(&outbox, other_clock_self)
    }

    /// Both sides have seen, and know the other has seen, everything.
    pub fn is_synchronized(&mut self) -> bool {
        if self.clock_self() != self.other_clock_self() {
            return false;
        }
        if self.clock_other() != self.other_clock_other() {
            return false;
        }
        debug_assert!(self.clock_out_of_order().is_empty());
        debug_assert!(self.other_clock_out_of_order().is_empty());
        true
    }

    pub fn debug_clocks(&mut self) -> DebugClocks {
        DebugClocks {
            clock_self: self.clock_self(),
            clock_other: self.clock_other(),
            clock_out_of_order: self.clock_out_of_order(),
            other_clock_self: self.other_clock_self(),
            other_clock_other: self.other_clock_other(),
            other_clock_out_of_order: self.other_clock_out_of_order(),
        }
    }

    /// Debug accessor for the inbox prefix cursor; non-decreasing.
    pub fn cached_clock_other(&self) -> u32 {
        self.cached_clock_other
    }

    /// Debug accessor for the outbox ack cursor; non-decreasing.
    pub fn cached_other_clock_self(&self) -> u32 {
        self.cached_other_clock_self
    }

    /// Requests a retransmission of a foreign packet, typically because
    /// its file failed to decode. The id is taken from the file name when
    /// the header itself is unreadable.
    pub fn add_nack(&mut self, packet_id: u32) {
        self.nack_ids.insert(packet_id);
    }

    pub fn nack_ids(&self) -> &BTreeSet<u32> {
        &self.nack_ids
    }

    pub fn num_sent_packets(&self) -> u32 {
        self.num_sent_packets
    }

    /// Appends one logical payload to the outbox, splitting it into a
    /// multipart chain when it exceeds the configured fragment size.
    /// Callable from any thread.
    pub fn append_outbox_data(&self, content: impl Into<Content>) -> Result<()> {
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        outbox.push_content(content.into(), self.config.multipart_limit_size_bytes())
    }

    /// Builds the next outgoing packet: the current control block plus
    /// every pending outbox message that is due and still fits.
    ///
    /// `retransmission_timeout` overrides the configured value, e.g.
    /// `Some(Duration::ZERO)` to resend immediately.
    pub fn create_packet(
        &mut self,
        now: SystemTime,
        retransmission_timeout: Option<Duration>,
    ) -> Result<Packet> {
        let now_ts = Timestamp::from_system_time(now)?;
        let rto = retransmission_timeout.unwrap_or_else(|| self.config.retransmission_timeout());

        let clock_other = scan_clock_other(&self.inbox, &mut self.cached_clock_other);
        let sender_clock_out_of_order = inbox_out_of_order(&self.inbox, clock_other);

        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let clock_self = outbox.len() as u32;
        let other_clock_self = scan_other_clock_self(&outbox, &mut self.cached_other_clock_self);

        let control = Control {
            sender_clock_sender: clock_self,
            sender_clock_recipient: clock_other,
            sender_clock_out_of_order,
            nack_ids: self.nack_ids.iter().copied().collect(),
            recipient_clock_sender: other_clock_self,
        };

        let limit = self.config.packet_limit_size_bytes();
        let mut total_size_bytes = PACKET_HEADER_SIZE + control.size_bytes();
        if total_size_bytes >= limit {
            return Err(Error::ErrPacketTooLarge);
        }

        // timestamps have one-second resolution, compare at that granularity
        let now_floor = now_ts.to_system_time();
        let mut messages = vec![];
        for item in outbox.iter().skip(other_clock_self as usize) {
            if item.acked.is_some() {
                continue;
            }
            if let Some(sent) = item.packet_timestamp {
                if sent.to_system_time() + rto > now_floor {
                    continue;
                }
            }
            if total_size_bytes + item.message.size_bytes() > limit {
                continue;
            }
            total_size_bytes += item.message.size_bytes();
            messages.push(item.message.clone());
        }
        drop(outbox);

        // NACK ageing: count this transmission, then fade ids that have
        // been asked for enough times
        for id in &self.nack_ids {
            *self.sent_nack_ids.entry(*id).or_insert(0) += 1;
        }
        self.nack_ids.clear();
        let max_transmits = self.config.nack_transmit_count();
        let nack_ids = &mut self.nack_ids;
        self.sent_nack_ids.retain(|id, count| {
            if *count >= max_transmits {
                false
            } else {
                nack_ids.insert(*id);
                true
            }
        });

        self.num_sent_packets = self
            .num_sent_packets
            .checked_add(1)
            .ok_or(Error::ErrPacketIdExhausted)?;

        log::trace!(
            "[{}] created packet {} with {} messages, clocks {}",
            self.self_uuid,
            self.num_sent_packets,
            messages.len(),
            control,
        );

        Ok(Packet {
            header: PacketHeader {
                sender_uuid: self.self_uuid,
                recipient_uuid: self.other_uuid,
                packet_id: self.num_sent_packets,
                num_messages: messages.len() as u32,
                packet_timestamp: now_ts,
                protocol_version: PROTOCOL_VERSION,
            },
            control: Some(control),
            messages,
        })
    }

    /// Records that a packet we created has been durably written to the
    /// drop folder: the acks it carries are now on the wire, and its
    /// messages are marked sent so a NACK can later invalidate them.
    pub fn packet_send(&mut self, packet: &Packet) -> Result<()> {
        if packet.header.sender_uuid != self.self_uuid {
            return Err(Error::ErrMismatchedSenderUuid);
        }
        if packet.header.recipient_uuid != self.other_uuid {
            return Err(Error::ErrMismatchedRecipientUuid);
        }
        let control = packet.control.as_ref().ok_or(Error::ErrMissingControl)?;
        let ts = packet.header.packet_timestamp;

        // mark the inbox slots this packet acks, first writer wins
        let clock_other = scan_clock_other(&self.inbox, &mut self.cached_clock_other);
        let scr = control
            .sender_clock_recipient
            .min(self.inbox.len() as u32);
        for i in clock_other..scr {
            if let Some(item) = self.inbox.get_mut(i as usize) {
                if item.acked.is_none() {
                    item.acked = Some(ts);
                }
            }
        }
        self.cached_clock_other = self.cached_clock_other.max(scr);

        for id in &control.sender_clock_out_of_order {
            let item = match id
                .checked_sub(1)
                .and_then(|i| self.inbox.get_mut(i as usize))
            {
                Some(item) => item,
                None => {
                    log::warn!("[{}] sent ack for unknown inbox id {}", self.self_uuid, id);
                    continue;
                }
            };
            debug_assert_eq!(
                item.message.as_ref().map(|m| m.header.message_id),
                Some(*id)
            );
            if item.acked.is_none() {
                item.acked = Some(ts);
            }
        }

        // record send metadata so a NACK can force a retransmission
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        for message in &packet.messages {
            let item = match message
                .header
                .message_id
                .checked_sub(1)
                .and_then(|i| outbox.get_mut(i as usize))
            {
                Some(item) => item,
                None => {
                    log::warn!(
                        "[{}] sent packet carries unknown outbox id {}",
                        self.self_uuid,
                        message.header.message_id
                    );
                    continue;
                }
            };
            if item.acked.is_some() {
                continue;
            }
            item.packet_timestamp = Some(ts);
            item.packet_id = Some(packet.header.packet_id);
        }
        Ok(())
    }

    /// Applies one received packet: grows the inbox to the announced
    /// high-water mark, applies the peer's acks and ack-confirmations,
    /// honors its NACKs, and ingests the carried messages.
    pub fn packet_receive(&mut self, packet: &Packet) -> Result<()> {
        if packet.header.sender_uuid != self.other_uuid {
            return Err(Error::ErrMismatchedSenderUuid);
        }
        if packet.header.recipient_uuid != self.self_uuid {
            return Err(Error::ErrMismatchedRecipientUuid);
        }
        let ts = packet.header.packet_timestamp;

        let control = match &packet.control {
            Some(control) => control,
            None => {
                // nothing beyond the header survived; the controller NACKs
                // incomplete packets by id
                log::debug!(
                    "[{}] received packet {} without control block",
                    self.self_uuid,
                    packet.header.packet_id
                );
                return Ok(());
            }
        };

        // grow the inbox with holes up to the announced high-water mark
        let announced = control.sender_clock_sender;
        if announced > MAX_MESSAGE_ID {
            log::warn!(
                "[{}] peer announced out-of-range clock {}",
                self.self_uuid,
                announced
            );
        }
        self.inbox.grow_to(announced.min(MAX_MESSAGE_ID) as usize);

        {
            let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);

            // apply the peer's contiguous and selective acks
            let other_clock_self =
                scan_other_clock_self(&outbox, &mut self.cached_other_clock_self);
            let len = outbox.len() as u32;
            if control.sender_clock_recipient > len {
                log::warn!(
                    "[{}] peer acked {} messages but only {} exist",
                    self.self_uuid,
                    control.sender_clock_recipient,
                    len
                );
            }
            let scr = control.sender_clock_recipient.min(len);
            for i in other_clock_self..scr {
                if let Some(item) = outbox.get_mut(i as usize) {
                    if item.acked.is_none() {
                        item.acked = Some(ts);
                    }
                }
            }
            self.cached_other_clock_self = self.cached_other_clock_self.max(scr);

            for id in &control.sender_clock_out_of_order {
                let item = match id.checked_sub(1).and_then(|i| outbox.get_mut(i as usize)) {
                    Some(item) => item,
                    None => {
                        log::warn!(
                            "[{}] peer acked unknown outbox id {}",
                            self.self_uuid,
                            id
                        );
                        continue;
                    }
                };
                if item.acked.is_none() {
                    item.acked = Some(ts);
                }
            }

            // NACKed packets are treated as never sent so the next
            // create_packet retransmits their messages
            if !control.nack_ids.is_empty() {
                let nacked: BTreeSet<u32> = control.nack_ids.iter().copied().collect();
                let from = scan_other_clock_self(&outbox, &mut self.cached_other_clock_self);
                for item in outbox.iter_mut().skip(from as usize) {
                    if item.acked.is_some() {
                        continue;
                    }
                    if let Some(packet_id) = item.packet_id {
                        if nacked.contains(&packet_id) {
                            item.packet_id = None;
                            item.packet_timestamp = None;
                        }
                    }
                }
            }
        }

        // the peer confirms which of our acks it has seen
        let rcs = control.recipient_clock_sender;
        if rcs > self.inbox.len() as u32 {
            log::warn!(
                "[{}] peer confirmed {} acks but inbox has {}",
                self.self_uuid,
                rcs,
                self.inbox.len()
            );
        }
        for i in 0..rcs.min(self.inbox.len() as u32) {
            if let Some(item) = self.inbox.get_mut(i as usize) {
                if item.ack_acked.is_none() {
                    item.ack_acked = Some(ts);
                }
            }
        }

        // ingest carried messages, first writer wins
        for message in &packet.messages {
            self.inbox.store_message(message.clone(), ts);
        }
        self.inbox.link_fragments();

        log::trace!(
            "[{}] received packet {}: {}",
            self.self_uuid,
            packet.header.packet_id,
            control,
        );
        Ok(())
    }
}
