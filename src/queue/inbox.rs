use fxhash::FxHashMap;

use crate::coerce::Timestamp;
use crate::error::Result;
use crate::packet::message::{Content, ContentType, Message};

/// One slot of the inbox. Slots are created as empty holes when a peer
/// announces messages we have not seen yet; `message` is set exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboxItem {
    pub message: Option<Message>,
    /// Timestamp of the packet that delivered the message.
    pub packet_timestamp: Option<Timestamp>,
    /// Set when we have emitted a packet acking this slot.
    pub acked: Option<Timestamp>,
    /// Set when the peer has confirmed our ack.
    pub ack_acked: Option<Timestamp>,
}

/// The sparse, ordered view of the peer's outbox. Index `i` holds
/// message id `i + 1`; slots above the contiguous prefix may be empty
/// until the missing messages arrive.
#[derive(Debug, Default)]
pub struct Inbox {
    items: Vec<InboxItem>,
    /// fragment id -> its message_prev, for fragments whose predecessor
    /// has not been stored yet
    unlinked_previous: FxHashMap<u32, u32>,
}

impl Inbox {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&InboxItem> {
        self.items.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut InboxItem> {
        self.items.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, InboxItem> {
        self.items.iter()
    }

    /// Grows the inbox with empty holes up to `len` slots.
    pub(crate) fn grow_to(&mut self, len: usize) {
        while self.items.len() < len {
            self.items.push(InboxItem::default());
        }
    }

    /// Stores a received message in its slot, first writer wins. Returns
    /// whether the message was stored (false for duplicates and for ids
    /// outside the currently announced range).
    pub(crate) fn store_message(&mut self, message: Message, packet_timestamp: Timestamp) -> bool {
        let id = message.header.message_id;
        if id == 0 {
            log::warn!("discarding message with id 0");
            return false;
        }
        let prev = message.header.message_prev;
        if prev >= id {
            // ids are assigned in append order, a chain can only point back
            log::warn!("discarding message {id} with non-causal message_prev {prev}");
            return false;
        }

        let item = match self.items.get_mut((id - 1) as usize) {
            Some(item) => item,
            None => {
                log::warn!("discarding message {id} beyond the announced inbox range");
                return false;
            }
        };
        if item.message.is_some() {
            return false;
        }

        if prev > 0 {
            self.unlinked_previous.insert(id, prev);
        }
        let item = &mut self.items[(id - 1) as usize];
        item.message = Some(message);
        item.packet_timestamp = Some(packet_timestamp);
        true
    }

    /// Forgets unlinked-previous entries whose predecessor has arrived.
    pub(crate) fn link_fragments(&mut self) {
        let items = &self.items;
        self.unlinked_previous.retain(|_, prev| {
            items
                .get((*prev - 1) as usize)
                .map_or(true, |item| item.message.is_none())
        });
    }

    /// Number of fragments still waiting for their predecessor.
    pub(crate) fn unlinked_len(&self) -> usize {
        self.unlinked_previous.len()
    }

    /// Concatenated bytes of the multipart chain ending at `message_id`,
    /// or `None` while any fragment of the chain is missing. A message
    /// with `message_prev == 0` is its own one-element chain.
    pub fn multipart_data(&self, message_id: u32) -> Option<Vec<u8>> {
        let mut chain = vec![];
        let mut id = message_id;
        loop {
            if id == 0 {
                return None;
            }
            let item = self.items.get((id - 1) as usize)?;
            let message = item.message.as_ref()?;
            chain.push(id);
            let prev = message.header.message_prev;
            if prev == 0 {
                break;
            }
            if prev >= id {
                return None;
            }
            id = prev;
        }

        let mut out = vec![];
        for id in chain.iter().rev() {
            let message = self.items[(*id - 1) as usize]
                .message
                .as_ref()
                .expect("chain ids were just checked");
            out.extend_from_slice(&message.binary_data);
        }
        Some(out)
    }

    /// Decodes the fully reassembled content of the message (or multipart
    /// chain) with the given terminal id. `Ok(None)` while the message or
    /// part of its chain is still missing, and for non-terminal fragments.
    pub fn content(&self, message_id: u32) -> Result<Option<Content>> {
        let message = match self
            .items
            .get(message_id.wrapping_sub(1) as usize)
            .and_then(|item| item.message.as_ref())
        {
            Some(message) => message,
            None => return Ok(None),
        };
        if message.header.content_type == ContentType::MultipartFragment {
            return Ok(None);
        }
        let data = match self.multipart_data(message_id) {
            Some(data) => data,
            None => return Ok(None),
        };
        Content::from_parts(message.header.content_type, &data).map(Some)
    }
}
