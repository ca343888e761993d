use std::slice;

use crate::coerce::Timestamp;
use crate::config::MAX_MESSAGE_ID;
use crate::error::{Error, Result};
use crate::packet::message::{Content, ContentType, Message};

/// One entry of the outbox. Entries are retained forever: `acked` is set
/// once and never cleared, while a NACK may reset the send metadata to
/// force a retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxItem {
    pub message: Message,
    /// When the message was last carried by a packet, if ever.
    pub packet_timestamp: Option<Timestamp>,
    /// Which packet last carried it, if any.
    pub packet_id: Option<u32>,
    /// When the peer first acked it.
    pub acked: Option<Timestamp>,
}

impl OutboxItem {
    fn new(message: Message) -> Self {
        OutboxItem {
            message,
            packet_timestamp: None,
            packet_id: None,
            acked: None,
        }
    }
}

/// The ordered sequence of messages this side has produced. Index `i`
/// holds message id `i + 1`, with no gaps.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<OutboxItem>,
}

impl Outbox {
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&OutboxItem> {
        self.items.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut OutboxItem> {
        self.items.get_mut(index)
    }

    pub(crate) fn iter(&self) -> slice::Iter<'_, OutboxItem> {
        self.items.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> slice::IterMut<'_, OutboxItem> {
        self.items.iter_mut()
    }

    /// Appends one logical payload, splitting it into a multipart chain
    /// when it exceeds `multipart_limit`. Fragments are cut at exactly
    /// `multipart_limit` bytes, the last one may be shorter. Only the
    /// terminal fragment carries the real content type.
    pub(crate) fn push_content(&mut self, content: Content, multipart_limit: usize) -> Result<()> {
        let (content_type, data) = content.into_parts()?;

        if data.len() <= multipart_limit {
            let id = self.next_message_id(1)?;
            self.items
                .push(OutboxItem::new(Message::from_parts(id, 0, content_type, data)?));
            return Ok(());
        }
        if multipart_limit == 0 {
            return Err(Error::ErrPayloadTooLarge);
        }

        let num_fragments = (data.len() + multipart_limit - 1) / multipart_limit;
        self.next_message_id(num_fragments as u64)?;

        let mut prev = 0u32;
        for i in 0..num_fragments {
            let fragment = data.slice(i * multipart_limit..((i + 1) * multipart_limit).min(data.len()));
            let fragment_type = if i + 1 == num_fragments {
                content_type
            } else {
                ContentType::MultipartFragment
            };
            let id = self.items.len() as u32 + 1;
            self.items
                .push(OutboxItem::new(Message::from_parts(id, prev, fragment_type, fragment)?));
            prev = id;
        }
        Ok(())
    }

    /// The id the next append will get, after checking that `additional`
    /// ids still fit in the 31-bit id space.
    fn next_message_id(&self, additional: u64) -> Result<u32> {
        let next = self.items.len() as u64 + 1;
        if next + additional - 1 > MAX_MESSAGE_ID as u64 {
            return Err(Error::ErrOutboxFull);
        }
        Ok(next as u32)
    }
}
