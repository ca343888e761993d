use std::fmt;
use std::io::Read;

use bytes::BytesMut;

use super::read_exact_buf;
use crate::coerce;
use crate::crypto;
use crate::error::{Error, Result};

/// Keyless BLAKE2b-64 tag length on the control block.
pub(crate) const CONTROL_DIGEST_SIZE: usize = crypto::TAG_LEN;

/// Control is the vector-clock-like block carried in every packet.
///
/// Wire layout, all counts and ids as u32 BE, terminated by a keyless
/// BLAKE2b-64 tag over everything before it:
///
/// ```text
/// sender_clock_sender
/// sender_clock_recipient
/// len(sender_clock_out_of_order); message_id x len
/// len(nack_ids);                  packet_id x len
/// recipient_clock_sender
/// tag
/// ```
///
/// The block length is not knowable up front, so decoding is streaming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Control {
    /// Highest message id the sender has produced.
    pub sender_clock_sender: u32,
    /// Length of the sender's densely received inbox prefix.
    pub sender_clock_recipient: u32,
    /// Message ids received beyond the contiguous prefix (the SACK part).
    pub sender_clock_out_of_order: Vec<u32>,
    /// Foreign packet ids the sender wants retransmitted.
    pub nack_ids: Vec<u32>,
    /// The sender's view of how much of its own outbox the recipient has
    /// acked contiguously.
    pub recipient_clock_sender: u32,
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CONTROL scs={} scr={} ooo={:?} nack={:?} rcs={}",
            self.sender_clock_sender,
            self.sender_clock_recipient,
            self.sender_clock_out_of_order,
            self.nack_ids,
            self.recipient_clock_sender
        )
    }
}

impl Control {
    /// On-wire size of this block.
    pub fn size_bytes(&self) -> usize {
        4 * 5
            + 4 * (self.sender_clock_out_of_order.len() + self.nack_ids.len())
            + CONTROL_DIGEST_SIZE
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        let start = writer.len();
        writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(
            self.sender_clock_sender,
        )));
        writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(
            self.sender_clock_recipient,
        )));
        writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(
            self.sender_clock_out_of_order.len() as u32,
        )));
        for id in &self.sender_clock_out_of_order {
            writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(*id)));
        }
        writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(
            self.nack_ids.len() as u32,
        )));
        for id in &self.nack_ids {
            writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(*id)));
        }
        writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(
            self.recipient_clock_sender,
        )));
        let tag = crypto::plain_tag(&writer[start..]);
        writer.extend_from_slice(&tag);
        Ok(writer.len())
    }

    pub(crate) fn from_reader(reader: &mut impl Read) -> Result<Control> {
        fn take_u32(reader: &mut impl Read, raw: &mut Vec<u8>) -> Result<u32> {
            let buf = read_exact_buf::<4>(reader)?;
            raw.extend_from_slice(&buf);
            coerce::to_unsigned_integer32(&buf)?.ok_or(Error::ErrUnexpectedNull)
        }

        // every field read also lands in `raw` for the trailing tag check
        let mut raw: Vec<u8> = Vec::with_capacity(64);

        let sender_clock_sender = take_u32(reader, &mut raw)?;
        let sender_clock_recipient = take_u32(reader, &mut raw)?;

        let n_out_of_order = take_u32(reader, &mut raw)?;
        let mut sender_clock_out_of_order = Vec::new();
        for _ in 0..n_out_of_order {
            sender_clock_out_of_order.push(take_u32(reader, &mut raw)?);
        }

        let n_nacks = take_u32(reader, &mut raw)?;
        let mut nack_ids = Vec::new();
        for _ in 0..n_nacks {
            nack_ids.push(take_u32(reader, &mut raw)?);
        }

        let recipient_clock_sender = take_u32(reader, &mut raw)?;

        let tag = read_exact_buf::<CONTROL_DIGEST_SIZE>(reader)?;
        if crypto::plain_tag(&raw) != tag {
            return Err(Error::ErrControlAuthFailure);
        }

        Ok(Control {
            sender_clock_sender,
            sender_clock_recipient,
            sender_clock_out_of_order,
            nack_ids,
            recipient_clock_sender,
        })
    }
}
