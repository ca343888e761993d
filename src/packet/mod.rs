
pub(crate) mod control;
pub(crate) mod header;
pub mod message;

use std::fmt;
use std::io::Read;

use bytes::{Bytes, BytesMut};
use rand::{CryptoRng, RngCore};

use crate::crypto::SecretKey;
use crate::error::{Error, Result};

pub use control::Control;
pub use header::{PacketHeader, PACKET_HEADER_SIZE};
pub use message::{Content, ContentType, Message, MessageHeader, MESSAGE_HEADER_SIZE};

pub(crate) fn read_exact_buf<const N: usize>(reader: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Packet is the wire-level aggregate carried by one packet file.
///
/// Serialization order is header, control, then messages. Decoding is
/// resilient: as long as the header authenticates, a packet is returned
/// even when the control block or trailing messages are damaged, so the
/// caller can still NACK by packet id. `control == None` or fewer
/// messages than `num_messages` marks such a partial packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub control: Option<Control>,
    pub messages: Vec<Message>,
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)?;
        match &self.control {
            Some(control) => write!(f, "\n{control}")?,
            None => write!(f, "\nCONTROL <missing>")?,
        }
        for message in &self.messages {
            write!(f, "\n{message}")?;
        }
        Ok(())
    }
}

impl Packet {
    /// Whether the decoder recovered the whole packet. Incomplete packets
    /// are still actionable, they just earn the sender a NACK.
    pub fn is_complete(&self) -> bool {
        self.control.is_some() && self.messages.len() as u64 == self.header.num_messages as u64
    }

    pub fn marshal<R: RngCore + CryptoRng>(
        &self,
        secret_key: &SecretKey,
        rng: &mut R,
    ) -> Result<Bytes> {
        if self.messages.len() as u64 != self.header.num_messages as u64 {
            return Err(Error::ErrNumMessagesMismatch);
        }
        let control = self.control.as_ref().ok_or(Error::ErrMissingControl)?;

        let mut writer = BytesMut::with_capacity(PACKET_HEADER_SIZE + control.size_bytes());
        let hash_key = self.header.marshal_to(secret_key, rng, &mut writer)?;
        control.marshal_to(&mut writer)?;
        for message in &self.messages {
            message.marshal_to(&hash_key, &mut writer)?;
        }
        Ok(writer.freeze())
    }

    pub fn from_reader(reader: &mut impl Read, secret_key: &SecretKey) -> Result<Packet> {
        let (header, hash_key) = PacketHeader::from_reader(reader, secret_key)?;

        let control = match Control::from_reader(reader) {
            Ok(control) => Some(control),
            Err(e) => {
                log::debug!(
                    "control block of packet {} failed to decode: {}",
                    header.packet_id,
                    e
                );
                return Ok(Packet {
                    header,
                    control: None,
                    messages: vec![],
                });
            }
        };

        let mut messages = vec![];
        for i in 0..header.num_messages {
            match Message::from_reader(reader, &hash_key) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    log::debug!(
                        "message {}/{} of packet {} failed to decode: {}",
                        i + 1,
                        header.num_messages,
                        header.packet_id,
                        e
                    );
                    break;
                }
            }
        }

        Ok(Packet {
            header,
            control,
            messages,
        })
    }

    pub fn unmarshal(raw: &Bytes, secret_key: &SecretKey) -> Result<Packet> {
        let mut reader: &[u8] = raw;
        Self::from_reader(&mut reader, secret_key)
    }
}
