use std::fmt;
use std::io::Read;

use bytes::BytesMut;
use rand::{CryptoRng, RngCore};
use uuid::Uuid;

use super::read_exact_buf;
use crate::coerce::{self, Timestamp};
use crate::config::PROTOCOL_VERSION;
use crate::crypto::{self, HashKey, SecretKey, TOKEN_LEN};
use crate::error::{Error, Result};

/// Keyed BLAKE2b-64 tag length on the packet header.
pub(crate) const PACKET_HEADER_DIGEST_SIZE: usize = crypto::TAG_LEN;
/// Tagged fields of the packet header, including the encapsulated key.
pub(crate) const PACKET_HEADER_FIELDS_SIZE: usize = 16 + 16 + 4 + 4 + 4 + 4 + TOKEN_LEN;
/// Full on-wire packet header size.
pub const PACKET_HEADER_SIZE: usize = PACKET_HEADER_FIELDS_SIZE + PACKET_HEADER_DIGEST_SIZE;

/// PacketHeader is the fixed 100-byte authenticated header of a packet.
///
/// ```text
/// sender_uuid      (16 bytes)
/// recipient_uuid   (16 bytes)
/// packet_id        (u32 BE, >= 1)
/// num_messages     (u32 BE)
/// packet_timestamp (i32 BE seconds UTC, microseconds truncated)
/// protocol_version (u32 BE, currently 2)
/// hash key token   (44 bytes, ChaCha20-Poly1305 encapsulation)
/// header tag       (8 bytes, BLAKE2b-64 over the 92 bytes above,
///                   keyed by the encapsulated hash key)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub sender_uuid: Uuid,
    pub recipient_uuid: Uuid,
    pub packet_id: u32,
    pub num_messages: u32,
    pub packet_timestamp: Timestamp,
    pub protocol_version: u32,
}

impl fmt::Display for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PACKET id={} {} -> {} messages={} at={}",
            self.packet_id,
            self.sender_uuid,
            self.recipient_uuid,
            self.num_messages,
            self.packet_timestamp
        )
    }
}

impl PacketHeader {
    /// The file name this packet travels under, also the input to the
    /// Layer-0 body-cipher nonce derivation.
    pub fn file_name(&self) -> String {
        format!(
            "{}--{}--{}.packet",
            self.sender_uuid, self.recipient_uuid, self.packet_id
        )
    }

    /// Serializes the header. A fresh hash key is generated, wrapped into
    /// the token, and returned so the caller can tag the rest of the
    /// packet with it.
    pub(crate) fn marshal_to<R: RngCore + CryptoRng>(
        &self,
        secret_key: &SecretKey,
        rng: &mut R,
        writer: &mut BytesMut,
    ) -> Result<HashKey> {
        let hash_key = HashKey::generate(rng);
        let token = crypto::encrypt_key(&hash_key, secret_key, rng)?;

        let start = writer.len();
        writer.extend_from_slice(&coerce::from_uuid(Some(self.sender_uuid)));
        writer.extend_from_slice(&coerce::from_uuid(Some(self.recipient_uuid)));
        writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(self.packet_id)));
        writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(self.num_messages)));
        writer.extend_from_slice(&coerce::from_datetime32(Some(self.packet_timestamp)));
        writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(self.protocol_version)));
        writer.extend_from_slice(&token);
        let tag = crypto::keyed_tag(&hash_key, &writer[start..]);
        writer.extend_from_slice(&tag);
        Ok(hash_key)
    }

    pub(crate) fn unmarshal(
        raw: &[u8; PACKET_HEADER_SIZE],
        secret_key: &SecretKey,
    ) -> Result<(PacketHeader, HashKey)> {
        let (fields, tag) = raw.split_at(PACKET_HEADER_FIELDS_SIZE);
        let token = &fields[PACKET_HEADER_FIELDS_SIZE - TOKEN_LEN..];
        let hash_key = crypto::decrypt_key(token, secret_key)?;
        if crypto::keyed_tag(&hash_key, fields).as_slice() != tag {
            return Err(Error::ErrHeaderAuthFailure);
        }

        let sender_uuid = coerce::to_uuid(&fields[0..16])?.ok_or(Error::ErrUnexpectedNull)?;
        let recipient_uuid = coerce::to_uuid(&fields[16..32])?.ok_or(Error::ErrUnexpectedNull)?;
        let packet_id =
            coerce::to_unsigned_integer32(&fields[32..36])?.ok_or(Error::ErrUnexpectedNull)?;
        let num_messages =
            coerce::to_unsigned_integer32(&fields[36..40])?.ok_or(Error::ErrUnexpectedNull)?;
        let packet_timestamp =
            coerce::to_datetime32(&fields[40..44])?.ok_or(Error::ErrUnexpectedNull)?;
        let protocol_version =
            coerce::to_unsigned_integer32(&fields[44..48])?.ok_or(Error::ErrUnexpectedNull)?;

        if protocol_version != PROTOCOL_VERSION {
            // the keyed tag already authenticated the bytes, so parse on
            log::warn!(
                "packet {packet_id} carries protocol version {protocol_version}, expected {PROTOCOL_VERSION}"
            );
        }

        Ok((
            PacketHeader {
                sender_uuid,
                recipient_uuid,
                packet_id,
                num_messages,
                packet_timestamp,
                protocol_version,
            },
            hash_key,
        ))
    }

    pub(crate) fn from_reader(
        reader: &mut impl Read,
        secret_key: &SecretKey,
    ) -> Result<(PacketHeader, HashKey)> {
        let raw = read_exact_buf::<PACKET_HEADER_SIZE>(reader)?;
        Self::unmarshal(&raw, secret_key)
    }
}
