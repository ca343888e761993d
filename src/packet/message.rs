use std::fmt;
use std::io::Read;

use bytes::{Bytes, BytesMut};

use super::read_exact_buf;
use crate::coerce;
use crate::config::MAX_MESSAGE_ID;
use crate::crypto::{self, HashKey};
use crate::error::{Error, Result};

/// BLAKE2b-128 content hash length.
pub(crate) const MESSAGE_DIGEST_SIZE: usize = crypto::CONTENT_HASH_LEN;
/// Keyed BLAKE2b-64 tag length on the message header.
pub(crate) const MESSAGE_HEADER_DIGEST_SIZE: usize = crypto::TAG_LEN;
/// Tagged fields of the message header, excluding the tag itself.
pub(crate) const MESSAGE_HEADER_FIELDS_SIZE: usize = 4 + 4 + 4 + 2 + MESSAGE_DIGEST_SIZE;
/// Full on-wire message header size.
pub const MESSAGE_HEADER_SIZE: usize = MESSAGE_HEADER_FIELDS_SIZE + MESSAGE_HEADER_DIGEST_SIZE;

/// ContentType tells the receiver how to interpret reassembled bytes.
///
/// Every fragment of a multipart chain except the last one carries
/// `MultipartFragment`; the terminal fragment alone carries the real
/// content type of the whole chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum ContentType {
    String = 1,
    Binary = 2,
    JsonObject = 3,
    MultipartFragment = 4,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ContentType::String => "STRING",
            ContentType::Binary => "BINARY",
            ContentType::JsonObject => "JSON-OBJECT",
            ContentType::MultipartFragment => "MULTIPART-FRAGMENT",
        };
        write!(f, "{s}")
    }
}

impl TryFrom<u16> for ContentType {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self> {
        match v {
            1 => Ok(ContentType::String),
            2 => Ok(ContentType::Binary),
            3 => Ok(ContentType::JsonObject),
            4 => Ok(ContentType::MultipartFragment),
            typ => Err(Error::ErrUnknownContentType { typ }),
        }
    }
}

/// A decoded (or to-be-sent) logical payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    String(String),
    Binary(Bytes),
    Json(serde_json::Value),
}

impl Content {
    pub(crate) fn into_parts(self) -> Result<(ContentType, Bytes)> {
        match self {
            Content::String(s) => Ok((ContentType::String, Bytes::from(s.into_bytes()))),
            Content::Binary(b) => Ok((ContentType::Binary, b)),
            Content::Json(v) => {
                let data = serde_json::to_vec(&v).map_err(|_| Error::ErrInvalidContent)?;
                Ok((ContentType::JsonObject, Bytes::from(data)))
            }
        }
    }

    pub(crate) fn from_parts(content_type: ContentType, data: &[u8]) -> Result<Content> {
        match content_type {
            ContentType::String => Ok(Content::String(
                coerce::to_string(data)?.unwrap_or_default(),
            )),
            ContentType::Binary => Ok(Content::Binary(Bytes::copy_from_slice(data))),
            ContentType::JsonObject => Ok(Content::Json(
                serde_json::from_slice(data).map_err(|_| Error::ErrInvalidContent)?,
            )),
            // a chain can only be interpreted through its terminal fragment
            ContentType::MultipartFragment => Err(Error::ErrInvalidContent),
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::String(s.to_owned())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::String(s)
    }
}

impl From<Vec<u8>> for Content {
    fn from(b: Vec<u8>) -> Self {
        Content::Binary(Bytes::from(b))
    }
}

impl From<&[u8]> for Content {
    fn from(b: &[u8]) -> Self {
        Content::Binary(Bytes::copy_from_slice(b))
    }
}

impl From<Bytes> for Content {
    fn from(b: Bytes) -> Self {
        Content::Binary(b)
    }
}

impl From<serde_json::Value> for Content {
    fn from(v: serde_json::Value) -> Self {
        Content::Json(v)
    }
}

/// MessageHeader is the fixed 38-byte header in front of every message.
///
/// ```text
/// message_id     (u32 BE)
/// message_prev   (u32 BE, 0 = none)
/// content_length (u32 BE)
/// content_type   (u16 BE)
/// content_hash   (16 bytes, BLAKE2b-128 of binary_data)
/// header tag     (8 bytes, BLAKE2b-64 keyed by the packet hash key)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_id: u32,
    pub message_prev: u32,
    pub content_length: u32,
    pub content_type: ContentType,
    pub content_hash: [u8; MESSAGE_DIGEST_SIZE],
}

impl fmt::Display for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MESSAGE id={} prev={} type={} len={}",
            self.message_id, self.message_prev, self.content_type, self.content_length
        )
    }
}

impl MessageHeader {
    /// Lowercase hex form of the content hash.
    pub fn content_hash_hex(&self) -> String {
        coerce::to_hex(&self.content_hash).unwrap_or_default()
    }

    pub(crate) fn marshal_to(&self, hash_key: &HashKey, writer: &mut BytesMut) -> Result<usize> {
        let start = writer.len();
        writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(self.message_id)));
        writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(self.message_prev)));
        writer.extend_from_slice(&coerce::from_unsigned_integer32(Some(self.content_length)));
        writer.extend_from_slice(&coerce::from_unsigned_integer16(Some(
            self.content_type as u16,
        )));
        writer.extend_from_slice(&self.content_hash);
        let tag = crypto::keyed_tag(hash_key, &writer[start..]);
        writer.extend_from_slice(&tag);
        Ok(writer.len())
    }

    pub(crate) fn unmarshal(raw: &[u8; MESSAGE_HEADER_SIZE], hash_key: &HashKey) -> Result<Self> {
        let (fields, tag) = raw.split_at(MESSAGE_HEADER_FIELDS_SIZE);
        if crypto::keyed_tag(hash_key, fields).as_slice() != tag {
            return Err(Error::ErrMessageAuthFailure);
        }

        let message_id =
            coerce::to_unsigned_integer32(&fields[0..4])?.ok_or(Error::ErrUnexpectedNull)?;
        let message_prev =
            coerce::to_unsigned_integer32(&fields[4..8])?.ok_or(Error::ErrUnexpectedNull)?;
        let content_length =
            coerce::to_unsigned_integer32(&fields[8..12])?.ok_or(Error::ErrUnexpectedNull)?;
        let content_type: ContentType = coerce::to_unsigned_integer16(&fields[12..14])?
            .ok_or(Error::ErrUnexpectedNull)?
            .try_into()?;
        let content_hash: [u8; MESSAGE_DIGEST_SIZE] = fields[14..14 + MESSAGE_DIGEST_SIZE]
            .try_into()
            .map_err(|_| Error::ErrInvalidLength)?;

        if message_id == 0 || message_id > MAX_MESSAGE_ID || content_length > MAX_MESSAGE_ID {
            return Err(Error::ErrInvalidContent);
        }

        Ok(MessageHeader {
            message_id,
            message_prev,
            content_length,
            content_type,
            content_hash,
        })
    }

    pub(crate) fn from_reader(reader: &mut impl Read, hash_key: &HashKey) -> Result<Self> {
        let raw = read_exact_buf::<MESSAGE_HEADER_SIZE>(reader)?;
        Self::unmarshal(&raw, hash_key)
    }
}

/// One message, or one fragment of a multipart chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub binary_data: Bytes,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)
    }
}

impl Message {
    pub(crate) fn from_parts(
        message_id: u32,
        message_prev: u32,
        content_type: ContentType,
        binary_data: Bytes,
    ) -> Result<Message> {
        if binary_data.len() > MAX_MESSAGE_ID as usize {
            return Err(Error::ErrPayloadTooLarge);
        }
        Ok(Message {
            header: MessageHeader {
                message_id,
                message_prev,
                content_length: binary_data.len() as u32,
                content_type,
                content_hash: crypto::content_hash(&binary_data),
            },
            binary_data,
        })
    }

    pub fn message_id(&self) -> u32 {
        self.header.message_id
    }

    /// On-wire size: header plus content.
    pub fn size_bytes(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.binary_data.len()
    }

    /// Decodes the payload of a message that is not part of a multipart
    /// chain. Chains are reassembled by the inbox instead.
    pub fn content(&self) -> Result<Content> {
        Content::from_parts(self.header.content_type, &self.binary_data)
    }

    pub(crate) fn marshal_to(&self, hash_key: &HashKey, writer: &mut BytesMut) -> Result<usize> {
        self.header.marshal_to(hash_key, writer)?;
        writer.extend_from_slice(&self.binary_data);
        Ok(writer.len())
    }

    pub(crate) fn from_reader(reader: &mut impl Read, hash_key: &HashKey) -> Result<Message> {
        let header = MessageHeader::from_reader(reader, hash_key)?;
        let mut data = vec![0u8; header.content_length as usize];
        reader.read_exact(&mut data)?;
        if crypto::content_hash(&data) != header.content_hash {
            return Err(Error::ErrHashMismatch);
        }
        Ok(Message {
            header,
            binary_data: Bytes::from(data),
        })
    }
}
