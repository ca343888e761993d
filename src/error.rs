use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("packet file size sentinel is zero or the file is shorter than the sentinel")]
    ErrCorruptedFile,
    #[error("io error: {0}")]
    ErrIo(String),

    #[error("packet header authentication failed")]
    ErrHeaderAuthFailure,
    #[error("control block authentication failed")]
    ErrControlAuthFailure,
    #[error("message header authentication failed")]
    ErrMessageAuthFailure,
    #[error("message content does not match its hash")]
    ErrHashMismatch,

    #[error("mismatched sender uuid")]
    ErrMismatchedSenderUuid,
    #[error("mismatched recipient uuid")]
    ErrMismatchedRecipientUuid,
    #[error("packet file name is not of the form sender--recipient--id.packet")]
    ErrInvalidFileName,
    #[error("packet id in the file name does not match the header")]
    ErrFileNamePacketIdMismatch,

    #[error("unhandled ContentType `{typ}`")]
    ErrUnknownContentType { typ: u16 },
    #[error("content bytes are not valid for the declared content type")]
    ErrInvalidContent,

    #[error("incorrect length of bytes input")]
    ErrInvalidLength,
    #[error("unexpected null value")]
    ErrUnexpectedNull,
    #[error("timestamp is outside the 32-bit range")]
    ErrInvalidSystemTime,
    #[error("incorrect key length")]
    ErrKeyLength,

    #[error("payload is too large for a single message")]
    ErrPayloadTooLarge,
    #[error("message id space is exhausted")]
    ErrOutboxFull,
    #[error("packet id space is exhausted")]
    ErrPacketIdExhausted,
    #[error("packet larger than the maximum packet size")]
    ErrPacketTooLarge,
    #[error("packet file larger than the maximum file size")]
    ErrFileTooLarge,
    #[error("num_messages does not equal the number of messages")]
    ErrNumMessagesMismatch,
    #[error("packet has no control block")]
    ErrMissingControl,

    #[error("writer is closed")]
    ErrWriterClosed,
    #[error("reader is closed")]
    ErrReaderClosed,
    #[error("no messenger registered for peer")]
    ErrUnknownPeer,

    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::ErrIo(error.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            e @ Error::ErrCorruptedFile => {
                io::Error::new(io::ErrorKind::InvalidData, e.to_string())
            }
            e @ Error::ErrWriterClosed | e @ Error::ErrReaderClosed => {
                io::Error::new(io::ErrorKind::NotConnected, e.to_string())
            }
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}
