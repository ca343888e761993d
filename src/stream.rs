//! Layer 0: one packet file on a shared folder.
//!
//! Raw layout of a packet file:
//!
//! ```text
//! offset 0 : 4 bytes  total file size (u32 BE), written last
//! offset 4 : N bytes  ChaCha20 keystream over gzip(packet bytes)
//! ```
//!
//! The size sentinel is reserved as zero when the file is opened and
//! patched on close, so a reader that sees zero knows the writer has not
//! finished (or never will). Readers additionally probe the file size and
//! assume the write is finished, successfully or not, once the size has
//! been stable for a configured delay.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::MAX_FILE_SIZE;
use crate::crypto::{self, SecretKey};
use crate::error::{Error, Result};

/// Size of the completeness sentinel at the start of every packet file.
pub(crate) const SENTINEL_SIZE: usize = 4;

fn body_cipher(path: &Path, secret_key: &SecretKey) -> Result<ChaCha20> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(Error::ErrInvalidFileName)?;
    let nonce = crypto::derive_nonce(file_name);
    Ok(ChaCha20::new(secret_key.as_bytes().into(), (&nonce).into()))
}

struct CipherWriter<W: Write> {
    inner: W,
    cipher: ChaCha20,
    written: u64,
}

impl<W: Write> CipherWriter<W> {
    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_FILE_SIZE {
            return Err(Error::ErrFileTooLarge.into());
        }
        let mut scratch = buf.to_vec();
        self.cipher.apply_keystream(&mut scratch);
        self.inner.write_all(&scratch)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct CipherReader<R: Read> {
    inner: R,
    cipher: ChaCha20,
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}

/// Writes one packet file: reserves the sentinel, streams the body
/// through gzip and the ChaCha20 envelope, and patches the sentinel on
/// close. If the writer fails or never closes, the sentinel stays zero
/// and readers treat the file as corrupted.
pub struct BinaryWriter {
    path: PathBuf,
    encoder: Option<GzEncoder<CipherWriter<File>>>,
}

impl BinaryWriter {
    pub fn new(path: impl AsRef<Path>, secret_key: &SecretKey) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let cipher = body_cipher(&path, secret_key)?;

        let mut file = File::create(&path)?;
        file.write_all(&[0u8; SENTINEL_SIZE])?;

        let writer = CipherWriter {
            inner: file,
            cipher,
            written: 0,
        };
        Ok(BinaryWriter {
            path,
            encoder: Some(GzEncoder::new(writer, Compression::default())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends plaintext body bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let encoder = self.encoder.as_mut().ok_or(Error::ErrWriterClosed)?;
        encoder.write_all(data)?;
        Ok(())
    }

    /// Flushes the gzip trailer and the cipher, then patches the size
    /// sentinel. Only after this returns is the file valid for readers.
    pub fn close(&mut self) -> Result<()> {
        let encoder = self.encoder.take().ok_or(Error::ErrWriterClosed)?;
        let writer = encoder.finish()?;
        let mut file = writer.into_inner();

        let size = file.stream_position()?;
        if size > MAX_FILE_SIZE {
            return Err(Error::ErrFileTooLarge);
        }
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&(size as u32).to_be_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn closed(&self) -> bool {
        self.encoder.is_none()
    }
}

/// Reads one packet file, tolerating files that are still being written.
pub struct BinaryReader {
    path: PathBuf,
    expected_total_size: u32,
    decoder: Option<GzDecoder<CipherReader<File>>>,
    prev_size_bytes: u64,
    prev_probe: Instant,
}

impl BinaryReader {
    pub fn new(path: impl AsRef<Path>, secret_key: &SecretKey, now: Instant) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cipher = body_cipher(&path, secret_key)?;

        let mut file = File::open(&path)?;
        let mut sentinel = [0u8; SENTINEL_SIZE];
        let expected_total_size = match file.read_exact(&mut sentinel) {
            Ok(()) => u32::from_be_bytes(sentinel),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(e) => return Err(e.into()),
        };
        if expected_total_size == 0 {
            log::warn!("corrupted packet file (zero size sentinel): {}", path.display());
        }
        // the body cipher stream starts right after the sentinel
        file.seek(SeekFrom::Start(SENTINEL_SIZE as u64))?;

        Ok(BinaryReader {
            path,
            expected_total_size,
            decoder: Some(GzDecoder::new(CipherReader {
                inner: file,
                cipher,
            })),
            prev_size_bytes: 0,
            prev_probe: now,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The size the writer recorded on close, or zero if it never did.
    pub fn expected_total_size(&self) -> u32 {
        self.expected_total_size
    }

    /// Whether the file looks finished: either the size sentinel is
    /// satisfied, or the file has stopped growing for `delay`. A `true`
    /// from the stable-size path does not mean the file is valid, only
    /// that parsing it is the next step (failure becomes a NACK).
    pub fn is_ready_to_read(&mut self, now: Instant, delay: Duration) -> Result<bool> {
        let current_size = fs::metadata(&self.path)?.len();

        if self.expected_total_size > 0 && current_size >= self.expected_total_size as u64 {
            return Ok(true);
        }

        if current_size > self.prev_size_bytes {
            self.prev_size_bytes = current_size;
            self.prev_probe = now;
            return Ok(false);
        }

        Ok(now.saturating_duration_since(self.prev_probe) >= delay)
    }

    /// Reads up to `buf.len()` decrypted and decompressed body bytes.
    ///
    /// A decode failure on a file whose sentinel was never patched is
    /// reported as the corruption it is, not as a generic stream error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let never_finished = self.expected_total_size == 0;
        let decoder = self.decoder.as_mut().ok_or(Error::ErrReaderClosed)?;
        match decoder.read(buf) {
            Ok(n) => Ok(n),
            Err(_) if never_finished => Err(Error::ErrCorruptedFile),
            Err(e) => Err(e.into()),
        }
    }

    pub fn close(&mut self, delete: bool) -> Result<()> {
        self.decoder = None;
        if delete {
            match fs::remove_file(&self.path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                other => other?,
            }
        }
        Ok(())
    }

    pub fn closed(&self) -> bool {
        self.decoder.is_none()
    }
}

impl Read for BinaryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BinaryReader::read(self, buf).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use rand::rngs::OsRng;
    use tempfile::tempdir;

    const DELAY: Duration = Duration::from_secs(1);

    #[test]
    fn test_write_read_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("peer").join("a--b--1.packet");
        let secret = SecretKey::generate(&mut OsRng);
        let body = b"hello drop folder".repeat(100);

        let mut writer = BinaryWriter::new(&path, &secret)?;
        writer.write(&body)?;
        writer.close()?;
        assert!(writer.closed());

        let now = Instant::now();
        let mut reader = BinaryReader::new(&path, &secret, now)?;
        assert!(reader.expected_total_size() > 0);
        assert!(reader.is_ready_to_read(now, DELAY)?);

        let mut out = vec![];
        io::Read::read_to_end(&mut reader, &mut out)?;
        assert_eq!(out, body);
        reader.close(true)?;
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_body_is_not_plaintext_on_disk() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a--b--1.packet");
        let secret = SecretKey::new([7u8; 32]);

        let mut writer = BinaryWriter::new(&path, &secret)?;
        writer.write(b"very recognizable plaintext")?;
        writer.close()?;

        let raw = fs::read(&path)?;
        // the plaintext must not appear anywhere in the enveloped body
        assert!(!raw
            .windows(b"recognizable".len())
            .any(|w| w == b"recognizable"));
        // and a reader holding the right key still gets it back
        let mut reader = BinaryReader::new(&path, &secret, Instant::now())?;
        let mut out = vec![];
        io::Read::read_to_end(&mut reader, &mut out)?;
        assert_eq!(out, b"very recognizable plaintext");
        Ok(())
    }

    #[test]
    fn test_wrong_secret_fails_to_decode() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a--b--1.packet");
        let secret = SecretKey::new([1u8; 32]);
        let other = SecretKey::new([2u8; 32]);

        let mut writer = BinaryWriter::new(&path, &secret)?;
        writer.write(b"payload")?;
        writer.close()?;

        let mut reader = BinaryReader::new(&path, &other, Instant::now())?;
        let mut out = vec![];
        assert!(io::Read::read_to_end(&mut reader, &mut out).is_err());
        Ok(())
    }

    #[test]
    fn test_zero_sentinel_and_readiness_timeout() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a--b--7.packet");
        // a writer that died before patching the sentinel
        fs::write(&path, [0u8, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef])?;

        let secret = SecretKey::generate(&mut OsRng);
        let t0 = Instant::now();
        let mut reader = BinaryReader::new(&path, &secret, t0)?;
        assert_eq!(reader.expected_total_size(), 0);

        // first probe records the size and keeps waiting
        assert!(!reader.is_ready_to_read(t0, DELAY)?);
        // still within the stability window
        assert!(!reader.is_ready_to_read(t0 + Duration::from_millis(500), DELAY)?);
        // size stable past the delay: give up waiting and let decode fail
        assert!(reader.is_ready_to_read(t0 + Duration::from_secs(2), DELAY)?);
        assert_eq!(reader.read(&mut [0u8; 8]), Err(Error::ErrCorruptedFile));
        Ok(())
    }

    #[test]
    fn test_growing_file_resets_probe() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a--b--9.packet");
        fs::write(&path, [0u8; 8])?;

        let secret = SecretKey::generate(&mut OsRng);
        let t0 = Instant::now();
        let mut reader = BinaryReader::new(&path, &secret, t0)?;
        assert!(!reader.is_ready_to_read(t0, DELAY)?);

        // the writer is still appending
        fs::write(&path, [0u8; 64])?;
        assert!(!reader.is_ready_to_read(t0 + Duration::from_secs(2), DELAY)?);
        // growth reset the clock, so the timeout counts from the growth
        assert!(!reader.is_ready_to_read(t0 + Duration::from_millis(2500), DELAY)?);
        assert!(reader.is_ready_to_read(t0 + Duration::from_secs(4), DELAY)?);
        Ok(())
    }

    #[test]
    fn test_file_shorter_than_sentinel() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a--b--3.packet");
        fs::write(&path, [0u8; 2])?;

        let secret = SecretKey::generate(&mut OsRng);
        let reader = BinaryReader::new(&path, &secret, Instant::now())?;
        assert_eq!(reader.expected_total_size(), 0);
        Ok(())
    }

    #[test]
    fn test_closed_reader_refuses_reads() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a--b--4.packet");
        let secret = SecretKey::generate(&mut OsRng);
        let mut writer = BinaryWriter::new(&path, &secret)?;
        writer.write(b"x")?;
        writer.close()?;

        let mut reader = BinaryReader::new(&path, &secret, Instant::now())?;
        reader.close(false)?;
        assert!(reader.closed());
        assert_eq!(reader.read(&mut [0u8; 8]), Err(Error::ErrReaderClosed));
        assert!(path.exists());
        Ok(())
    }
}
