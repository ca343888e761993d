
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use fxhash::FxHashMap;
use rand::rngs::OsRng;
use uuid::Uuid;

use crate::config::Config;
use crate::crypto::SecretKey;
use crate::error::{Error, Result};
use crate::messenger::Messenger;
use crate::packet::Packet;
use crate::stream::{BinaryReader, BinaryWriter};

pub(crate) const PACKET_FILE_SUFFIX: &str = ".packet";

/// Splits a `sender--recipient--id.packet` file name into its parts.
/// Exactly two `--` separators are required; the packet id must be a
/// positive integer.
pub(crate) fn parse_file_name(file_name: &str) -> Result<(Uuid, Uuid, u32)> {
    let stem = file_name
        .strip_suffix(PACKET_FILE_SUFFIX)
        .ok_or(Error::ErrInvalidFileName)?;
    let parts: Vec<&str> = stem.split("--").collect();
    if parts.len() != 3 {
        return Err(Error::ErrInvalidFileName);
    }
    let sender = Uuid::parse_str(parts[0]).map_err(|_| Error::ErrInvalidFileName)?;
    let recipient = Uuid::parse_str(parts[1]).map_err(|_| Error::ErrInvalidFileName)?;
    let packet_id: u32 = parts[2].parse().map_err(|_| Error::ErrInvalidFileName)?;
    if packet_id == 0 {
        return Err(Error::ErrInvalidFileName);
    }
    Ok((sender, recipient, packet_id))
}

struct OpenFile {
    reader: BinaryReader,
    sender_uuid: Uuid,
    packet_id: u32,
}

/// Endpoint drives the drop-folder I/O for one local peer: it discovers
/// incoming packet files, feeds them through Layer 0 and the packet
/// codec, dispatches decoded packets to the right messenger, and writes
/// one outgoing packet per messenger per cycle.
///
/// Decode failures never escape a cycle; they turn into NACKs keyed by
/// the filename-derived packet id, and the offending file is retried a
/// configured number of times before it is deleted.
pub struct Endpoint {
    uuid: Uuid,
    input_folder: PathBuf,
    output_folder: PathBuf,
    secret_key: SecretKey,
    config: Config,

    messengers: FxHashMap<Uuid, Messenger>,
    open_files: FxHashMap<PathBuf, OpenFile>,
    decode_attempts: FxHashMap<PathBuf, u32>,

    delete_successful: bool,
    delete_error_files: bool,
}

impl Endpoint {
    pub fn new(
        uuid: Uuid,
        input_folder: impl AsRef<Path>,
        output_folder: impl AsRef<Path>,
        secret_key: SecretKey,
        config: Config,
    ) -> Self {
        Endpoint {
            uuid,
            input_folder: input_folder.as_ref().to_path_buf(),
            output_folder: output_folder.as_ref().to_path_buf(),
            secret_key,
            config,
            messengers: FxHashMap::default(),
            open_files: FxHashMap::default(),
            decode_attempts: FxHashMap::default(),
            delete_successful: true,
            delete_error_files: true,
        }
    }

    /// Whether to delete packet files after a successful decode, and
    /// after the decode-attempt budget of a broken file is exhausted.
    pub fn with_delete_policy(mut self, delete_successful: bool, delete_error_files: bool) -> Self {
        self.delete_successful = delete_successful;
        self.delete_error_files = delete_error_files;
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Registers a peer, creating its messenger if needed.
    pub fn add_peer(&mut self, peer_uuid: Uuid) -> &mut Messenger {
        let uuid = self.uuid;
        let config = self.config.clone();
        self.messengers
            .entry(peer_uuid)
            .or_insert_with(|| Messenger::new(uuid, peer_uuid, config))
    }

    pub fn messenger(&self, peer_uuid: &Uuid) -> Option<&Messenger> {
        self.messengers.get(peer_uuid)
    }

    pub fn messenger_mut(&mut self, peer_uuid: &Uuid) -> Option<&mut Messenger> {
        self.messengers.get_mut(peer_uuid)
    }

    /// One find -> read -> write cycle. The caller sleeps between cycles.
    pub fn run_once(&mut self) -> Result<()> {
        let now = Instant::now();
        self.find_input_files(now);
        self.try_read_input_files(now);
        self.write_output_files(SystemTime::now())
    }

    fn find_input_files(&mut self, now: Instant) {
        let dir = self.input_folder.join(self.uuid.to_string());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                log::warn!("[{}] failed to list {}: {}", self.uuid, dir.display(), e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            // a leading dot marks a partial file still being written
            if name.starts_with('.') {
                continue;
            }
            if self.open_files.contains_key(&path) {
                continue;
            }
            let (sender, recipient, packet_id) = match parse_file_name(name) {
                Ok(parts) => parts,
                Err(_) => continue,
            };
            if recipient != self.uuid {
                log::warn!(
                    "[{}] incorrect recipient for {}: got {}",
                    self.uuid,
                    path.display(),
                    recipient
                );
                continue;
            }
            if !self.messengers.contains_key(&sender) {
                log::warn!("[{}] no messenger for sender {}", self.uuid, sender);
                continue;
            }

            match BinaryReader::new(&path, &self.secret_key, now) {
                Ok(reader) => {
                    self.open_files.insert(
                        path,
                        OpenFile {
                            reader,
                            sender_uuid: sender,
                            packet_id,
                        },
                    );
                }
                Err(e) => {
                    log::warn!("[{}] failed to open {}: {}", self.uuid, path.display(), e);
                }
            }
        }
    }

    fn try_read_input_files(&mut self, now: Instant) {
        let delay = self.config.delay_assume_write_finished();
        let paths: Vec<PathBuf> = self.open_files.keys().cloned().collect();

        for path in paths {
            let open_file = match self.open_files.get_mut(&path) {
                Some(open_file) => open_file,
                None => continue,
            };

            match open_file.reader.is_ready_to_read(now, delay) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    // the file usually vanished underneath us; give up on it
                    log::warn!("[{}] failed to probe {}: {}", self.uuid, path.display(), e);
                    Self::fail_file(
                        &mut self.messengers,
                        &mut self.decode_attempts,
                        open_file,
                        &path,
                        1,
                        self.delete_error_files,
                    );
                    continue;
                }
            }

            let expected_packet_id = open_file.packet_id;
            let expected_sender = open_file.sender_uuid;
            let decoded = Packet::from_reader(&mut open_file.reader, &self.secret_key)
                .and_then(|packet| {
                    if packet.header.packet_id != expected_packet_id
                        || packet.header.sender_uuid != expected_sender
                    {
                        Err(Error::ErrFileNamePacketIdMismatch)
                    } else {
                        Ok(packet)
                    }
                });

            match decoded {
                Ok(packet) if packet.header.recipient_uuid != self.uuid => {
                    log::warn!(
                        "[{}] packet in {} is addressed to {}",
                        self.uuid,
                        path.display(),
                        packet.header.recipient_uuid
                    );
                    let _ = open_file.reader.close(self.delete_error_files);
                    self.decode_attempts.remove(&path);
                }
                Ok(packet) => {
                    let messenger = match self.messengers.get_mut(&open_file.sender_uuid) {
                        Some(messenger) => messenger,
                        None => {
                            let _ = open_file.reader.close(false);
                            continue;
                        }
                    };
                    match messenger.packet_receive(&packet) {
                        Ok(()) => {
                            if !packet.is_complete() {
                                messenger.add_nack(packet.header.packet_id);
                            }
                            if let Err(e) = open_file.reader.close(self.delete_successful) {
                                log::warn!(
                                    "[{}] failed to close {}: {}",
                                    self.uuid,
                                    path.display(),
                                    e
                                );
                            }
                            self.decode_attempts.remove(&path);
                        }
                        Err(e) => {
                            log::warn!(
                                "[{}] messenger rejected packet from {}: {}",
                                self.uuid,
                                path.display(),
                                e
                            );
                            let _ = open_file.reader.close(self.delete_error_files);
                            self.decode_attempts.remove(&path);
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[{}] failed to decode {}: {}", self.uuid, path.display(), e);
                    Self::fail_file(
                        &mut self.messengers,
                        &mut self.decode_attempts,
                        open_file,
                        &path,
                        self.config.max_decode_attempts(),
                        self.delete_error_files,
                    );
                }
            }
        }

        self.open_files.retain(|_, open_file| !open_file.reader.closed());
    }

    /// NACKs a file by its filename-derived packet id and closes it,
    /// deleting it once its decode-attempt budget is used up. The NACK is
    /// always inserted before any deletion.
    fn fail_file(
        messengers: &mut FxHashMap<Uuid, Messenger>,
        decode_attempts: &mut FxHashMap<PathBuf, u32>,
        open_file: &mut OpenFile,
        path: &Path,
        max_attempts: u32,
        delete_error_files: bool,
    ) {
        if let Some(messenger) = messengers.get_mut(&open_file.sender_uuid) {
            messenger.add_nack(open_file.packet_id);
        }

        let attempts = decode_attempts.entry(path.to_path_buf()).or_insert(0);
        *attempts = attempts.saturating_add(1);
        let give_up = *attempts >= max_attempts;
        if let Err(e) = open_file.reader.close(give_up && delete_error_files) {
            log::warn!("failed to close {}: {}", path.display(), e);
        }
        if give_up {
            decode_attempts.remove(path);
        }
    }

    fn write_output_files(&mut self, now: SystemTime) -> Result<()> {
        for (peer_uuid, messenger) in self.messengers.iter_mut() {
            let packet = messenger.create_packet(now, None)?;
            let raw = packet.marshal(&self.secret_key, &mut OsRng)?;

            let path = self
                .output_folder
                .join(peer_uuid.to_string())
                .join(packet.header.file_name());
            if let Err(e) = write_packet_file(&path, &self.secret_key, &raw) {
                log::warn!("[{}] failed to write {}: {}", self.uuid, path.display(), e);
                continue;
            }

            messenger.packet_send(&packet)?;
        }
        Ok(())
    }
}

fn write_packet_file(path: &Path, secret_key: &SecretKey, raw: &[u8]) -> Result<()> {
    let mut writer = BinaryWriter::new(path, secret_key)?;
    writer.write(raw)?;
    writer.close()
}
