//! File transfer (spec component 4.I): chunked, resumable, backpressure-aware
//! transport of files over the same data channel text uses, encrypted
//! end-to-end under a key derived from the contact's ratchet session root
//! and, separately, re-encrypted at rest under a key derived from the local
//! vault master key before anything touches disk.

use crate::config::Config;
use crate::crypto::provider::CryptoProvider;
use crate::messaging::service::MessagingService;
use crate::protocol::peer::PeerConnectionManager;
use crate::protocol::wire::{encode_frame, FileAckBody, FileCancelBody, FileChunkBody, FileOfferBody, Frame};
use crate::storage::models::{FileRecord, TransferDirection, TransferState, TransferStatus};
use crate::storage::Store;
use crate::utils::b64;
use crate::utils::error::{MessengerError, Result};
use crate::utils::time::{current_timestamp, now_ms};
use crate::utils::uuid::generate_v4;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress {
        transfer_id: String,
        contact_id: String,
        bytes_transferred: u64,
        total: u64,
        speed_bps: f64,
        eta_secs: Option<f64>,
    },
    Received {
        transfer_id: String,
        contact_id: String,
        file_id: String,
        filename: String,
    },
    Completed {
        transfer_id: String,
        contact_id: String,
    },
    Failed {
        transfer_id: String,
        contact_id: String,
        reason: String,
    },
}

struct ReceiveBuffer {
    hasher: Sha256,
    inline: Option<Vec<u8>>,
    file: Option<std::fs::File>,
    write_index: u64,
}

/// Exponential moving average over ~1s windows, matching the smoothing the
/// progress/ETA readout uses on both the sending and receiving side.
struct SpeedTracker {
    last_sample_ms: i64,
    last_bytes: u64,
    ema_bps: f64,
}

impl SpeedTracker {
    fn new() -> Self {
        Self { last_sample_ms: now_ms(), last_bytes: 0, ema_bps: 0.0 }
    }

    fn sample(&mut self, bytes_transferred: u64, total: u64) -> Option<(f64, Option<f64>)> {
        let now = now_ms();
        let elapsed_ms = now - self.last_sample_ms;
        if elapsed_ms < 1000 {
            return None;
        }
        let delta_bytes = bytes_transferred.saturating_sub(self.last_bytes) as f64;
        let elapsed_secs = elapsed_ms as f64 / 1000.0;
        let instantaneous = delta_bytes / elapsed_secs;
        let alpha = Config::global().speed_ema_alpha;
        self.ema_bps = if self.ema_bps == 0.0 {
            instantaneous
        } else {
            alpha * instantaneous + (1.0 - alpha) * self.ema_bps
        };
        self.last_sample_ms = now;
        self.last_bytes = bytes_transferred;
        let remaining = total.saturating_sub(bytes_transferred) as f64;
        let eta = if self.ema_bps > 0.0 { Some(remaining / self.ema_bps) } else { None };
        Some((self.ema_bps, eta))
    }
}

pub struct TransferManager<P: CryptoProvider> {
    store: Arc<dyn Store>,
    peer: Arc<PeerConnectionManager>,
    messaging: Arc<MessagingService<P>>,
    files_dir: PathBuf,
    master_key: [u8; 32],
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    receive_buffers: Mutex<HashMap<String, ReceiveBuffer>>,
    speed_trackers: Mutex<HashMap<String, SpeedTracker>>,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
}

impl<P: CryptoProvider> TransferManager<P> {
    pub fn new(
        store: Arc<dyn Store>,
        peer: Arc<PeerConnectionManager>,
        messaging: Arc<MessagingService<P>>,
        files_dir: PathBuf,
        master_key: [u8; 32],
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = std::fs::create_dir_all(&files_dir);
        (
            Self {
                store,
                peer,
                messaging,
                files_dir,
                master_key,
                cancel_flags: Mutex::new(HashMap::new()),
                receive_buffers: Mutex::new(HashMap::new()),
                speed_trackers: Mutex::new(HashMap::new()),
                events_tx,
            },
            events_rx,
        )
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Start sending a file. Returns the transfer id immediately; the send
    /// loop runs in the background and reports progress through [`TransferEvent`].
    pub async fn send_file(self: &Arc<Self>, contact_id: &str, path: &Path) -> Result<String> {
        let transfer_id = generate_v4();
        self.begin_send(contact_id, &transfer_id, path).await?;
        self.spawn_send_loop(contact_id.to_string(), transfer_id.clone(), path.to_path_buf());
        Ok(transfer_id)
    }

    /// Resume a previously interrupted send: re-announces the same
    /// transfer id with a fresh `file-offer` and continues from
    /// `next_chunk_index`.
    pub async fn resume_send(self: &Arc<Self>, transfer_id: &str, path: &Path) -> Result<()> {
        let transfer = self
            .store
            .load_transfer(transfer_id)?
            .ok_or_else(|| MessengerError::NotFound(format!("transfer {}", transfer_id)))?;
        if transfer.direction != TransferDirection::Send {
            return Err(MessengerError::InvalidInput("cannot resume a receive transfer".to_string()));
        }
        if is_terminal(transfer.status) {
            return Err(MessengerError::InvalidInput(
                "transfer is terminal; start a new one to retry".to_string(),
            ));
        }

        let contact_id = transfer.contact_id.clone();
        let offer = Frame::FileOffer {
            id: generate_v4(),
            ts: current_timestamp(),
            body: FileOfferBody {
                transfer_id: transfer_id.to_string(),
                filename: transfer.filename.clone(),
                mime: transfer.mime.clone(),
                size: transfer.size,
                chunk_size: transfer.chunk_size,
                sha256: transfer.sha256_expected.clone(),
            },
        };
        self.send_frame(&contact_id, offer).await?;
        self.spawn_send_loop(contact_id, transfer_id.to_string(), path.to_path_buf());
        Ok(())
    }

    async fn begin_send(&self, contact_id: &str, transfer_id: &str, path: &Path) -> Result<()> {
        let metadata =
            std::fs::metadata(path).map_err(|e| MessengerError::InvalidInput(e.to_string()))?;
        let size = metadata.len();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let mime = guess_mime(&filename);
        let sha256 = hash_file(path)?;
        let chunk_size = Config::global().file_chunk_size as u32;

        if let Some(collision) = self.store.load_transfers(contact_id)?.into_iter().find(|t| {
            t.direction == TransferDirection::Send
                && t.file_id.as_deref() == Some(sha256.as_str())
                && !is_terminal(t.status)
        }) {
            return Err(MessengerError::AlreadyExists(format!(
                "transfer {} of this file to this contact is already in progress",
                collision.transfer_id
            )));
        }

        self.store.save_transfer(TransferState {
            transfer_id: transfer_id.to_string(),
            contact_id: contact_id.to_string(),
            direction: TransferDirection::Send,
            file_id: Some(sha256.clone()),
            filename: filename.clone(),
            mime: mime.clone(),
            size,
            chunk_size,
            next_chunk_index: 0,
            bytes_transferred: 0,
            sha256_expected: sha256.clone(),
            status: TransferStatus::Negotiating,
            failure_reason: None,
            updated_at: current_timestamp(),
        })?;

        let offer = Frame::FileOffer {
            id: generate_v4(),
            ts: current_timestamp(),
            body: FileOfferBody { transfer_id: transfer_id.to_string(), filename, mime, size, chunk_size, sha256 },
        };
        self.send_frame(contact_id, offer).await
    }

    fn spawn_send_loop(self: &Arc<Self>, contact_id: String, transfer_id: String, path: PathBuf) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_send_loop(&contact_id, &transfer_id, &path).await {
                warn!(target: "transfer", transfer_id, error = %e, "send loop ended with an error");
                this.mark_failed(&transfer_id, &contact_id, &e.to_string());
            }
        });
    }

    async fn run_send_loop(&self, contact_id: &str, transfer_id: &str, path: &Path) -> Result<()> {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags.lock().insert(transfer_id.to_string(), cancel_flag.clone());

        let mut transfer = self
            .store
            .load_transfer(transfer_id)?
            .ok_or_else(|| MessengerError::NotFound(format!("transfer {}", transfer_id)))?;
        transfer.status = TransferStatus::InProgress;
        self.store.save_transfer(transfer.clone())?;

        let key = self.messaging.transfer_key(contact_id, transfer_id)?;
        let chunk_size = transfer.chunk_size as usize;
        let mut file = std::fs::File::open(path).map_err(|e| MessengerError::InvalidInput(e.to_string()))?;
        file.seek(SeekFrom::Start(transfer.next_chunk_index * chunk_size as u64))
            .map_err(|e| MessengerError::StorageError(e.to_string()))?;

        let persist_every = Config::global().transfer_persist_every_n_chunks as u64;
        let mut index = transfer.next_chunk_index;
        let mut buf = vec![0u8; chunk_size];

        loop {
            if cancel_flag.load(Ordering::Relaxed) {
                return Ok(());
            }
            let n = file.read(&mut buf).map_err(|e| MessengerError::StorageError(e.to_string()))?;
            if n == 0 {
                break;
            }

            let nonce = chunk_nonce(index);
            let ciphertext = P::aead_encrypt(&key, &nonce, &buf[..n], Some(transfer_id.as_bytes()))
                .map_err(MessengerError::from)?;
            let chunk = Frame::FileChunk {
                id: generate_v4(),
                ts: current_timestamp(),
                body: FileChunkBody {
                    transfer_id: transfer_id.to_string(),
                    index,
                    ciphertext: b64::url_encode(&ciphertext),
                },
            };
            self.send_frame(contact_id, chunk).await?;

            index += 1;
            transfer.next_chunk_index = index;
            transfer.bytes_transferred += n as u64;
            transfer.updated_at = current_timestamp();
            if index % persist_every == 0 {
                self.store.save_transfer(transfer.clone())?;
            }

            let sample = self
                .speed_trackers
                .lock()
                .entry(transfer_id.to_string())
                .or_insert_with(SpeedTracker::new)
                .sample(transfer.bytes_transferred, transfer.size);
            if let Some((speed_bps, eta_secs)) = sample {
                let _ = self.events_tx.send(TransferEvent::Progress {
                    transfer_id: transfer_id.to_string(),
                    contact_id: contact_id.to_string(),
                    bytes_transferred: transfer.bytes_transferred,
                    total: transfer.size,
                    speed_bps,
                    eta_secs,
                });
            }
        }

        transfer.status = TransferStatus::Completed;
        self.store.save_transfer(transfer)?;
        self.cancel_flags.lock().remove(transfer_id);
        self.speed_trackers.lock().remove(transfer_id);
        info!(target: "transfer", transfer_id, "send completed");
        let _ = self.events_tx.send(TransferEvent::Completed {
            transfer_id: transfer_id.to_string(),
            contact_id: contact_id.to_string(),
        });
        Ok(())
    }

    fn mark_failed(&self, transfer_id: &str, contact_id: &str, reason: &str) {
        if let Ok(Some(mut t)) = self.store.load_transfer(transfer_id) {
            t.status = TransferStatus::Failed;
            t.failure_reason = Some(reason.to_string());
            let _ = self.store.save_transfer(t);
        }
        self.cancel_flags.lock().remove(transfer_id);
        let _ = self.events_tx.send(TransferEvent::Failed {
            transfer_id: transfer_id.to_string(),
            contact_id: contact_id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub async fn cancel(&self, transfer_id: &str, reason: &str) -> Result<()> {
        if let Some(flag) = self.cancel_flags.lock().get(transfer_id) {
            flag.store(true, Ordering::Relaxed);
        }
        self.receive_buffers.lock().remove(transfer_id);
        self.speed_trackers.lock().remove(transfer_id);

        let Some(mut transfer) = self.store.load_transfer(transfer_id)? else { return Ok(()) };
        let contact_id = transfer.contact_id.clone();
        transfer.status = TransferStatus::Cancelled;
        transfer.failure_reason = Some(reason.to_string());
        self.store.save_transfer(transfer)?;

        let frame = Frame::FileCancel {
            id: generate_v4(),
            ts: current_timestamp(),
            body: FileCancelBody { transfer_id: transfer_id.to_string(), reason: reason.to_string() },
        };
        self.send_frame(&contact_id, frame).await?;
        let _ = self.events_tx.send(TransferEvent::Failed {
            transfer_id: transfer_id.to_string(),
            contact_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn send_frame(&self, contact_id: &str, frame: Frame) -> Result<()> {
        let bytes = encode_frame(&frame)?;
        match self.peer.send(contact_id, bytes.clone()).await {
            Ok(()) => Ok(()),
            Err(MessengerError::Backpressure(_)) => {
                self.peer.send_ready(contact_id).await?;
                self.peer.send(contact_id, bytes).await
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    pub async fn handle_frame(&self, contact_id: &str, frame: Frame) -> Result<()> {
        match frame {
            Frame::FileOffer { body, .. } => self.handle_file_offer(contact_id, body),
            Frame::FileChunk { body, .. } => self.handle_file_chunk(contact_id, body),
            Frame::FileAck { body, .. } => self.handle_file_ack(contact_id, body),
            Frame::FileCancel { body, .. } => self.handle_file_cancel(contact_id, body),
            other => {
                warn!(target: "transfer", frame = other.type_name(), "non-file frame reached the transfer router");
                Ok(())
            }
        }
    }

    fn handle_file_offer(&self, contact_id: &str, body: FileOfferBody) -> Result<()> {
        let existing = self.store.load_transfer(&body.transfer_id)?;
        let resuming = existing
            .as_ref()
            .filter(|t| t.sha256_expected == body.sha256 && !is_terminal(t.status));

        if resuming.is_none() {
            if let Some(collision) = self.store.load_transfers(contact_id)?.into_iter().find(|t| {
                t.direction == TransferDirection::Receive
                    && t.file_id.as_deref() == Some(body.sha256.as_str())
                    && !is_terminal(t.status)
            }) {
                return Err(MessengerError::AlreadyExists(format!(
                    "transfer {} of this file from this contact is already in progress",
                    collision.transfer_id
                )));
            }
        }

        let next_index = resuming.map(|t| t.next_chunk_index).unwrap_or(0);

        self.store.save_transfer(TransferState {
            transfer_id: body.transfer_id.clone(),
            contact_id: contact_id.to_string(),
            direction: TransferDirection::Receive,
            file_id: Some(body.sha256.clone()),
            filename: body.filename.clone(),
            mime: body.mime.clone(),
            size: body.size,
            chunk_size: body.chunk_size,
            next_chunk_index: next_index,
            bytes_transferred: next_index * body.chunk_size as u64,
            sha256_expected: body.sha256.clone(),
            status: TransferStatus::InProgress,
            failure_reason: None,
            updated_at: current_timestamp(),
        })?;

        let buffer = self.open_receive_buffer(&body, next_index)?;
        self.receive_buffers.lock().insert(body.transfer_id, buffer);
        Ok(())
    }

    fn open_receive_buffer(&self, body: &FileOfferBody, next_index: u64) -> Result<ReceiveBuffer> {
        if (body.size as usize) <= Config::global().file_inline_threshold {
            return Ok(ReceiveBuffer { hasher: Sha256::new(), inline: Some(Vec::new()), file: None, write_index: 0 });
        }

        let part_path = self.part_path(&body.transfer_id);
        let key = derive_file_key(&self.master_key, &body.sha256)?;
        let mut hasher = Sha256::new();

        if next_index > 0 && part_path.exists() {
            let mut reader =
                std::fs::File::open(&part_path).map_err(|e| MessengerError::StorageError(e.to_string()))?;
            for index in 0..next_index {
                let mut len_buf = [0u8; 4];
                reader.read_exact(&mut len_buf).map_err(|e| MessengerError::StorageError(e.to_string()))?;
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut ciphertext = vec![0u8; len];
                reader
                    .read_exact(&mut ciphertext)
                    .map_err(|e| MessengerError::StorageError(e.to_string()))?;
                let plaintext = unseal_chunk(&key, &chunk_nonce(index), &ciphertext)?;
                hasher.update(&plaintext);
            }
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(next_index > 0)
            .truncate(next_index == 0)
            .open(&part_path)
            .map_err(|e| MessengerError::StorageError(e.to_string()))?;

        Ok(ReceiveBuffer { hasher, inline: None, file: Some(file), write_index: next_index })
    }

    fn handle_file_chunk(&self, contact_id: &str, body: FileChunkBody) -> Result<()> {
        let mut transfer = self
            .store
            .load_transfer(&body.transfer_id)?
            .ok_or_else(|| MessengerError::NotFound(format!("transfer {}", body.transfer_id)))?;
        if body.index < transfer.next_chunk_index {
            return Ok(()); // already-received chunk on a resumed stream
        }

        let key = self.messaging.transfer_key(contact_id, &body.transfer_id)?;
        let ciphertext = b64::url_decode(&body.ciphertext).map_err(MessengerError::ValidationError)?;
        let nonce = chunk_nonce(body.index);
        let plaintext = match P::aead_decrypt(&key, &nonce, &ciphertext, Some(body.transfer_id.as_bytes())) {
            Ok(pt) => pt,
            Err(e) => {
                self.mark_failed(&body.transfer_id, contact_id, &format!("chunk decrypt failed: {}", e));
                return Ok(());
            }
        };

        self.write_received_chunk(&body.transfer_id, &transfer.sha256_expected, &plaintext)?;
        transfer.next_chunk_index = body.index + 1;
        transfer.bytes_transferred += plaintext.len() as u64;
        transfer.updated_at = current_timestamp();

        if transfer.bytes_transferred >= transfer.size {
            match self.finalize_receive(&mut transfer) {
                Ok(()) => {
                    let _ = self.events_tx.send(TransferEvent::Received {
                        transfer_id: transfer.transfer_id.clone(),
                        contact_id: contact_id.to_string(),
                        file_id: transfer.file_id.clone().unwrap_or_default(),
                        filename: transfer.filename.clone(),
                    });
                    let _ = self.events_tx.send(TransferEvent::Completed {
                        transfer_id: transfer.transfer_id.clone(),
                        contact_id: contact_id.to_string(),
                    });
                }
                Err(e) => {
                    let _ = self.events_tx.send(TransferEvent::Failed {
                        transfer_id: transfer.transfer_id.clone(),
                        contact_id: contact_id.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
            self.speed_trackers.lock().remove(&transfer.transfer_id);
            return Ok(());
        }

        let persist_every = Config::global().transfer_persist_every_n_chunks as u64;
        if transfer.next_chunk_index % persist_every == 0 {
            self.store.save_transfer(transfer.clone())?;
        }

        let sample = self
            .speed_trackers
            .lock()
            .entry(transfer.transfer_id.clone())
            .or_insert_with(SpeedTracker::new)
            .sample(transfer.bytes_transferred, transfer.size);
        if let Some((speed_bps, eta_secs)) = sample {
            let _ = self.events_tx.send(TransferEvent::Progress {
                transfer_id: transfer.transfer_id.clone(),
                contact_id: contact_id.to_string(),
                bytes_transferred: transfer.bytes_transferred,
                total: transfer.size,
                speed_bps,
                eta_secs,
            });
        }
        Ok(())
    }

    fn write_received_chunk(&self, transfer_id: &str, file_id: &str, plaintext: &[u8]) -> Result<()> {
        let mut buffers = self.receive_buffers.lock();
        let buffer = buffers
            .get_mut(transfer_id)
            .ok_or_else(|| MessengerError::SessionError(format!("no receive buffer for transfer {}", transfer_id)))?;
        buffer.hasher.update(plaintext);

        if let Some(inline) = buffer.inline.as_mut() {
            inline.extend_from_slice(plaintext);
        } else if let Some(file) = buffer.file.as_mut() {
            let key = derive_file_key(&self.master_key, file_id)?;
            let nonce = chunk_nonce(buffer.write_index);
            let ciphertext = seal_chunk(&key, &nonce, plaintext)?;
            file.write_all(&(ciphertext.len() as u32).to_be_bytes())
                .map_err(|e| MessengerError::StorageError(e.to_string()))?;
            file.write_all(&ciphertext).map_err(|e| MessengerError::StorageError(e.to_string()))?;
        }
        buffer.write_index += 1;
        Ok(())
    }

    fn finalize_receive(&self, transfer: &mut TransferState) -> Result<()> {
        let buffer = self
            .receive_buffers
            .lock()
            .remove(&transfer.transfer_id)
            .ok_or_else(|| MessengerError::SessionError("no receive buffer to finalize".to_string()))?;
        let digest = hex::encode(buffer.hasher.finalize());
        if digest != transfer.sha256_expected {
            transfer.status = TransferStatus::Failed;
            transfer.failure_reason = Some("sha256 mismatch".to_string());
            self.store.save_transfer(transfer.clone())?;
            return Err(MessengerError::HashMismatch(format!(
                "expected {}, got {}",
                transfer.sha256_expected, digest
            )));
        }

        let record = if let Some(inline) = buffer.inline {
            FileRecord {
                id: digest.clone(),
                contact_id: transfer.contact_id.clone(),
                filename: transfer.filename.clone(),
                mime: transfer.mime.clone(),
                size: transfer.size,
                sha256: digest,
                inline_blob: Some(inline),
                path: None,
                thumbnail: None,
                created_at: current_timestamp(),
            }
        } else {
            drop(buffer.file);
            let part_path = self.part_path(&transfer.transfer_id);
            let final_path = part_path.with_extension("enc");
            std::fs::rename(&part_path, &final_path).map_err(|e| MessengerError::StorageError(e.to_string()))?;
            FileRecord {
                id: digest.clone(),
                contact_id: transfer.contact_id.clone(),
                filename: transfer.filename.clone(),
                mime: transfer.mime.clone(),
                size: transfer.size,
                sha256: digest,
                inline_blob: None,
                path: Some(final_path.to_string_lossy().to_string()),
                thumbnail: None,
                created_at: current_timestamp(),
            }
        };

        transfer.status = TransferStatus::Completed;
        self.store.complete_file_transfer(record, transfer.clone())?;
        Ok(())
    }

    fn handle_file_ack(&self, _contact_id: &str, _body: FileAckBody) -> Result<()> {
        // Progress is driven locally from bytes actually sent; acks are not
        // currently used to drive UI state, only kept on the wire for a
        // future liveness check.
        Ok(())
    }

    fn handle_file_cancel(&self, contact_id: &str, body: FileCancelBody) -> Result<()> {
        if let Some(flag) = self.cancel_flags.lock().get(&body.transfer_id) {
            flag.store(true, Ordering::Relaxed);
        }
        self.receive_buffers.lock().remove(&body.transfer_id);
        self.speed_trackers.lock().remove(&body.transfer_id);

        if let Some(mut t) = self.store.load_transfer(&body.transfer_id)? {
            t.status = TransferStatus::Cancelled;
            t.failure_reason = Some(body.reason.clone());
            self.store.save_transfer(t)?;
        }
        let _ = self.events_tx.send(TransferEvent::Failed {
            transfer_id: body.transfer_id,
            contact_id: contact_id.to_string(),
            reason: body.reason,
        });
        Ok(())
    }

    /// Decrypt a completed file back into memory, re-reading the
    /// at-rest-encrypted chunks it was stored in.
    pub fn read_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let record = self
            .store
            .load_file_record(file_id)?
            .ok_or_else(|| MessengerError::NotFound(format!("file {}", file_id)))?;
        if let Some(inline) = record.inline_blob {
            return Ok(inline);
        }
        let path = record
            .path
            .ok_or_else(|| MessengerError::Corrupted("file record has neither blob nor path".to_string()))?;
        let key = derive_file_key(&self.master_key, file_id)?;
        let mut reader = std::fs::File::open(&path).map_err(|e| MessengerError::StorageError(e.to_string()))?;
        let mut out = Vec::with_capacity(record.size as usize);
        let mut index = 0u64;
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(MessengerError::StorageError(e.to_string())),
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut ciphertext = vec![0u8; len];
            reader.read_exact(&mut ciphertext).map_err(|e| MessengerError::StorageError(e.to_string()))?;
            let plaintext = unseal_chunk(&key, &chunk_nonce(index), &ciphertext)?;
            out.extend_from_slice(&plaintext);
            index += 1;
        }
        Ok(out)
    }

    fn part_path(&self, transfer_id: &str) -> PathBuf {
        self.files_dir.join(format!("{}.part", transfer_id))
    }
}

/// `Completed`/`Cancelled`/`Failed` are terminal: a new `transfer_id` is
/// required to retry, per the status enum's own contract.
fn is_terminal(status: TransferStatus) -> bool {
    matches!(
        status,
        TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Failed
    )
}

fn chunk_nonce(index: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&index.to_be_bytes());
    nonce
}

fn guess_mime(filename: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
    .to_string()
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| MessengerError::InvalidInput(e.to_string()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf).map_err(|e| MessengerError::StorageError(e.to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// At-rest encryption is a local-storage concern, not part of the
/// crypto-agile message suite, so it goes straight through ChaCha20-Poly1305
/// the same way `identity::seal_field` does, rather than through `P`.
fn derive_file_key(master_key: &[u8; 32], transfer_id: &str) -> Result<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, master_key);
    let mut out = [0u8; 32];
    hkdf.expand(
        &[crate::crypto::constants::CONST_AEAD_V1, b"file-at-rest:", transfer_id.as_bytes()].concat(),
        &mut out,
    )
    .map_err(|e| MessengerError::CryptoError(format!("file key derivation failed: {}", e)))?;
    Ok(out)
}

fn seal_chunk(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| MessengerError::CryptoError(format!("at-rest chunk seal failed: {}", e)))
}

fn unseal_chunk(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| MessengerError::Corrupted("at-rest file chunk failed to decrypt".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::suites::classic::ClassicSuiteProvider;
    use crate::identity::Identity;
    use crate::protocol::signalling::SignallingClient;
    use crate::storage::memory::MemoryStore;
    use tempfile::tempdir;

    fn make_transfer_manager(
        name: &str,
    ) -> (Arc<TransferManager<ClassicSuiteProvider>>, mpsc::UnboundedReceiver<TransferEvent>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let identity = Arc::new(Identity::<ClassicSuiteProvider>::generate(&*store, &[7u8; 32], name).unwrap());
        let (peer, _peer_events) = PeerConnectionManager::new(vec![]);
        let signalling = Arc::new(SignallingClient::<ClassicSuiteProvider>::new("wss://example.invalid"));
        let (messaging, _messaging_events) =
            MessagingService::new(identity, store.clone(), Arc::new(peer), signalling);
        let messaging = Arc::new(messaging);
        let (peer2, _peer2_events) = PeerConnectionManager::new(vec![]);
        let dir = tempdir().unwrap().keep();
        let (manager, rx) = TransferManager::new(store.clone(), Arc::new(peer2), messaging, dir, [9u8; 32]);
        (Arc::new(manager), rx, store)
    }

    #[test]
    fn chunk_nonce_is_stable_and_distinct_per_index() {
        assert_ne!(chunk_nonce(0), chunk_nonce(1));
        assert_eq!(chunk_nonce(5), chunk_nonce(5));
    }

    #[test]
    fn at_rest_seal_then_unseal_round_trips() {
        let key = derive_file_key(&[1u8; 32], "transfer-1").unwrap();
        let nonce = chunk_nonce(3);
        let ciphertext = seal_chunk(&key, &nonce, b"some file bytes").unwrap();
        let plaintext = unseal_chunk(&key, &nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"some file bytes");
    }

    #[test]
    fn small_file_is_received_inline_and_hash_checked() {
        let (manager, mut events, store) = make_transfer_manager("alice");
        let sha256 = hex::encode(Sha256::digest(b"hello"));
        let body = FileOfferBody {
            transfer_id: "t1".to_string(),
            filename: "note.txt".to_string(),
            mime: "text/plain".to_string(),
            size: 5,
            chunk_size: Config::global().file_chunk_size as u32,
            sha256: sha256.clone(),
        };
        manager.handle_file_offer("bob", body).unwrap();

        // Exercise the inline receive path directly; decrypting a real
        // ciphertext chunk requires a live ratchet session, which this test
        // intentionally does not stand up.
        manager.write_received_chunk("t1", &sha256, b"hello").unwrap();
        let mut transfer = store.load_transfer("t1").unwrap().unwrap();
        transfer.bytes_transferred = 5;
        manager.finalize_receive(&mut transfer).unwrap();

        let record = store.load_file_record(&sha256).unwrap().unwrap();
        assert_eq!(record.inline_blob.as_deref(), Some(&b"hello"[..]));

        drop(events); // nothing asserted on the channel here; draining is optional in this test
    }

    #[test]
    fn second_offer_for_same_file_while_first_is_in_flight_is_rejected() {
        let (manager, _events, _store) = make_transfer_manager("alice");
        let sha256 = hex::encode(Sha256::digest(b"hello"));
        let offer = |transfer_id: &str| FileOfferBody {
            transfer_id: transfer_id.to_string(),
            filename: "note.txt".to_string(),
            mime: "text/plain".to_string(),
            size: 5,
            chunk_size: Config::global().file_chunk_size as u32,
            sha256: sha256.clone(),
        };

        manager.handle_file_offer("bob", offer("t1")).unwrap();
        let err = manager.handle_file_offer("bob", offer("t2")).unwrap_err();
        assert!(matches!(err, MessengerError::AlreadyExists(_)));
    }
}
