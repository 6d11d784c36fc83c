//! Durable journal backing the mutation queue.
//!
//! Each queued record is one bincode frame keyed by its big-endian sequence
//! number, so a prefix scan returns entries in FIFO order:
//!
//! ```text
//!   q/<seq:8 BE> ─► JournalEntry { sequence, attempts, payload(json), checksum }
//! ```
//!
//! The frame is written before `add` returns and deleted once the server
//! acknowledges the record. Frames that fail their checksum are skipped on
//! recovery.

use crate::storage::KvBackend;
use ginger_core::{MutationRecord, Result, SyncError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const PREFIX: &[u8] = b"q/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub attempts: u32,
    /// JSON-encoded [`MutationRecord`]
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl JournalEntry {
    /// Build a frame for `record` with its checksum computed.
    pub fn new(sequence: u64, attempts: u32, record: &MutationRecord) -> Result<Self> {
        let payload = serde_json::to_vec(record)?;
        let checksum = Self::compute_checksum(sequence, &payload);
        Ok(Self { sequence, attempts, payload, checksum })
    }

    /// Check the stored checksum against the payload.
    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, &self.payload)
    }

    /// Decode the JSON payload back into a record.
    pub fn record(&self) -> Result<MutationRecord> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// FNV-1a over the sequence number and payload.
    fn compute_checksum(sequence: u64, payload: &[u8]) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in sequence.to_le_bytes().iter().chain(payload) {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }

    /// Serialize the frame with bincode.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Deserialize a frame written by [`JournalEntry::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (entry, _): (Self, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(entry)
    }
}

/// A recovered journal entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    pub sequence: u64,
    pub attempts: u32,
    pub record: MutationRecord,
}

pub struct QueueJournal {
    backend: Arc<dyn KvBackend>,
}

impl QueueJournal {
    /// Journal over `backend`. Frames live under the `q/` prefix.
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    fn key(sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(PREFIX.len() + 8);
        key.extend_from_slice(PREFIX);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    /// Write (or overwrite) the frame for `sequence`.
    pub fn write(&self, sequence: u64, attempts: u32, record: &MutationRecord) -> Result<()> {
        let entry = JournalEntry::new(sequence, attempts, record)?;
        self.backend.put(&Self::key(sequence), &entry.encode()?)
    }

    /// Delete the frame for `sequence`. Removing a missing frame is not an error.
    pub fn remove(&self, sequence: u64) -> Result<()> {
        self.backend.delete(&Self::key(sequence))
    }

    /// All intact entries in sequence order.
    pub fn recover(&self) -> Result<Vec<Recovered>> {
        let mut recovered = Vec::new();
        for (key, bytes) in self.backend.scan_prefix(PREFIX)? {
            let entry = match JournalEntry::decode(&bytes) {
                Ok(entry) if entry.verify() => entry,
                Ok(entry) => {
                    log::warn!("journal checksum mismatch at sequence {}, skipping", entry.sequence);
                    continue;
                }
                Err(e) => {
                    log::warn!("undecodable journal frame {:?}: {}", key, e);
                    continue;
                }
            };
            match entry.record() {
                Ok(record) => recovered.push(Recovered {
                    sequence: entry.sequence,
                    attempts: entry.attempts,
                    record,
                }),
                Err(e) => log::warn!("journal entry {} holds an invalid record: {}", entry.sequence, e),
            }
        }
        recovered.sort_by_key(|r| r.sequence);
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use ginger_core::KeyPath;

    fn record(n: usize) -> MutationRecord {
        MutationRecord::del(KeyPath::new(["animals".to_string(), n.to_string()]), "c1")
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut entry = JournalEntry::new(7, 0, &record(1)).unwrap();
        assert!(entry.verify());
        entry.payload[0] ^= 0xff;
        assert!(!entry.verify());
    }

    #[test]
    fn test_recover_in_sequence_order() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let journal = QueueJournal::new(Arc::clone(&backend));
        // 256 sorts after 2 only with big-endian keys.
        journal.write(256, 0, &record(256)).unwrap();
        journal.write(2, 1, &record(2)).unwrap();
        journal.write(3, 0, &record(3)).unwrap();
        journal.remove(3).unwrap();

        let recovered = journal.recover().unwrap();
        let seqs: Vec<u64> = recovered.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![2, 256]);
        assert_eq!(recovered[0].attempts, 1);
        assert_eq!(recovered[0].record, record(2));
    }

    #[test]
    fn test_corrupt_frames_are_skipped() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let journal = QueueJournal::new(Arc::clone(&backend));
        journal.write(1, 0, &record(1)).unwrap();
        backend.put(&QueueJournal::key(2), b"garbage").unwrap();

        let recovered = journal.recover().unwrap();
        assert_eq!(recovered.len(), 1);
    }
}
