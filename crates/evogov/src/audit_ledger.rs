//! Append-only, hash-chained ledger of promotion decisions.
//!
//! Every decision the promotion pipeline reaches — promote, rollback, or
//! block — is written exactly once as a [`ProofArtifact`] whose hash covers
//! a canonical serialization of every field and links to the hash of its
//! predecessor. Any in-place edit of a stored record breaks the chain at a
//! verifiable index.
//!
//! The storage medium is an external collaborator behind [`LedgerStorage`]:
//! an append-only byte sink with a durability guarantee. This module owns
//! only the chaining logic; operational append-only enforcement (filesystem
//! permissions, write-once media) is assumed.
//!
//! A broken chain is the one fail-stop condition in the system: a corrupted
//! ledger refuses all further appends until an operator intervenes, since
//! appending onto a broken chain would make every later audit meaningless.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::gate_evaluator::GateResult;

/// Schema version stamped into every artifact.
pub const PROOF_SCHEMA_VERSION: u32 = 1;

/// Hash of the predecessor of the first entry: 64 hex zeros.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Metadata key under which the pipeline records a run's metered cost, so
/// budget state can be replayed from the ledger at startup.
pub const COST_METADATA_KEY: &str = "cost_millionths";

// ---------------------------------------------------------------------------
// DecisionKind
// ---------------------------------------------------------------------------

/// Category of a recorded decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DecisionKind {
    /// Challenger passed the gate and replaces the champion.
    Promote,
    /// Challenger evaluated and rejected, or the run was cancelled.
    Rollback,
    /// Promotion blocked without a completed gate evaluation.
    Block,
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Promote => f.write_str("promote"),
            Self::Rollback => f.write_str("rollback"),
            Self::Block => f.write_str("block"),
        }
    }
}

// ---------------------------------------------------------------------------
// ProofArtifact
// ---------------------------------------------------------------------------

/// One immutable, hash-chained decision record.
///
/// `current_hash` is SHA-256 over the canonical serialization of the
/// artifact with `current_hash` itself set to the empty string; field order
/// is fixed by the struct and `metadata` is a `BTreeMap`, so serialization
/// is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofArtifact {
    /// Schema version of this record.
    pub schema_version: u32,
    /// Zero-based position in the chain.
    pub sequence_index: u64,
    /// Decision time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Unique decision identifier.
    pub decision_id: String,
    /// Category of the decision.
    pub decision_type: DecisionKind,
    /// Snapshot of the gate verdict and its evidence.
    pub metrics: GateResult,
    /// `current_hash` of the predecessor, or [`GENESIS_HASH`].
    pub previous_hash: String,
    /// SHA-256 over the canonical serialization of every other field.
    pub current_hash: String,
    /// Additional structured evidence, deterministically ordered.
    pub metadata: BTreeMap<String, String>,
}

impl ProofArtifact {
    /// Recompute this artifact's hash from its own fields.
    pub fn canonical_hash(&self) -> Result<String, LedgerError> {
        let mut unsealed = self.clone();
        unsealed.current_hash = String::new();
        let bytes = serde_json::to_vec(&unsealed).map_err(|e| LedgerError::Encoding {
            detail: e.to_string(),
        })?;
        Ok(sha256_hex(&bytes))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ---------------------------------------------------------------------------
// DecisionRecord — append input
// ---------------------------------------------------------------------------

/// The decision data a caller submits for appending. The ledger assigns
/// the sequence index and the hash links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_id: String,
    pub decision_type: DecisionKind,
    pub metrics: GateResult,
    pub timestamp_ms: u64,
    pub metadata: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// LedgerError
// ---------------------------------------------------------------------------

/// Errors from ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerError {
    /// The chain is broken; no further appends are accepted.
    ChainCorrupted { first_invalid_index: u64 },
    /// The storage collaborator failed.
    Storage { detail: String },
    /// A record could not be serialized or deserialized.
    Encoding { detail: String },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChainCorrupted {
                first_invalid_index,
            } => write!(
                f,
                "ledger chain corrupted at index {first_invalid_index}; appends refused"
            ),
            Self::Storage { detail } => write!(f, "ledger storage failure: {detail}"),
            Self::Encoding { detail } => write!(f, "ledger encoding failure: {detail}"),
        }
    }
}

impl std::error::Error for LedgerError {}

// ---------------------------------------------------------------------------
// LedgerStorage — external append-only byte sink
// ---------------------------------------------------------------------------

/// Append-only record storage. Offsets are record indices.
pub trait LedgerStorage: Send {
    /// Durably append one record as a single atomic operation, returning
    /// its record index.
    fn append_atomic(&mut self, record: &[u8]) -> Result<u64, LedgerError>;

    /// Read every record at or after `offset`, in order.
    fn read_from(&self, offset: u64) -> Result<Vec<Vec<u8>>, LedgerError>;
}

/// Volatile storage for tests and lab runs.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    records: Vec<Vec<u8>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate a stored record in place. Exists so tests can prove that
    /// tampering is detected; real storage has no such operation.
    pub fn corrupt(&mut self, index: usize, bytes: Vec<u8>) {
        if let Some(record) = self.records.get_mut(index) {
            *record = bytes;
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl LedgerStorage for InMemoryStorage {
    fn append_atomic(&mut self, record: &[u8]) -> Result<u64, LedgerError> {
        self.records.push(record.to_vec());
        Ok(self.records.len() as u64 - 1)
    }

    fn read_from(&self, offset: u64) -> Result<Vec<Vec<u8>>, LedgerError> {
        Ok(self
            .records
            .iter()
            .skip(offset as usize)
            .cloned()
            .collect())
    }
}

/// Newline-delimited records in an append-mode file.
///
/// Each record is written with its trailing newline in one `write_all`
/// call and synced before the append returns. Records are JSON and contain
/// no raw newlines.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    record_count: Option<u64>,
}

impl FileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            record_count: None,
        }
    }
}

impl LedgerStorage for FileStorage {
    fn append_atomic(&mut self, record: &[u8]) -> Result<u64, LedgerError> {
        let existing = match self.record_count {
            Some(count) => count,
            None => self.read_from(0)?.len() as u64,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LedgerError::Storage {
                detail: e.to_string(),
            })?;
        let mut line = Vec::with_capacity(record.len() + 1);
        line.extend_from_slice(record);
        line.push(b'\n');
        file.write_all(&line).map_err(|e| LedgerError::Storage {
            detail: e.to_string(),
        })?;
        file.sync_data().map_err(|e| LedgerError::Storage {
            detail: e.to_string(),
        })?;
        self.record_count = Some(existing + 1);
        Ok(existing)
    }

    fn read_from(&self, offset: u64) -> Result<Vec<Vec<u8>>, LedgerError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(LedgerError::Storage {
                    detail: e.to_string(),
                });
            }
        };
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| LedgerError::Storage {
                detail: e.to_string(),
            })?;
            if !line.is_empty() {
                records.push(line.into_bytes());
            }
        }
        Ok(records.into_iter().skip(offset as usize).collect())
    }
}

// ---------------------------------------------------------------------------
// ChainVerification
// ---------------------------------------------------------------------------

/// Outcome of a full chain walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    /// Index of the first record whose hash or link fails, if any.
    pub first_invalid_index: Option<u64>,
    pub entries_checked: u64,
}

// ---------------------------------------------------------------------------
// AuditLedger
// ---------------------------------------------------------------------------

/// The chained ledger over an injected storage collaborator.
pub struct AuditLedger {
    storage: Box<dyn LedgerStorage>,
    next_index: u64,
    last_hash: String,
    corrupted_at: Option<u64>,
}

impl fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLedger")
            .field("next_index", &self.next_index)
            .field("last_hash", &self.last_hash)
            .field("corrupted_at", &self.corrupted_at)
            .finish_non_exhaustive()
    }
}

impl AuditLedger {
    /// Open a ledger, replaying existing records to recover the chain tail.
    ///
    /// A broken chain does not fail the open — the ledger is readable for
    /// diagnosis — but it is poisoned and refuses appends.
    pub fn open(storage: Box<dyn LedgerStorage>) -> Result<Self, LedgerError> {
        let mut ledger = Self {
            storage,
            next_index: 0,
            last_hash: GENESIS_HASH.to_string(),
            corrupted_at: None,
        };
        let verification = ledger.walk_chain()?;
        if let Some(index) = verification.first_invalid_index {
            ledger.corrupted_at = Some(index);
        }
        Ok(ledger)
    }

    /// Append one decision, sealing it into the chain.
    pub fn append(&mut self, record: DecisionRecord) -> Result<ProofArtifact, LedgerError> {
        if let Some(first_invalid_index) = self.corrupted_at {
            return Err(LedgerError::ChainCorrupted {
                first_invalid_index,
            });
        }

        let mut artifact = ProofArtifact {
            schema_version: PROOF_SCHEMA_VERSION,
            sequence_index: self.next_index,
            timestamp_ms: record.timestamp_ms,
            decision_id: record.decision_id,
            decision_type: record.decision_type,
            metrics: record.metrics,
            previous_hash: self.last_hash.clone(),
            current_hash: String::new(),
            metadata: record.metadata,
        };
        artifact.current_hash = artifact.canonical_hash()?;

        let bytes = serde_json::to_vec(&artifact).map_err(|e| LedgerError::Encoding {
            detail: e.to_string(),
        })?;
        self.storage.append_atomic(&bytes)?;

        self.next_index += 1;
        self.last_hash = artifact.current_hash.clone();
        Ok(artifact)
    }

    /// Walk every record, checking self-hashes and predecessor links.
    ///
    /// A failed verification poisons the ledger against further appends.
    pub fn verify_chain(&mut self) -> Result<ChainVerification, LedgerError> {
        let verification = self.walk_chain_readonly()?;
        if let Some(index) = verification.first_invalid_index {
            self.corrupted_at = Some(index);
        }
        Ok(verification)
    }

    /// All artifacts in chain order.
    pub fn read_all(&self) -> Result<Vec<ProofArtifact>, LedgerError> {
        let mut artifacts = Vec::new();
        for bytes in self.storage.read_from(0)? {
            let artifact: ProofArtifact =
                serde_json::from_slice(&bytes).map_err(|e| LedgerError::Encoding {
                    detail: e.to_string(),
                })?;
            artifacts.push(artifact);
        }
        Ok(artifacts)
    }

    /// Number of entries in the chain.
    pub fn len(&self) -> u64 {
        self.next_index
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    /// Hash of the most recent entry, or [`GENESIS_HASH`].
    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    /// Whether the ledger has been poisoned by a failed verification.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted_at.is_some()
    }

    /// Sum of metered costs recorded at or after a period boundary.
    ///
    /// Used at startup to reconstruct budget spend from the audit trail
    /// when no dedicated checkpoint exists.
    pub fn replay_spend_since(&self, period_start_ms: u64) -> Result<u64, LedgerError> {
        let mut total: u64 = 0;
        for artifact in self.read_all()? {
            if artifact.timestamp_ms < period_start_ms {
                continue;
            }
            if let Some(cost) = artifact.metadata.get(COST_METADATA_KEY) {
                if let Ok(cost) = cost.parse::<u64>() {
                    total = total.saturating_add(cost);
                }
            }
        }
        Ok(total)
    }

    // -- Internal --

    /// Walk used at open: recovers tail state while verifying.
    fn walk_chain(&mut self) -> Result<ChainVerification, LedgerError> {
        let verification = self.walk_chain_readonly()?;
        // Recover the tail from however much of the chain is intact.
        let artifacts = self.read_all().unwrap_or_default();
        let intact = match verification.first_invalid_index {
            Some(index) => index,
            None => artifacts.len() as u64,
        };
        self.next_index = intact;
        self.last_hash = if intact == 0 {
            GENESIS_HASH.to_string()
        } else {
            artifacts
                .get(intact as usize - 1)
                .map(|a| a.current_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string())
        };
        Ok(verification)
    }

    fn walk_chain_readonly(&self) -> Result<ChainVerification, LedgerError> {
        let records = self.storage.read_from(0)?;
        let mut previous_hash = GENESIS_HASH.to_string();
        let mut checked: u64 = 0;

        for (index, bytes) in records.iter().enumerate() {
            let index = index as u64;
            let artifact: ProofArtifact = match serde_json::from_slice(bytes) {
                Ok(artifact) => artifact,
                Err(_) => {
                    return Ok(ChainVerification {
                        valid: false,
                        first_invalid_index: Some(index),
                        entries_checked: checked,
                    });
                }
            };

            let recomputed = artifact.canonical_hash()?;
            let intact = artifact.sequence_index == index
                && artifact.previous_hash == previous_hash
                && artifact.current_hash == recomputed;
            if !intact {
                return Ok(ChainVerification {
                    valid: false,
                    first_invalid_index: Some(index),
                    entries_checked: checked,
                });
            }

            previous_hash = artifact.current_hash;
            checked += 1;
        }

        Ok(ChainVerification {
            valid: true,
            first_invalid_index: None,
            entries_checked: checked,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
