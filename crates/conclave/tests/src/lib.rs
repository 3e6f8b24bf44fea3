//! Shared fixtures for the cross-crate suites under `tests/`.
//!
//! A [`Harness`] owns a temporary data directory holding a generated writer
//! key, three registered approvers and a manual clock, and opens kernels
//! over it. Reopening the same harness simulates a restart.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conclave_ceremony::{ApprovalRole, Ceremony, FailoverHandler, SignedApproval};
use conclave_kernel::{ApproverEntry, ConstitutionalKernel, KernelConfig, KeyDirectory, StorageConfig, TrustAnchor};
use conclave_signing::{crypto, SoftwareKeyCustody};
use conclave_types::{ApproverId, Clock, ContentHash, EventPayload, KeyId, ManualClock};
use ed25519_dalek::SigningKey;
use tempfile::TempDir;

pub const WRITER: &str = "writer-1";
pub const APPROVERS: [&str; 3] = ["alice", "bob", "carol"];

/// Records every promotion instead of touching a real writer.
#[derive(Default)]
pub struct RecordingFailover {
    promotions: Mutex<Vec<(String, String)>>,
}

impl RecordingFailover {
    pub fn promotions(&self) -> Vec<(String, String)> {
        self.promotions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl FailoverHandler for RecordingFailover {
    async fn promote(&self, previous: &str, new: &str) -> Result<(), String> {
        self.promotions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((previous.to_string(), new.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub config: KernelConfig,
    pub custody: Arc<SoftwareKeyCustody>,
    pub clock: Arc<ManualClock>,
    pub failover: Arc<RecordingFailover>,
    approvers: Vec<(ApproverId, SigningKey)>,
    dir: TempDir,
}

impl Harness {
    pub async fn new(storage: StorageConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = KernelConfig::development(dir.path());
        config.storage = storage;

        let keys = KeyDirectory::new(config.key_dir());
        let writer = keys.generate(&KeyId::new(WRITER)).expect("writer key");
        config.trust_anchors.push(TrustAnchor {
            key_id: WRITER.into(),
            public_key: writer,
        });

        let mut approvers = Vec::new();
        for name in APPROVERS {
            let key = crypto::generate_signing_key();
            config.approvers.push(ApproverEntry {
                id: name.into(),
                public_key: crypto::public_key_hex(&key.verifying_key()),
                role: ApprovalRole::Approver,
                organisation: None,
            });
            approvers.push((ApproverId::new(name), key));
        }

        let custody = keys.load_custody(&KeyId::new(WRITER)).await.expect("custody");
        Self {
            config,
            custody: Arc::new(custody),
            clock: Arc::new(ManualClock::starting_now()),
            failover: Arc::new(RecordingFailover::default()),
            approvers,
            dir,
        }
    }

    /// Memory storage, nothing survives a reopen.
    pub async fn in_memory() -> Self {
        Self::new(StorageConfig::Memory).await
    }

    /// WAL-backed storage in the harness directory.
    pub async fn durable() -> Self {
        Self::new(StorageConfig::Wal {
            max_segment_bytes: 64 * 1024,
            fsync: true,
        })
        .await
    }

    pub async fn open(&self) -> ConstitutionalKernel {
        ConstitutionalKernel::open(
            self.config.clone(),
            self.custody.clone(),
            self.failover.clone(),
            self.clock.clone(),
        )
        .await
        .expect("kernel opens")
    }

    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn approver(&self, index: usize) -> ApproverId {
        self.approvers[index].0.clone()
    }

    /// A valid approval of `ceremony` by approver `index`.
    pub fn approve(&self, index: usize, ceremony: &Ceremony) -> SignedApproval {
        let (approver, key) = &self.approvers[index];
        SignedApproval::sign(
            approver.clone(),
            ApprovalRole::Approver,
            key,
            &ceremony.id,
            ceremony.ceremony_type,
            &ceremony.subject,
            self.clock.now(),
        )
        .unwrap()
    }

    /// An approval signed with a key nobody registered.
    pub fn forged_approval(&self, index: usize, ceremony: &Ceremony) -> SignedApproval {
        SignedApproval::sign(
            self.approvers[index].0.clone(),
            ApprovalRole::Approver,
            &crypto::generate_signing_key(),
            &ceremony.id,
            ceremony.ceremony_type,
            &ceremony.subject,
            self.clock.now(),
        )
        .unwrap()
    }
}

pub fn vote_tally(motion: &str, n: u64) -> EventPayload {
    EventPayload::StateRecorded {
        subject: format!("motion:{motion}"),
        state_kind: "vote_tally".into(),
        state_hash: ContentHash::hash(&n.to_le_bytes()),
    }
}

/// Record `count` vote tallies spread over a few motions.
pub async fn fill(kernel: &ConstitutionalKernel, count: u64) {
    for n in 0..count {
        kernel
            .record(vote_tally(&(n % 7).to_string(), n))
            .await
            .expect("append");
    }
}
