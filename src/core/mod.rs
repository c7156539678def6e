pub mod comparator;
pub mod hasher;
pub mod manifest;
pub mod scanner;
pub mod session;
pub mod snapshot;
pub mod transfer;

pub use comparator::{diff, DiffEntry, DiffKind, DiffSet, DiffSummary};
pub use hasher::{ContentHasher, DigestAlgorithm};
pub use manifest::{decode_manifest, ManifestRecord, ManifestStore};
pub use scanner::{LocalTreeScanner, ScanConfig};
pub use session::{ReconciliationSession, SessionOptions, SessionState, SyncEvents, SyncReport};
pub use snapshot::{normalize_relative_path, FileRecord, TreeSnapshot};
pub use transfer::{SyncOutcome, TransferConfig, TransferCoordinator, TransferProgress};
