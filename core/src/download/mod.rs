//! Model artifact downloads.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`manager`] | Transport, task state, single-file and directory fetches |
//! | [`strategy`] | Per-format manifest derivation for directory packages |

mod manager;
mod strategy;

pub use manager::{
    verify_sha256, DownloadManager, DownloadProgress, DownloadTask, DownloadTransport,
    HttpTransport, TaskState, TransportResponse,
};
pub use strategy::{canonical_remote_dir, DownloadStrategy, MlPackageStrategy, WhisperBundleStrategy};
