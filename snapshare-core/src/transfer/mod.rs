//! Blob transfers: the single-item client and the batch coordinators built
//! on top of it.

pub mod client;
pub mod download;
pub mod job;
pub mod progress;
pub mod upload;

pub use client::BlobTransferClient;
pub use download::{DownloadCoordinator, DownloadReport};
pub use job::{BatchId, JobState, JobTransition, RetryPolicy, TransferJob};
pub use progress::{BatchOutcome, BatchPhase, BatchSnapshot, ProgressSmoother};
pub use upload::{BatchHandle, BatchReport, UploadContext, UploadCoordinator};
