//! Upload and retention knobs.
//!
//! The engine itself never uploads; these values are read by whatever
//! collaborator ships finished trace files off the device.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Total bytes the uploader may consume per time period.
    pub upload_max_bytes: u64,
    /// Bytes granted back per elapsed period.
    pub upload_bytes_per_update: u64,
    /// Length of one accounting period.
    pub upload_time_period: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            upload_max_bytes: 10_000_000,
            upload_bytes_per_update: 0,
            upload_time_period: Duration::from_secs(60 * 60),
        }
    }
}
