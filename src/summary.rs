// Result Summary - final payload returned to the uploader

use serde::{Deserialize, Serialize};

/// Error details shown to the uploader; full counts are always preserved.
pub const DISPLAYED_ERROR_DETAILS: usize = 10;

// ============================================================================
// UPLOAD STATS
// ============================================================================

/// Per-batch accounting, accumulated in memory during the row loop.
/// Invariant: processed == successful + errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadStats {
    pub processed: usize,
    pub successful: usize,
    pub errors: usize,
    pub error_details: Vec<String>,
}

impl UploadStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.processed += 1;
        self.successful += 1;
    }

    pub fn record_failure(&mut self, row_number: usize, reason: impl std::fmt::Display) {
        self.processed += 1;
        self.errors += 1;
        self.error_details.push(format!("Row {row_number}: {reason}"));
    }
}

// ============================================================================
// UPLOAD SUMMARY
// ============================================================================

/// What the caller gets back: counts plus a capped error-detail list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSummary {
    pub processed: usize,
    pub successful: usize,
    pub errors: usize,
    pub error_details: Vec<String>,
}

impl UploadSummary {
    /// Shape the final payload. Only the first few error details are shown;
    /// the rest collapse into a truncation marker.
    pub fn build(stats: &UploadStats) -> Self {
        let mut error_details: Vec<String> = stats
            .error_details
            .iter()
            .take(DISPLAYED_ERROR_DETAILS)
            .cloned()
            .collect();

        let hidden = stats.error_details.len().saturating_sub(DISPLAYED_ERROR_DETAILS);
        if hidden > 0 {
            error_details.push(format!("... y {hidden} más"));
        }

        UploadSummary {
            processed: stats.processed,
            successful: stats.successful,
            errors: stats.errors,
            error_details,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
