//! Terminal outcome of a job.
//!
//! Every job resolves to exactly one [`JobOutcome`], which the callback
//! publisher turns into exactly one outbound message.

use crate::types::Seed;

/// Images and seeds produced by a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    /// Blob-store reference tokens, one per result image.
    pub image_refs: Vec<String>,
    pub seeds: Vec<Seed>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success(JobResult),
    /// The job was terminally handled without a result. The reason is
    /// for logs only; the callback carries null result fields.
    Failure { reason: String },
}

impl JobOutcome {
    pub fn failure(reason: impl std::fmt::Display) -> Self {
        Self::Failure {
            reason: reason.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_keeps_reason_text() {
        let outcome = JobOutcome::failure("stage 0 failed");
        assert!(!outcome.is_success());
        assert_eq!(
            outcome,
            JobOutcome::Failure {
                reason: "stage 0 failed".into()
            }
        );
    }
}
