//! Scenario verification results.

use serde::{Deserialize, Serialize};

/// Result of verifying one scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub case_name: String,
    pub passed: bool,
    /// One line per failed check.
    pub mismatches: Vec<String>,
    /// Graph state digest when the controller was built.
    pub digest_before: String,
    /// Graph state digest after the last call.
    pub digest_after: String,
    /// Decisions committed during the scenario.
    pub decisions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<VerificationResult>,
}

impl VerificationSummary {
    #[must_use]
    pub fn from_results(results: Vec<VerificationResult>) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        Self {
            total,
            passed,
            failed: total - passed,
            results,
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    /// Names of failed cases with their first mismatch.
    #[must_use]
    pub fn failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| match r.mismatches.first() {
                Some(m) => format!("{}: {m}", r.case_name),
                None => r.case_name.clone(),
            })
            .collect()
    }
}
