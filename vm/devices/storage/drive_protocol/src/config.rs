// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::Deserialize;
use serde::Serialize;

/// Knobs for the generic classification rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    /// Escalate predictive-failure recovered errors to end of life. When
    /// clear they are only logged.
    pub pfa_handling: bool,
    /// Reject media errors on writes whose bad LBA lies outside the
    /// command's range.
    pub check_bad_lba_range: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            pfa_handling: false,
            check_bad_lba_range: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn missing_fields_take_defaults() {
        let config: ClassifierConfig = serde_json::from_str(r#"{"pfa_handling": true}"#).unwrap();
        assert!(config.pfa_handling);
        assert!(config.check_bad_lba_range);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(serde_json::from_str::<ClassifierConfig>(r#"{"pfa": true}"#).is_err());
    }
}
