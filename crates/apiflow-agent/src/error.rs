// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while wiring up or running the agent core.
///
/// Nothing on the per-event hot path produces these: malformed payloads and
/// identifiers degrade to zero values and are only counted and logged.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to post to intake: {0}")]
    Intake(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AgentError::InvalidConfig("missing trace intake url".to_string());
        assert_eq!(
            error.to_string(),
            "invalid configuration: missing trace intake url"
        );
    }

    #[test]
    fn test_error_debug() {
        let error = AgentError::InvalidConfig("x".to_string());
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("InvalidConfig"));
    }
}
