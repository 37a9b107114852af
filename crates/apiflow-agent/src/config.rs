// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::env;
use std::time::Duration;

use crate::error::AgentError;

const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 3;
const DEFAULT_EXPORT_RETRIES: u32 = 3;
const DEFAULT_EXPORT_RETRY_BACKOFF_MS: u64 = 100;
const DEFAULT_SERVICE_ENV: &str = "DD_SERVICE,OTEL_SERVICE_NAME";

/// Process-filter rule set, fixed at construction of the filter.
///
/// Env and process-name rules carry a polarity: `true` admits on match,
/// `false` forbids. Path rules admit on presence alone.
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    /// Env var names whose values become the service name, scanned in order.
    pub svc_assign_env: Vec<String>,
    pub rule_env: HashMap<String, bool>,
    pub rule_process_name: HashMap<String, bool>,
    pub rule_path: HashSet<String>,
    /// Admit every PID unless something explicitly forbids it.
    pub any_process: bool,
    /// Admit nothing, regardless of rules.
    pub disable: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Intake endpoint for L7 statistics records.
    pub metrics_post_url: String,
    /// Intake endpoint for trace span records.
    pub trace_post_url: String,
    /// How often the exporter drains its batches.
    pub flush_interval: Duration,
    /// Retry attempts for a transiently failed intake POST.
    pub export_retries: u32,
    /// Base backoff between retries, grown linearly per attempt.
    pub export_retry_backoff: Duration,
    /// Attach trace identifiers to admitted requests.
    pub enable_trace: bool,
    /// Render trace/span ids as 64-bit decimals instead of 128-bit hex.
    pub conv_to_dd: bool,
    /// Tags stamped onto every emitted record.
    pub global_tags: HashMap<String, String>,
    pub filter: FilterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            metrics_post_url: "http://127.0.0.1:9529/v1/write/metric".to_string(),
            trace_post_url: "http://127.0.0.1:9529/v1/write/tracing".to_string(),
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            export_retries: DEFAULT_EXPORT_RETRIES,
            export_retry_backoff: Duration::from_millis(DEFAULT_EXPORT_RETRY_BACKOFF_MS),
            enable_trace: true,
            conv_to_dd: false,
            global_tags: HashMap::new(),
            filter: FilterConfig {
                svc_assign_env: split_list(DEFAULT_SERVICE_ENV),
                ..FilterConfig::default()
            },
        }
    }
}

impl Config {
    /// Builds a config from `APIFLOW_*` environment variables.
    ///
    /// The two intake URLs are required; everything else falls back to the
    /// defaults above. Rule lists are comma separated, e.g.
    /// `APIFLOW_ALLOW_PROCESSES=curl,wget` and `APIFLOW_DENY_PROCESSES=nginx`.
    pub fn from_env() -> Result<Config, AgentError> {
        let metrics_post_url = env::var("APIFLOW_METRICS_URL").map_err(|_| {
            AgentError::InvalidConfig("APIFLOW_METRICS_URL environment variable is not set".into())
        })?;
        let trace_post_url = env::var("APIFLOW_TRACE_URL").map_err(|_| {
            AgentError::InvalidConfig("APIFLOW_TRACE_URL environment variable is not set".into())
        })?;

        let flush_interval = env::var("APIFLOW_FLUSH_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(
                Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
                Duration::from_secs,
            );

        let svc_assign_env = env::var("APIFLOW_SERVICE_ENV")
            .map(|v| split_list(&v))
            .unwrap_or_else(|_| split_list(DEFAULT_SERVICE_ENV));

        let mut rule_env = HashMap::new();
        for key in env_list("APIFLOW_ALLOW_ENV") {
            rule_env.insert(key, true);
        }
        for key in env_list("APIFLOW_DENY_ENV") {
            rule_env.insert(key, false);
        }

        let mut rule_process_name = HashMap::new();
        for name in env_list("APIFLOW_ALLOW_PROCESSES") {
            rule_process_name.insert(name, true);
        }
        for name in env_list("APIFLOW_DENY_PROCESSES") {
            rule_process_name.insert(name, false);
        }

        let rule_path = env_list("APIFLOW_ALLOW_PATHS").into_iter().collect();

        let global_tags = env::var("APIFLOW_TAGS")
            .map(|v| parse_tags(&v))
            .unwrap_or_default();

        Ok(Config {
            metrics_post_url,
            trace_post_url,
            flush_interval,
            enable_trace: env_flag("APIFLOW_ENABLE_TRACE", true),
            conv_to_dd: env_flag("APIFLOW_CONV_TO_DD", false),
            global_tags,
            filter: FilterConfig {
                svc_assign_env,
                rule_env,
                rule_process_name,
                rule_path,
                any_process: env_flag("APIFLOW_ANY_PROCESS", false),
                disable: env_flag("APIFLOW_DISABLE_FILTER", false),
            },
            ..Config::default()
        })
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key).map_or(default, |v| v.to_lowercase() != "false")
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key).map(|v| split_list(&v)).unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `key:value` tags. Space-separated is the standard form; commas are
/// accepted as separators for compatibility.
fn parse_tags(value: &str) -> HashMap<String, String> {
    let normalized = value.replace(',', " ");
    let mut tags = HashMap::new();
    for kv in normalized.split_whitespace() {
        let parts = kv.split(':').collect::<Vec<&str>>();
        if parts.len() == 2 {
            tags.insert(parts[0].to_string(), parts[1].to_string());
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_service_env_order() {
        let config = Config::default();
        assert_eq!(
            config.filter.svc_assign_env,
            vec!["DD_SERVICE".to_string(), "OTEL_SERVICE_NAME".to_string()]
        );
    }

    #[test]
    fn split_list_trims_and_drops_empties() {
        assert_eq!(
            split_list(" a, b ,,c "),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn parse_tags_mixed_separators() {
        let tags = parse_tags("env:prod,host:web-1 bad:tag:extra");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.get("env"), Some(&"prod".to_string()));
        assert_eq!(tags.get("host"), Some(&"web-1".to_string()));
    }

    #[test]
    fn from_env_requires_intake_urls() {
        env::remove_var("APIFLOW_METRICS_URL");
        env::remove_var("APIFLOW_TRACE_URL");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("APIFLOW_METRICS_URL"));
    }
}
