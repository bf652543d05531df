//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BenchSettings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{BenchSettings, DeadlinePolicy, MAX_BURST_SIZE};

/// Load settings from an optional file, then apply process env overrides.
///
/// A missing file yields defaults; invalid JSON is an error. The result is
/// validated before it is returned.
pub fn load_settings(path: Option<&Path>) -> Result<BenchSettings> {
    load_settings_with(path, |key| std::env::var(key).ok())
}

/// Same as [`load_settings`] with an explicit variable lookup.
pub fn load_settings_with<F>(path: Option<&Path>, lookup: F) -> Result<BenchSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(BenchSettings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: BenchSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, lookup);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides read through `lookup`.
///
/// Names follow the load-test harness convention (`SUT_URL`, `NS`, `DB`,
/// `QUERY`, `VUS_COUNT`, ...). Empty values are ignored; numeric values
/// outside their range are ignored with a warning.
pub fn apply_overrides<F>(settings: &mut BenchSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |key: &str| lookup(key).filter(|v| !v.is_empty());

    // ── Target ──────────────────────────────────────────────────────
    if let Some(v) = string("SUT_URL") {
        settings.target.url = v;
    }
    if let Some(v) = string("SUT_USERNAME") {
        settings.target.username = v;
    }
    if let Some(v) = string("SUT_PASSWORD") {
        settings.target.password = v;
    }
    if let Some(v) = string("NS") {
        settings.target.namespace = v;
    }
    if let Some(v) = string("DB") {
        settings.target.database = v;
    }

    // ── Workload ────────────────────────────────────────────────────
    if let Some(v) = string("QUERY") {
        settings.workload.live_query = v;
    }
    if let Some(v) = string("WRITE_QUERY") {
        settings.workload.write_query = v;
    }
    if let Some(v) = ranged(&string, "BURST_NUMBER", 1, MAX_BURST_SIZE as u64) {
        settings.workload.burst_size = v as usize;
    }
    if let Some(v) = ranged(&string, "LOAD_WAIT_MS", 1, 3_600_000) {
        settings.workload.load_wait_ms = v;
    }

    // ── Scenario ────────────────────────────────────────────────────
    if let Some(v) = ranged(&string, "DURATION", 1, 86_400) {
        settings.scenario.duration_secs = v;
    }
    if let Some(v) = ranged(&string, "VUS_COUNT", 1, 100_000) {
        settings.scenario.vus = v as usize;
    }

    // ── Policy ──────────────────────────────────────────────────────
    if let Some(v) = string("DEADLINE_POLICY") {
        match v.parse::<DeadlinePolicy>() {
            Ok(policy) => settings.deadline_policy = policy,
            Err(_) => warn!(key = "DEADLINE_POLICY", value = %v, "invalid deadline policy, ignoring"),
        }
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn ranged<F>(string: &F, key: &str, min: u64, max: u64) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let val = string(key)?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key, value = %val, "invalid numeric env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
