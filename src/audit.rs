//! Tool-call audit logging and token-usage recording
//!
//! Both logs are append-only JSON-Lines files, one per UTC calendar day.
//! Writing is fire-and-forget: a failed write logs a warning and never
//! interrupts tool execution or the agent loop.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::backend::Usage;

#[derive(Serialize)]
struct AuditRecord<'a> {
    ts: String,
    tool: &'a str,
    args: &'a Value,
    result_length: usize,
    is_error: bool,
}

#[derive(Serialize)]
struct UsageRecord<'a> {
    ts: String,
    model: &'a str,
    input_tokens: u64,
    output_tokens: u64,
    cache_read_input_tokens: u64,
    cache_creation_input_tokens: u64,
}

fn append_jsonl<T: Serialize>(dir: &Path, record: &T) {
    let day = Utc::now().format("%Y-%m-%d");
    let path = dir.join(format!("{}.jsonl", day));

    let line = match serde_json::to_string(record) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "Failed to serialize log record");
            return;
        }
    };

    let result = std::fs::create_dir_all(dir).and_then(|_| {
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", line)
    });

    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to append log record");
    }
}

/// Append a tool call record to today's audit log.
pub fn audit_log(audit_dir: &Path, tool: &str, args: &Value, result: &str, is_error: bool) {
    append_jsonl(
        audit_dir,
        &AuditRecord {
            ts: Utc::now().to_rfc3339(),
            tool,
            args,
            result_length: result.len(),
            is_error,
        },
    );
}

/// Append a token usage record to today's usage log.
pub fn record_usage(usage_dir: &Path, model: &str, usage: &Usage) {
    append_jsonl(
        usage_dir,
        &UsageRecord {
            ts: Utc::now().to_rfc3339(),
            model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_input_tokens: usage.cache_read_input_tokens,
            cache_creation_input_tokens: usage.cache_creation_input_tokens,
        },
    );
}

/// Log token usage including cache stats.
pub fn log_usage(model: &str, usage: &Usage) {
    let cr = usage.cache_read_input_tokens;
    let cw = usage.cache_creation_input_tokens;
    info!(
        model,
        total_in = cr + cw + usage.input_tokens,
        cache_read = cr,
        cache_write = cw,
        uncached = usage.input_tokens,
        out = usage.output_tokens,
        "Tokens"
    );
}
