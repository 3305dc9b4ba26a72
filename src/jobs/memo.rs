//! Canonical params hashing for result memoization.
//!
//! Identical params must hash identically regardless of field order, so
//! objects are serialized with keys sorted at every depth.

use sha2::{Digest, Sha256};

use crate::context::ContextCarrier;
use crate::jobs::model::JobType;

/// Compact JSON with object keys sorted recursively.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hex SHA-256 of the canonical form of `params`.
pub fn params_hash(params: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(params).as_bytes());
    hex::encode(hasher.finalize())
}

/// Param added by the dispatcher when a job is delegated. Not part of the
/// caller's request, so it is excluded from the memo key.
pub const DELEGATED_TO_PARAM: &str = "delegated_to";

/// Resource id of the memoized result for `(job_type, params)` run in `ctx`.
///
/// The target collection is part of the key for every job type, and the
/// executing agent for agent executions, so a memo never answers a job
/// whose side effects land somewhere else.
pub fn memo_resource_id(
    job_type: JobType,
    ctx: &ContextCarrier,
    params: &serde_json::Value,
) -> String {
    let request = match params.as_object() {
        Some(map) if map.contains_key(DELEGATED_TO_PARAM) => {
            let mut request = map.clone();
            request.remove(DELEGATED_TO_PARAM);
            serde_json::Value::Object(request)
        }
        _ => params.clone(),
    };
    let agent = match job_type {
        JobType::AgentExecution => ctx.agent_id(),
        _ => None,
    };
    let hash = params_hash(&serde_json::json!({
        "params": request,
        "collection": ctx.collection_id(),
        "agent": agent,
    }));
    format!("{}:{hash}", job_type.as_str())
}
