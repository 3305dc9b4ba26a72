//! Compound cache keys.
//!
//! Layout: `tenant:{t}[|agent:{a}][|collection:{c}][|conversation:{v}]|{data_type}:{resource}`.
//! The tenant segment is always outermost; the only constructor takes a
//! [`ContextCarrier`], which cannot exist without a tenant.

use crate::cache::ttl::DataType;
use crate::context::ContextCarrier;

/// A tenant-prefixed cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    key: String,
    data_type: DataType,
    tenant_len: usize,
}

impl CacheKey {
    /// Build the key for `resource_id` of `data_type` under `ctx`.
    pub fn build(data_type: DataType, ctx: &ContextCarrier, resource_id: &str) -> Self {
        let scope = data_type.key_scope();
        let tenant = format!("tenant:{}", escape(ctx.tenant_id()));
        let tenant_len = tenant.len();
        let mut segments = vec![tenant];

        if scope.agent {
            if let Some(agent) = ctx.agent_id() {
                segments.push(format!("agent:{}", escape(agent)));
            }
        }
        if scope.collection {
            if let Some(collection) = ctx.collection_id() {
                segments.push(format!("collection:{}", escape(collection)));
            }
        }
        if scope.conversation {
            if let Some(conversation) = ctx.conversation_id() {
                segments.push(format!("conversation:{}", escape(conversation)));
            }
        }
        segments.push(format!("{}:{}", data_type.as_str(), escape(resource_id)));

        Self {
            key: segments.join("|"),
            data_type,
            tenant_len,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// The `tenant:{t}` segment.
    pub fn tenant_segment(&self) -> &str {
        &self.key[..self.tenant_len]
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Keep separators out of user-supplied segments so two different inputs
/// never collapse to one key.
fn escape(segment: &str) -> String {
    segment
        .replace('%', "%25")
        .replace('|', "%7C")
        .replace(':', "%3A")
}
