use indexmap::IndexMap;

// ============================================================================
// Request Context
// ============================================================================
//
// Typed replacement for request-scoped values (tenant, trace). Built from
// inbound message headers by the consumer loop, or by the caller of a domain
// operation, and threaded explicitly through call signatures.
//
// ============================================================================

pub const HEADER_MESSAGE_ID: &str = "message_id";
pub const HEADER_TIMESTAMP: &str = "timestamp";
pub const HEADER_TENANT_ID: &str = "tenant_id";
pub const HEADER_TRACE_ID: &str = "trace_id";

/// Characters a tenant id may not contain. Tenant ids are embedded in cache
/// keys (`tenant:{tenant}:`), scan patterns and storage keys (`{tenant}/`), so
/// a separator or glob metacharacter would let one tenant alias another.
pub const TENANT_ID_RESERVED: &[char] = &[':', '/', '*', '?', '[', ']', '\\', '^'];

/// Whether `tenant_id` is safe to embed in a key. The empty id (no tenant)
/// is accepted here; callers that need a tenant check for it separately.
pub fn is_valid_tenant_id(tenant_id: &str) -> bool {
    !tenant_id
        .chars()
        .any(|c| TENANT_ID_RESERVED.contains(&c) || c.is_whitespace() || c.is_control())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant_id: Option<String>,
    pub trace_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            trace_id: None,
        }
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Empty header values count as absent.
    pub fn from_headers(headers: &IndexMap<String, String>) -> Self {
        let pick = |name: &str| {
            headers
                .get(name)
                .filter(|value| !value.is_empty())
                .cloned()
        };

        Self {
            tenant_id: pick(HEADER_TENANT_ID),
            trace_id: pick(HEADER_TRACE_ID),
        }
    }

    /// Copies tenant and trace ids into `headers` unless the caller already set them.
    pub fn write_headers(&self, headers: &mut IndexMap<String, String>) {
        if let Some(tenant_id) = self.tenant_id.as_deref().filter(|t| !t.is_empty()) {
            headers
                .entry(HEADER_TENANT_ID.to_string())
                .or_insert_with(|| tenant_id.to_string());
        }
        if let Some(trace_id) = self.trace_id.as_deref().filter(|t| !t.is_empty()) {
            headers
                .entry(HEADER_TRACE_ID.to_string())
                .or_insert_with(|| trace_id.to_string());
        }
    }

    pub fn tenant(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or("")
    }

    pub fn trace(&self) -> &str {
        self.trace_id.as_deref().unwrap_or("")
    }
}
