use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// 16 lower-hex characters correlating remote commands with their initiator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceId(String);

impl TraceId {
    pub fn generate() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TraceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            Ok(Self(s.to_string()))
        } else {
            Err(anyhow::anyhow!("trace id must be 16 lower-hex chars: {s:?}"))
        }
    }
}

/// Per-invocation identity passed explicitly down every call chain.
///
/// Replaces any notion of globally mutable request/trace state; the logging
/// span carries both ids so every line emitted under it is correlated.
#[derive(Clone, Debug)]
pub struct OpContext {
    pub request_id: Uuid,
    pub trace_id: TraceId,
}

impl OpContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            trace_id: TraceId::generate(),
        }
    }

    pub fn with_request_id(request_id: Uuid) -> Self {
        Self {
            request_id,
            trace_id: TraceId::generate(),
        }
    }

    pub fn span(&self, function_name: &str) -> tracing::Span {
        tracing::info_span!(
            "operation",
            function_name,
            request_id = %self.request_id,
            trace_id = %self.trace_id,
        )
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}
