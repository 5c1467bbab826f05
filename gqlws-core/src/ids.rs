use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one operation within a connection.
///
/// Clients of the current protocol send string ids while older clients send
/// integers; whichever form arrives is echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationId {
    Number(u64),
    Text(String),
}

impl OperationId {
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(OperationId::Text(s.clone())),
            serde_json::Value::Number(n) => n.as_u64().map(OperationId::Number),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            OperationId::Number(n) => serde_json::Value::from(*n),
            OperationId::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationId::Number(n) => write!(f, "{}", n),
            OperationId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for OperationId {
    fn from(value: u64) -> Self {
        OperationId::Number(value)
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        OperationId::Text(value.to_string())
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        OperationId::Text(value)
    }
}

/// Hands out operation ids for one client connection: 0, 1, 2, ...
///
/// Ids are never reused, even after the operation that held one is released.
#[derive(Debug)]
pub struct OperationIdAllocator {
    next: AtomicU64,
}

impl OperationIdAllocator {
    pub fn new() -> Self {
        OperationIdAllocator {
            next: AtomicU64::new(0),
        }
    }

    pub fn allocate(&self) -> OperationId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        OperationId::Text(id.to_string())
    }

    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for OperationIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Executor-internal handle for a live subscription. Opaque to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(value: u64) -> Self {
        SubscriptionHandle(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionHandle({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_allocator_starts_at_zero_and_increases() {
        let allocator = OperationIdAllocator::new();

        assert_eq!(allocator.allocate(), OperationId::from("0"));
        assert_eq!(allocator.allocate(), OperationId::from("1"));
        assert_eq!(allocator.allocate(), OperationId::from("2"));
        assert_eq!(allocator.peek_next(), 3);
    }

    #[test]
    fn test_allocator_thread_safety() {
        let allocator = Arc::new(OperationIdAllocator::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let alloc = Arc::clone(&allocator);
            handles.push(thread::spawn(move || {
                (0..50).map(|_| alloc.allocate()).collect::<Vec<_>>()
            }));
        }

        let mut all_ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all_ids.insert(id.clone()), "Duplicate ID found: {}", id);
            }
        }
        assert_eq!(all_ids.len(), 400);
    }

    #[test]
    fn test_id_json_forms_are_preserved() {
        let numeric: OperationId = serde_json::from_str("7").unwrap();
        assert_eq!(numeric, OperationId::Number(7));
        assert_eq!(serde_json::to_string(&numeric).unwrap(), "7");

        let text: OperationId = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(text, OperationId::from("7"));
        assert_eq!(serde_json::to_string(&text).unwrap(), "\"7\"");

        assert_ne!(numeric, text);
    }

    #[test]
    fn test_id_from_json_rejects_other_shapes() {
        assert!(OperationId::from_json(&serde_json::json!(null)).is_none());
        assert!(OperationId::from_json(&serde_json::json!(-1)).is_none());
        assert!(OperationId::from_json(&serde_json::json!({"id": 1})).is_none());
        assert!(OperationId::from_json(&serde_json::json!(1.5)).is_none());
    }
}
