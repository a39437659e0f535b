use std::cell::RefCell;

use uuid::Uuid;

thread_local! {
    static CURRENT_TRACE_ID: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Per-decision trace id, propagated through logs and metrics.
///
/// 128-bit, rendered as 32 lowercase hex characters.
pub struct TraceContext;

impl TraceContext {
    /// Generate a fresh trace id.
    pub fn generate() -> String {
        Uuid::new_v4().as_simple().to_string()
    }

    /// The current thread's trace id, if one is in scope.
    pub fn current() -> Option<String> {
        CURRENT_TRACE_ID.with(|id| id.borrow().clone())
    }

    /// Set the current thread's trace id.
    pub fn set(trace_id: impl Into<String>) {
        CURRENT_TRACE_ID.with(|id| *id.borrow_mut() = Some(trace_id.into()));
    }

    /// Clear the current thread's trace id.
    pub fn clear() {
        CURRENT_TRACE_ID.with(|id| *id.borrow_mut() = None);
    }
}

/// RAII scope that installs a trace id for the current thread and
/// restores the previous one on drop.
pub struct TraceScope {
    previous: Option<String>,
}

impl TraceScope {
    /// Enter a scope with the given trace id.
    pub fn enter(trace_id: impl Into<String>) -> Self {
        let previous = TraceContext::current();
        TraceContext::set(trace_id);
        TraceScope { previous }
    }

    /// Enter a scope with a freshly generated trace id.
    pub fn new() -> (Self, String) {
        let id = TraceContext::generate();
        (TraceScope::enter(id.clone()), id)
    }
}

impl Drop for TraceScope {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(prev) => TraceContext::set(prev),
            None => TraceContext::clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_format() {
        let id = TraceContext::generate();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_scope_restores_previous() {
        TraceContext::clear();
        assert!(TraceContext::current().is_none());

        {
            let _outer = TraceScope::enter("aaaa");
            assert_eq!(TraceContext::current().as_deref(), Some("aaaa"));

            {
                let (_inner, id) = TraceScope::new();
                assert_eq!(TraceContext::current(), Some(id));
            }

            assert_eq!(TraceContext::current().as_deref(), Some("aaaa"));
        }

        assert!(TraceContext::current().is_none());
    }
}
