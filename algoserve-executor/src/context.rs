//! Per-task context store.
//!
//! The worker loop (and the inline executor) installs the current task's
//! bindings into a thread-local slot before invoking user code and clears
//! it afterwards. Inside `run`, user code reads the request through the
//! `current_*` getters and stages response metadata through the `set_*`
//! setters; the executor captures whatever was staged on every exit path.
//!
//! The store is strictly task-local: installing a scope clears any staged
//! metadata, and dropping the guard removes the bindings, so nothing leaks
//! between tasks sharing a worker.

use std::cell::RefCell;

use algoserve_core::envelope::AlgorithmContext;
use algoserve_core::execution::ResponseMeta;
use chrono::{DateTime, Utc};

/// Request-side bindings installed for one task.
#[derive(Debug, Clone, Default)]
pub struct TaskBindings {
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub context: Option<AlgorithmContext>,
    pub request_datetime: Option<DateTime<Utc>>,
}

struct TaskScope {
    bindings: TaskBindings,
    staged: ResponseMeta,
}

thread_local! {
    static CURRENT: RefCell<Option<TaskScope>> = const { RefCell::new(None) };
}

/// Guard keeping a task scope installed; dropping it clears the slot.
pub struct ScopeGuard {
    _private: (),
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        CURRENT.with(|slot| slot.borrow_mut().take());
    }
}

/// Install `bindings` for the current thread. Response metadata starts
/// cleared; the previous scope (if any) is discarded.
pub fn install(bindings: TaskBindings) -> ScopeGuard {
    CURRENT.with(|slot| {
        *slot.borrow_mut() = Some(TaskScope {
            bindings,
            staged: ResponseMeta::default(),
        });
    });
    ScopeGuard { _private: () }
}

/// Staged response metadata, if any; `None` outside a scope or when user
/// code staged nothing.
pub fn capture_response_meta() -> Option<ResponseMeta> {
    CURRENT.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|scope| scope.staged.clone())
            .filter(|meta| !meta.is_empty())
    })
}

// ── Read API (user code) ────────────────────────────────────────────────────

/// The `requestId` of the task currently executing on this thread.
pub fn current_request_id() -> Option<String> {
    CURRENT.with(|slot| {
        slot.borrow()
            .as_ref()
            .and_then(|scope| scope.bindings.request_id.clone())
    })
}

/// The `traceId` of the current task, from the request context.
pub fn current_trace_id() -> Option<String> {
    CURRENT.with(|slot| {
        slot.borrow()
            .as_ref()
            .and_then(|scope| scope.bindings.trace_id.clone())
    })
}

/// The caller context of the current task.
pub fn current_context() -> Option<AlgorithmContext> {
    CURRENT.with(|slot| {
        slot.borrow()
            .as_ref()
            .and_then(|scope| scope.bindings.context.clone())
    })
}

/// The request timestamp of the current task.
pub fn current_request_datetime() -> Option<DateTime<Utc>> {
    CURRENT.with(|slot| {
        slot.borrow()
            .as_ref()
            .and_then(|scope| scope.bindings.request_datetime)
    })
}

// ── Write API (user code) ───────────────────────────────────────────────────

fn with_staged(f: impl FnOnce(&mut ResponseMeta)) {
    CURRENT.with(|slot| {
        if let Some(scope) = slot.borrow_mut().as_mut() {
            f(&mut scope.staged);
        }
    });
}

/// Stage a response `code` override for the current task.
pub fn set_response_code(code: i64) {
    with_staged(|meta| meta.code = Some(code));
}

/// Stage a response `message` override for the current task.
pub fn set_response_message(message: impl Into<String>) {
    let message = message.into();
    with_staged(|meta| meta.message = Some(message));
}

/// Stage a response `context` for the current task. The envelope carries a
/// context only when this was called.
pub fn set_response_context(context: AlgorithmContext) {
    with_staged(|meta| meta.context = Some(context));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(request_id: &str) -> TaskBindings {
        TaskBindings {
            request_id: Some(request_id.to_string()),
            trace_id: Some("t-1".to_string()),
            context: None,
            request_datetime: Some("2026-01-01T00:00:00Z".parse().unwrap()),
        }
    }

    #[test]
    fn getters_read_installed_bindings() {
        let _guard = install(bindings("r1"));
        assert_eq!(current_request_id().as_deref(), Some("r1"));
        assert_eq!(current_trace_id().as_deref(), Some("t-1"));
        assert!(current_context().is_none());
        assert!(current_request_datetime().is_some());
    }

    #[test]
    fn scope_clears_on_drop() {
        {
            let _guard = install(bindings("r1"));
            set_response_code(201);
        }
        assert!(current_request_id().is_none());
        assert!(capture_response_meta().is_none());
    }

    #[test]
    fn staged_meta_is_captured() {
        let _guard = install(bindings("r1"));
        set_response_code(201);
        set_response_message("created");
        let mut ctx = AlgorithmContext::default();
        ctx.trace_id = Some("rt".to_string());
        set_response_context(ctx);

        let meta = capture_response_meta().unwrap();
        assert_eq!(meta.code, Some(201));
        assert_eq!(meta.message.as_deref(), Some("created"));
        assert_eq!(meta.context.unwrap().trace_id.as_deref(), Some("rt"));
    }

    #[test]
    fn setters_are_idempotent_within_a_task() {
        let _guard = install(bindings("r1"));
        set_response_code(201);
        set_response_code(201);
        set_response_message("created");
        set_response_message("created");
        let meta = capture_response_meta().unwrap();
        assert_eq!(meta.code, Some(201));
        assert_eq!(meta.message.as_deref(), Some("created"));
    }

    #[test]
    fn fresh_scope_starts_with_cleared_meta() {
        {
            let _guard = install(bindings("r1"));
            set_response_code(500);
        }
        let _guard = install(bindings("r2"));
        assert!(capture_response_meta().is_none());
        assert_eq!(current_request_id().as_deref(), Some("r2"));
    }

    #[test]
    fn setters_outside_a_scope_are_ignored() {
        set_response_code(999);
        assert!(capture_response_meta().is_none());
    }
}
