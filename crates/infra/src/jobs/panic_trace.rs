//! Backtraces of handler panics, captured where the panic happened.
//!
//! `catch_unwind` only hands back the payload, so a process-wide panic hook
//! stores the backtrace in a thread-local slot for the dispatcher to pick up.
//! The previously installed hook still runs.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic;
use std::sync::Once;

thread_local! {
    static LAST_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

pub(crate) fn install() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

/// Take the trace of the most recent panic on this thread.
pub(crate) fn take() -> Option<String> {
    LAST_TRACE.with(|slot| slot.borrow_mut().take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn fail_deep_inside() {
        panic!("deep failure");
    }

    #[test]
    fn trace_points_at_the_panic_site() {
        install();
        let _ = take();
        assert!(panic::catch_unwind(fail_deep_inside).is_err());

        let trace = take().unwrap();
        assert!(trace.contains("fail_deep_inside"));
        assert!(take().is_none());
    }
}
