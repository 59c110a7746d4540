//! `pth_die` / `pth_catch` / `pth_exit`, reimplemented on `std::panic`
//! rather than a hand-rolled stack of exit-labels (`spec.md` §9: "pick one
//! mechanism and document it" — nested `catch_unwind` calls already give
//! us exactly the innermost-catches-first nesting the source's label stack
//! was providing).

use std::panic::{self, AssertUnwindSafe, UnwindSafe};

/// Payload of a [`die`] call; caught (and turned into `Some(message)`) by
/// the nearest enclosing [`catch`].
pub(crate) struct DieSignal(pub String);

/// Payload of an [`exit`] call, or of a fiber's watchdog firing. Never
/// caught by [`catch`] — it always propagates to the fiber's own runner,
/// which treats it as ordinary fiber termination.
pub(crate) struct ExitSignal;

/// Aborts the current fiber with `message`, unwinding to the nearest
/// enclosing [`catch`]. If nothing is currently catching, the fiber's
/// runner logs the message and terminates the fiber (not the process).
pub fn die(message: impl Into<String>) -> ! {
    panic::panic_any(DieSignal(message.into()))
}

/// Unconditionally and unrecoverably terminates the current fiber. Unlike
/// [`die`], this is never intercepted by [`catch`].
pub fn exit() -> ! {
    panic::panic_any(ExitSignal)
}

/// Runs `f`, catching a [`die`] that escapes it and returning its message.
/// Returns `None` if `f` returns normally. An [`exit`] (including one
/// delivered by a fired watchdog) or any other panic propagates through
/// unchanged — only `die` is caught.
pub fn catch<F, T>(f: F) -> Option<String>
where
    F: FnOnce() -> T + UnwindSafe,
{
    match panic::catch_unwind(AssertUnwindSafe(|| {
        f();
    })) {
        Ok(()) => None,
        Err(payload) => match payload.downcast::<DieSignal>() {
            Ok(die) => Some(die.0),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_returns_die_message() {
        assert_eq!(catch(|| die("boom")), Some("boom".to_string()));
    }

    #[test]
    fn catch_returns_none_on_normal_return() {
        assert_eq!(catch(|| 42), None);
    }

    #[test]
    fn nested_catch_delivers_to_innermost() {
        let outer = catch(|| {
            let inner = catch(|| die("inner"));
            assert_eq!(inner, Some("inner".to_string()));
        });
        assert_eq!(outer, None);
    }

    #[test]
    #[should_panic]
    fn catch_does_not_intercept_exit() {
        catch(|| exit());
    }
}
