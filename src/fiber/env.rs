//! Per-fiber language/timezone overrides (`spec.md` §4.4).
//!
//! `LANG`/`LC_MESSAGES` and `TZ` are process-wide as far as the C library
//! is concerned, so the runtime fakes per-fiber values by setting the
//! process environment on every resume and clearing (or restoring the
//! previous fiber's values) on every suspend. Only the currently-running
//! fiber's view of the environment is ever observable between two
//! suspension points, which is all the contract promises.

use std::cell::RefCell;

const LANG_VAR: &str = "LANGUAGE";
const TZ_VAR: &str = "TZ";

thread_local! {
    /// Count of `set_language` calls, mirroring the source's message
    /// catalog refresh counter — bumped any time the current fiber's
    /// language override changes.
    static CATALOG_GENERATION: RefCell<u64> = RefCell::new(0);
}

#[derive(Default, Clone)]
pub(super) struct Overrides {
    pub language: Option<String>,
    pub timezone: Option<String>,
}

/// Sets the language override for the current fiber. Takes effect on its
/// next resume (including immediately, if called while running).
pub fn set_language(language: Option<String>) {
    super::with_current_record(|record| record.env.language = language);
    apply_current();
    CATALOG_GENERATION.with(|c| *c.borrow_mut() += 1);
}

/// Sets the timezone override for the current fiber.
pub fn set_timezone(timezone: Option<String>) {
    super::with_current_record(|record| record.env.timezone = timezone);
    apply_current();
}

pub fn language() -> Option<String> {
    super::with_current_record(|record| record.env.language.clone())
}

pub fn timezone() -> Option<String> {
    super::with_current_record(|record| record.env.timezone.clone())
}

/// Number of times `set_language` has changed the current fiber's
/// language override on this thread.
pub fn catalog_generation() -> u64 {
    CATALOG_GENERATION.with(|c| *c.borrow())
}

/// Applies the environment for whichever fiber is now current. Called by
/// the executor immediately after a resume.
pub(super) fn apply_current() {
    let overrides = super::with_current_record(|record| record.env.clone());
    apply(&overrides);
}

/// Clears the environment. Called by the executor immediately before a
/// fiber suspends, so that code running in the reactor (which has no
/// "current fiber") never observes a stale override.
pub(super) fn clear_on_suspend() {
    std::env::remove_var(LANG_VAR);
    std::env::remove_var(TZ_VAR);
}

fn apply(overrides: &Overrides) {
    match &overrides.language {
        Some(lang) => std::env::set_var(LANG_VAR, lang),
        None => std::env::remove_var(LANG_VAR),
    }
    match &overrides.timezone {
        Some(tz) => std::env::set_var(TZ_VAR, tz),
        None => std::env::remove_var(TZ_VAR),
    }
}
