//! Test hooks for deterministic interleaving of chain races.
//!
//! A retirement that decides to remove an exhausted child releases both of
//! its locks before `remove_child` reacquires them; that window is where a
//! concurrent reserve can slip in and repopulate the child, and the version
//! gate must turn the removal into a no-op. The hook below lets a test park
//! the retiring task inside the window (a barrier, a channel send) to force
//! that exact interleaving.
//!
//! Hooks are global; set them from one test at a time and clear them in
//! teardown.

use std::sync::OnceLock;

/// A callback injected into a chain operation.
pub type TestHook = Box<dyn Fn() + Send + Sync>;

/// Fires between a retirement releasing its locks and `remove_child`
/// relocking the parent.
static BEFORE_CHILD_REMOVAL: OnceLock<parking_lot::Mutex<Option<TestHook>>> = OnceLock::new();

fn registry() -> &'static parking_lot::Mutex<Option<TestHook>> {
    BEFORE_CHILD_REMOVAL.get_or_init(|| parking_lot::Mutex::new(None))
}

/// Install the before-child-removal hook.
///
/// # Panics
///
/// Panics if a hook is already installed and was not cleared.
pub fn set_before_child_removal_hook(hook: TestHook) {
    let mut slot = registry().lock();
    assert!(
        slot.is_none(),
        "before-child-removal hook already set; clear it first"
    );
    *slot = Some(hook);
}

/// Remove the before-child-removal hook.
pub fn clear_before_child_removal_hook() {
    *registry().lock() = None;
}

/// Invoke the hook if one is installed.
pub(super) fn call_before_child_removal() {
    // Take the hook out while calling so a blocking hook does not hold the
    // registry lock against other chain operations reaching this point.
    let hook: Option<TestHook> = registry().lock().take();
    if let Some(hook) = hook {
        hook();
        let mut slot = registry().lock();
        if slot.is_none() {
            *slot = Some(hook);
        }
    }
}
