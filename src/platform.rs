//! Host integration.
//!
//! The cache only needs three things from its host: whether the application is currently
//! visible, a notification when visibility changes, and a notification when the network comes
//! back. [`Platform`] abstracts them so the same client runs in a GUI shell, a terminal
//! application or a headless service.

use std::fmt;
use std::sync::Arc;

use crate::atom::{Atom, Unsubscribe};

/// Callback passed to platform subscriptions.
pub type PlatformCallback = Arc<dyn Fn() + Send + Sync>;

/// Compatibility shim between the cache and its host.
pub trait Platform: Send + Sync + 'static {
    /// Whether the application is in the foreground. Fetches are skipped while it is not.
    fn is_app_visible(&self) -> bool;

    /// Calls `callback` whenever visibility changes.
    fn visibility_change_subscribe(&self, callback: PlatformCallback) -> Unsubscribe;

    /// Calls `callback` whenever connectivity is regained.
    fn reconnect_change_subscribe(&self, callback: PlatformCallback) -> Unsubscribe;
}

/// Platform for hosts without visibility or connectivity signals: always visible, never
/// notifies.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPlatform;

impl Platform for DefaultPlatform {
    fn is_app_visible(&self) -> bool {
        true
    }

    fn visibility_change_subscribe(&self, _callback: PlatformCallback) -> Unsubscribe {
        Unsubscribe::noop()
    }

    fn reconnect_change_subscribe(&self, _callback: PlatformCallback) -> Unsubscribe {
        Unsubscribe::noop()
    }
}

/// A platform driven by hand.
///
/// Useful for hosts that learn about focus and connectivity from their own event loop (a
/// terminal focus event, a network monitor), and for tests.
///
/// ```
/// use querykit::platform::{ManualPlatform, Platform};
///
/// let platform = ManualPlatform::new();
/// assert!(platform.is_app_visible());
///
/// platform.set_visible(false);
/// assert!(!platform.is_app_visible());
/// ```
#[derive(Clone)]
pub struct ManualPlatform {
    visible: Atom<bool>,
    reconnects: Atom<u64>,
}

impl ManualPlatform {
    /// Creates a visible platform.
    pub fn new() -> Self {
        Self {
            visible: Atom::new(true),
            reconnects: Atom::new(0),
        }
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.set(visible);
    }

    /// Signals that the network came back.
    pub fn reconnect(&self) {
        self.reconnects.update(|count| *count += 1);
    }
}

impl Default for ManualPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualPlatform")
            .field("visible", &self.visible.get())
            .field("reconnects", &self.reconnects.get())
            .finish()
    }
}

impl Platform for ManualPlatform {
    fn is_app_visible(&self) -> bool {
        self.visible.get()
    }

    fn visibility_change_subscribe(&self, callback: PlatformCallback) -> Unsubscribe {
        self.visible.listen(move |_| callback())
    }

    fn reconnect_change_subscribe(&self, callback: PlatformCallback) -> Unsubscribe {
        self.reconnects.listen(move |_| callback())
    }
}
