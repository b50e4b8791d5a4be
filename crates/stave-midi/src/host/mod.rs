//! Host MIDI backends.
//!
//! The device manager only talks to a [`MidiHost`]. `VirtualMidiHost` is an
//! in-process host for routing without hardware; `MidirHost` (feature
//! `midi-io`) enumerates real devices via midir.

use crate::error::Result;
use crate::port::{HostPort, StateChangeListener};
use std::sync::Arc;

mod virtual_host;
pub use virtual_host::{VirtualMidiHost, VirtualPort};

#[cfg(feature = "midi-io")]
mod midir_host;
#[cfg(feature = "midi-io")]
pub use midir_host::MidirHost;

/// Host MIDI interface consumed by the device manager.
///
/// Enumeration is where access failures surface: a host that was denied
/// permission, or has no MIDI backend, returns `Error::AccessDenied` /
/// `Error::Unsupported` from `inputs()`/`outputs()`.
pub trait MidiHost: Send + Sync {
    fn inputs(&self) -> Result<Vec<Arc<dyn HostPort>>>;

    fn outputs(&self) -> Result<Vec<Arc<dyn HostPort>>>;

    /// Install (or clear, with `None`) the hot-plug notification listener.
    /// Notifications must be delivered one at a time, in the order they occur.
    fn on_state_change(&self, listener: Option<StateChangeListener>);

    /// Clear the hot-plug listener only if it is still `listener` (same
    /// `Arc`). Returns whether it was cleared.
    fn remove_state_listener(&self, listener: &StateChangeListener) -> bool;
}

/// Clear `slot` if it holds `listener`.
pub(crate) fn clear_if_same(
    slot: &mut Option<StateChangeListener>,
    listener: &StateChangeListener,
) -> bool {
    if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, listener)) {
        *slot = None;
        true
    } else {
        false
    }
}
