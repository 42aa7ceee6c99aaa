//! A finalization channel built on weak handles.
//!
//! Reference counting has no collector that can call back when a value dies,
//! so the registry stands in for one: each registration watches a weak handle,
//! and [`FinalizationRegistry::sweep`] moves the registrations whose target
//! has been dropped onto a pending queue. Owners drain that queue whenever it
//! suits them, which keeps delivery outside of any other in-progress
//! operation.

use alloc::collections::VecDeque;
use core::fmt;

use hashbrown::{DefaultHashBuilder, HashMap};

use crate::{StrongRef, WeakRef};

/// Token identifying one registration.
///
/// Tokens are never reused by the registry that issued them, so a token for
/// a replaced value can be cancelled without touching the registration that
/// replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Registration(u64);

struct Cell<W, H> {
    target: W,
    held: H,
}

/// Registrations of weakly held targets, each carrying a held value that is
/// delivered once the target has been dropped.
pub struct FinalizationRegistry<W, H> {
    cells: HashMap<Registration, Cell<W, H>, DefaultHashBuilder>,
    pending: VecDeque<(Registration, H)>,
    next: u64,
}

impl<W, H> Default for FinalizationRegistry<W, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W, H> FinalizationRegistry<W, H> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            cells: HashMap::default(),
            pending: VecDeque::new(),
            next: 0,
        }
    }

    /// Number of registrations whose target has not been seen dropped yet.
    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns `true` if there are neither live registrations nor pending
    /// notifications.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.pending.is_empty()
    }

    /// Returns `true` if notifications are waiting to be delivered.
    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Cancels a registration.
    ///
    /// A notification that was already queued for it is withdrawn as well.
    /// Returns `false` if the token was unknown or already delivered.
    pub fn unregister(&mut self, token: Registration) -> bool {
        if self.cells.remove(&token).is_some() {
            return true;
        }
        let before = self.pending.len();
        self.pending.retain(|(t, _)| *t != token);
        self.pending.len() != before
    }

    /// Takes the next pending notification.
    pub fn take_pending(&mut self) -> Option<(Registration, H)> {
        self.pending.pop_front()
    }

    /// Drops every pending notification without delivering it.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Drops every registration and pending notification.
    ///
    /// Tokens issued before the call stay unique afterwards.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.pending.clear();
    }
}

impl<W, H> FinalizationRegistry<W, H>
where
    W: WeakRef,
{
    /// Starts watching `target`; `held` is delivered after it is dropped.
    pub fn register(&mut self, target: &W::Strong, held: H) -> Registration {
        let token = Registration(self.next);
        self.next += 1;
        self.cells.insert(
            token,
            Cell {
                target: W::Strong::downgrade(target),
                held,
            },
        );
        token
    }

    /// Moves every registration whose target has been dropped onto the
    /// pending queue, returning how many were queued.
    pub fn sweep(&mut self) -> usize {
        let before = self.pending.len();
        let pending = &mut self.pending;
        for (token, cell) in self.cells.extract_if(|_, cell| cell.target.is_expired()) {
            pending.push_back((token, cell.held));
        }
        let queued = self.pending.len() - before;
        if queued > 0 {
            log::debug!("finalization sweep queued {queued} notification(s)");
        }
        queued
    }
}

impl<W, H> fmt::Debug for FinalizationRegistry<W, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizationRegistry")
            .field("registrations", &self.cells.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use alloc::rc::{Rc, Weak};

    use super::*;

    #[test]
    fn test_sweep_delivers_dropped() {
        let mut registry = FinalizationRegistry::<Weak<u32>, &str>::new();

        let kept = Rc::new(1);
        registry.register(&kept, "kept");
        {
            let dropped = Rc::new(2);
            registry.register(&dropped, "dropped");
        }

        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.has_pending());
        assert_eq!(registry.take_pending().map(|(_, held)| held), Some("dropped"));
        assert_eq!(registry.take_pending(), None);
        assert_eq!(registry.sweep(), 0);
    }

    #[test]
    fn test_unregister_withdraws_pending() {
        let mut registry = FinalizationRegistry::<Weak<u32>, u32>::new();

        let value = Rc::new(7);
        let token = registry.register(&value, 7);
        drop(value);

        assert_eq!(registry.sweep(), 1);
        assert!(registry.unregister(token));
        assert!(!registry.has_pending());
        assert!(!registry.unregister(token));
    }

    #[test]
    fn test_clear_pending_keeps_registrations() {
        let mut registry = FinalizationRegistry::<Weak<u32>, u32>::new();

        let kept = Rc::new(0);
        registry.register(&kept, 0);
        registry.register(&Rc::new(1), 1);

        assert_eq!(registry.sweep(), 1);
        registry.clear_pending();
        assert!(!registry.has_pending());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_tokens_unique_across_clear() {
        let mut registry = FinalizationRegistry::<Weak<u32>, ()>::new();

        let value = Rc::new(0);
        let first = registry.register(&value, ());
        registry.clear();
        assert!(registry.is_empty());

        let second = registry.register(&value, ());
        assert_ne!(first, second);
        assert!(!registry.unregister(first));
        assert!(registry.unregister(second));
    }
}
