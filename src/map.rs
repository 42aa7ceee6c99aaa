//! An insertion-ordered map that stores weak references to values.

use core::{
    fmt,
    hash::{BuildHasher, Hash},
    iter::FusedIterator,
};

use hashbrown::DefaultHashBuilder;
use indexmap::{Equivalent, IndexMap, map};

use crate::{FinalizationRegistry, InvalidValueError, Referent, Registration, StrongRef, WeakRef};

/// Default number of mutating operations between two finalization sweeps.
pub const DEFAULT_CLEANUP_THRESHOLD: usize = 1000;

struct OpsCounter {
    ops: usize,
    threshold: usize,
}

impl OpsCounter {
    #[inline]
    const fn new() -> Self {
        Self {
            ops: 0,
            threshold: DEFAULT_CLEANUP_THRESHOLD,
        }
    }

    #[inline]
    fn bump(&mut self) {
        self.ops += 1;
    }

    #[inline]
    fn reset(&mut self) {
        self.ops = 0;
    }

    #[inline]
    fn reach_threshold(&self) -> bool {
        self.ops >= self.threshold
    }
}

/// An insertion-ordered map that stores strong references to values.
pub type StrongMap<K, V, S = DefaultHashBuilder> = IndexMap<K, V, S>;

struct Slot<W> {
    weak: W,
    registration: Registration,
}

/// An insertion-ordered map that stores weak references to values.
///
/// The map never keeps a value alive. Once the last strong reference to a
/// value is dropped, reads and iteration stop observing its key, and the key
/// itself is pruned the next time it is looked at or when the finalization
/// registry reports the value as gone.
///
/// Keys are cloned once per insertion: the clone is what the finalization
/// registry hands back when the value is dropped.
pub struct WeakValueMap<K, V, S = DefaultHashBuilder> {
    inner: IndexMap<K, Slot<V>, S>,
    registry: FinalizationRegistry<V, K>,
    ops: OpsCounter,
}

impl<K, V, S: Default> Default for WeakValueMap<K, V, S> {
    #[inline]
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V> WeakValueMap<K, V, DefaultHashBuilder> {
    /// Creates an empty `WeakValueMap`.
    ///
    /// The map is initially created with a capacity of 0, so it will not
    /// allocate until it is first inserted into.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty `WeakValueMap` with the specified capacity.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }
}

impl<K, V, S> WeakValueMap<K, V, S> {
    /// Creates an empty `WeakValueMap` which will use the given hash builder
    /// to hash keys.
    #[inline]
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    /// Creates an empty `WeakValueMap` with the specified capacity, using
    /// `hash_builder` to hash the keys.
    #[inline]
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        Self {
            inner: IndexMap::with_capacity_and_hasher(capacity, hash_builder),
            registry: FinalizationRegistry::new(),
            ops: OpsCounter::new(),
        }
    }

    /// Sets how many mutating operations may pass between two sweeps of the
    /// finalization registry.
    ///
    /// A threshold of 0 sweeps on every mutation.
    #[inline]
    pub fn with_cleanup_threshold(mut self, threshold: usize) -> Self {
        self.set_cleanup_threshold(threshold);
        self
    }

    /// See [`Self::with_cleanup_threshold`].
    #[inline]
    pub fn set_cleanup_threshold(&mut self, threshold: usize) {
        self.ops.threshold = threshold;
    }

    /// Returns the current cleanup threshold.
    #[inline]
    pub fn cleanup_threshold(&self) -> usize {
        self.ops.threshold
    }

    /// Returns a reference to the map's [`BuildHasher`].
    #[inline]
    pub fn hasher(&self) -> &S {
        self.inner.hasher()
    }

    /// Returns the number of elements the map can hold without reallocating.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Returns the number of keys currently recorded, including keys whose
    /// value has been dropped but which have not been pruned yet.
    ///
    /// This never undercounts: it is always at least [`Self::len`]. Iterate
    /// the map or call [`Self::cleanup_some`] first for an exact figure.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.len()
    }

    /// Removes every entry and cancels every pending finalization.
    #[inline]
    pub fn clear(&mut self) {
        self.inner.clear();
        self.registry.clear();
        self.ops.reset();
    }
}

impl<K, V, S> WeakValueMap<K, V, S>
where
    V: WeakRef,
{
    /// Returns the number of entries whose value is still alive.
    ///
    /// This is a linear operation and prunes nothing.
    pub fn len(&self) -> usize {
        self.live().count()
    }

    /// Returns `true` if no entry has a live value.
    pub fn is_empty(&self) -> bool {
        self.live().next().is_none()
    }

    /// Drops every entry whose value has been dropped, in one pass.
    ///
    /// Queued notifications are discarded first: each one names either an
    /// entry this pass removes or a key that has a live value again.
    fn prune_expired(&mut self) -> usize {
        self.registry.clear_pending();
        let registry = &mut self.registry;
        let before = self.inner.len();
        self.inner.retain(|_, slot| {
            let expired = slot.weak.is_expired();
            if expired {
                registry.unregister(slot.registration);
            }
            !expired
        });
        let pruned = before - self.inner.len();
        if pruned > 0 {
            log::trace!("pruned {pruned} expired entries");
        }
        pruned
    }

    /// Removes a single entry, shifting every later entry down: O(n).
    fn prune_index(&mut self, index: usize) {
        if let Some((_, slot)) = self.inner.shift_remove_index(index) {
            self.registry.unregister(slot.registration);
            log::trace!("pruned expired entry at index {index}");
        }
    }

    /// Iterates over entries whose value is alive, pruning nothing.
    pub(crate) fn live(&self) -> Iter<'_, K, V> {
        Iter(self.inner.iter())
    }

    /// An iterator visiting all live key-value pairs in insertion order.
    ///
    /// This is not lazy about pruning: the whole map is scanned and every
    /// expired entry removed before the iterator is handed out, so even
    /// taking the first item costs O(n). Values dropped while the iterator is
    /// in use are skipped.
    pub fn iter(&mut self) -> Iter<'_, K, V> {
        self.prune_expired();
        Iter(self.inner.iter())
    }

    /// Same as [`Self::iter`].
    #[inline]
    pub fn entries(&mut self) -> Iter<'_, K, V> {
        self.iter()
    }

    /// An iterator visiting the keys of all live entries in insertion order.
    #[inline]
    pub fn keys(&mut self) -> Keys<'_, K, V> {
        Keys(self.iter())
    }

    /// An iterator visiting all live values in insertion order.
    #[inline]
    pub fn values(&mut self) -> Values<'_, K, V> {
        Values(self.iter())
    }

    /// Calls `f` with every live value and its key, in insertion order.
    ///
    /// Expired entries are skipped as they are reached and pruned together
    /// once the walk is over.
    pub fn for_each<F>(&mut self, mut f: F)
    where
        F: FnMut(V::Strong, &K),
    {
        let mut expired = false;
        for (key, slot) in &self.inner {
            match slot.weak.upgrade() {
                Some(value) => f(value, key),
                None => expired = true,
            }
        }
        if expired {
            self.prune_expired();
        }
    }

    /// Retains only the live entries specified by the predicate, preserving
    /// the order of the rest.
    pub fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&K, V::Strong) -> bool,
    {
        self.registry.clear_pending();
        let registry = &mut self.registry;
        self.inner.retain(|key, slot| {
            let keep = slot.weak.upgrade().is_some_and(|value| f(key, value));
            if !keep {
                registry.unregister(slot.registration);
            }
            keep
        });
    }
}

impl<K, V, S> WeakValueMap<K, V, S>
where
    K: Eq + Hash,
    V: WeakRef,
    S: BuildHasher,
{
    /// Delivers queued finalization notifications, then counts one operation
    /// and sweeps the registry once the threshold is reached.
    ///
    /// Notifications found by the sweep are delivered on the next call.
    fn try_bump(&mut self) {
        self.deliver_pending();
        self.ops.bump();
        if self.ops.reach_threshold() {
            self.ops.reset();
            self.registry.sweep();
        }
    }

    /// Delivers queued notifications. The first one that still names an
    /// expired entry triggers a single pruning pass over the whole map.
    fn deliver_pending(&mut self) -> usize {
        while let Some((_, key)) = self.registry.take_pending() {
            if self.finalization_due(&key) {
                return self.prune_expired();
            }
        }
        0
    }

    /// Checks a notification that the value last registered under `key` has
    /// been dropped.
    ///
    /// The key may have been given a new, live value since the notification
    /// was queued; it is kept in that case.
    fn finalization_due(&self, key: &K) -> bool {
        let Some(slot) = self.inner.get(key) else {
            return false;
        };
        if !slot.weak.is_expired() {
            log::trace!("ignored stale finalization notification");
            return false;
        }
        true
    }

    /// Sweeps the finalization registry and prunes every entry it reports,
    /// returning how many entries were pruned.
    pub fn cleanup_some(&mut self) -> usize {
        self.ops.reset();
        self.registry.sweep();
        self.deliver_pending()
    }

    /// Reserves capacity for at least `additional` more elements.
    pub fn reserve(&mut self, additional: usize) {
        self.prune_expired();
        self.inner.reserve(additional);
    }

    /// Shrinks the capacity of the map as much as possible after pruning
    /// expired entries.
    pub fn shrink_to_fit(&mut self) {
        self.prune_expired();
        self.inner.shrink_to_fit();
    }

    /// Returns the value corresponding to the key, if it is still alive.
    ///
    /// A key whose value has been dropped is pruned, which shifts the entries
    /// after it: O(n).
    pub fn get<Q>(&mut self, key: &Q) -> Option<V::Strong>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let (index, _, slot) = self.inner.get_full(key)?;
        let value = slot.weak.upgrade();
        if value.is_none() {
            self.prune_index(index);
        }
        value
    }

    /// Returns `true` if the map holds a live value for the key.
    ///
    /// A key whose value has been dropped is pruned, which shifts the entries
    /// after it: O(n).
    pub fn has<Q>(&mut self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let Some((index, _, slot)) = self.inner.get_full(key) else {
            return false;
        };
        if slot.weak.is_expired() {
            self.prune_index(index);
            return false;
        }
        true
    }

    fn peek<Q>(&self, key: &Q) -> Option<V::Strong>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.inner.get(key).and_then(|slot| slot.weak.upgrade())
    }

    /// Associates `value` with `key`.
    ///
    /// Fails without recording anything if `value` is not a heap reference.
    pub fn set<R>(&mut self, key: K, value: &R) -> Result<(), InvalidValueError>
    where
        K: Clone,
        R: Referent<Strong = V::Strong> + ?Sized,
    {
        let value = value
            .as_strong()
            .ok_or_else(|| InvalidValueError::new::<R>("WeakValueMap"))?;
        self.insert(key, value);
        Ok(())
    }

    /// Inserts a key-value pair into the map.
    ///
    /// If the key was present, its position is kept, the value is replaced,
    /// and the old value is returned if it is still alive. The finalization of
    /// the old value is cancelled before the new one is registered, so
    /// dropping the old value later leaves the key alone.
    pub fn insert(&mut self, key: K, value: &V::Strong) -> Option<V::Strong>
    where
        K: Clone,
    {
        self.try_bump();
        if let Some(old) = self.inner.get(&key) {
            self.registry.unregister(old.registration);
        }
        let registration = self.registry.register(value, key.clone());
        let slot = Slot {
            weak: V::Strong::downgrade(value),
            registration,
        };
        self.inner
            .insert(key, slot)
            .and_then(|old| old.weak.upgrade())
    }

    /// Removes a key from the map, returning its value if it was present and
    /// still alive.
    ///
    /// Insertion order is kept by shifting the entries after the key, so this
    /// costs O(n). Prefer [`Self::retain`] to remove many keys at once.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V::Strong>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.try_bump();
        let slot = self.inner.shift_remove(key)?;
        self.registry.unregister(slot.registration);
        slot.weak.upgrade()
    }

    /// Removes a key from the map, returning `true` if it was recorded,
    /// whether or not its value was still alive.
    ///
    /// Costs O(n), like [`Self::remove`].
    pub fn delete<Q>(&mut self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.try_bump();
        match self.inner.shift_remove(key) {
            Some(slot) => {
                self.registry.unregister(slot.registration);
                true
            }
            None => false,
        }
    }

    /// Upgrades every live entry into a `StrongMap`, preserving order.
    pub fn upgrade(&self) -> StrongMap<K, V::Strong, S>
    where
        K: Clone,
        S: Clone,
    {
        let mut map = StrongMap::with_hasher(self.hasher().clone());
        for (key, value) in self.live() {
            map.insert(key.clone(), value);
        }
        map
    }
}

impl<K, V, S> Clone for WeakValueMap<K, V, S>
where
    K: Clone + Eq + Hash,
    V: WeakRef,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> Self {
        let mut map = WeakValueMap::with_hasher(self.hasher().clone())
            .with_cleanup_threshold(self.cleanup_threshold());
        for (key, value) in self.live() {
            map.insert(key.clone(), &value);
        }
        map
    }
}

impl<K, V, S> PartialEq for WeakValueMap<K, V, S>
where
    K: Eq + Hash,
    V: WeakRef,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.live().all(|(key, value)| {
                other
                    .peek(key)
                    .is_some_and(|v| V::Strong::ptr_eq(&value, &v))
            })
    }
}

impl<K, V, S> Eq for WeakValueMap<K, V, S>
where
    K: Eq + Hash,
    V: WeakRef,
    S: BuildHasher,
{
}

impl<K, V, S> fmt::Debug for WeakValueMap<K, V, S>
where
    K: fmt::Debug,
    V: WeakRef,
    V::Strong: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.live()).finish()
    }
}

impl<'a, K, V, S> Extend<(K, &'a V::Strong)> for WeakValueMap<K, V, S>
where
    K: Clone + Eq + Hash,
    V: WeakRef,
    V::Strong: 'a,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, &'a V::Strong)>>(&mut self, iter: T) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<'a, K, V, S> FromIterator<(K, &'a V::Strong)> for WeakValueMap<K, V, S>
where
    K: Clone + Eq + Hash,
    V: WeakRef,
    V::Strong: 'a,
    S: BuildHasher + Default,
{
    #[inline]
    fn from_iter<T: IntoIterator<Item = (K, &'a V::Strong)>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let mut map = WeakValueMap::with_capacity_and_hasher(iter.size_hint().0, S::default());
        map.extend(iter);
        map
    }
}

impl<K, V, S, const N: usize> From<[(K, &V::Strong); N]> for WeakValueMap<K, V, S>
where
    K: Clone + Eq + Hash,
    V: WeakRef,
    S: BuildHasher + Default,
{
    #[inline]
    fn from(array: [(K, &V::Strong); N]) -> Self {
        array.into_iter().collect()
    }
}

impl<K, V, S> From<&StrongMap<K, V::Strong, S>> for WeakValueMap<K, V, S>
where
    K: Clone + Eq + Hash,
    V: WeakRef,
    S: BuildHasher + Clone,
{
    fn from(value: &StrongMap<K, V::Strong, S>) -> Self {
        let mut map = WeakValueMap::with_capacity_and_hasher(value.len(), value.hasher().clone());
        map.extend(value.iter().map(|(key, value)| (key.clone(), value)));
        map
    }
}

/// An iterator over the live entries of a `WeakValueMap` in insertion order.
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Iter<'a, K, V>(map::Iter<'a, K, Slot<V>>);

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    V: WeakRef,
{
    type Item = (&'a K, V::Strong);

    fn next(&mut self) -> Option<Self::Item> {
        for (key, slot) in self.0.by_ref() {
            if let Some(value) = slot.weak.upgrade() {
                return Some((key, value));
            }
        }
        None
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.0.len()))
    }
}

impl<K, V> DoubleEndedIterator for Iter<'_, K, V>
where
    V: WeakRef,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        while let Some((key, slot)) = self.0.next_back() {
            if let Some(value) = slot.weak.upgrade() {
                return Some((key, value));
            }
        }
        None
    }
}

impl<K, V> FusedIterator for Iter<'_, K, V> where V: WeakRef {}

impl<K, V> Clone for Iter<'_, K, V> {
    fn clone(&self) -> Self {
        Iter(self.0.clone())
    }
}

impl<'a, K, V, S> IntoIterator for &'a mut WeakValueMap<K, V, S>
where
    V: WeakRef,
{
    type IntoIter = Iter<'a, K, V>;
    type Item = (&'a K, V::Strong);

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// An iterator over the keys of the live entries of a `WeakValueMap`.
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Keys<'a, K, V>(Iter<'a, K, V>);

impl<'a, K, V> Iterator for Keys<'a, K, V>
where
    V: WeakRef,
{
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(key, _)| key)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl<K, V> FusedIterator for Keys<'_, K, V> where V: WeakRef {}

/// An iterator over the live values of a `WeakValueMap`.
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Values<'a, K, V>(Iter<'a, K, V>);

impl<K, V> Iterator for Values<'_, K, V>
where
    V: WeakRef,
{
    type Item = V::Strong;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(_, value)| value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl<K, V> FusedIterator for Values<'_, K, V> where V: WeakRef {}

/// An owning iterator over the live entries of a `WeakValueMap`.
pub struct IntoIter<K, V>(map::IntoIter<K, Slot<V>>);

impl<K, V> Iterator for IntoIter<K, V>
where
    V: WeakRef,
{
    type Item = (K, V::Strong);

    fn next(&mut self) -> Option<Self::Item> {
        for (key, slot) in self.0.by_ref() {
            if let Some(value) = slot.weak.upgrade() {
                return Some((key, value));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.0.len()))
    }
}

impl<K, V> FusedIterator for IntoIter<K, V> where V: WeakRef {}

impl<K, V, S> IntoIterator for WeakValueMap<K, V, S>
where
    V: WeakRef,
{
    type IntoIter = IntoIter<K, V>;
    type Item = (K, V::Strong);

    fn into_iter(self) -> Self::IntoIter {
        IntoIter(self.inner.into_iter())
    }
}
