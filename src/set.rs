//! An insertion-ordered set that holds its members weakly.

use core::{fmt, iter::FusedIterator};

use hashbrown::HashMap;

use crate::{
    InvalidValueError, Referent, StrongRef, WeakRef,
    map::{self, WeakValueMap},
};

/// Key under which a member is stored in the backing map.
///
/// Every membership gets a fresh token, so a member that is removed and added
/// again never shares a token with its earlier membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Token(u64);

struct Member<W> {
    weak: W,
    token: Token,
}

/// An insertion-ordered set that holds its members weakly.
///
/// Members are compared by identity, not by value: two equal but distinct
/// allocations are two members. A member leaves the set once it is dropped
/// elsewhere.
pub struct WeakValueSet<V> {
    map: WeakValueMap<Token, V>,
    /// Member address to its current token. The weak handle keeps the
    /// allocation, and therefore the address, from being reused while the
    /// entry exists.
    lookup: HashMap<usize, Member<V>>,
    next_token: u64,
}

impl<V> Default for WeakValueSet<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> WeakValueSet<V> {
    /// Creates an empty `WeakValueSet`.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty `WeakValueSet` with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: WeakValueMap::with_capacity(capacity),
            lookup: HashMap::with_capacity(capacity),
            next_token: 0,
        }
    }

    /// Sets how many mutating operations may pass between two sweeps of the
    /// finalization registry. See [`WeakValueMap::with_cleanup_threshold`].
    pub fn with_cleanup_threshold(mut self, threshold: usize) -> Self {
        self.map.set_cleanup_threshold(threshold);
        self
    }

    /// Returns the number of members currently recorded, including members
    /// that have been dropped but not pruned yet. See [`WeakValueMap::size`].
    #[must_use]
    pub fn size(&self) -> usize {
        self.map.size()
    }

    /// Removes every member.
    pub fn clear(&mut self) {
        self.lookup.clear();
        self.map.clear();
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }
}

impl<V> WeakValueSet<V>
where
    V: WeakRef,
{
    /// Returns the number of members that are still alive.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if no member is alive.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn token_of(&self, value: &V::Strong) -> Option<Token> {
        let member = self.lookup.get(&value.addr())?;
        member
            .weak
            .upgrade()
            .is_some_and(|current| current.ptr_eq(value))
            .then_some(member.token)
    }

    fn prune_lookup(&mut self) {
        let before = self.lookup.len();
        self.lookup.retain(|_, member| !member.weak.is_expired());
        let pruned = before - self.lookup.len();
        if pruned > 0 {
            log::trace!("pruned {pruned} expired member lookups");
        }
    }

    /// Adds `value` to the set.
    ///
    /// Fails without recording anything if `value` is not a heap reference.
    /// Re-adding a member moves it to the end, see [`Self::insert`].
    pub fn add<R>(&mut self, value: &R) -> Result<(), InvalidValueError>
    where
        R: Referent<Strong = V::Strong> + ?Sized,
    {
        let value = value
            .as_strong()
            .ok_or_else(|| InvalidValueError::new::<R>("WeakValueSet"))?;
        self.insert(value);
        Ok(())
    }

    /// Adds a member, returning `true` if it was not a member before.
    ///
    /// Adding a member again keeps a single membership but backs it with a
    /// fresh token, which also moves the member to the end of iteration
    /// order.
    pub fn insert(&mut self, value: &V::Strong) -> bool {
        if self.lookup.len() > self.map.size() {
            self.prune_lookup();
        }

        let previous = self.token_of(value);
        if let Some(token) = previous {
            self.map.delete(&token);
        }

        let token = self.next_token();
        self.lookup.insert(
            value.addr(),
            Member {
                weak: value.downgrade(),
                token,
            },
        );
        self.map.insert(token, value);
        previous.is_none()
    }

    /// Returns `true` if `value` is a live member.
    pub fn has<R>(&mut self, value: &R) -> bool
    where
        R: Referent<Strong = V::Strong> + ?Sized,
    {
        let Some(token) = value.as_strong().and_then(|value| self.token_of(value)) else {
            return false;
        };
        self.map.has(&token)
    }

    /// Removes `value` from the set, returning `true` if it was a member.
    pub fn delete<R>(&mut self, value: &R) -> bool
    where
        R: Referent<Strong = V::Strong> + ?Sized,
    {
        let Some(value) = value.as_strong() else {
            return false;
        };
        if self.token_of(value).is_none() {
            return false;
        }
        match self.lookup.remove(&value.addr()) {
            Some(member) => self.map.remove(&member.token).is_some(),
            None => false,
        }
    }

    /// Prunes every member reported dropped by the finalization registry,
    /// returning how many were pruned.
    pub fn cleanup_some(&mut self) -> usize {
        let pruned = self.map.cleanup_some();
        self.prune_lookup();
        pruned
    }

    /// An iterator visiting all live members in insertion order.
    pub fn iter(&mut self) -> Iter<'_, V> {
        self.prune_lookup();
        Iter(self.map.values())
    }

    /// Same as [`Self::iter`].
    #[inline]
    pub fn values(&mut self) -> Iter<'_, V> {
        self.iter()
    }

    /// Same as [`Self::iter`].
    #[inline]
    pub fn keys(&mut self) -> Iter<'_, V> {
        self.iter()
    }

    /// An iterator visiting every live member paired with itself.
    #[inline]
    pub fn entries(&mut self) -> Entries<'_, V> {
        Entries(self.iter())
    }

    /// Calls `f` with every live member in insertion order.
    pub fn for_each<F>(&mut self, mut f: F)
    where
        F: FnMut(V::Strong),
    {
        self.map.for_each(|value, _| f(value));
    }

    /// Retains only the live members specified by the predicate.
    pub fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&V::Strong) -> bool,
    {
        let lookup = &mut self.lookup;
        self.map.retain(|_, value| {
            let keep = f(&value);
            if !keep {
                lookup.remove(&value.addr());
            }
            keep
        });
        self.prune_lookup();
    }
}

impl<V> Clone for WeakValueSet<V>
where
    V: WeakRef,
{
    fn clone(&self) -> Self {
        let mut set = WeakValueSet::new().with_cleanup_threshold(self.map.cleanup_threshold());
        for (_, value) in self.map.live() {
            set.insert(&value);
        }
        set
    }
}

impl<V> fmt::Debug for WeakValueSet<V>
where
    V: WeakRef,
    V::Strong: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.map.live().map(|(_, value)| value))
            .finish()
    }
}

impl<'a, V> Extend<&'a V::Strong> for WeakValueSet<V>
where
    V: WeakRef,
    V::Strong: 'a,
{
    fn extend<T: IntoIterator<Item = &'a V::Strong>>(&mut self, iter: T) {
        for value in iter {
            self.insert(value);
        }
    }
}

impl<'a, V> FromIterator<&'a V::Strong> for WeakValueSet<V>
where
    V: WeakRef,
    V::Strong: 'a,
{
    fn from_iter<T: IntoIterator<Item = &'a V::Strong>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let mut set = WeakValueSet::with_capacity(iter.size_hint().0);
        set.extend(iter);
        set
    }
}

impl<V, const N: usize> From<[&V::Strong; N]> for WeakValueSet<V>
where
    V: WeakRef,
{
    fn from(array: [&V::Strong; N]) -> Self {
        array.into_iter().collect()
    }
}

/// An iterator over the live members of a `WeakValueSet` in insertion order.
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Iter<'a, V>(map::Values<'a, Token, V>);

impl<V> Iterator for Iter<'_, V>
where
    V: WeakRef,
{
    type Item = V::Strong;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl<V> FusedIterator for Iter<'_, V> where V: WeakRef {}

impl<'a, V> IntoIterator for &'a mut WeakValueSet<V>
where
    V: WeakRef,
{
    type IntoIter = Iter<'a, V>;
    type Item = V::Strong;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// An iterator over the live members of a `WeakValueSet`, each paired with
/// itself.
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Entries<'a, V>(Iter<'a, V>);

impl<V> Iterator for Entries<'_, V>
where
    V: WeakRef,
    V::Strong: Clone,
{
    type Item = (V::Strong, V::Strong);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|value| (value.clone(), value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl<V> FusedIterator for Entries<'_, V>
where
    V: WeakRef,
    V::Strong: Clone,
{
}

#[cfg(test)]
mod tests {
    use alloc::{
        rc::{Rc, Weak},
        string::String,
        vec,
        vec::Vec,
    };

    use super::*;

    #[test]
    fn test_add_has_delete() {
        let mut set = WeakValueSet::<Weak<()>>::new();
        let object = Rc::new(());

        set.add(&object).unwrap();
        assert!(set.has(&object));
        assert!(set.delete(&object));
        assert!(!set.has(&object));
        assert!(!set.delete(&object));
        assert_eq!(set.size(), 0);
    }

    #[test]
    fn test_dropped_members_leave() {
        let mut objects: Vec<_> = (0..5).map(Rc::new).collect();
        let mut set: WeakValueSet<Weak<i32>> = objects.iter().collect();
        assert_eq!(set.size(), 5);

        objects.truncate(3);
        assert_eq!(set.size(), 5);
        assert_eq!(set.iter().count(), 3);
        assert_eq!(set.size(), 3);
        assert_eq!(set.lookup.len(), 3);
        assert_eq!(set.values().map(|v| *v).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_identity_not_equality() {
        let mut set = WeakValueSet::<Weak<String>>::new();
        let a = Rc::new(String::from("same"));
        let b = Rc::new(String::from("same"));

        set.insert(&a);
        assert!(set.has(&a));
        assert!(!set.has(&b));

        set.insert(&b);
        assert_eq!(set.len(), 2);
        set.delete(&a);
        assert!(!set.has(&a));
        assert!(set.has(&b));
    }

    #[test]
    fn test_re_add_uses_fresh_token() {
        let mut set = WeakValueSet::<Weak<u8>>::new();
        let object = Rc::new(1);

        assert!(set.insert(&object));
        let first = set.token_of(&object);
        assert!(!set.insert(&object));
        let second = set.token_of(&object);

        assert!(first.is_some());
        assert_ne!(first, second);
        assert_eq!(set.size(), 1);
        assert_eq!(set.iter().count(), 1);

        set.delete(&object);
        assert!(set.insert(&object));
        assert_ne!(set.token_of(&object), second);
    }

    #[test]
    fn test_re_add_moves_to_end() {
        let a = Rc::new(1);
        let b = Rc::new(2);
        let mut set = WeakValueSet::<Weak<i32>>::new();

        set.insert(&a);
        set.insert(&b);
        set.insert(&a);

        assert_eq!(set.iter().map(|v| *v).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(set.size(), 2);
    }

    #[test]
    fn test_add_rejects_primitives() {
        let mut set = WeakValueSet::<Weak<u8>>::new();

        let err = set.add(&None::<Rc<u8>>).unwrap_err();
        assert_eq!(err.container(), "WeakValueSet");
        assert_eq!(set.size(), 0);
        assert!(!set.has(&None::<Rc<u8>>));
        assert!(!set.delete(&None::<Rc<u8>>));

        let object = Some(Rc::new(3));
        set.add(&object).unwrap();
        assert!(set.has(&object));
    }

    #[test]
    fn test_entries_and_for_each() {
        let a = Rc::new('a');
        let b = Rc::new('b');
        let mut set = WeakValueSet::<Weak<char>>::from([&a, &b]);

        for (left, right) in set.entries() {
            assert!(Rc::ptr_eq(&left, &right));
        }

        let mut seen = Vec::new();
        set.for_each(|value| seen.push(*value));
        assert_eq!(seen, vec!['a', 'b']);
    }

    #[test]
    fn test_clear() {
        let objects: Vec<_> = (0..3).map(Rc::new).collect();
        let mut set: WeakValueSet<Weak<i32>> = objects.iter().collect();

        set.clear();
        assert_eq!(set.size(), 0);
        assert_eq!(set.iter().next(), None);
        assert!(!set.has(&objects[0]));
    }

    #[test]
    fn test_cleanup_some_prunes_lookup() {
        let kept = Rc::new(0);
        let mut set = WeakValueSet::<Weak<i32>>::new();
        set.insert(&kept);
        set.insert(&Rc::new(1));

        assert_eq!(set.cleanup_some(), 1);
        assert_eq!(set.size(), 1);
        assert_eq!(set.lookup.len(), 1);
        assert!(set.has(&kept));
    }

    #[test]
    fn test_retain_and_clone() {
        let objects: Vec<_> = (0..4).map(Rc::new).collect();
        let mut set: WeakValueSet<Weak<i32>> = objects.iter().collect();

        set.retain(|value| **value >= 2);
        assert!(!set.has(&objects[0]));
        assert_eq!(set.lookup.len(), 2);

        let mut copy = set.clone();
        assert!(copy.has(&objects[2]));
        assert!(copy.has(&objects[3]));
        assert_eq!(alloc::format!("{copy:?}"), "{2, 3}");
    }
}
