use alloc::{rc, sync};

/// An owning reference-counted pointer that can be observed weakly.
pub trait StrongRef {
    /// The weak counterpart of this pointer.
    type Weak: WeakRef<Strong = Self>;

    /// Creates a weak handle to the same allocation.
    fn downgrade(&self) -> Self::Weak;

    /// Returns `true` if both pointers refer to the same allocation.
    fn ptr_eq(&self, other: &Self) -> bool;

    /// Address of the allocation, stable for as long as any strong or weak
    /// handle to it exists.
    fn addr(&self) -> usize;
}

/// A non-owning handle that never keeps its referent alive.
pub trait WeakRef {
    /// The owning counterpart of this handle.
    type Strong: StrongRef<Weak = Self>;

    /// Attempts to obtain an owning pointer, returning `None` once the
    /// referent has been dropped.
    fn upgrade(&self) -> Option<Self::Strong>;

    /// Returns `true` once the referent has been dropped.
    fn is_expired(&self) -> bool {
        self.upgrade().is_none()
    }
}

/// A host value that may or may not be something a collection can hold
/// weakly.
///
/// Plain reference-counted pointers always qualify. Dynamically typed hosts
/// implement this for their value type and return `None` for primitives, which
/// the collections then reject with [`InvalidValueError`].
///
/// [`InvalidValueError`]: crate::InvalidValueError
pub trait Referent {
    /// The pointer type stored by the collection.
    type Strong: StrongRef;

    /// Returns the heap reference behind this value, if there is one.
    fn as_strong(&self) -> Option<&Self::Strong>;
}

impl<T: ?Sized> StrongRef for rc::Rc<T> {
    type Weak = rc::Weak<T>;

    fn downgrade(&self) -> Self::Weak {
        rc::Rc::downgrade(self)
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        rc::Rc::ptr_eq(self, other)
    }

    fn addr(&self) -> usize {
        rc::Rc::as_ptr(self).cast::<()>() as usize
    }
}

impl<T: ?Sized> WeakRef for rc::Weak<T> {
    type Strong = rc::Rc<T>;

    fn upgrade(&self) -> Option<Self::Strong> {
        rc::Weak::upgrade(self)
    }

    fn is_expired(&self) -> bool {
        self.strong_count() == 0
    }
}

impl<T: ?Sized> StrongRef for sync::Arc<T> {
    type Weak = sync::Weak<T>;

    fn downgrade(&self) -> Self::Weak {
        sync::Arc::downgrade(self)
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        sync::Arc::ptr_eq(self, other)
    }

    fn addr(&self) -> usize {
        sync::Arc::as_ptr(self).cast::<()>() as usize
    }
}

impl<T: ?Sized> WeakRef for sync::Weak<T> {
    type Strong = sync::Arc<T>;

    fn upgrade(&self) -> Option<Self::Strong> {
        sync::Weak::upgrade(self)
    }

    fn is_expired(&self) -> bool {
        self.strong_count() == 0
    }
}

impl<T: ?Sized> Referent for rc::Rc<T> {
    type Strong = Self;

    #[inline]
    fn as_strong(&self) -> Option<&Self> {
        Some(self)
    }
}

impl<T: ?Sized> Referent for sync::Arc<T> {
    type Strong = Self;

    #[inline]
    fn as_strong(&self) -> Option<&Self> {
        Some(self)
    }
}

impl<S: StrongRef> Referent for Option<S> {
    type Strong = S;

    #[inline]
    fn as_strong(&self) -> Option<&S> {
        self.as_ref()
    }
}
