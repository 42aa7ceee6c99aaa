//! [`WeakValueMap`] and [`WeakValueSet`] are iterable collections that hold
//! their values weakly.
//!
//! Entries whose value has been dropped elsewhere disappear from reads and
//! iteration on their own; the bookkeeping they leave behind is pruned lazily,
//! either when a read observes the expired value or when the finalization
//! registry delivers a notification for it.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

mod error;
pub use error::InvalidValueError;

pub mod finalize;
pub use finalize::{FinalizationRegistry, Registration};

pub mod map;
pub use map::WeakValueMap;

pub mod set;
pub use set::WeakValueSet;

mod traits;
pub use traits::{Referent, StrongRef, WeakRef};
