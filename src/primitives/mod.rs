//! Low-level building blocks shared by the [`crate::evm`], [`crate::store`]
//! and [`crate::cm`] modules: bit-field extraction, string hashing, and a
//! bounded spinlock.

pub mod bits;
pub mod hash;
pub mod spin;

pub use bits::get_bits;
pub use hash::{hash_sdbm, strid};
pub use spin::SpinLock;
