//! Building blocks for an event-driven networking daemon: a multi-threaded
//! event dispatcher ([`evm`]), a concurrent keyed trie store ([`store`]),
//! and an asynchronous traceroute engine ([`trace`]), plus the shared
//! primitives ([`primitives`]) and configuration layer ([`cm`]) they sit
//! on.

pub mod cm;
pub mod evm;
pub mod primitives;
pub mod store;
pub mod trace;

pub use cm::ConfigManager;
pub use evm::Context as EventContext;
pub use store::Store;
pub use trace::TraceContext;
