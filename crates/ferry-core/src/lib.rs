//! Ferry core: local-side policy and the synchronization loop.
//!
//! [`AccessController`] decides which files may move in which direction,
//! [`Manager`] drives one repository's ticks against a relay, and
//! [`Supervisor`] keeps one manager task per repository alive.

pub mod access;
pub mod manager;
pub mod supervisor;

pub use access::{AccessController, AttributeStore, Attributes};
pub use ferry_common::Error;
pub use manager::Manager;
pub use supervisor::Supervisor;
