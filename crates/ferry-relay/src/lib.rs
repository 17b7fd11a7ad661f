//! Ferry relay engine.
//!
//! [`Relay`] implements the coordination protocol that moves files between
//! independent clients through a passive blob store: who may write, who has
//! read, and when a file may disappear from the relay.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), ferry_common::Error> {
//! use ferry_relay::{local::LocalStore, Relay};
//!
//! let store = LocalStore::new("/mnt/relay/music").await?;
//! let relay = Relay::new(Box::new(store), "alice".parse()?)?;
//!
//! // Send a file, recording its modification time for the pullers.
//! relay.push("song.flac".as_ref(), "song.flac", Some("1700000000"), true).await?;
//!
//! // See what peers left for us.
//! for name in relay.list_ready("", true).await? {
//!     println!("ready: {name}");
//! }
//! # Ok(()) }
//! ```

pub mod cipher;
mod engine;
pub mod local;
pub mod lock;
pub mod placeholder;
pub mod store;

pub use cipher::Cipher;
pub use engine::{Accessor, Relay};
pub use ferry_common::Error;
pub use lock::{LockInfo, LockMode};
pub use placeholder::PlaceholderMeta;
pub use store::{BlobStore, Entry};
