//! # Weft Store
//!
//! Persistence for Weft nodes. Identities and channel snapshots are stored
//! as opaque values under string keys; the [`Store`] trait hides whether
//! they live in SQLite or in memory.
//!
//! ## Key Types
//!
//! - [`Store`] - The async key/value trait
//! - [`StoreExt`] - Typed CBOR helpers on top of any store
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use weft_store::{SqliteStore, Store};
//!
//! async fn example() {
//!     let store = SqliteStore::open("weft.db").unwrap();
//!     store.put("identity/alice", b"...").await.unwrap();
//!     let keys = store.keys_with_prefix("identity/").await.unwrap();
//!     assert_eq!(keys, vec!["identity/alice".to_string()]);
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{Store, StoreExt};
