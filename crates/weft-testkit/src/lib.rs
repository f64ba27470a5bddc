//! # Weft Testkit
//!
//! Testing utilities for Weft.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: fixed seeds and timestamps whose message hashes
//!   must not drift between releases
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: deterministic identities, pre-filled channels, and an
//!   in-process cluster of nodes that exchanges packets without a transport
//!
//! ## Golden Vectors
//!
//! ```rust
//! use weft_testkit::vectors::{all_vectors, generate_from_vector};
//!
//! for vector in all_vectors() {
//!     let generated = generate_from_vector(&vector);
//!     println!("{}: {}", vector.name, generated.hash.to_hex());
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use weft_testkit::generators::{envelope_from_params, MessageParams};
//!
//! proptest! {
//!     #[test]
//!     fn hash_is_deterministic(params: MessageParams) {
//!         let a = envelope_from_params(&params);
//!         let b = envelope_from_params(&params);
//!         prop_assert_eq!(a.hash(), b.hash());
//!     }
//! }
//! ```
//!
//! ## Clusters
//!
//! ```rust,no_run
//! use weft_testkit::fixtures::Cluster;
//!
//! # async fn example() -> weft::Result<()> {
//! let mut cluster = Cluster::invited(3).await?;
//! let channel_id = cluster.channel_id();
//! cluster.post(0, "hello").await?;
//! assert!(cluster.is_converged(&channel_id));
//! # Ok(())
//! # }
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{identity_from_seed, multi_party_identities, ChannelFixture, Cluster, TestNode};
pub use generators::{envelope_from_params, MessageParams};
pub use vectors::{all_vectors, generate_from_vector, verify_all_vectors, GoldenVector};
