//! Petek: a segment-locked concurrent hopscotch hash map.
//!
//! Petek stores key-value pairs in fixed-size bucket rings ("segments"),
//! following the hopscotch hashing scheme of Herlihy, Shavit and Tzafrir:
//! every entry lives within a bounded distance of its home bucket, and a
//! per-bucket bitmap makes lookups touch only the handful of buckets that
//! can actually hold the key.
//!
//! # Features
//!
//! - **Bounded probes**: lookups visit at most `hop_range` buckets, driven
//!   by one bitmap word per home bucket.
//! - **Fine-grained locking**: writers take only the home segment's TTAS
//!   lock; operations on different segments never contend.
//! - **Lock-free reads**: `get` takes no lock. A per-segment timestamp,
//!   bumped on every displacement, lets readers detect an entry moving
//!   mid-probe and retry within a configured budget.
//! - **Memory reclamation**: displaced and removed entries are retired
//!   through `crossbeam-epoch`, so racing readers never observe freed
//!   memory.
//!
//! # Example
//!
//! ```
//! use petek::HopscotchMap;
//!
//! let map = HopscotchMap::new();
//! map.insert("a", 1).unwrap();
//! assert_eq!(map.get(&"a"), Some(1));
//! assert_eq!(map.remove(&"a"), Some(1));
//! assert_eq!(map.get(&"a"), None);
//! ```

#![warn(missing_docs)]

mod config;
mod error;
mod lock;
mod map;
mod segment;

pub use config::TableConfig;
pub use error::Error;
pub use map::HopscotchMap;
