//! Versioned key-value region used as the host store.
//!
//! A [`Region`] is one partition: a sorted map from row key to the list of
//! versions written to it. The region knows nothing about transactions; it
//! stores tagged cells, evaluates injected filters at read time, and
//! invokes registered observers at every operation boundary. All
//! transactional semantics live in the observers.

pub mod region;

pub use region::Region;
