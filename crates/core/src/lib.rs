//! Ambient building blocks shared by the xDS client: a cheap interned
//! string type and a small metrics-recording abstraction. Kept deliberately
//! thin; this crate owns no xDS-specific semantics.

pub mod metrics;
pub mod strng;
