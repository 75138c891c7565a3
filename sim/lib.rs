#![deny(dead_code)]
#![deny(unused_imports)]

//! Two-level (cluster -> site) binary-response models expressed additively in logit space.
//!
//! A cluster carries a baseline response rate; each of its sites shifts that baseline by a
//! logit offset. The crate simulates labeled observations from such a hierarchy, encodes
//! them as one-hot design rows in two layouts, and reconciles a fitted full-layout weight
//! vector into the equivalent site-only vector.

pub mod config;
pub mod encode;
pub mod fit;
pub mod hierarchy;
pub mod logit;
pub mod simulate;
pub mod stats;
