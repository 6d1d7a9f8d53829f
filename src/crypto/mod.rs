//! Cryptographic utilities for the node
//!
//! This module provides:
//! - SHA-256 and double SHA-256 hashing
//! - Wire message checksums

pub mod hash;

pub use hash::{checksum, double_sha256, sha256};
