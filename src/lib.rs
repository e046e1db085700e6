//! Physical backup engine for PostgreSQL clusters.
//!
//! The crate copies a running cluster's data directory and tablespaces
//! into a repository while the cluster stays online, validates data
//! pages against the cluster's checksum scheme, and records everything
//! in a manifest that is sufficient to reconstruct the cluster.

pub mod tools;

pub mod error;

pub mod config;

pub mod pg;

pub mod protocol;

pub mod backup;
