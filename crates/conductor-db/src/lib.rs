//! Persistence gateway for the conductor control plane.
//!
//! The relational store is the single source of truth for jobs, agents,
//! requirements, citation artifacts, uploads, and audit entries. Every
//! mutation goes through a transaction here; no other crate issues SQL.

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod queries;

pub use error::{StoreError, StoreResult, retry_transient};
