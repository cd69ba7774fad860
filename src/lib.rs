//! Sifter turns query-parameter filter grammars into typed predicate trees and
//! gives every resulting query a stable cache identity with tag-based
//! invalidation.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
