//! Core types shared by the request pipeline and the cache layer.

pub mod error;
pub mod fields;
pub mod opaque_id;
pub mod operators;
pub mod predicate;
pub mod schema;
pub mod values;
