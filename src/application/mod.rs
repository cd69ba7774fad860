//! Request intake, field resolution, criteria and the repository API.

pub mod builder;
pub mod catalog;
pub mod criteria;
pub mod error;
pub mod grammar;
pub mod repos;
pub mod repository;
pub mod request;
pub mod resolver;
