//! Application services orchestrating domain logic and infrastructure.

pub mod articles;
pub mod error;
pub mod repos;
