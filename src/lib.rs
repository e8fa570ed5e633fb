//! Quire: a publishing server with a shared page cache whose entries are
//! evicted fleet-wide through invalidation messages on a STOMP topic.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod invalidation;
pub mod presentation;
