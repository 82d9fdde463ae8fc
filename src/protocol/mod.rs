//! Gateway wire protocol.

pub mod models;
