//! groundfix - a local-first engine for curating shortform groundings and
//! keeping the documents behind a trained disambiguation model consistent
//! through rename/merge commits

pub mod commands;
pub mod config;
pub mod consistency;
pub mod curate;
pub mod models;
pub mod session;
pub mod store;
pub mod transition;
