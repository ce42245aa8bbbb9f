//! Realtime support chat between students and admins.
//!
//! ARCHITECTURE
//! ============
//! `sync` keeps one consistent message timeline per open conversation on
//! top of the collaborator contracts in `store`. `store::postgres` binds
//! those contracts to the hosted tables and `LISTEN/NOTIFY`;
//! `store::memory` is the in-process backend used by tests. `services` holds
//! the admin inbox and the student unread badge.

pub mod config;
pub mod db;
pub mod frame;
pub mod model;
pub mod services;
pub mod store;
pub mod sync;
