//! Support-desk services layered on the store contracts.
//!
//! ARCHITECTURE
//! ============
//! The chat view itself lives in `sync`. These services cover the screens
//! around it: the admin conversation list and the student's unread badge.

pub mod badge;
pub mod inbox;
