//! Interactive account-linking client for camera plugin configuration.
//!
//! Drives the third-party login conversation (username → password →
//! one-time code → issued credentials) over a [`link_channel`] duplex to
//! a backend linking agent, and persists the resulting credential bundle
//! into the plugin's configuration record.

pub mod config;
pub mod logger;
pub mod machine;
pub mod session;
