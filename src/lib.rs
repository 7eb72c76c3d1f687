//! Zero-downtime migration of a live table between two storage backends.
//!
//! Application writes go through a [`pool::DoubleWritePool`] whose
//! [`pattern::Pattern`] decides which backend is authoritative and whether
//! the other one shadows it. A [`validator::Validator`] diffs the backends
//! and publishes drift events; a [`fixer::Fixer`] consumes them and repairs
//! rows. The [`scheduler::Scheduler`] owns the pattern and the validation
//! runs and is served over HTTP by [`server::WebServer`].

pub mod api;
pub mod cli;
pub mod config;
pub mod database;
pub mod entity;
pub mod error;
pub mod events;
pub mod fixer;
pub mod interactive;
pub mod pattern;
pub mod pool;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod validator;

#[cfg(test)]
mod test_utils;
