//! codepod: per-project container workspaces.
//!
//! A [`service::Codepod`] ties together the pool manager
//! ([`workspace::WorkspaceManager`]), the terminal multiplexer
//! ([`session::TerminalMultiplexer`]) and the file cache synchronizer
//! ([`sync::FileCacheSync`]) over pluggable runtime, object storage and
//! ledger backends.

pub mod cli;
pub mod config;
pub mod error;
pub mod governor;
pub mod health;
pub mod ledger;
pub mod metrics;
pub mod runtime;
pub mod service;
pub mod session;
pub mod storage;
pub mod sync;
pub mod workspace;

pub use error::RuntimeError;
pub use service::Codepod;
