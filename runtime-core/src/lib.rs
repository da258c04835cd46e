//! Core library for a secure, multi-tenant remote code-execution service.
//!
//! A [`session_manager::SessionManager`] provisions hardened, container-backed
//! sessions, runs untrusted code in them through a pluggable
//! [`transport::GuestTransport`], exchanges files with them over tar
//! archives, and enforces per-call resource limits. [`tool_surface`] is the
//! thin shim that maps the external tool operations onto the manager and
//! wraps every result in a uniform envelope.

pub mod config;
pub mod container_runtime;
pub mod error;
pub mod limits;
pub mod path_policy;
pub mod session;
pub mod session_manager;
pub mod tool_surface;
pub mod transport;

pub use error::{Error, Result};
