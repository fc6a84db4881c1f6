//! darkerhttpd: a simple, single-threaded, static content webserver.
//!
//! The binary wires these together; the library split exists so the pieces can be tested on
//! their own.

pub mod auth;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod listing;
pub mod log;
pub mod mime;
pub mod poller;
pub mod range;
pub mod request;
pub mod response;
pub mod server;
pub mod url;
