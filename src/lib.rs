//! Tag-manager container generator for clean scroll-depth tracking.
//!
//! [`container::build`] turns validated [`settings::Settings`] into an
//! importable container whose Custom HTML tag runs the listener rendered by
//! [`listener::script`]. [`listener::ScrollTracker`] is the same listener as
//! a Rust state machine, and [`page::PageSnapshot`] is a static page it can
//! be exercised against.

pub mod api;
pub mod config;
pub mod container;
pub mod ids;
pub mod listener;
pub mod page;
pub mod server;
pub mod settings;
