//! Serve a directory over HTTP and reload connected browsers when its files
//! change.
//!
//! [`startup::Application`] owns the two listeners (site and admin
//! dashboard). Files under the root are watched by [`watcher`]; bursts of
//! changes are collapsed by [`reload::ReloadGate`] and pushed to every page
//! over a WebSocket opened by the injected client script.

pub mod cli;
pub mod config;
pub mod error;
pub mod files;
pub mod internal_scope;
pub mod reload;
pub mod startup;
pub mod ui;
pub mod watcher;
