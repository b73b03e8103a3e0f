//! Appgate - run small web apps in containers behind one path-prefix proxy
//!
//! This library provides:
//! - Provisioning of Node.js and Dart apps from git repositories or tar archives
//! - A container runtime adapter over the Docker API with a privileged CLI fallback
//! - Host port allocation that accounts for both recorded and live containers
//! - Lifecycle operations (start, stop, restart, update, delete) with startup reconciliation
//! - A reverse proxy that routes `/{prefix}/{app}/...` to the app's container and
//!   tells HTML pages where they are mounted

pub mod api;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod manifest;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod rewrite;
pub mod routes;
pub mod runtime;
pub mod settings;
pub mod source;
