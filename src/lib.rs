#![cfg_attr(doc, doc = include_str!("../README.md"))]

#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            ::tracing::debug!($($arg)+);
        }
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($enabled:expr, $($arg:tt)+) => {
        let _ = &$enabled;
    };
}

pub(crate) use debug_log;

pub mod auth;
pub mod backend;
pub mod config;
pub mod document;
pub mod error;
pub mod listener;
pub mod manager;
pub mod retry;

use crate::error::Error;

pub use crate::config::{BackendKind, ManagerConfig, ReconnectConfig};
pub use crate::listener::{LifecycleEvent, ListenerId};
pub use crate::manager::{ConnectionState, SocketManager};

pub type Result<T> = std::result::Result<T, Error>;
