use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid plugin descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("no plugin registered for {0}")]
    NotFound(String),
    #[error("failed to load plugin library {path:?}: {message}")]
    Library { path: PathBuf, message: String },
    #[error("plugin instantiation failed: {0}")]
    Instantiation(String),
    #[error("plugin is not instantiated")]
    NotInstantiated,
    #[error("plugin is not active")]
    NotActive,
    #[error("plugin state cannot be saved")]
    Unsavable,
    #[error("plugin state rejected: {0}")]
    State(String),
    #[error("plugin failed while processing: {0}")]
    Process(&'static str),
    #[error("plugin crashed")]
    Crashed,
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge io error: {0}")]
    Io(#[from] io::Error),
    #[error("bridge message could not be encoded: {0}")]
    Codec(#[from] bincode::Error),
    #[error("failed to start sandbox: {0}")]
    Spawn(String),
    #[error("unexpected sandbox reply: {0}")]
    Protocol(String),
    #[error("sandbox did not answer in time")]
    Timeout,
    #[error("sandbox reported an error: {0}")]
    Remote(String),
    #[error("sandbox connection closed")]
    Disconnected,
    #[error("shared audio ring is invalid: {0}")]
    Ring(&'static str),
}
