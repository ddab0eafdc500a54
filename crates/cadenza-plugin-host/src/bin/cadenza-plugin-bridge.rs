//! Sandbox process for bridged plugins. Speaks the bridge protocol on
//! stdin/stdout; logs go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use cadenza_plugin_host::bridge::server;
use cadenza_plugin_host::NativeRegistry;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let registry = Arc::new(NativeRegistry::with_builtins());
    tracing::debug!(plugins = registry.descriptors().len(), "bridge ready");
    server::serve(std::io::stdin(), std::io::stdout(), registry)
        .context("plugin bridge terminated with an error")
}
