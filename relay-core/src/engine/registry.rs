//! The interceptor plugin registry.
//!
//! Plugins are named, pre-compiled implementations selected at start-up.
//! A reload (SIGHUP) rebuilds the set and swaps it atomically for *new*
//! connections only; live connections keep the set they started with. If
//! any plugin fails to load, the previous set stays installed.

use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

use super::interceptor::{PluginSet, ProtocolPlugin};
use crate::http::HttpPlugin;

lazy_static! {
    static ref REGISTRY: RwLock<PluginSet> = RwLock::new(Arc::new(Vec::new()));
}

fn builtin(name: &str) -> Option<Arc<dyn ProtocolPlugin>> {
    match name {
        "http" => Some(Arc::new(HttpPlugin::new())),
        _ => None,
    }
}

/// Build and install a fresh plugin set. Returns an error (and leaves the
/// installed set untouched) when a name is unknown or an `init` fails.
pub fn reload(selection: &[String]) -> Result<usize, String> {
    let mut set: Vec<(String, Arc<dyn ProtocolPlugin>)> = Vec::new();
    for name in selection {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        log::info!("Trying to load interceptor \"{}\"...", name);
        let plugin =
            builtin(name).ok_or_else(|| format!("unknown interceptor \"{}\"", name))?;
        plugin
            .init()
            .map_err(|e| format!("interceptor \"{}\" failed to initialize: {}", name, e))?;
        log::info!("Interceptor \"{}\" loaded", name);
        set.push((name.to_string(), plugin));
    }
    let count = set.len();
    *REGISTRY.write().unwrap() = Arc::new(set);
    Ok(count)
}

/// Snapshot of the currently installed set; captured once per connection.
pub fn current() -> PluginSet {
    REGISTRY.read().unwrap().clone()
}
