//! Command-line surface and logging setup for the intercepting relay.

use clap::Parser;

/// socks <=> socks relay for live traffic introspection, interception &
/// manipulation.
#[derive(Parser, Debug)]
#[command(name = "relay-core")]
pub struct Args {
    /// IP:PORT to listen on
    #[arg(short = 'l', long)]
    pub listen: String,

    /// IP:PORT of the socks proxy to connect to, or "direct" for none
    #[arg(short = 'c', long)]
    pub via: String,

    /// Comma-separated list of interceptor plugins to enable
    #[arg(long, default_value = "http")]
    pub plugins: String,
}

impl Args {
    pub fn plugin_selection(&self) -> Vec<String> {
        self.plugins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// `DEBUG` in the environment (any value) raises the default verbosity to
/// debug; an explicit `RUST_LOG` still wins.
pub fn init_logging() {
    let default = if std::env::var_os("DEBUG").is_some() {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_selection() {
        let args = Args {
            listen: "127.0.0.1:2666".to_string(),
            via: "direct".to_string(),
            plugins: "http, websocket ,".to_string(),
        };
        assert_eq!(args.plugin_selection(), vec!["http", "websocket"]);
    }
}
