//! # Relay TLS
//!
//! The TLS legs of the relay family. `relay-untls` strips TLS off selected
//! connections by minting leaf certificates signed by a local CA and hands
//! the plaintext to the interception chain; `relay-retls` re-establishes a
//! real TLS session toward the destination at the far end of the chain.

pub mod certgen;
pub mod clienthello;
pub mod duplex;
pub mod prefixed;

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
