//! The daemon's configuration file format.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// The top-level TOML configuration for `sabled`.
///
/// Every field has a default, so an empty file (or no file at all) yields a
/// working mainnet node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SabledConfig {
    /// Default log filter directives, overridable with `--filter`.
    pub tracing_filter: String,

    /// The `[network]` section, passed through to the networking core.
    pub network: sable_network::Config,
}

impl Default for SabledConfig {
    fn default() -> Self {
        SabledConfig {
            tracing_filter: "info".to_owned(),
            network: sable_network::Config::default(),
        }
    }
}

impl SabledConfig {
    /// Load the configuration from a TOML file.
    pub fn load(path: &Path) -> color_eyre::eyre::Result<SabledConfig> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_valid() {
        sable_test::init();
        let config: SabledConfig = toml::from_str("").expect("empty config parses");
        assert_eq!(config.tracing_filter, "info");
        assert_eq!(config.network.target_outbound_peers, 8);
    }

    #[test]
    fn network_section_overrides() {
        sable_test::init();
        let config: SabledConfig = toml::from_str(
            r#"
            tracing_filter = "debug"

            [network]
            network = "regtest"
            listen_addr = "127.0.0.1:18444"
            target_outbound_peers = 2
            initial_peers = ["127.0.0.1:18445"]
            "#,
        )
        .expect("config parses");
        assert_eq!(config.tracing_filter, "debug");
        assert_eq!(
            config.network.network,
            sable_chain::parameters::Network::Regtest
        );
        assert_eq!(config.network.target_outbound_peers, 2);
        assert_eq!(config.network.initial_peers.len(), 1);
    }

    #[test]
    fn default_roundtrips_through_toml() {
        sable_test::init();
        let config = SabledConfig::default();
        let serialized = toml::to_string(&config).expect("default config serializes");
        let parsed: SabledConfig = toml::from_str(&serialized).expect("round-trips");
        assert_eq!(parsed.network.listen_addr, config.network.listen_addr);
    }
}
