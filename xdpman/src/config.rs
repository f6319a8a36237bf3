// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of xdpman

use std::{collections::HashMap, str::FromStr};

use log::{debug, warn};
use serde::Deserialize;

use crate::{errors::ParseError, types::XdpMode};

pub(crate) const CFGPATH_XDPMAN_CONFIG: &str = "/etc/xdpman/xdpman.toml";

/// Host-level defaults for dispatcher installation: where to look for
/// the dispatcher template object, and which attach mode an interface
/// gets when the caller does not name one.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    dispatcher: DispatcherConfig,
    #[serde(default)]
    interfaces: HashMap<String, InterfaceConfig>,
}

impl Config {
    /// Directories searched, in order, for the dispatcher template
    /// object.
    pub(crate) fn object_dirs(&self) -> &[String] {
        &self.dispatcher.object_dirs
    }

    /// The attach mode configured for `iface`, if any. Consulted only
    /// when an attach request passes `XdpMode::Unspec`.
    pub(crate) fn default_mode(&self, iface: &str) -> Option<XdpMode> {
        self.interfaces.get(iface).map(|i| i.default_mode)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    object_dirs: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            object_dirs: vec![
                "/usr/local/lib/bpf".to_string(),
                "/usr/lib/bpf".to_string(),
            ],
        }
    }
}

#[derive(Debug, Deserialize, Copy, Clone)]
pub struct InterfaceConfig {
    default_mode: XdpMode,
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(ParseError::ConfigParseError)
    }
}

pub(crate) fn open_config_file() -> Config {
    if let Ok(c) = std::fs::read_to_string(CFGPATH_XDPMAN_CONFIG) {
        if let Ok(config) = c.parse::<Config>() {
            config
        } else {
            warn!("Unable to parse config file, using defaults");
            Config::default()
        }
    } else {
        debug!("Unable to read config file, using defaults");
        Config::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_rejects_non_toml() {
        assert!(Config::from_str("dispatch-7/link-prog0").is_err());
    }

    #[test]
    fn test_missing_sections_fall_back_to_defaults() {
        let config: Config = toml::from_str("").expect("error parsing toml input");
        assert_eq!(
            config.object_dirs(),
            &["/usr/local/lib/bpf".to_string(), "/usr/lib/bpf".to_string()]
        );
        assert_eq!(config.default_mode("ens3"), None);
    }

    #[test]
    fn test_object_dirs_override_replaces_defaults() {
        let input = r#"
        [dispatcher]
        object_dirs = ["/srv/xdp/objects", "/usr/lib/bpf"]
        "#;
        let config: Config = toml::from_str(input).expect("error parsing toml input");
        assert_eq!(
            config.object_dirs(),
            &["/srv/xdp/objects".to_string(), "/usr/lib/bpf".to_string()]
        );
    }

    #[test]
    fn test_per_interface_default_modes() {
        let input = r#"
        [dispatcher]
        object_dirs = ["/srv/xdp/objects"]

        [interfaces.ens3]
        default_mode = "drv"
        [interfaces.xdptest0]
        default_mode = "skb"
        "#;
        let config: Config = toml::from_str(input).expect("error parsing toml input");
        assert_eq!(config.default_mode("ens3"), Some(XdpMode::Drv));
        assert_eq!(config.default_mode("xdptest0"), Some(XdpMode::Skb));
        // Unconfigured interfaces stay unspecified; the kernel picks.
        assert_eq!(config.default_mode("lo"), None);
        // The dispatcher section is independent of the interface table.
        assert_eq!(config.object_dirs(), &["/srv/xdp/objects".to_string()]);
    }
}
