// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use serde::Deserialize;

/// Default port clients connect to when none is configured.
pub const DEFAULT_PORT: u16 = 9999;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen address, e.g. "127.0.0.1"
    #[serde(default = "default_listen_on")]
    pub listen_on: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Storage root; contains blobs/, staging/ and db/
    #[serde(default)]
    pub dir: Option<String>,

    /// Log file location (stderr when absent)
    #[serde(default)]
    pub log: Option<String>,

    /// Detach from the terminal before serving
    #[serde(default = "default_daemonize")]
    pub daemonize: bool,

    /// Legacy origin consulted on read misses (migration mode)
    #[serde(default)]
    pub fallback_url: Option<String>,

    /// Delete unreferenced blobs before serving
    #[serde(default)]
    pub sweep_on_startup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on: default_listen_on(),
            port: default_port(),
            dir: None,
            log: None,
            daemonize: default_daemonize(),
            fallback_url: None,
            sweep_on_startup: false,
        }
    }
}

impl Config {
    pub fn from_path(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        Ok(cfg)
    }
}

fn default_listen_on() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_daemonize() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: Config = toml::from_str("dir = \"/srv/filetracker\"").unwrap();
        assert_eq!(cfg.listen_on, "127.0.0.1");
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.dir.as_deref(), Some("/srv/filetracker"));
        assert!(cfg.daemonize);
        assert!(!cfg.sweep_on_startup);
        assert!(cfg.fallback_url.is_none());
    }
}
