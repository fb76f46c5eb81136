// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Fan-in configuration options

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{FanInError, Result};

/// Configuration option "fanin.relay_capacity"
pub const OPT_RELAY_CAPACITY: &str = "fanin.relay_capacity";

/// Configuration option "fanin.drop_in_flight_on_cancel"
pub const OPT_DROP_IN_FLIGHT_ON_CANCEL: &str = "fanin.drop_in_flight_on_cancel";

/// A single documented configuration entry, as returned by [`FanInConfig::entries`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    /// key used to identify this configuration option
    pub key: &'static str,
    /// current value, rendered as a string
    pub value: String,
    /// Description to be used in generated documentation
    pub description: &'static str,
}

/// Options controlling how a [`StreamSource`](crate::StreamSource) fans
/// its parts into a single stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanInConfig {
    /// Maximum number of batches buffered between the part runners and
    /// the consumer. Producers suspend once this many are in flight.
    pub relay_capacity: usize,
    /// When the consumer cancels, discard batches already buffered in
    /// the relay instead of delivering them before completion.
    pub drop_in_flight_on_cancel: bool,
}

impl Default for FanInConfig {
    fn default() -> Self {
        Self {
            relay_capacity: 16,
            drop_in_flight_on_cancel: true,
        }
    }
}

impl FanInConfig {
    /// Create a config with default settings
    pub fn new() -> Self {
        Default::default()
    }

    /// Create a config with options read from the environment.
    ///
    /// Each key maps to an upper-cased variable with `.` replaced by `_`,
    /// e.g. `fanin.relay_capacity` is read from `FANIN_RELAY_CAPACITY`.
    pub fn from_env() -> Result<Self> {
        let mut ret = Self::default();
        for key in [OPT_RELAY_CAPACITY, OPT_DROP_IN_FLIGHT_ON_CANCEL] {
            let env = key.to_uppercase().replace('.', "_");
            if let Some(var) = std::env::var_os(env) {
                ret.set(key, var.to_string_lossy().as_ref())?;
            }
        }
        Ok(ret)
    }

    /// Create a config taking values from a string hash map
    pub fn from_string_hash_map(settings: HashMap<String, String>) -> Result<Self> {
        let mut ret = Self::default();
        for (k, v) in settings {
            ret.set(&k, &v)?;
        }
        Ok(ret)
    }

    /// Set a configuration option by its dotted key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            OPT_RELAY_CAPACITY => {
                let capacity: usize = parse(key, value)?;
                if capacity == 0 {
                    return Err(FanInError::Plan(format!(
                        "Config value \"{key}\" must be greater than zero"
                    )));
                }
                self.relay_capacity = capacity;
            }
            OPT_DROP_IN_FLIGHT_ON_CANCEL => {
                self.drop_in_flight_on_cancel = parse(key, value)?;
            }
            _ => {
                return Err(FanInError::Plan(format!(
                    "Config value \"{key}\" not found on FanInConfig"
                )))
            }
        }
        Ok(())
    }

    /// Customize relay capacity
    pub fn with_relay_capacity(mut self, n: usize) -> Self {
        // a zero capacity relay could never hand off a batch
        assert!(n > 0);
        self.relay_capacity = n;
        self
    }

    /// Customize whether buffered batches are dropped on cancel
    pub fn with_drop_in_flight_on_cancel(mut self, enabled: bool) -> Self {
        self.drop_in_flight_on_cancel = enabled;
        self
    }

    /// Returns every option with its current value and description
    pub fn entries(&self) -> Vec<ConfigEntry> {
        vec![
            ConfigEntry {
                key: OPT_RELAY_CAPACITY,
                value: self.relay_capacity.to_string(),
                description: "Maximum number of record batches buffered between the part \
                    runners and the consumer. Part runners suspend while the relay is full.",
            },
            ConfigEntry {
                key: OPT_DROP_IN_FLIGHT_ON_CANCEL,
                value: self.drop_in_flight_on_cancel.to_string(),
                description: "When set to true, batches already buffered in the relay are \
                    discarded once the consumer cancels the subscription.",
            },
        ]
    }

    /// Generate documentation that can be included in the user guide
    pub fn generate_config_markdown() -> String {
        let mut docs = "| key | default | description |\n".to_string();
        docs += "|-----|---------|-------------|\n";
        for entry in Self::default().entries() {
            docs += &format!(
                "| {} | {} | {} |\n",
                entry.key, entry.value, entry.description
            );
        }
        docs
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| {
        FanInError::Plan(format!(
            "Error parsing '{value}' as config value \"{key}\": {e}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = FanInConfig::new();
        assert_eq!(config.relay_capacity, 16);
        assert!(config.drop_in_flight_on_cancel);
    }

    #[test]
    fn get_then_set() -> Result<()> {
        let mut config = FanInConfig::new();
        config.set(OPT_RELAY_CAPACITY, "4")?;
        config.set(OPT_DROP_IN_FLIGHT_ON_CANCEL, "false")?;
        assert_eq!(config.relay_capacity, 4);
        assert!(!config.drop_in_flight_on_cancel);
        Ok(())
    }

    #[test]
    fn set_invalid() {
        let mut config = FanInConfig::new();
        let err = config.set("not.valid", "1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error during planning: Config value \"not.valid\" not found on FanInConfig"
        );

        assert!(config.set(OPT_RELAY_CAPACITY, "zero").is_err());
        assert!(config.set(OPT_RELAY_CAPACITY, "0").is_err());
        assert_eq!(config.relay_capacity, 16);
    }

    #[test]
    fn from_hash_map() -> Result<()> {
        let settings = HashMap::from([(OPT_RELAY_CAPACITY.to_string(), "2".to_string())]);
        let config = FanInConfig::from_string_hash_map(settings)?;
        assert_eq!(config.relay_capacity, 2);
        Ok(())
    }

    #[test]
    #[should_panic]
    fn zero_capacity_builder_panics() {
        FanInConfig::new().with_relay_capacity(0);
    }

    #[test]
    fn docs() {
        let docs = FanInConfig::generate_config_markdown();
        assert!(docs.starts_with("| key | default | description |\n"));
        assert!(docs.contains("| fanin.relay_capacity | 16 |"));
        assert!(docs.contains("| fanin.drop_in_flight_on_cancel | true |"));
    }
}
