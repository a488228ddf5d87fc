/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::env;
use std::time::Duration;

/// Enum for supported process-level settings
#[derive(Debug, Clone, Copy)]
pub enum Config {
    LockTimeout,
    DelegateTimeout,
    IptablesBinary,
    LogFormat,
    LogFile,
}

impl Config {
    /// Returns the associated environment variable for the setting.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::LockTimeout => "CNI_WRAPPER_LOCK_TIMEOUT_SECS",
            Config::DelegateTimeout => "CNI_WRAPPER_DELEGATE_TIMEOUT_SECS",
            Config::IptablesBinary => "CNI_WRAPPER_IPTABLES",
            Config::LogFormat => "CNI_WRAPPER_LOG_FORMAT",
            Config::LogFile => "CNI_WRAPPER_LOG_FILE",
        }
    }

    /// Returns the value used when the environment does not provide one.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            Config::LockTimeout => Some("30"),
            Config::DelegateTimeout => Some("60"),
            Config::IptablesBinary => Some("iptables"),
            Config::LogFormat => Some("text"),
            Config::LogFile => None,
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get(&self) -> Option<String> {
        match env::var(self.env_var()) {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => self.default_value().map(str::to_string),
        }
    }

    /// Interprets the setting as a whole number of seconds.
    ///
    /// Unparsable or zero values fall back to the default so a typo in the
    /// runtime environment never disables a timeout.
    pub fn duration(&self) -> Duration {
        let fallback = self
            .default_value()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        let secs = match self.get().map(|value| value.parse::<u64>()) {
            Some(Ok(secs)) if secs > 0 => secs,
            Some(_) => {
                crate::wrapper::logger::log_warn(
                    "config",
                    "Ignoring invalid duration setting",
                    &[("variable", self.env_var())],
                );
                fallback
            }
            None => fallback,
        };
        Duration::from_secs(secs)
    }
}
