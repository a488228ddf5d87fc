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

use crate::wrapper::util::error::{classified, DynResult, ErrorKind};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::net::Ipv4Addr;

pub const DEFAULT_CNI_VERSION: &str = "0.3.1";
pub const SUPPORTED_CNI_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0"];

pub const CODE_INVALID_ENVIRONMENT: u32 = 4;
pub const CODE_TRY_AGAIN_LATER: u32 = 11;
pub const CODE_INTERNAL: u32 = 999;

/// Structured error object of the CNI plugin error convention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CniError {
    #[serde(rename = "cniVersion", default, skip_serializing_if = "Option::is_none")]
    pub cni_version: Option<String>,
    pub code: u32,
    pub msg: String,
    #[serde(default)]
    pub details: String,
}

impl CniError {
    pub fn new(code: u32, msg: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            cni_version: None,
            code,
            msg: msg.into(),
            details: details.into(),
        }
    }
}

/// Failure reported by (or while running) the delegate plugin.
///
/// Carries the delegate's own code, message and details so the wrapper can
/// hand them to the runtime untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateError {
    pub code: u32,
    pub msg: String,
    pub details: String,
}

impl DelegateError {
    pub fn new(code: u32, msg: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            details: details.into(),
        }
    }
}

impl fmt::Display for DelegateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.msg)
        } else {
            write!(f, "{}; {}", self.msg, self.details)
        }
    }
}

impl Error for DelegateError {}

impl From<CniError> for DelegateError {
    fn from(error: CniError) -> Self {
        DelegateError::new(error.code, error.msg, error.details)
    }
}

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    #[serde(rename = "cniVersion")]
    pub cni_version: &'static str,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: &'static [&'static str],
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            cni_version: DEFAULT_CNI_VERSION,
            supported_versions: SUPPORTED_CNI_VERSIONS,
        }
    }
}

/// Address and interface a delegate assigned to the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedAddress {
    pub ip: Ipv4Addr,
    pub interface: Option<String>,
}

/// Extracts the first IPv4 address from a delegate result.
///
/// Understands the 0.1.0/0.2.0 layout (`ip4.ip`) as well as the 0.3.0 and
/// later layout (`ips[]`, with `interface` indexing into `interfaces[]`).
pub fn assigned_address(result: &Value, default_interface: &str) -> DynResult<AssignedAddress> {
    if let Some(ip) = result
        .get("ip4")
        .and_then(|ip4| ip4.get("ip"))
        .and_then(Value::as_str)
        .and_then(parse_ipv4_cidr)
    {
        return Ok(AssignedAddress {
            ip,
            interface: Some(default_interface.to_string()),
        });
    }

    let interfaces = result
        .get("interfaces")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for entry in result
        .get("ips")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(ip) = entry
            .get("address")
            .and_then(Value::as_str)
            .and_then(parse_ipv4_cidr)
        else {
            continue;
        };
        let interface = entry
            .get("interface")
            .and_then(Value::as_u64)
            .and_then(|index| interfaces.get(index as usize))
            .and_then(|iface| iface.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(default_interface.to_string()));
        return Ok(AssignedAddress { ip, interface });
    }

    Err(classified(
        ErrorKind::RuleApplication,
        "finding assigned ipv4 address in delegate result",
    ))
}

fn parse_ipv4_cidr(value: &str) -> Option<Ipv4Addr> {
    let address = value.split_once('/').map_or(value, |(addr, _)| addr);
    address.trim().parse::<Ipv4Addr>().ok()
}
