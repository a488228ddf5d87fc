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

use crate::wrapper::cni::types::DEFAULT_CNI_VERSION;
use crate::wrapper::util::error::{classified, classified_with_context, DynResult, ErrorKind};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wrapper-specific settings parsed from the network configuration on stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrapperConfig {
    pub datastore: String,
    pub iptables_lock_file: String,
    pub instance_address: String,
    pub underlay_ips: Vec<String>,
    pub temporary_underlay_interface_names: Vec<String>,
    pub iptables_asg_logging: bool,
    pub ingress_tag: String,
    pub vtep_name: String,
    pub iptables_denied_logs_per_sec: u32,
    pub iptables_accepted_udp_logs_per_sec: u32,
    pub delegate: Map<String, Value>,
    #[serde(rename = "runtimeConfig", skip_serializing_if = "Option::is_none")]
    pub runtime_config: Option<RuntimeConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(rename = "portMappings", default)]
    pub port_mappings: Vec<RuntimePortMapping>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RuntimePortMapping {
    #[serde(rename = "hostPort")]
    pub host_port: u16,
    #[serde(rename = "containerPort")]
    pub container_port: u16,
    #[serde(rename = "protocol", default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Deserialize)]
struct RawWrapperConfig {
    #[serde(default)]
    datastore: Option<String>,
    #[serde(default)]
    iptables_lock_file: Option<String>,
    #[serde(default)]
    instance_address: Option<String>,
    #[serde(default)]
    underlay_ips: Option<Vec<String>>,
    #[serde(default)]
    temporary_underlay_interface_names: Option<Vec<String>>,
    #[serde(default)]
    iptables_asg_logging: Option<bool>,
    #[serde(default)]
    ingress_tag: Option<String>,
    #[serde(default)]
    vtep_name: Option<String>,
    #[serde(default)]
    iptables_denied_logs_per_sec: Option<i64>,
    #[serde(default)]
    iptables_accepted_udp_logs_per_sec: Option<i64>,
    #[serde(default)]
    delegate: Option<Map<String, Value>>,
    #[serde(rename = "runtimeConfig", default)]
    runtime_config: Option<RuntimeConfig>,
    #[serde(default)]
    name: Option<String>,
}

/// Parses and validates the wrapper configuration.
///
/// Pure: the only input is `input`. The delegate blob is passed through
/// untouched apart from receiving a default `cniVersion`.
pub fn load_wrapper_config(input: &[u8]) -> DynResult<WrapperConfig> {
    let raw: RawWrapperConfig = serde_json::from_slice(input)
        .map_err(|e| classified_with_context(ErrorKind::Config, e, "loading wrapper config"))?;

    let datastore = required(raw.datastore, "missing datastore path")?;
    let iptables_lock_file = required(raw.iptables_lock_file, "missing iptables lock file path")?;
    let underlay_ips = match raw.underlay_ips {
        Some(ips) if !ips.is_empty() && ips.iter().all(|ip| !ip.trim().is_empty()) => ips,
        _ => return Err(classified(ErrorKind::Config, "missing underlay ips")),
    };
    let instance_address = required(raw.instance_address, "missing instance address")?;
    let ingress_tag = required(raw.ingress_tag, "missing ingress tag")?;
    let vtep_name = required(raw.vtep_name, "missing vtep device name")?;
    let iptables_denied_logs_per_sec =
        log_rate(raw.iptables_denied_logs_per_sec, "invalid denied logs per sec")?;
    let iptables_accepted_udp_logs_per_sec = log_rate(
        raw.iptables_accepted_udp_logs_per_sec,
        "invalid accepted udp logs per sec",
    )?;

    let mut delegate = raw.delegate.unwrap_or_default();
    delegate
        .entry("cniVersion")
        .or_insert_with(|| Value::String(DEFAULT_CNI_VERSION.to_string()));

    Ok(WrapperConfig {
        datastore,
        iptables_lock_file,
        instance_address,
        underlay_ips,
        temporary_underlay_interface_names: raw
            .temporary_underlay_interface_names
            .unwrap_or_default(),
        iptables_asg_logging: raw.iptables_asg_logging.unwrap_or(false),
        ingress_tag,
        vtep_name,
        iptables_denied_logs_per_sec,
        iptables_accepted_udp_logs_per_sec,
        delegate,
        runtime_config: raw.runtime_config,
        name: raw.name.filter(|name| !name.is_empty()),
    })
}

fn required(value: Option<String>, message: &'static str) -> DynResult<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(classified(ErrorKind::Config, message)),
    }
}

fn log_rate(value: Option<i64>, message: &'static str) -> DynResult<u32> {
    value
        .and_then(|rate| u32::try_from(rate).ok())
        .ok_or_else(|| classified(ErrorKind::Config, message))
}

impl WrapperConfig {
    /// Builds the netconf handed to the delegate: the delegate blob merged
    /// with the runtime arguments of this invocation.
    pub fn delegate_netconf(&self) -> Map<String, Value> {
        let mut netconf = self.delegate.clone();
        if let Some(name) = &self.name {
            netconf
                .entry("name")
                .or_insert_with(|| Value::String(name.clone()));
        }
        if let Some(runtime_config) = &self.runtime_config {
            if let Ok(value) = serde_json::to_value(runtime_config) {
                netconf.insert("runtimeConfig".to_string(), value);
            }
        }
        netconf
    }

    /// Port mappings requested by the runtime for this invocation.
    pub fn port_mappings(&self) -> Vec<RuntimePortMapping> {
        self.runtime_config
            .as_ref()
            .map(|runtime| runtime.port_mappings.clone())
            .unwrap_or_default()
    }
}
