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

use crate::wrapper::cni::args::CmdArgs;
use crate::wrapper::cni::config::{load_wrapper_config, WrapperConfig};
use crate::wrapper::cni::delegator::Delegator;
use crate::wrapper::cni::lock::IptablesLock;
use crate::wrapper::cni::rules::{
    egress_interfaces, host_interfaces_for, InterfaceLookup, IpTables, RuleSet,
};
use crate::wrapper::cni::store::{ContainerRecord, Store};
use crate::wrapper::cni::types::assigned_address;
use crate::wrapper::config::Config;
use crate::wrapper::logger::{log_info, log_warn};
use crate::wrapper::util::error::{
    aggregate, classified, classified_with_context, DynError, DynResult, ErrorKind,
};

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const COMPONENT: &str = "controller";

/// Drives ADD and DEL: delegate first, then record state and program the
/// host firewall, all under the iptables lock.
pub struct PluginController {
    delegator: Arc<dyn Delegator>,
    iptables: Arc<dyn IpTables>,
    interface_lookup: InterfaceLookup,
    lock_timeout: Duration,
}

impl PluginController {
    pub fn new(delegator: Arc<dyn Delegator>, iptables: Arc<dyn IpTables>) -> Self {
        Self {
            delegator,
            iptables,
            interface_lookup: host_interfaces_for,
            lock_timeout: Config::LockTimeout.duration(),
        }
    }

    pub fn with_interface_lookup(mut self, lookup: InterfaceLookup) -> Self {
        self.interface_lookup = lookup;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Serializes `netconf` and hands it to the delegate's ADD. Errors from
    /// the delegator are returned untouched.
    pub fn delegate_add<N>(&self, netconf: &N) -> DynResult<Value>
    where
        N: Serialize + ?Sized,
    {
        let (plugin, bytes) = encode_netconf(netconf)?;
        self.delegator.delegate_add(&plugin, &bytes)
    }

    pub fn delegate_del<N>(&self, netconf: &N) -> DynResult<()>
    where
        N: Serialize + ?Sized,
    {
        let (plugin, bytes) = encode_netconf(netconf)?;
        self.delegator.delegate_del(&plugin, &bytes)
    }

    pub fn add(&self, args: &CmdArgs) -> DynResult<Value> {
        let config = load_wrapper_config(&args.stdin_data)?;
        let container_id = args.container_id.as_str();
        log_info(
            COMPONENT,
            "Handling ADD",
            &[("container_id", container_id), ("ifname", &args.ifname)],
        );

        let _lock = IptablesLock::acquire(&config.iptables_lock_file, self.lock_timeout)?;
        let result = self.delegate_add(&config.delegate_netconf())?;

        let address = assigned_address(&result, &args.ifname)?;
        let mut record = ContainerRecord {
            ip: address.ip,
            interface: address.interface,
            egress_interfaces: egress_interfaces(&config, self.interface_lookup)?,
            port_mappings: config.port_mappings(),
            rules: Vec::new(),
        };
        let rules = RuleSet::for_container(&config, container_id, &record);
        record.rules = rules.operations().to_vec();

        let store = Store::new(&config.datastore);
        let previous = match store.get(container_id) {
            Ok(previous) => previous,
            Err(err) => {
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Ignoring unreadable container record",
                    &[("container_id", container_id), ("error", &error)],
                );
                None
            }
        };
        if let Some(previous) = previous.filter(|previous| *previous != record) {
            self.remove_stale_rules(&config, container_id, &previous);
        }
        store.put(container_id, &record)?;

        if let Err(err) = rules.apply(self.iptables.as_ref()) {
            if let Err(cleanup) = store.delete(container_id) {
                let error = cleanup.to_string();
                log_warn(
                    COMPONENT,
                    "Failed to discard container record after rule failure",
                    &[("container_id", container_id), ("error", &error)],
                );
            }
            return Err(err);
        }

        let ip = record.ip.to_string();
        log_info(
            COMPONENT,
            "Container attached",
            &[("container_id", container_id), ("ip", &ip)],
        );
        Ok(result)
    }

    pub fn del(&self, args: &CmdArgs) -> DynResult<()> {
        let config = load_wrapper_config(&args.stdin_data)?;
        let container_id = args.container_id.as_str();
        log_info(COMPONENT, "Handling DEL", &[("container_id", container_id)]);

        let _lock = IptablesLock::acquire(&config.iptables_lock_file, self.lock_timeout)?;
        let store = Store::new(&config.datastore);
        let mut errors: Vec<DynError> = Vec::new();

        match store.get(container_id) {
            Ok(Some(record)) => {
                let rules = RuleSet::installed(&config, container_id, &record);
                errors.extend(rules.remove(self.iptables.as_ref()));
            }
            Ok(None) => log_info(
                COMPONENT,
                "No container record, skipping rule removal",
                &[("container_id", container_id)],
            ),
            Err(err) => errors.push(err),
        }

        if let Err(err) = self.delegate_del(&config.delegate_netconf()) {
            errors.push(err);
        }
        if let Err(err) = store.delete(container_id) {
            errors.push(err);
        }

        let failures = errors.len().to_string();
        log_info(
            COMPONENT,
            "Container detached",
            &[("container_id", container_id), ("failures", &failures)],
        );
        aggregate(errors)
    }

    fn remove_stale_rules(
        &self,
        config: &WrapperConfig,
        container_id: &str,
        previous: &ContainerRecord,
    ) {
        let rules = RuleSet::installed(config, container_id, previous);
        for err in rules.remove(self.iptables.as_ref()) {
            let error = err.to_string();
            log_warn(
                COMPONENT,
                "Failed to remove stale container rule",
                &[("container_id", container_id), ("error", &error)],
            );
        }
    }
}

fn encode_netconf<N>(netconf: &N) -> DynResult<(String, Vec<u8>)>
where
    N: Serialize + ?Sized,
{
    let value = serde_json::to_value(netconf).map_err(|e| {
        classified_with_context(ErrorKind::Serialization, e, "serializing delegate netconf")
    })?;
    let plugin = value
        .get("type")
        .and_then(Value::as_str)
        .filter(|plugin| !plugin.is_empty())
        .ok_or_else(|| classified(ErrorKind::Config, "delegate config is missing type"))?
        .to_string();
    let bytes = serde_json::to_vec(&value).map_err(|e| {
        classified_with_context(ErrorKind::Serialization, e, "serializing delegate netconf")
    })?;
    Ok((plugin, bytes))
}
