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

use crate::wrapper::cni::config::{RuntimePortMapping, WrapperConfig};
use crate::wrapper::cni::store::ContainerRecord;
use crate::wrapper::config::Config;
use crate::wrapper::logger::{log_debug, log_warn};
use crate::wrapper::util::error::{
    classified, classified_with_context, new_error, with_context, DynError, DynResult, ErrorKind,
};

use nix::ifaddrs::getifaddrs;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::{Command, Output};

const COMPONENT: &str = "rules";
const TABLE_NAT: &str = "nat";
const TABLE_MANGLE: &str = "mangle";
const TABLE_FILTER: &str = "filter";
const LOG_BURST: u32 = 5;
const OWNER_COMMENT_PREFIX: &str = "cni-wrapper";

/// Minimal iptables surface needed to program one container's rules.
///
/// Rules are passed as argument vectors (`["-s", "10.0.0.1/32", "-j", "ACCEPT"]`).
pub trait IpTables: Send + Sync {
    fn chain_exists(&self, table: &str, chain: &str) -> DynResult<bool>;
    fn new_chain(&self, table: &str, chain: &str) -> DynResult<()>;
    fn flush_chain(&self, table: &str, chain: &str) -> DynResult<()>;
    fn delete_chain(&self, table: &str, chain: &str) -> DynResult<()>;
    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> DynResult<bool>;
    fn insert(&self, table: &str, chain: &str, position: u32, rule: &[String]) -> DynResult<()>;
    fn append(&self, table: &str, chain: &str, rule: &[String]) -> DynResult<()>;
    fn delete(&self, table: &str, chain: &str, rule: &[String]) -> DynResult<()>;
}

/// [`IpTables`] backed by the `iptables` binary.
pub struct IptablesCommand {
    binary: String,
}

impl IptablesCommand {
    pub fn new() -> Self {
        let binary = Config::IptablesBinary
            .get()
            .unwrap_or_else(|| "iptables".to_string());
        Self { binary }
    }

    fn output(&self, table: &str, args: &[&str], rule: &[String]) -> DynResult<Output> {
        Command::new(&self.binary)
            .args(["-w", "-t", table])
            .args(args)
            .args(rule)
            .output()
            .map_err(|e| with_context(e, format!("Failed to execute {}", self.binary)))
    }

    fn run(&self, table: &str, args: &[&str], rule: &[String]) -> DynResult<()> {
        let output = self.output(table, args, rule)?;
        if output.status.success() {
            return Ok(());
        }
        Err(new_error(format!(
            "{} -t {} {} {} failed (exit status: {}): {}",
            self.binary,
            table,
            args.join(" "),
            rule.join(" "),
            describe_status(&output),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    /// Runs a check command where exit status 1 means "not present".
    fn check(&self, table: &str, args: &[&str], rule: &[String]) -> DynResult<bool> {
        let output = self.output(table, args, rule)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(new_error(format!(
                "{} -t {} {} {} failed (exit status: {}): {}",
                self.binary,
                table,
                args.join(" "),
                rule.join(" "),
                describe_status(&output),
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

impl Default for IptablesCommand {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_status(output: &Output) -> String {
    output
        .status
        .code()
        .map(|code| code.to_string())
        .unwrap_or_else(|| "terminated by signal".to_string())
}

impl IpTables for IptablesCommand {
    fn chain_exists(&self, table: &str, chain: &str) -> DynResult<bool> {
        self.check(table, &["-S", chain], &[])
    }

    fn new_chain(&self, table: &str, chain: &str) -> DynResult<()> {
        self.run(table, &["-N", chain], &[])
    }

    fn flush_chain(&self, table: &str, chain: &str) -> DynResult<()> {
        self.run(table, &["-F", chain], &[])
    }

    fn delete_chain(&self, table: &str, chain: &str) -> DynResult<()> {
        self.run(table, &["-X", chain], &[])
    }

    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> DynResult<bool> {
        self.check(table, &["-C", chain], rule)
    }

    fn insert(&self, table: &str, chain: &str, position: u32, rule: &[String]) -> DynResult<()> {
        let position = position.to_string();
        self.run(table, &["-I", chain, &position], rule)
    }

    fn append(&self, table: &str, chain: &str, rule: &[String]) -> DynResult<()> {
        self.run(table, &["-A", chain], rule)
    }

    fn delete(&self, table: &str, chain: &str, rule: &[String]) -> DynResult<()> {
        self.run(table, &["-D", chain], rule)
    }
}

/// Short stable identifier for a container, usable inside chain names.
///
/// iptables limits chain names to 28 characters, so container ids are hashed.
pub fn container_hash(container_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(container_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..12].to_string()
}

/// One idempotent firewall mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Create a chain owned by this container.
    NewChain { table: String, chain: String },
    /// Append a rule to a chain owned by this container.
    Append {
        table: String,
        chain: String,
        rule: Vec<String>,
    },
    /// Insert a rule at the top of a built-in chain.
    Insert {
        table: String,
        chain: String,
        rule: Vec<String>,
    },
}

impl Operation {
    fn apply(&self, iptables: &dyn IpTables) -> DynResult<()> {
        match self {
            Operation::NewChain { table, chain } => {
                if !iptables.chain_exists(table, chain)? {
                    iptables.new_chain(table, chain)?;
                }
            }
            Operation::Append { table, chain, rule } => {
                if !iptables.exists(table, chain, rule)? {
                    iptables.append(table, chain, rule)?;
                }
            }
            Operation::Insert { table, chain, rule } => {
                if !iptables.exists(table, chain, rule)? {
                    iptables.insert(table, chain, 1, rule)?;
                }
            }
        }
        Ok(())
    }

    /// Undoes [`Operation::apply`]; an already absent rule or chain is success.
    fn revert(&self, iptables: &dyn IpTables) -> DynResult<()> {
        match self {
            Operation::NewChain { table, chain } => {
                if iptables.chain_exists(table, chain)? {
                    iptables.flush_chain(table, chain)?;
                    iptables.delete_chain(table, chain)?;
                }
            }
            Operation::Append { table, chain, rule } => {
                if !iptables.chain_exists(table, chain)? {
                    return Ok(());
                }
                if rule_present(iptables, table, chain, rule)? {
                    iptables.delete(table, chain, rule)?;
                }
            }
            Operation::Insert { table, chain, rule } => {
                if rule_present(iptables, table, chain, rule)? {
                    iptables.delete(table, chain, rule)?;
                }
            }
        }
        Ok(())
    }
}

/// `iptables -C` rejects a rule whose jump target chain is gone, so a jump to
/// a missing chain is reported as absent without asking.
fn rule_present(
    iptables: &dyn IpTables,
    table: &str,
    chain: &str,
    rule: &[String],
) -> DynResult<bool> {
    if let Some(target) = jump_chain(rule) {
        if !iptables.chain_exists(table, target)? {
            return Ok(false);
        }
    }
    iptables.exists(table, chain, rule)
}

/// Target of `-j` when it names a user chain rather than a target extension.
pub fn jump_chain(rule: &[String]) -> Option<&str> {
    rule.windows(2)
        .find(|pair| pair[0] == "-j")
        .map(|pair| pair[1].as_str())
        .filter(|target| !target.chars().all(|c| c.is_ascii_uppercase()))
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::NewChain { table, chain } => write!(f, "-t {} -N {}", table, chain),
            Operation::Append { table, chain, rule } => {
                write!(f, "-t {} -A {} {}", table, chain, rule.join(" "))
            }
            Operation::Insert { table, chain, rule } => {
                write!(f, "-t {} -I {} 1 {}", table, chain, rule.join(" "))
            }
        }
    }
}

/// Ordered firewall mutations for a single container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    container_hash: String,
    operations: Vec<Operation>,
}

impl RuleSet {
    /// Derives the rules for `record` from the current configuration.
    pub fn for_container(
        config: &WrapperConfig,
        container_id: &str,
        record: &ContainerRecord,
    ) -> RuleSet {
        RuleBuilder::new(config, container_id, record).build()
    }

    /// Rules that were installed for `record`. Records written before the
    /// operations were persisted fall back to deriving them.
    pub fn installed(
        config: &WrapperConfig,
        container_id: &str,
        record: &ContainerRecord,
    ) -> RuleSet {
        if record.rules.is_empty() {
            return Self::for_container(config, container_id, record);
        }
        RuleSet {
            container_hash: container_hash(container_id),
            operations: record.rules.clone(),
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Applies every operation in order. On failure the operations already
    /// applied by this call are reverted, best effort, before returning.
    pub fn apply(&self, iptables: &dyn IpTables) -> DynResult<()> {
        for (index, operation) in self.operations.iter().enumerate() {
            if let Err(err) = operation.apply(iptables) {
                self.rollback(iptables, index);
                return Err(classified_with_context(
                    ErrorKind::RuleApplication,
                    err,
                    format!("applying iptables rule '{}'", operation),
                ));
            }
        }
        log_debug(
            COMPONENT,
            "Applied container rules",
            &[
                ("container", &self.container_hash),
                ("operations", &self.operations.len().to_string()),
            ],
        );
        Ok(())
    }

    fn rollback(&self, iptables: &dyn IpTables, applied: usize) {
        for operation in self.operations[..applied].iter().rev() {
            if let Err(err) = operation.revert(iptables) {
                let operation = operation.to_string();
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Failed to roll back iptables operation",
                    &[
                        ("container", &self.container_hash),
                        ("operation", &operation),
                        ("error", &error),
                    ],
                );
            }
        }
    }

    /// Reverts every operation in reverse order. Each step is attempted even
    /// when an earlier one fails; all failures are returned.
    pub fn remove(&self, iptables: &dyn IpTables) -> Vec<DynError> {
        let mut errors = Vec::new();
        for operation in self.operations.iter().rev() {
            if let Err(err) = operation.revert(iptables) {
                errors.push(classified_with_context(
                    ErrorKind::RuleApplication,
                    err,
                    format!("removing iptables rule '{}'", operation),
                ));
            }
        }
        errors
    }
}

struct RuleBuilder<'a> {
    config: &'a WrapperConfig,
    record: &'a ContainerRecord,
    hash: String,
    container_cidr: String,
    operations: Vec<Operation>,
}

impl<'a> RuleBuilder<'a> {
    fn new(config: &'a WrapperConfig, container_id: &str, record: &'a ContainerRecord) -> Self {
        Self {
            config,
            record,
            hash: container_hash(container_id),
            container_cidr: format!("{}/32", record.ip),
            operations: Vec::new(),
        }
    }

    fn chain(&self, prefix: &str) -> String {
        format!("{}--{}", prefix, self.hash)
    }

    fn owner_comment(&self) -> Vec<String> {
        args(&[
            "-m",
            "comment",
            "--comment",
            &format!("{}:{}", OWNER_COMMENT_PREFIX, self.hash),
        ])
    }

    fn new_chain(&mut self, table: &str, chain: &str) {
        self.operations.push(Operation::NewChain {
            table: table.to_string(),
            chain: chain.to_string(),
        });
    }

    fn append(&mut self, table: &str, chain: &str, rule: Vec<String>) {
        self.operations.push(Operation::Append {
            table: table.to_string(),
            chain: chain.to_string(),
            rule,
        });
    }

    fn insert(&mut self, table: &str, chain: &str, mut rule: Vec<String>) {
        // Owner comment goes before the target so `-C` matches what `-I` wrote.
        let target_at = rule.iter().position(|arg| arg == "-j").unwrap_or(rule.len());
        let comment = self.owner_comment();
        rule.splice(target_at..target_at, comment);
        self.operations.push(Operation::Insert {
            table: table.to_string(),
            chain: chain.to_string(),
            rule,
        });
    }

    fn build(mut self) -> RuleSet {
        self.snat();
        self.netin();
        self.ingress_tag();
        self.asg_chains();
        self.netout_jumps();
        RuleSet {
            container_hash: self.hash,
            operations: self.operations,
        }
    }

    fn snat(&mut self) {
        let rule = args(&[
            "-s",
            &self.container_cidr,
            "!",
            "-o",
            &self.config.vtep_name,
            "-j",
            "SNAT",
            "--to-source",
            &self.config.instance_address,
        ]);
        self.insert(TABLE_NAT, "POSTROUTING", rule);
    }

    fn netin(&mut self) {
        let mappings = normalized_mappings(&self.record.port_mappings);
        if mappings.is_empty() {
            return;
        }
        let config = self.config;
        let chain = self.chain("netin");
        self.new_chain(TABLE_NAT, &chain);
        for mapping in &mappings {
            for underlay in &config.underlay_ips {
                let rule = args(&[
                    "-d",
                    &format!("{}/32", underlay),
                    "-p",
                    &mapping.protocol,
                    "-m",
                    &mapping.protocol,
                    "--dport",
                    &mapping.host_port.to_string(),
                    "-j",
                    "DNAT",
                    "--to-destination",
                    &format!("{}:{}", self.record.ip, mapping.container_port),
                ]);
                self.append(TABLE_NAT, &chain, rule);
            }
        }
        self.insert(TABLE_NAT, "PREROUTING", args(&["-j", &chain]));
    }

    fn ingress_tag(&mut self) {
        let chain = self.chain("ingress");
        let mark = format!(
            "0x{}/0xffffffff",
            self.config.ingress_tag.trim_start_matches("0x")
        );
        self.new_chain(TABLE_MANGLE, &chain);
        let direct = args(&[
            "-d",
            &self.container_cidr,
            "!",
            "-i",
            &self.config.vtep_name,
            "-j",
            "MARK",
            "--set-xmark",
            &mark,
        ]);
        self.append(TABLE_MANGLE, &chain, direct);
        let config = self.config;
        for mapping in normalized_mappings(&self.record.port_mappings) {
            for underlay in &config.underlay_ips {
                let rule = args(&[
                    "-d",
                    &format!("{}/32", underlay),
                    "-p",
                    &mapping.protocol,
                    "-m",
                    &mapping.protocol,
                    "--dport",
                    &mapping.host_port.to_string(),
                    "-j",
                    "MARK",
                    "--set-xmark",
                    &mark,
                ]);
                self.append(TABLE_MANGLE, &chain, rule);
            }
        }
        self.insert(TABLE_MANGLE, "PREROUTING", args(&["-j", &chain]));
    }

    fn asg_chains(&mut self) {
        let logging = self.config.iptables_asg_logging;

        let deny = self.chain("deny");
        self.new_chain(TABLE_FILTER, &deny);
        let denied_rate = self.config.iptables_denied_logs_per_sec;
        if logging && denied_rate > 0 {
            let rule = log_rule(None, denied_rate, &format!("DENY_{} ", self.hash));
            self.append(TABLE_FILTER, &deny, rule);
        }
        self.append(
            TABLE_FILTER,
            &deny,
            args(&["-j", "REJECT", "--reject-with", "icmp-port-unreachable"]),
        );

        let accept = self.chain("accept");
        self.new_chain(TABLE_FILTER, &accept);
        let accepted_rate = self.config.iptables_accepted_udp_logs_per_sec;
        if logging && accepted_rate > 0 {
            let rule = log_rule(Some("udp"), accepted_rate, &format!("OK_{} ", self.hash));
            self.append(TABLE_FILTER, &accept, rule);
        }
        self.append(TABLE_FILTER, &accept, args(&["-j", "ACCEPT"]));

        let netout = self.chain("netout");
        self.new_chain(TABLE_FILTER, &netout);
        self.append(
            TABLE_FILTER,
            &netout,
            args(&["-m", "state", "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT"]),
        );
        self.append(TABLE_FILTER, &netout, args(&["-j", &deny]));
    }

    fn netout_jumps(&mut self) {
        let netout = self.chain("netout");
        let interfaces = self.record.egress_interfaces.clone();
        for interface in interfaces {
            let rule = args(&["-s", &self.container_cidr, "-o", &interface, "-j", &netout]);
            self.insert(TABLE_FILTER, "FORWARD", rule);
        }
    }
}

fn log_rule(protocol: Option<&str>, rate: u32, prefix: &str) -> Vec<String> {
    let mut rule = Vec::new();
    if let Some(protocol) = protocol {
        rule.extend(args(&["-p", protocol]));
    }
    rule.extend(args(&[
        "-m",
        "limit",
        "--limit",
        &format!("{}/s", rate),
        "--limit-burst",
        &LOG_BURST.to_string(),
        "-j",
        "LOG",
        "--log-prefix",
        prefix,
    ]));
    rule
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

struct NormalizedMapping {
    host_port: u16,
    container_port: u16,
    protocol: String,
}

fn normalized_mappings(mappings: &[RuntimePortMapping]) -> Vec<NormalizedMapping> {
    mappings
        .iter()
        .filter_map(|mapping| {
            if mapping.host_port == 0 || mapping.container_port == 0 {
                return None;
            }
            let protocol = mapping.protocol.as_deref().unwrap_or("tcp").to_lowercase();
            if protocol != "tcp" && protocol != "udp" {
                return None;
            }
            Some(NormalizedMapping {
                host_port: mapping.host_port,
                container_port: mapping.container_port,
                protocol,
            })
        })
        .collect()
}

/// Resolves host interface names for underlay addresses.
pub type InterfaceLookup = fn(&[String]) -> DynResult<Vec<String>>;

/// Finds the host interface that owns each underlay address.
pub fn host_interfaces_for(addresses: &[String]) -> DynResult<Vec<String>> {
    let owned: Vec<(String, Ipv4Addr)> = getifaddrs()
        .map_err(|e| with_context(e, "listing host interface addresses"))?
        .filter_map(|ifaddr| {
            let sin = *ifaddr.address.as_ref()?.as_sockaddr_in()?;
            Some((ifaddr.interface_name.clone(), *SocketAddrV4::from(sin).ip()))
        })
        .collect();

    addresses
        .iter()
        .map(|address| {
            let wanted = address.parse::<Ipv4Addr>().map_err(|e| {
                classified_with_context(
                    ErrorKind::Config,
                    e,
                    format!("parsing underlay ip {}", address),
                )
            })?;
            owned
                .iter()
                .find(|(_, ip)| *ip == wanted)
                .map(|(name, _)| name.clone())
                .ok_or_else(|| {
                    classified(
                        ErrorKind::RuleApplication,
                        format!("finding underlay interface for {}", address),
                    )
                })
        })
        .collect()
}

/// Interfaces container egress traffic may leave through: the owners of the
/// underlay addresses followed by the temporary underlay interfaces.
pub fn egress_interfaces(
    config: &WrapperConfig,
    lookup: InterfaceLookup,
) -> DynResult<Vec<String>> {
    let mut interfaces: Vec<String> = Vec::new();
    let resolved = lookup(&config.underlay_ips)?;
    for name in resolved
        .into_iter()
        .chain(config.temporary_underlay_interface_names.iter().cloned())
    {
        if !name.is_empty() && !interfaces.contains(&name) {
            interfaces.push(name);
        }
    }
    Ok(interfaces)
}
