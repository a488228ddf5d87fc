#![allow(dead_code)]

use crate::wrapper::cni::delegator::Delegator;
use crate::wrapper::cni::rules::{jump_chain, IpTables};
use crate::wrapper::cni::types::DelegateError;
use crate::wrapper::util::error::{new_error, DynResult};

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::env;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Table name -> chain name -> rules, in evaluation order.
pub type TableSnapshot = BTreeMap<String, BTreeMap<String, Vec<Vec<String>>>>;

const BUILTIN_CHAINS: &[(&str, &[&str])] = &[
    ("filter", &["INPUT", "FORWARD", "OUTPUT"]),
    ("nat", &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"]),
    (
        "mangle",
        &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
    ),
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct FakeIpTablesState {
    tables: TableSnapshot,
    journal: Vec<String>,
    failures: Vec<String>,
}

/// In-memory [`IpTables`] that enforces the same preconditions as the kernel
/// tables: chains must exist before use, in-use or non-empty chains cannot be
/// deleted, and deleting an absent rule fails.
pub struct FakeIpTables {
    state: Mutex<FakeIpTablesState>,
    delay: Duration,
}

impl FakeIpTables {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Sleeps for `delay` after each mutation, widening race windows.
    pub fn with_delay(delay: Duration) -> Self {
        let mut tables = TableSnapshot::new();
        for (table, chains) in BUILTIN_CHAINS {
            let entry = tables.entry(table.to_string()).or_default();
            for chain in *chains {
                entry.insert(chain.to_string(), Vec::new());
            }
        }
        Self {
            state: Mutex::new(FakeIpTablesState {
                tables,
                ..Default::default()
            }),
            delay,
        }
    }

    /// Makes every later mutation whose rendered command contains `pattern` fail.
    pub fn fail_on(&self, pattern: &str) {
        lock(&self.state).failures.push(pattern.to_string());
    }

    pub fn snapshot(&self) -> TableSnapshot {
        lock(&self.state).tables.clone()
    }

    /// Successful mutations in the order they happened.
    pub fn journal(&self) -> Vec<String> {
        lock(&self.state).journal.clone()
    }

    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        lock(&self.state)
            .tables
            .get(table)
            .is_some_and(|chains| chains.contains_key(chain))
    }

    /// Rules of a chain rendered as single strings.
    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        lock(&self.state)
            .tables
            .get(table)
            .and_then(|chains| chains.get(chain))
            .map(|rules| rules.iter().map(|rule| rule.join(" ")).collect())
            .unwrap_or_default()
    }

    /// All rules of a table rendered as `<chain> <rule>`.
    pub fn all_rules(&self, table: &str) -> Vec<String> {
        lock(&self.state)
            .tables
            .get(table)
            .map(|chains| {
                chains
                    .iter()
                    .flat_map(|(chain, rules)| {
                        rules
                            .iter()
                            .map(move |rule| format!("{} {}", chain, rule.join(" ")))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn mutate<F>(&self, command: String, change: F) -> DynResult<()>
    where
        F: FnOnce(&mut TableSnapshot) -> DynResult<()>,
    {
        {
            let mut state = lock(&self.state);
            if state
                .failures
                .iter()
                .any(|pattern| command.contains(pattern.as_str()))
            {
                return Err(new_error(format!("injected failure: {}", command)));
            }
            change(&mut state.tables)?;
            state.journal.push(command);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(())
    }
}

impl Default for FakeIpTables {
    fn default() -> Self {
        Self::new()
    }
}

fn is_builtin(table: &str, chain: &str) -> bool {
    BUILTIN_CHAINS
        .iter()
        .any(|(name, chains)| *name == table && chains.contains(&chain))
}

fn chain_mut<'a>(
    tables: &'a mut TableSnapshot,
    table: &str,
    chain: &str,
) -> DynResult<&'a mut Vec<Vec<String>>> {
    tables
        .get_mut(table)
        .and_then(|chains| chains.get_mut(chain))
        .ok_or_else(|| {
            new_error(format!("No chain/target/match by that name: {} {}", table, chain))
        })
}

fn check_target(tables: &TableSnapshot, table: &str, rule: &[String]) -> DynResult<()> {
    if let Some(target) = jump_chain(rule) {
        let exists = tables
            .get(table)
            .is_some_and(|chains| chains.contains_key(target));
        if !exists {
            return Err(new_error(format!("Couldn't load target `{}'", target)));
        }
    }
    Ok(())
}

impl IpTables for FakeIpTables {
    fn chain_exists(&self, table: &str, chain: &str) -> DynResult<bool> {
        Ok(self.has_chain(table, chain))
    }

    fn new_chain(&self, table: &str, chain: &str) -> DynResult<()> {
        self.mutate(format!("-t {} -N {}", table, chain), |tables| {
            let chains = tables.entry(table.to_string()).or_default();
            if chains.contains_key(chain) {
                return Err(new_error(format!("Chain already exists: {}", chain)));
            }
            chains.insert(chain.to_string(), Vec::new());
            Ok(())
        })
    }

    fn flush_chain(&self, table: &str, chain: &str) -> DynResult<()> {
        self.mutate(format!("-t {} -F {}", table, chain), |tables| {
            chain_mut(tables, table, chain)?.clear();
            Ok(())
        })
    }

    fn delete_chain(&self, table: &str, chain: &str) -> DynResult<()> {
        self.mutate(format!("-t {} -X {}", table, chain), |tables| {
            if is_builtin(table, chain) {
                return Err(new_error(format!("Cannot delete built-in chain {}", chain)));
            }
            if !chain_mut(tables, table, chain)?.is_empty() {
                return Err(new_error(format!("Directory not empty: {}", chain)));
            }
            let referenced = tables.get(table).is_some_and(|chains| {
                chains.values().flatten().any(|rule| {
                    rule.windows(2)
                        .any(|pair| pair[0] == "-j" && pair[1] == chain)
                })
            });
            if referenced {
                return Err(new_error(format!("Too many links: {}", chain)));
            }
            if let Some(chains) = tables.get_mut(table) {
                chains.remove(chain);
            }
            Ok(())
        })
    }

    /// Like `iptables -C`: a missing chain reads as absent, a missing jump
    /// target is an error.
    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> DynResult<bool> {
        let state = lock(&self.state);
        check_target(&state.tables, table, rule)?;
        Ok(state
            .tables
            .get(table)
            .and_then(|chains| chains.get(chain))
            .is_some_and(|rules| rules.iter().any(|existing| existing == rule)))
    }

    fn insert(&self, table: &str, chain: &str, position: u32, rule: &[String]) -> DynResult<()> {
        let command = format!("-t {} -I {} {} {}", table, chain, position, rule.join(" "));
        self.mutate(command, |tables| {
            check_target(tables, table, rule)?;
            let rules = chain_mut(tables, table, chain)?;
            let index = (position.max(1) as usize - 1).min(rules.len());
            rules.insert(index, rule.to_vec());
            Ok(())
        })
    }

    fn append(&self, table: &str, chain: &str, rule: &[String]) -> DynResult<()> {
        let command = format!("-t {} -A {} {}", table, chain, rule.join(" "));
        self.mutate(command, |tables| {
            check_target(tables, table, rule)?;
            chain_mut(tables, table, chain)?.push(rule.to_vec());
            Ok(())
        })
    }

    fn delete(&self, table: &str, chain: &str, rule: &[String]) -> DynResult<()> {
        let command = format!("-t {} -D {} {}", table, chain, rule.join(" "));
        self.mutate(command, |tables| {
            let rules = chain_mut(tables, table, chain)?;
            let index = rules
                .iter()
                .position(|existing| existing == rule)
                .ok_or_else(|| new_error("Bad rule (does a matching rule exist in that chain?)"))?;
            rules.remove(index);
            Ok(())
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DelegateCall {
    pub plugin: String,
    pub netconf: Value,
}

struct FakeDelegatorState {
    add_result: Value,
    add_error: Option<DelegateError>,
    del_error: Option<DelegateError>,
    add_calls: Vec<DelegateCall>,
    del_calls: Vec<DelegateCall>,
}

/// Scriptable [`Delegator`] that records every call it receives.
pub struct FakeDelegator {
    state: Mutex<FakeDelegatorState>,
    delay: Duration,
}

impl FakeDelegator {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(FakeDelegatorState {
                add_result: ipam_result("1.2.3.4/32"),
                add_error: None,
                del_error: None,
                add_calls: Vec::new(),
                del_calls: Vec::new(),
            }),
            delay,
        }
    }

    pub fn set_add_result(&self, result: Value) {
        lock(&self.state).add_result = result;
    }

    pub fn fail_add(&self, error: DelegateError) {
        lock(&self.state).add_error = Some(error);
    }

    pub fn fail_del(&self, error: DelegateError) {
        lock(&self.state).del_error = Some(error);
    }

    pub fn add_calls(&self) -> Vec<DelegateCall> {
        lock(&self.state).add_calls.clone()
    }

    pub fn del_calls(&self) -> Vec<DelegateCall> {
        lock(&self.state).del_calls.clone()
    }

    fn record(plugin: &str, netconf: &[u8]) -> DynResult<DelegateCall> {
        Ok(DelegateCall {
            plugin: plugin.to_string(),
            netconf: serde_json::from_slice(netconf)?,
        })
    }
}

impl Default for FakeDelegator {
    fn default() -> Self {
        Self::new()
    }
}

impl Delegator for FakeDelegator {
    fn delegate_add(&self, plugin: &str, netconf: &[u8]) -> DynResult<Value> {
        let call = Self::record(plugin, netconf)?;
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let mut state = lock(&self.state);
        state.add_calls.push(call);
        match state.add_error.clone() {
            Some(error) => Err(error.into()),
            None => Ok(state.add_result.clone()),
        }
    }

    fn delegate_del(&self, plugin: &str, netconf: &[u8]) -> DynResult<()> {
        let call = Self::record(plugin, netconf)?;
        let mut state = lock(&self.state);
        state.del_calls.push(call);
        match state.del_error.clone() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

/// CNI 0.3.1 result carrying a single IPv4 address on interface 0.
pub fn ipam_result(address: &str) -> Value {
    json!({
        "cniVersion": "0.3.1",
        "interfaces": [{"name": "eth0", "sandbox": "/var/run/netns/test"}],
        "ips": [{"version": "4", "address": address, "interface": 0}],
        "dns": {}
    })
}

/// Sets or clears an environment variable for the lifetime of the guard.
/// Pair with `#[serial]`; the process environment is shared by all tests.
pub struct EnvGuard {
    key: String,
    previous: Option<String>,
}

impl EnvGuard {
    pub fn set(key: &str, value: impl AsRef<std::ffi::OsStr>) -> Self {
        let previous = env::var(key).ok();
        env::set_var(key, value);
        Self {
            key: key.to_string(),
            previous,
        }
    }

    pub fn unset(key: &str) -> Self {
        let previous = env::var(key).ok();
        env::remove_var(key);
        Self {
            key: key.to_string(),
            previous,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.previous.as_ref() {
            env::set_var(&self.key, prev);
        } else {
            env::remove_var(&self.key);
        }
    }
}
