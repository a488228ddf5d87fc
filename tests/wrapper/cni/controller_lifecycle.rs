use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cni_wrapper::wrapper::cni::args::{CmdArgs, Command};
use cni_wrapper::wrapper::cni::lock::IptablesLock;
use cni_wrapper::wrapper::cni::rules::container_hash;
use cni_wrapper::wrapper::cni::store::Store;
use cni_wrapper::wrapper::cni::types::DelegateError;
use cni_wrapper::wrapper::cni::PluginController;
use cni_wrapper::wrapper::test_support::{ipam_result, FakeDelegator, FakeIpTables};
use cni_wrapper::wrapper::util::error::{error_kind, AggregateError, DynResult, ErrorKind};
use serde_json::json;
use tempfile::TempDir;

fn underlay_lookup(_: &[String]) -> DynResult<Vec<String>> {
    Ok(vec!["eth1".to_string()])
}

fn netconf(dir: &Path) -> Vec<u8> {
    netconf_with(dir, true, "silk-vtep")
}

fn netconf_with(dir: &Path, logging: bool, vtep_name: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "cniVersion": "0.3.1",
        "name": "overlay",
        "type": "cni-wrapper-plugin",
        "datastore": dir.join("store.json"),
        "iptables_lock_file": dir.join("iptables.lock"),
        "instance_address": "10.244.20.1",
        "underlay_ips": ["10.0.0.5"],
        "temporary_underlay_interface_names": ["tmp0"],
        "iptables_asg_logging": logging,
        "ingress_tag": "ffaa0000",
        "vtep_name": vtep_name,
        "iptables_denied_logs_per_sec": 2,
        "iptables_accepted_udp_logs_per_sec": 4,
        "delegate": {"type": "silk", "mtu": 1450}
    }))
    .expect("encode netconf")
}

fn cmd_args(command: Command, container_id: &str, stdin: Vec<u8>) -> CmdArgs {
    CmdArgs {
        command,
        container_id: container_id.to_string(),
        netns: format!("/var/run/netns/{}", container_id),
        ifname: "eth0".to_string(),
        args: String::new(),
        path: "/opt/cni/bin".to_string(),
        stdin_data: stdin,
    }
}

struct Harness {
    dir: TempDir,
    delegator: Arc<FakeDelegator>,
    iptables: Arc<FakeIpTables>,
    controller: PluginController,
}

impl Harness {
    fn new() -> Self {
        Self::with_iptables(Arc::new(FakeIpTables::new()))
    }

    fn with_iptables(iptables: Arc<FakeIpTables>) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let delegator = Arc::new(FakeDelegator::new());
        let controller = PluginController::new(delegator.clone(), iptables.clone())
            .with_interface_lookup(underlay_lookup)
            .with_lock_timeout(Duration::from_secs(5));
        Self {
            dir,
            delegator,
            iptables,
            controller,
        }
    }

    fn args(&self, command: Command, container_id: &str) -> CmdArgs {
        cmd_args(command, container_id, netconf(self.dir.path()))
    }

    fn args_with(&self, command: Command, logging: bool, vtep_name: &str) -> CmdArgs {
        cmd_args(command, "container-1", netconf_with(self.dir.path(), logging, vtep_name))
    }

    fn store(&self) -> Store {
        Store::new(self.dir.path().join("store.json"))
    }
}

#[test]
fn add_then_del_round_trips_host_state() {
    let harness = Harness::new();
    let initial = harness.iptables.snapshot();
    let hash = container_hash("container-1");

    let result = harness
        .controller
        .add(&harness.args(Command::Add, "container-1"))
        .expect("add succeeds");
    assert_eq!(result, ipam_result("1.2.3.4/32"));

    let calls = harness.delegator.add_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].plugin, "silk");
    assert_eq!(
        calls[0].netconf,
        json!({"type": "silk", "mtu": 1450, "cniVersion": "0.3.1", "name": "overlay"})
    );

    let snat = harness.iptables.rules("nat", "POSTROUTING");
    assert_eq!(
        snat,
        vec![format!(
            "-s 1.2.3.4/32 ! -o silk-vtep -m comment --comment cni-wrapper:{hash} -j SNAT --to-source 10.244.20.1"
        )]
    );
    assert!(harness
        .iptables
        .rules("mangle", &format!("ingress--{hash}"))
        .contains(&"-d 1.2.3.4/32 ! -i silk-vtep -j MARK --set-xmark 0xffaa0000/0xffffffff".to_string()));
    assert!(harness
        .iptables
        .rules("filter", &format!("deny--{hash}"))
        .iter()
        .any(|rule| rule.contains("--log-prefix DENY_")));
    let forward = harness.iptables.rules("filter", "FORWARD");
    assert_eq!(forward.len(), 2);
    assert!(forward.iter().any(|rule| rule.starts_with("-s 1.2.3.4/32 -o eth1 ")));
    assert!(forward.iter().any(|rule| rule.starts_with("-s 1.2.3.4/32 -o tmp0 ")));

    let record = harness
        .store()
        .get("container-1")
        .expect("read store")
        .expect("record present");
    assert_eq!(record.ip, Ipv4Addr::new(1, 2, 3, 4));
    assert_eq!(record.egress_interfaces, vec!["eth1", "tmp0"]);

    harness
        .controller
        .del(&harness.args(Command::Del, "container-1"))
        .expect("del succeeds");
    assert_eq!(harness.iptables.snapshot(), initial);
    assert_eq!(harness.store().get("container-1").expect("read store"), None);
    assert_eq!(harness.delegator.del_calls().len(), 1);
}

#[test]
fn del_without_record_still_calls_delegate() {
    let harness = Harness::new();
    let initial = harness.iptables.snapshot();

    harness
        .controller
        .del(&harness.args(Command::Del, "never-added"))
        .expect("del succeeds");
    harness
        .controller
        .del(&harness.args(Command::Del, "never-added"))
        .expect("repeated del succeeds");

    assert_eq!(harness.delegator.del_calls().len(), 2);
    assert_eq!(harness.iptables.snapshot(), initial);
}

#[test]
fn delegate_add_failure_is_returned_unchanged() {
    let harness = Harness::new();
    let initial = harness.iptables.snapshot();
    let expected =
        DelegateError::new(117, "no addresses available", "pool 10.255.0.0/16 exhausted");
    harness.delegator.fail_add(expected.clone());

    let err = harness
        .controller
        .add(&harness.args(Command::Add, "container-1"))
        .unwrap_err();
    assert_eq!(err.downcast_ref::<DelegateError>(), Some(&expected));
    assert_eq!(err.to_string(), "no addresses available; pool 10.255.0.0/16 exhausted");
    assert_eq!(harness.iptables.snapshot(), initial);
    assert_eq!(harness.store().get("container-1").expect("read store"), None);
}

#[test]
fn lone_delegate_del_failure_is_returned_unchanged() {
    let harness = Harness::new();
    let initial = harness.iptables.snapshot();
    harness
        .controller
        .add(&harness.args(Command::Add, "container-1"))
        .expect("add succeeds");
    let expected = DelegateError::new(7, "bad config", "");
    harness.delegator.fail_del(expected.clone());

    let err = harness
        .controller
        .del(&harness.args(Command::Del, "container-1"))
        .unwrap_err();
    assert_eq!(err.downcast_ref::<DelegateError>(), Some(&expected));
    assert_eq!(harness.iptables.snapshot(), initial);
    assert_eq!(harness.store().get("container-1").expect("read store"), None);
}

#[test]
fn del_aggregates_independent_failures() {
    let harness = Harness::new();
    harness
        .controller
        .add(&harness.args(Command::Add, "container-1"))
        .expect("add succeeds");
    harness.iptables.fail_on("SNAT");
    harness
        .delegator
        .fail_del(DelegateError::new(11, "delegate busy", ""));

    let err = harness
        .controller
        .del(&harness.args(Command::Del, "container-1"))
        .unwrap_err();
    let aggregate = err
        .downcast_ref::<AggregateError>()
        .expect("aggregate error");
    assert_eq!(aggregate.errors().len(), 2);
    assert!(err.to_string().contains("; delegate busy"));

    // Everything else was still torn down.
    let hash = container_hash("container-1");
    assert!(!harness.iptables.has_chain("filter", &format!("netout--{hash}")));
    assert_eq!(harness.store().get("container-1").expect("read store"), None);
}

#[test]
fn rule_failure_rolls_back_and_discards_record() {
    let harness = Harness::new();
    let initial = harness.iptables.snapshot();
    harness.iptables.fail_on("-j netout--");

    let err = harness
        .controller
        .add(&harness.args(Command::Add, "container-1"))
        .unwrap_err();
    assert_eq!(error_kind(err.as_ref()), Some(ErrorKind::RuleApplication));
    assert_eq!(harness.iptables.snapshot(), initial);
    assert_eq!(harness.store().get("container-1").expect("read store"), None);
}

#[test]
fn repeated_add_replaces_previous_rules() {
    let harness = Harness::new();
    let initial = harness.iptables.snapshot();
    let args = harness.args(Command::Add, "container-1");

    harness.controller.add(&args).expect("first add");
    harness.controller.add(&args).expect("identical add");
    assert_eq!(harness.iptables.rules("nat", "POSTROUTING").len(), 1);

    harness.delegator.set_add_result(ipam_result("1.2.3.5/32"));
    harness.controller.add(&args).expect("add with new address");

    for table in ["nat", "mangle", "filter"] {
        assert!(
            !harness
                .iptables
                .all_rules(table)
                .iter()
                .any(|rule| rule.contains("1.2.3.4/32")),
            "stale rule left in {table}"
        );
    }
    let record = harness
        .store()
        .get("container-1")
        .expect("read store")
        .expect("record present");
    assert_eq!(record.ip, Ipv4Addr::new(1, 2, 3, 5));

    harness
        .controller
        .del(&harness.args(Command::Del, "container-1"))
        .expect("del succeeds");
    assert_eq!(harness.iptables.snapshot(), initial);
}

#[test]
fn repeated_add_rebuilds_rules_when_config_changes() {
    let harness = Harness::new();
    let initial = harness.iptables.snapshot();
    let hash = container_hash("container-1");
    let deny = format!("deny--{hash}");

    harness
        .controller
        .add(&harness.args_with(Command::Add, false, "silk-vtep"))
        .expect("add without logging");
    assert!(!harness
        .iptables
        .rules("filter", &deny)
        .iter()
        .any(|rule| rule.contains("-j LOG")));

    // Same address and interfaces, so only the derived rules differ.
    harness
        .controller
        .add(&harness.args_with(Command::Add, true, "silk-vtep"))
        .expect("add with logging");
    let rules = harness.iptables.rules("filter", &deny);
    assert!(rules.first().expect("deny rules").contains("-j LOG"));
    assert!(rules.last().expect("deny rules").contains("-j REJECT"));
    assert_eq!(rules.iter().filter(|rule| rule.contains("-j REJECT")).count(), 1);

    harness
        .controller
        .del(&harness.args_with(Command::Del, true, "silk-vtep"))
        .expect("del succeeds");
    assert_eq!(harness.iptables.snapshot(), initial);
}

#[test]
fn del_removes_installed_rules_after_config_change() {
    let harness = Harness::new();
    let initial = harness.iptables.snapshot();

    harness
        .controller
        .add(&harness.args_with(Command::Add, true, "silk-vtep"))
        .expect("add succeeds");
    harness
        .controller
        .del(&harness.args_with(Command::Del, false, "vxlan0"))
        .expect("del succeeds");

    assert_eq!(harness.iptables.snapshot(), initial);
    assert_eq!(harness.store().get("container-1").expect("read store"), None);
}

#[test]
fn invalid_config_fails_before_delegation() {
    let harness = Harness::new();
    let args = cmd_args(Command::Add, "container-1", b"{\"delegate\": {}}".to_vec());

    let err = harness.controller.add(&args).unwrap_err();
    assert_eq!(err.to_string(), "missing datastore path");
    assert_eq!(error_kind(err.as_ref()), Some(ErrorKind::Config));
    assert!(harness.delegator.add_calls().is_empty());
}

#[test]
fn lock_timeout_fails_without_mutation() {
    let harness = Harness::new();
    let initial = harness.iptables.snapshot();
    let _held = IptablesLock::acquire(
        harness.dir.path().join("iptables.lock"),
        Duration::from_secs(1),
    )
    .expect("hold lock");
    let controller = PluginController::new(harness.delegator.clone(), harness.iptables.clone())
        .with_interface_lookup(underlay_lookup)
        .with_lock_timeout(Duration::from_millis(50));

    let err = controller
        .add(&harness.args(Command::Add, "container-1"))
        .unwrap_err();
    assert_eq!(error_kind(err.as_ref()), Some(ErrorKind::Lock));
    assert!(err
        .to_string()
        .starts_with("acquiring iptables lock: timed out after"));
    assert!(harness.delegator.add_calls().is_empty());
    assert_eq!(harness.iptables.snapshot(), initial);
}

#[test]
fn concurrent_adds_do_not_interleave_rule_mutations() {
    let dir = TempDir::new().expect("tempdir");
    let iptables = Arc::new(FakeIpTables::with_delay(Duration::from_millis(2)));
    let containers = [("container-a", "10.255.0.10/32"), ("container-b", "10.255.0.11/32")];

    let workers: Vec<_> = containers
        .iter()
        .map(|(container_id, address)| {
            let delegator = Arc::new(FakeDelegator::new());
            delegator.set_add_result(ipam_result(address));
            let controller = PluginController::new(delegator, iptables.clone())
                .with_interface_lookup(underlay_lookup)
                .with_lock_timeout(Duration::from_secs(10));
            let args = cmd_args(Command::Add, container_id, netconf(dir.path()));
            thread::spawn(move || controller.add(&args).map(|_| ()).map_err(|e| e.to_string()))
        })
        .collect();
    for worker in workers {
        worker.join().expect("join").expect("add succeeds");
    }

    let owners: Vec<&str> = iptables
        .journal()
        .iter()
        .map(|entry| {
            containers
                .iter()
                .map(|(container_id, _)| *container_id)
                .find(|container_id| entry.contains(&container_hash(container_id)))
                .expect("every mutation belongs to a container")
        })
        .collect();
    let switches = owners.windows(2).filter(|pair| pair[0] != pair[1]).count();
    assert_eq!(switches, 1, "mutations interleaved: {owners:?}");
}
