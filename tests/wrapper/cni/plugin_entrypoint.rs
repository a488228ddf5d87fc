use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use cni_wrapper::wrapper::cni::args::{CmdArgs, Command};
use cni_wrapper::wrapper::cni::plugin::{run, run_with};
use cni_wrapper::wrapper::cni::PluginController;
use cni_wrapper::wrapper::test_support::{ipam_result, FakeDelegator, FakeIpTables};
use cni_wrapper::wrapper::util::error::DynResult;
use serde_json::{json, Value};
use serial_test::serial;
use tempfile::TempDir;

fn write_script(path: &Path, contents: &str) {
    fs::write(path, contents).expect("failed to write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("set permissions");
}

fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn netconf(dir: &Path, delegate: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "cniVersion": "0.4.0",
        "type": "cni-wrapper-plugin",
        "datastore": dir.join("store.json"),
        "iptables_lock_file": dir.join("iptables.lock"),
        "instance_address": "10.244.20.1",
        "underlay_ips": ["10.0.0.5"],
        "ingress_tag": "ffaa0000",
        "vtep_name": "silk-vtep",
        "iptables_denied_logs_per_sec": 0,
        "iptables_accepted_udp_logs_per_sec": 0,
        "delegate": delegate
    }))
    .expect("encode netconf")
}

fn invoke(env: &HashMap<String, String>, stdin: Vec<u8>) -> (i32, String) {
    let mut out = Vec::new();
    let code = run(env, stdin, &mut out);
    (code, String::from_utf8(out).expect("utf8 output"))
}

fn parse(output: &str) -> Value {
    serde_json::from_str(output).expect("json output")
}

#[test]
fn version_reports_supported_versions() {
    let (code, output) = invoke(&env(&[("CNI_COMMAND", "VERSION")]), Vec::new());
    assert_eq!(code, 0);
    assert_eq!(
        parse(&output),
        json!({
            "cniVersion": "0.3.1",
            "supportedVersions": ["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0"]
        })
    );
}

#[test]
fn missing_environment_is_reported_with_code_4() {
    let (code, output) = invoke(&env(&[]), Vec::new());
    assert_eq!(code, 1);
    assert_eq!(
        parse(&output),
        json!({"code": 4, "msg": "CNI_COMMAND not set", "details": ""})
    );

    let (code, output) = invoke(&env(&[("CNI_COMMAND", "CHECK")]), Vec::new());
    assert_eq!(code, 1);
    assert_eq!(parse(&output)["msg"], "unknown CNI_COMMAND: CHECK");

    let (code, output) = invoke(
        &env(&[("CNI_COMMAND", "ADD"), ("CNI_CONTAINERID", "c1")]),
        Vec::new(),
    );
    assert_eq!(code, 1);
    assert_eq!(parse(&output)["msg"], "CNI_IFNAME not set");
}

#[test]
fn config_errors_carry_requested_version() {
    let temp = TempDir::new().expect("tempdir");
    let mut config: Value =
        serde_json::from_slice(&netconf(temp.path(), json!({"type": "silk"}))).expect("json");
    config
        .as_object_mut()
        .expect("object")
        .remove("vtep_name");
    let (code, output) = invoke(
        &env(&[
            ("CNI_COMMAND", "ADD"),
            ("CNI_CONTAINERID", "c1"),
            ("CNI_IFNAME", "eth0"),
        ]),
        serde_json::to_vec(&config).expect("encode"),
    );
    assert_eq!(code, 1);
    assert_eq!(
        parse(&output),
        json!({"cniVersion": "0.4.0", "code": 7, "msg": "missing vtep device name", "details": ""})
    );
}

#[test]
fn missing_delegate_type_fails_without_running_anything() {
    let temp = TempDir::new().expect("tempdir");
    let (code, output) = invoke(
        &env(&[
            ("CNI_COMMAND", "ADD"),
            ("CNI_CONTAINERID", "c1"),
            ("CNI_IFNAME", "eth0"),
            ("CNI_PATH", "/nonexistent"),
        ]),
        netconf(temp.path(), json!({"mtu": 1450})),
    );
    assert_eq!(code, 1);
    assert_eq!(parse(&output)["msg"], "delegate config is missing type");
    assert_eq!(parse(&output)["code"], 7);
    assert!(!temp.path().join("store.json").exists());
}

#[test]
#[serial]
fn delegate_failure_reaches_the_runtime_verbatim() {
    let temp = TempDir::new().expect("tempdir");
    let bin_dir = temp.path().join("bin");
    fs::create_dir_all(&bin_dir).expect("bin dir");
    write_script(
        &bin_dir.join("silk"),
        "#!/bin/sh\ncat > /dev/null\necho '{\"code\":117,\"msg\":\"no addresses available\",\"details\":\"pool exhausted\"}'\nexit 1\n",
    );
    let bin_path = bin_dir.display().to_string();

    let (code, output) = invoke(
        &env(&[
            ("CNI_COMMAND", "ADD"),
            ("CNI_CONTAINERID", "c1"),
            ("CNI_IFNAME", "eth0"),
            ("CNI_PATH", &bin_path),
        ]),
        netconf(temp.path(), json!({"type": "silk"})),
    );
    assert_eq!(code, 1);
    assert_eq!(
        parse(&output),
        json!({
            "cniVersion": "0.4.0",
            "code": 117,
            "msg": "no addresses available",
            "details": "pool exhausted"
        })
    );
}

#[test]
#[serial]
fn del_without_record_prints_nothing() {
    let temp = TempDir::new().expect("tempdir");
    let bin_dir = temp.path().join("bin");
    fs::create_dir_all(&bin_dir).expect("bin dir");
    write_script(&bin_dir.join("silk"), "#!/bin/sh\ncat > /dev/null\nexit 0\n");
    let bin_path = bin_dir.display().to_string();

    let (code, output) = invoke(
        &env(&[
            ("CNI_COMMAND", "DEL"),
            ("CNI_CONTAINERID", "c1"),
            ("CNI_PATH", &bin_path),
        ]),
        netconf(temp.path(), json!({"type": "silk"})),
    );
    assert_eq!(code, 0, "unexpected output: {output}");
    assert!(output.is_empty());
}

#[test]
fn add_prints_delegate_result() {
    fn lookup(_: &[String]) -> DynResult<Vec<String>> {
        Ok(vec!["eth1".to_string()])
    }

    let temp = TempDir::new().expect("tempdir");
    let delegator = Arc::new(FakeDelegator::new());
    let controller = PluginController::new(delegator, Arc::new(FakeIpTables::new()))
        .with_interface_lookup(lookup);
    let args = CmdArgs {
        command: Command::Add,
        container_id: "c1".to_string(),
        netns: "/var/run/netns/c1".to_string(),
        ifname: "eth0".to_string(),
        args: String::new(),
        path: String::new(),
        stdin_data: netconf(temp.path(), json!({"type": "silk"})),
    };

    let mut out = Vec::new();
    assert_eq!(run_with(&controller, &args, &mut out), 0);
    assert_eq!(
        serde_json::from_slice::<Value>(&out).expect("json"),
        ipam_result("1.2.3.4/32")
    );
}
