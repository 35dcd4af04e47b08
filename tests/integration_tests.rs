//! Integration smoke tests for the `watchdog-mux` CLI surface.

mod common;

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: watchdog-mux [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn version_command_prints_version() {
    let result = common::run_cli_case("version_command_prints_version", &["--version"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("watchdog-mux"),
        "missing version output; log: {}",
        result.log_path.display()
    );
}

#[test]
fn config_command_prints_effective_toml() {
    let result = common::run_cli_case(
        "config_command_prints_effective_toml",
        &["--timeout", "30", "--socket", "/tmp/wdm-test.sock", "config"],
    );
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("timeout_secs = 30")
            && result.stdout.contains("/tmp/wdm-test.sock"),
        "expected overridden values; log: {}",
        result.log_path.display()
    );
}

#[test]
fn json_mode_outputs_structured_payload() {
    let result = common::run_cli_case(
        "json_mode_outputs_structured_payload",
        &["config", "--json"],
    );
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    let value: serde_json::Value =
        serde_json::from_str(&result.stdout).expect("config --json emits JSON");
    assert_eq!(value["device"]["timeout_secs"], 20);
    assert_eq!(value["clients"]["capacity"], 100);
}

#[test]
fn invalid_timeout_is_rejected_with_code() {
    let result = common::run_cli_case(
        "invalid_timeout_is_rejected_with_code",
        &["--timeout", "0", "config"],
    );
    assert!(
        !result.status.success(),
        "expected failure; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stderr.contains("[WDM-1001]"),
        "expected config error code; log: {}",
        result.log_path.display()
    );
}

#[test]
fn completions_command_generates_shell_script() {
    let result = common::run_cli_case(
        "completions_command_generates_shell_script",
        &["completions", "bash"],
    );
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("watchdog-mux"),
        "expected completion script contents; log: {}",
        result.log_path.display()
    );
}
