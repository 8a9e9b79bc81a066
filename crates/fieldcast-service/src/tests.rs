use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use fieldcast_core::{failure_code, CancelToken, FailureCode};

use crate::{
    custom_environment_lines, environment_assignments, generate_unit, splice_custom_lines,
    ServiceLifecycleCoordinator, ServiceManager, ServicePhase, ServiceSnapshot, UnitSpec,
};

#[derive(Debug, Default)]
struct FakeState {
    available: bool,
    active: bool,
    enabled: bool,
    ignore_stop: bool,
    ignore_kill: bool,
    fail_start: bool,
    calls: Vec<String>,
}

#[derive(Debug, Default, Clone)]
struct FakeManager {
    state: Rc<RefCell<FakeState>>,
}

impl FakeManager {
    fn new() -> Self {
        let manager = Self::default();
        manager.state.borrow_mut().available = true;
        manager
    }

    fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }
}

impl ServiceManager for FakeManager {
    fn available(&self) -> bool {
        self.state.borrow().available
    }

    fn is_active(&self, _unit: &str) -> Result<bool> {
        Ok(self.state.borrow().active)
    }

    fn is_enabled(&self, _unit: &str) -> Result<bool> {
        Ok(self.state.borrow().enabled)
    }

    fn start(&self, _unit: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push("start".to_string());
        if !state.fail_start {
            state.active = true;
        }
        Ok(())
    }

    fn stop(&self, _unit: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push("stop".to_string());
        if !state.ignore_stop {
            state.active = false;
        }
        Ok(())
    }

    fn kill(&self, _unit: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push("kill".to_string());
        if !state.ignore_kill {
            state.active = false;
        }
        Ok(())
    }

    fn enable(&self, _unit: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push("enable".to_string());
        state.enabled = true;
        Ok(())
    }

    fn daemon_reload(&self) -> Result<()> {
        self.state.borrow_mut().calls.push("daemon-reload".to_string());
        Ok(())
    }

    fn show_property(&self, _unit: &str, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

struct TestRig {
    root: PathBuf,
    manager: FakeManager,
    coordinator: ServiceLifecycleCoordinator,
}

impl TestRig {
    fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        let root = std::env::temp_dir().join(format!(
            "fieldcast-service-tests-{}-{}",
            std::process::id(),
            nanos
        ));
        fs::create_dir_all(&root).expect("must create test root");

        let manager = FakeManager::new();
        let coordinator = ServiceLifecycleCoordinator::new(
            Box::new(manager.clone()),
            "fieldcast-stream",
            root.join("fieldcast-stream.service"),
            root.join("fieldcast.cron"),
            root.join("backups"),
            Duration::from_millis(50),
            Duration::from_millis(50),
            Duration::from_millis(5),
        );
        Self {
            root,
            manager,
            coordinator,
        }
    }

    fn unit_path(&self) -> PathBuf {
        self.root.join("fieldcast-stream.service")
    }

    fn cron_path(&self) -> PathBuf {
        self.root.join("fieldcast.cron")
    }

    fn write_unit(&self, text: &str) {
        fs::write(self.unit_path(), text).expect("must write unit file");
    }
}

impl Drop for TestRig {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn spec() -> UnitSpec {
    UnitSpec::stream_supervisor(std::path::Path::new("/home/fieldcast/fieldcast"))
}

#[test]
fn generated_unit_has_no_custom_lines() {
    let text = generate_unit(&spec());
    assert!(custom_environment_lines(&text).is_empty());
    assert_eq!(
        environment_assignments(&text).len(),
        fieldcast_core::GENERATOR_ENVIRONMENT_DEFAULTS.len()
    );
}

#[test]
fn custom_lines_catch_changed_defaults_and_unknown_keys() {
    let unit = concat!(
        "[Service]\n",
        "Environment=\"FIELDCAST_SAMPLE_RATE=44100\"\n",
        "Environment=\"FIELDCAST_CHANNELS=2\"\n",
        "Environment=\"FIELDCAST_EXTRA_ARGS=--mono\"\n",
        "Environment=\"FIELDCAST_EXTRA_ARGS=--mono\"\n",
    );
    let custom = custom_environment_lines(unit);
    assert_eq!(
        custom,
        vec![
            "FIELDCAST_SAMPLE_RATE=44100".to_string(),
            "FIELDCAST_EXTRA_ARGS=--mono".to_string(),
        ]
    );
}

#[test]
fn splice_inserts_after_last_generated_environment_line() {
    let generated = generate_unit(&spec());
    let custom = vec!["FIELDCAST_EXTRA_ARGS=--mono".to_string()];
    let merged = splice_custom_lines(&generated, &custom).expect("must splice");

    let lines: Vec<&str> = merged.lines().collect();
    let last_default = lines
        .iter()
        .rposition(|line| line.contains("FIELDCAST_LOG_LEVEL"))
        .expect("generated defaults present");
    assert_eq!(
        lines[last_default + 1],
        "Environment=\"FIELDCAST_EXTRA_ARGS=--mono\""
    );
    // Generated content is untouched.
    assert!(merged.contains("ExecStart="));
    assert_eq!(merged.matches("Environment=").count(), 8);
}

#[test]
fn splice_falls_back_to_service_section_anchor() {
    let generated = "[Unit]\nDescription=x\n\n[Service]\nExecStart=/bin/true\n";
    let merged = splice_custom_lines(generated, &["A=1".to_string()]).expect("must splice");
    let lines: Vec<&str> = merged.lines().collect();
    let service = lines.iter().position(|line| *line == "[Service]").unwrap();
    assert_eq!(lines[service + 1], "Environment=\"A=1\"");
}

#[test]
fn splice_fails_without_any_anchor() {
    let err = splice_custom_lines("[Unit]\n", &["A=1".to_string()])
        .expect_err("must fail without anchor");
    assert!(err.to_string().contains("[Service]"));
}

#[test]
fn detect_reports_absent_when_unit_file_missing() {
    let mut rig = TestRig::new();
    let snapshot = rig.coordinator.detect().expect("must detect");
    assert!(!snapshot.installed);
    assert_eq!(rig.coordinator.phase(), ServicePhase::Absent);
}

#[test]
fn detect_captures_flags_and_custom_lines() {
    let mut rig = TestRig::new();
    {
        let mut state = rig.manager.state.borrow_mut();
        state.active = true;
        state.enabled = true;
    }
    let generated = generate_unit(&spec());
    let live = splice_custom_lines(&generated, &["FIELDCAST_EXTRA_ARGS=--mono".to_string()])
        .expect("must splice");
    rig.write_unit(&live);

    let snapshot = rig.coordinator.detect().expect("must detect");
    assert!(snapshot.installed);
    assert!(snapshot.was_running);
    assert!(snapshot.was_enabled);
    assert_eq!(
        snapshot.custom_environment_lines,
        vec!["FIELDCAST_EXTRA_ARGS=--mono".to_string()]
    );
    assert_eq!(rig.coordinator.phase(), ServicePhase::Detected);
}

#[test]
fn stop_escalates_to_kill_when_graceful_stop_stalls() {
    let mut rig = TestRig::new();
    rig.write_unit(&generate_unit(&spec()));
    {
        let mut state = rig.manager.state.borrow_mut();
        state.active = true;
        state.ignore_stop = true;
    }
    let snapshot = rig.coordinator.detect().expect("must detect");
    rig.coordinator
        .stop(&snapshot, &CancelToken::new())
        .expect("kill must converge");

    let calls = rig.manager.calls();
    assert!(calls.contains(&"stop".to_string()));
    assert!(calls.contains(&"kill".to_string()));
    assert_eq!(rig.coordinator.phase(), ServicePhase::Stopped);
}

#[test]
fn stop_fails_when_service_survives_kill() {
    let mut rig = TestRig::new();
    rig.write_unit(&generate_unit(&spec()));
    {
        let mut state = rig.manager.state.borrow_mut();
        state.active = true;
        state.ignore_stop = true;
        state.ignore_kill = true;
    }
    let snapshot = rig.coordinator.detect().expect("must detect");
    let err = rig
        .coordinator
        .stop(&snapshot, &CancelToken::new())
        .expect_err("must fail while still active");
    assert_eq!(failure_code(&err), Some(FailureCode::ServiceStopFailed));
}

#[test]
fn start_is_skipped_when_service_was_not_running() {
    let mut rig = TestRig::new();
    rig.write_unit(&generate_unit(&spec()));
    let snapshot = rig.coordinator.detect().expect("must detect");
    assert!(!snapshot.was_running);

    rig.coordinator
        .start(&snapshot, &CancelToken::new())
        .expect("must be a no-op");
    assert!(!rig.manager.calls().contains(&"start".to_string()));
}

#[test]
fn start_failure_carries_remediation_hints() {
    let mut rig = TestRig::new();
    rig.write_unit(&generate_unit(&spec()));
    {
        let mut state = rig.manager.state.borrow_mut();
        state.active = true;
    }
    let snapshot = rig.coordinator.detect().expect("must detect");
    {
        let mut state = rig.manager.state.borrow_mut();
        state.active = false;
        state.fail_start = true;
    }

    let err = rig
        .coordinator
        .start(&snapshot, &CancelToken::new())
        .expect_err("must time out");
    assert_eq!(failure_code(&err), Some(FailureCode::ServiceStartFailed));
    assert!(err.to_string().contains("journalctl -u fieldcast-stream"));
}

#[test]
fn reinstall_preserves_customs_and_reenables() {
    let mut rig = TestRig::new();
    {
        let mut state = rig.manager.state.borrow_mut();
        state.enabled = true;
    }
    let generated = generate_unit(&spec());
    let live = splice_custom_lines(&generated, &["FIELDCAST_EXTRA_ARGS=--mono".to_string()])
        .expect("must splice");
    rig.write_unit(&live);

    let snapshot = rig.coordinator.detect().expect("must detect");
    rig.coordinator
        .reinstall(&spec(), &snapshot)
        .expect("must reinstall");

    let reinstalled = fs::read_to_string(rig.unit_path()).expect("must read unit");
    assert_eq!(
        custom_environment_lines(&reinstalled),
        vec!["FIELDCAST_EXTRA_ARGS=--mono".to_string()]
    );
    let calls = rig.manager.calls();
    assert!(calls.contains(&"daemon-reload".to_string()));
    assert!(calls.contains(&"enable".to_string()));
    assert_eq!(rig.coordinator.phase(), ServicePhase::Reinstalled);
}

#[test]
fn backup_restore_round_trip_is_byte_identical() {
    let mut rig = TestRig::new();
    let original_unit = generate_unit(&spec());
    rig.write_unit(&original_unit);
    fs::write(rig.cron_path(), "0 * * * * fieldcast capture\n").expect("must write cron");

    let mut snapshot = rig.coordinator.detect().expect("must detect");
    rig.coordinator.backup(&mut snapshot).expect("must back up");
    assert!(snapshot.backup_unit_path.is_some());
    assert!(snapshot.backup_cron_path.is_some());

    // Mutate both live files, then roll back.
    rig.write_unit("[Service]\nExecStart=/bin/false\n");
    fs::write(rig.cron_path(), "broken\n").expect("must write cron");
    rig.coordinator
        .restore_from_backup(&snapshot)
        .expect("must restore");

    assert_eq!(
        fs::read_to_string(rig.unit_path()).expect("must read unit"),
        original_unit
    );
    assert_eq!(
        fs::read_to_string(rig.cron_path()).expect("must read cron"),
        "0 * * * * fieldcast capture\n"
    );
    assert_eq!(rig.coordinator.phase(), ServicePhase::RolledBack);
}

#[test]
fn cleanup_removes_backup_files() {
    let mut rig = TestRig::new();
    rig.write_unit(&generate_unit(&spec()));
    let mut snapshot = rig.coordinator.detect().expect("must detect");
    rig.coordinator.backup(&mut snapshot).expect("must back up");

    let backup = snapshot.backup_unit_path.clone().expect("backup path");
    assert!(backup.exists());
    rig.coordinator.cleanup_backup(&snapshot);
    assert!(!backup.exists());
}

#[test]
fn snapshot_serializes_for_the_update_marker() {
    let snapshot = ServiceSnapshot {
        installed: true,
        was_running: true,
        was_enabled: false,
        custom_environment_lines: vec!["FIELDCAST_EXTRA_ARGS=--mono".to_string()],
        backup_unit_path: Some(PathBuf::from("/var/lib/fieldcast/update/backup.bak")),
        backup_cron_path: None,
    };
    let json = serde_json::to_string(&snapshot).expect("must serialize");
    let round_tripped: ServiceSnapshot = serde_json::from_str(&json).expect("must deserialize");
    assert_eq!(round_tripped, snapshot);
}
