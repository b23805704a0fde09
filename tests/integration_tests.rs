//! Integration tests for the gauntlet CLI.
//!
//! Each test drives the real binary against a throwaway project directory.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const GOOD_SPEC: &str = "\
# Overview
This service accepts uploads of sensor readings and stores them for later analysis by the reporting team.

# Requirements
- Each reading carries a device id, a timestamp and a numeric value.
- Readings older than thirty days are archived to cold storage.
- An invalid reading is rejected with a clear error message and logged.

# Acceptance Criteria
- A valid reading is visible in the reporting view within five seconds.
- A failure to reach storage is retried three times before the upload is reported as failed.
";

const SHORT_SPEC: &str = "# Overview\nTBD\n";

/// Helper to create a gauntlet Command rooted in `dir`
fn gauntlet(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("gauntlet");
    cmd.current_dir(dir)
        .env_remove("GAUNTLET_MAX_RETRIES")
        .env_remove("GAUNTLET_ADVISORY_CMD")
        .env_remove("GAUNTLET_ADVISORY_URL")
        .env_remove("GAUNTLET_INVARIANT_DIR")
        .env_remove("RUST_LOG");
    cmd
}

fn project_with_spec(content: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("spec.md"), content).unwrap();
    dir
}

fn write_config(dir: &Path, content: &str) {
    let gauntlet_dir = dir.join(".gauntlet");
    fs::create_dir_all(&gauntlet_dir).unwrap();
    fs::write(gauntlet_dir.join("gauntlet.toml"), content).unwrap();
}

fn run_id(stdout: &[u8]) -> String {
    String::from_utf8_lossy(stdout)
        .lines()
        .find_map(|l| l.strip_prefix("run_id: "))
        .map(|s| s.trim().to_string())
        .expect("run_id in output")
}

fn invariant_id(stdout: &[u8]) -> String {
    String::from_utf8_lossy(stdout)
        .lines()
        .find_map(|l| l.strip_prefix("invariant: "))
        .map(|s| s.trim().to_string())
        .expect("invariant id in output")
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        gauntlet(dir.path()).arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        gauntlet(dir.path()).arg("--version").assert().success();
    }

    #[test]
    fn test_gates_lists_default_table() {
        let dir = TempDir::new().unwrap();
        gauntlet(dir.path())
            .arg("gates")
            .assert()
            .success()
            .stdout(predicate::str::contains("stress-test"))
            .stdout(predicate::str::contains("structure"))
            .stdout(predicate::str::contains("error-states"))
            .stdout(predicate::str::contains("security-scan"))
            .stdout(predicate::str::contains("acceptance-review"));
    }

    #[test]
    fn test_cyclic_gate_table_is_rejected() {
        let dir = project_with_spec(GOOD_SPEC);
        write_config(
            dir.path(),
            r#"
[[gates]]
id = "a"
name = "A"
order = 1
depends_on = ["b"]
checks = [{ kind = "min_length", chars = 1 }]

[[gates]]
id = "b"
name = "B"
order = 2
depends_on = ["a"]
checks = [{ kind = "min_length", chars = 1 }]
"#,
        );
        gauntlet(dir.path())
            .args(["start", "spec.md"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Cycle"));
        assert!(!dir.path().join(".gauntlet/state/runs").exists());
    }

    #[test]
    fn test_config_validate_warns_about_stub() {
        let dir = TempDir::new().unwrap();
        gauntlet(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("stub"));
    }
}

// =============================================================================
// Run lifecycle
// =============================================================================

mod runs {
    use super::*;

    #[test]
    fn test_good_spec_completes_with_exit_zero() {
        let dir = project_with_spec(GOOD_SPEC);
        gauntlet(dir.path())
            .args(["start", "spec.md"])
            .assert()
            .code(0)
            .stdout(predicate::str::contains("status: COMPLETE"))
            .stdout(predicate::str::contains("run_id: "));
    }

    #[test]
    fn test_start_warns_when_stub_backs_advisory_gates() {
        let dir = project_with_spec(GOOD_SPEC);
        gauntlet(dir.path())
            .args(["start", "spec.md"])
            .assert()
            .code(0)
            .stderr(predicate::str::contains("advisory backend is the stub"));
    }

    #[test]
    fn test_failing_spec_escalates_with_exit_two() {
        let dir = project_with_spec(SHORT_SPEC);
        let output = gauntlet(dir.path())
            .args(["--max-retries", "2", "start", "spec.md"])
            .assert()
            .code(2)
            .stdout(predicate::str::contains("status: GUTTER"))
            .stdout(predicate::str::contains("Escalated to operator"))
            .stdout(predicate::str::contains("gate:   stress-test (attempts: 2)"))
            .get_output()
            .stdout
            .clone();

        let id = run_id(&output);
        gauntlet(dir.path())
            .args(["status", &id])
            .assert()
            .code(2)
            .stdout(predicate::str::contains("GUTTER"))
            .stdout(predicate::str::contains("AttemptFailed"))
            .stdout(predicate::str::contains("budget"));
    }

    #[test]
    fn test_env_sets_retry_budget() {
        let dir = project_with_spec(SHORT_SPEC);
        gauntlet(dir.path())
            .env("GAUNTLET_MAX_RETRIES", "1")
            .args(["start", "spec.md"])
            .assert()
            .code(2)
            .stdout(predicate::str::contains("(attempts: 1)"));
    }

    #[test]
    fn test_resume_of_complete_run_is_idempotent() {
        let dir = project_with_spec(GOOD_SPEC);
        let output = gauntlet(dir.path())
            .args(["start", "spec.md"])
            .assert()
            .code(0)
            .get_output()
            .stdout
            .clone();
        let id = run_id(&output);
        let run_file = dir.path().join(format!(".gauntlet/state/runs/{}.json", id));
        let before = fs::read_to_string(&run_file).unwrap();

        for _ in 0..2 {
            gauntlet(dir.path())
                .args(["resume", &id])
                .assert()
                .code(0)
                .stdout(predicate::str::contains("status: COMPLETE"));
        }
        assert_eq!(fs::read_to_string(&run_file).unwrap(), before);
    }

    #[test]
    fn test_gate_metrics_written_per_gate() {
        let dir = project_with_spec(GOOD_SPEC);
        let output = gauntlet(dir.path())
            .args(["start", "spec.md"])
            .assert()
            .code(0)
            .get_output()
            .stdout
            .clone();
        let id = run_id(&output);
        let metrics_dir = dir.path().join(format!(".gauntlet/state/metrics/{}", id));
        for gate in ["stress-test", "structure", "error-states", "security-scan", "acceptance-review"] {
            let raw = fs::read_to_string(metrics_dir.join(format!("{}.json", gate))).unwrap();
            assert!(raw.contains("\"outcome\": \"PASSED\""), "{}: {}", gate, raw);
        }
    }

    #[test]
    fn test_remediate_then_resume_completes() {
        let dir = project_with_spec(SHORT_SPEC);
        let output = gauntlet(dir.path())
            .args(["--max-retries", "1", "start", "spec.md"])
            .assert()
            .code(2)
            .get_output()
            .stdout
            .clone();
        let id = run_id(&output);

        // Resuming without remediation leaves the run escalated.
        gauntlet(dir.path()).args(["resume", &id]).assert().code(2);

        fs::write(dir.path().join("spec.md"), GOOD_SPEC).unwrap();
        gauntlet(dir.path())
            .args(["remediate", &id, "--note", "expanded the spec"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Remediated"));
        gauntlet(dir.path())
            .args(["resume", &id])
            .assert()
            .code(0)
            .stdout(predicate::str::contains("status: COMPLETE"));
    }

    #[test]
    fn test_remediate_requires_gutter() {
        let dir = project_with_spec(GOOD_SPEC);
        let output = gauntlet(dir.path())
            .args(["start", "spec.md"])
            .assert()
            .code(0)
            .get_output()
            .stdout
            .clone();
        let id = run_id(&output);
        gauntlet(dir.path())
            .args(["remediate", &id])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("not allowed"));
    }

    #[test]
    fn test_cancel_escalated_run() {
        let dir = project_with_spec(SHORT_SPEC);
        let output = gauntlet(dir.path())
            .args(["--max-retries", "1", "start", "spec.md"])
            .assert()
            .code(2)
            .get_output()
            .stdout
            .clone();
        let id = run_id(&output);

        gauntlet(dir.path())
            .args(["cancel", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cancelled"));
        gauntlet(dir.path())
            .args(["status", &id])
            .assert()
            .code(0)
            .stdout(predicate::str::contains("COMPLETE"))
            .stdout(predicate::str::contains("cancelled: true"));
    }

    #[test]
    fn test_status_lists_runs() {
        let dir = project_with_spec(GOOD_SPEC);
        gauntlet(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs yet"));
        let output = gauntlet(dir.path())
            .args(["start", "spec.md"])
            .assert()
            .code(0)
            .get_output()
            .stdout
            .clone();
        gauntlet(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains(run_id(&output)));
    }

    #[test]
    fn test_unknown_run_is_an_error() {
        let dir = TempDir::new().unwrap();
        gauntlet(dir.path())
            .args(["status", "no-such-run"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_missing_spec_is_an_error() {
        let dir = TempDir::new().unwrap();
        gauntlet(dir.path())
            .args(["start", "absent.md"])
            .assert()
            .code(1);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_advisor_fixes_spec() {
        let dir = project_with_spec("# Overview\nShort spec.\n");
        let fix = serde_json::json!({
            "structured_fields": { "revised_content": GOOD_SPEC }
        });
        fs::write(dir.path().join("fix.json"), fix.to_string()).unwrap();
        let script = format!(
            "input=$(cat)\ncase \"$input\" in\n  *'\"mode\":\"fix-suggest\"'*) cat '{}' ;;\n  *) echo '{{\"confidence\": 0.9, \"issues\": []}}' ;;\nesac\n",
            dir.path().join("fix.json").display()
        );
        fs::write(dir.path().join("advisor.sh"), script).unwrap();
        write_config(
            dir.path(),
            &format!(
                "[advisory]\nbackend = \"command\"\ncommand = \"sh\"\nargs = [\"{}\"]\n",
                dir.path().join("advisor.sh").display()
            ),
        );

        gauntlet(dir.path())
            .args(["start", "spec.md"])
            .assert()
            .code(0)
            .stdout(predicate::str::contains("status: COMPLETE"));
        assert_eq!(fs::read_to_string(dir.path().join("spec.md")).unwrap(), GOOD_SPEC);
    }
}

// =============================================================================
// Learnings and invariants
// =============================================================================

mod invariants {
    use super::*;

    #[test]
    fn test_learn_thresholds() {
        let dir = TempDir::new().unwrap();
        gauntlet(dir.path())
            .args(["learn", "Specs name a data retention period", "--confidence", "0.95"])
            .assert()
            .success()
            .stdout(predicate::str::contains("PROMOTE"))
            .stdout(predicate::str::contains("invariant: inv-"));
        gauntlet(dir.path())
            .args(["learn", "Specs list supported locales", "--confidence", "0.6"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ACCEPT"));
        gauntlet(dir.path())
            .args(["learn", "Specs mention the team lead", "--confidence", "0.3"])
            .assert()
            .success()
            .stdout(predicate::str::contains("REJECT"));
        gauntlet(dir.path())
            .args(["learn", "Specs define rate limits", "--confidence", "0.3", "--force"])
            .assert()
            .success()
            .stdout(predicate::str::contains("PROMOTE"));

        gauntlet(dir.path())
            .args(["invariants", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Specs name a data retention period"))
            .stdout(predicate::str::contains("Specs define rate limits"))
            .stdout(predicate::str::contains("Specs list supported locales").not());
    }

    #[test]
    fn test_learn_rejects_bad_confidence() {
        let dir = TempDir::new().unwrap();
        gauntlet(dir.path())
            .args(["learn", "anything", "--confidence", "1.5"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("between 0 and 1"));
    }

    #[test]
    fn test_promoted_invariant_gates_later_runs() {
        let dir = project_with_spec(&format!("{}\nLorem ipsum placeholder text.\n", GOOD_SPEC));
        let output = gauntlet(dir.path())
            .args([
                "learn",
                "Specs carry no placeholder text",
                "--confidence",
                "0.9",
                "--forbid",
                "(?i)lorem ipsum",
            ])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let id = invariant_id(&output);

        gauntlet(dir.path())
            .args(["--max-retries", "1", "start", "spec.md"])
            .assert()
            .code(2)
            .stdout(predicate::str::contains("Specs carry no placeholder text"));

        gauntlet(dir.path())
            .args(["invariants", "show", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("Violated"))
            .stdout(predicate::str::contains("violations: 1"));
    }

    #[test]
    fn test_show_unknown_invariant() {
        let dir = TempDir::new().unwrap();
        gauntlet(dir.path())
            .args(["invariants", "show", "inv-missing"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_shared_invariant_dir_from_env() {
        let dir = TempDir::new().unwrap();
        let shared = TempDir::new().unwrap();
        gauntlet(dir.path())
            .env("GAUNTLET_INVARIANT_DIR", shared.path())
            .args(["learn", "Specs state an owner", "--confidence", "0.9"])
            .assert()
            .success();

        let other = TempDir::new().unwrap();
        gauntlet(other.path())
            .env("GAUNTLET_INVARIANT_DIR", shared.path())
            .args(["invariants"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Specs state an owner"));
    }
}
