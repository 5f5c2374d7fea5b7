use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn shx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("shx");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let kb_dir = root.join("kb");
    fs::create_dir_all(kb_dir.join("billing")).unwrap();
    fs::write(
        kb_dir.join("billing/refunds.md"),
        "# Refund policy\n\nAnnual plans can be refunded in full within 14 days of purchase.\n\n\
         Monthly plans are not refunded, but you can cancel at any time.",
    )
    .unwrap();
    fs::write(
        kb_dir.join("billing/payment-methods.md"),
        "# Payment methods\n\nWe accept Visa, Mastercard, and American Express.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/support.sqlite"

[knowledge_base]
root = "{}/kb"

[server]
bind = "127.0.0.1:7331"
"#,
        root.display(),
        root.display()
    );

    let config_path = root.join("support.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_shx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = shx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run shx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_index_reports_counts() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_shx(&config, &["index"]);
    assert!(ok, "index failed: {}", stderr);
    assert!(stdout.contains("Indexed 2 documents into 2 chunks"), "{}", stdout);
    assert!(stdout.contains("hash-256"), "{}", stdout);
}

#[test]
fn test_ask_greeting() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_shx(&config, &["ask", "hi"]);
    assert!(ok, "ask failed: {}", stderr);
    assert!(stdout.contains("Intent: greeting"), "{}", stdout);
}

#[test]
fn test_ask_json_after_index() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, ok) = run_shx(&config, &["index"]);
    assert!(ok, "index failed: {}", stderr);

    let (stdout, stderr, ok) = run_shx(
        &config,
        &["ask", "--json", "Can I get a refund on my annual plan?"],
    );
    assert!(ok, "ask failed: {}", stderr);
    let body: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(body["intent"], "question");
    assert_eq!(body["ticket_id"].as_str().unwrap().len(), 8);
    assert_eq!(body["trace"][0], "start");
    assert_eq!(body["trace"].as_array().unwrap().last().unwrap(), "end");
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _) = setup_test_env();
    let config = tmp.path().join("bad.toml");
    fs::write(&config, "[quality]\nconfidence_threshold = 0.4\nescalation_threshold = 0.6\n").unwrap();

    let (_, stderr, ok) = run_shx(&config, &["index"]);
    assert!(!ok);
    assert!(stderr.contains("escalation_threshold"), "{}", stderr);
}

#[test]
fn test_missing_config_errors() {
    let (tmp, _) = setup_test_env();
    let (_, _, ok) = run_shx(&tmp.path().join("nope.toml"), &["index"]);
    assert!(!ok);
}
