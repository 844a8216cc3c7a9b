use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn copilot_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("copilot");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/copilot.sqlite"

[storage]
root = "{root}/data/manuals"

[server]
bind = "127.0.0.1:8731"

[chunking]
target_tokens = 400
overlap_tokens = 50

[cache]
ttl_days = 7
"#,
        root = root.display()
    );

    let config_path = config_dir.join("copilot.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_copilot(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = copilot_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("JWT_SECRET_KEY", "integration-test-secret-key")
        .env_remove("ANTHROPIC_API_KEY")
        .env_remove("OPENAI_API_KEY")
        .env_remove("GOOGLE_API_KEY")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run copilot binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_copilot(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/copilot.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_copilot(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_copilot(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_user_create_and_reset_password() {
    let (_tmp, config_path) = setup_test_env();
    run_copilot(&config_path, &["init"]);

    let (stdout, stderr, success) = run_copilot(
        &config_path,
        &[
            "user", "create", "--username", "alice", "--email", "alice@example.com",
            "--password", "correct-horse", "--role", "admin",
        ],
    );
    assert!(success, "user create failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Created user alice"));
    assert!(stdout.contains("role admin"));

    let (_, _, success) = run_copilot(
        &config_path,
        &["user", "reset-password", "--username", "alice", "--password", "battery-staple"],
    );
    assert!(success, "reset-password failed");
}

#[test]
fn test_user_create_duplicate_fails() {
    let (_tmp, config_path) = setup_test_env();
    let args = [
        "user", "create", "--username", "bob", "--email", "bob@example.com",
        "--password", "password123",
    ];

    let (_, _, first) = run_copilot(&config_path, &args);
    assert!(first);
    let (_, stderr, second) = run_copilot(&config_path, &args);
    assert!(!second, "duplicate user should fail");
    assert!(stderr.contains("already registered"), "stderr={}", stderr);
}

#[test]
fn test_user_create_unknown_role_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_copilot(
        &config_path,
        &[
            "user", "create", "--username", "carol", "--email", "carol@example.com",
            "--password", "password123", "--role", "superuser",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("unknown role"), "stderr={}", stderr);
}

#[test]
fn test_reset_password_unknown_user_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, _, success) = run_copilot(
        &config_path,
        &["user", "reset-password", "--username", "nobody", "--password", "password123"],
    );
    assert!(!success);
}

#[test]
fn test_cache_purge_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_copilot(&config_path, &["init"]);

    let (stdout, stderr, success) = run_copilot(&config_path, &["cache", "purge"]);
    assert!(success, "cache purge failed: stderr={}", stderr);
    assert!(stdout.contains("Purged 0 expired cache entries"));
}

#[test]
fn test_usage_report() {
    let (_tmp, config_path) = setup_test_env();
    run_copilot(&config_path, &["init"]);

    let (stdout, stderr, success) = run_copilot(&config_path, &["usage", "--days", "7"]);
    assert!(success, "usage failed: stderr={}", stderr);
    assert!(stdout.contains("last 7 days"));
    assert!(stdout.contains("Requests:    0"));
}

#[test]
fn test_usage_rejects_out_of_range_days() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_copilot(&config_path, &["usage", "--days", "400"]);
    assert!(!success);
    assert!(stderr.contains("days must be between 1 and 365"), "stderr={}", stderr);
}

#[test]
fn test_manual_index_unknown_id() {
    let (_tmp, config_path) = setup_test_env();
    run_copilot(&config_path, &["init"]);

    let (_, stderr, success) = run_copilot(
        &config_path,
        &["manual", "index", "00000000-0000-0000-0000-000000000000"],
    );
    assert!(!success);
    assert!(stderr.contains("Manual not found"), "stderr={}", stderr);
}

#[test]
fn test_invalid_config_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(
        &bad,
        format!(
            "[db]\npath = \"{}/x.sqlite\"\n\n[server]\nbind = \"127.0.0.1:1\"\n\n[chunking]\ntarget_tokens = 100\noverlap_tokens = 100\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, success) = run_copilot(&bad, &["init"]);
    assert!(!success);
    assert!(stderr.contains("overlap_tokens"), "stderr={}", stderr);
}

#[test]
fn test_missing_config_file() {
    let (tmp, _) = setup_test_env();
    let missing = tmp.path().join("config/missing.toml");
    let (_, stderr, success) = run_copilot(&missing, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr={}", stderr);
}
