use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn corpus_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("corpus");
    path
}

fn setup_test_env(extra_config: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let vault = root.join("vault");
    fs::create_dir_all(vault.join("notes")).unwrap();
    fs::create_dir_all(vault.join(".obsidian")).unwrap();
    fs::write(
        vault.join("alpha.md"),
        "# Alpha\n\nRust programming notes. See [[beta]].\n\n## Cargo\n\nCrates and workspaces.\n",
    )
    .unwrap();
    fs::write(
        vault.join("beta.md"),
        "# Beta\n\nPython and machine learning notes.\n",
    )
    .unwrap();
    fs::write(
        vault.join("notes/gamma.md"),
        "Gamma links back to [alpha](../alpha.md).\n",
    )
    .unwrap();
    fs::write(vault.join("notes/skip.txt"), "not markdown").unwrap();
    fs::write(vault.join(".obsidian/workspace.md"), "editor state").unwrap();

    let config_content = format!(
        r#"[vault]
root = "{}/vault"

[embedding]
provider = "disabled"

[context]
max_tokens = 4000
{}
"#,
        root.display(),
        extra_config
    );

    let config_path = config_dir.join("corpus.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_corpus(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = corpus_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run corpus binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn json(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout)
        .unwrap_or_else(|e| panic!("stdout is not JSON ({}):\n{}", e, stdout))
}

#[test]
fn test_index_dry_run_reports_backlog() {
    let (_tmp, config) = setup_test_env("");
    let (stdout, stderr, success) = run_corpus(&config, &["index", "--dry-run"]);
    assert!(success, "index --dry-run failed: {}", stderr);
    assert!(stdout.contains("index (dry-run)"));
    assert!(stdout.contains("sources: 3"), "unexpected output: {}", stdout);
    // alpha.md: source + 2 headings, beta.md: source + 1 heading, gamma: source
    assert!(stdout.contains("entities: 6"), "unexpected output: {}", stdout);
    assert!(stdout.contains("pending embeddings: 6"), "unexpected output: {}", stdout);
}

#[test]
fn test_index_requires_provider() {
    let (_tmp, config) = setup_test_env("");
    let (_stdout, stderr, success) = run_corpus(&config, &["index", "--progress", "off"]);
    assert!(!success);
    assert!(stderr.contains("disabled"), "unexpected stderr: {}", stderr);
}

#[test]
fn test_status_json() {
    let (_tmp, config) = setup_test_env("");
    let (stdout, stderr, success) = run_corpus(&config, &["status"]);
    assert!(success, "status failed: {}", stderr);

    let out = json(&stdout);
    assert_eq!(out["status"], "idle");
    assert_eq!(out["sources"], 3);
    assert_eq!(out["entities"], 6);
    assert_eq!(out["state"]["phase"], "idle");
    assert_eq!(out["state"]["queue"]["pendingJobs"], 6);
    assert_eq!(out["state"]["queue"]["staleTotal"], 6);
    assert!(out["state"]["run"].is_null());
}

#[test]
fn test_context_assembles_target_links_and_manual() {
    let (_tmp, config) = setup_test_env("");
    let (stdout, stderr, success) = run_corpus(
        &config,
        &[
            "context",
            "--target",
            "alpha.md",
            "--manual",
            "notes/gamma.md",
        ],
    );
    assert!(success, "context failed: {}", stderr);

    let out = json(&stdout);
    let items = out["items"].as_array().unwrap();
    let kind = |key: &str| {
        items
            .iter()
            .find(|i| i["key"] == key)
            .map(|i| i["type"].as_str().unwrap().to_string())
    };
    assert_eq!(kind("notes/gamma.md").as_deref(), Some("manual"));
    assert_eq!(kind("beta.md").as_deref(), Some("linked"));
    assert_eq!(kind("alpha.md").as_deref(), Some("source"));
    assert_eq!(kind("alpha.md#Alpha#Cargo").as_deref(), Some("block"));

    let mut keys: Vec<&str> = items.iter().map(|i| i["key"].as_str().unwrap()).collect();
    let count = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), count, "duplicate keys in result");

    let sum: u64 = items.iter().map(|i| i["tokens"].as_u64().unwrap()).sum();
    assert_eq!(out["total_tokens"].as_u64().unwrap(), sum);
    assert_eq!(out["metadata"]["target_path"], "alpha.md");
    assert!(out["truncated_items"].is_null());

    let used: Vec<&str> = out["metadata"]["strategies_used"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s.as_str().unwrap())
        .collect();
    assert!(used.contains(&"manual"));
    assert!(used.contains(&"target"));
    assert!(!used.contains(&"semantic"));
}

#[test]
fn test_context_respects_max_tokens() {
    let (_tmp, config) = setup_test_env("");
    let (stdout, stderr, success) = run_corpus(
        &config,
        &["context", "--target", "alpha.md", "--max-tokens", "12"],
    );
    assert!(success, "context failed: {}", stderr);

    let out = json(&stdout);
    assert!(out["total_tokens"].as_u64().unwrap() <= 12);
}

#[test]
fn test_context_rejects_malformed_budget() {
    let (_tmp, config) = setup_test_env("");
    let (_stdout, stderr, success) =
        run_corpus(&config, &["context", "--budget", "recent"]);
    assert!(!success);
    assert!(stderr.contains("NAME=TOKENS"), "unexpected stderr: {}", stderr);
}

#[test]
fn test_strategies_listing() {
    let (_tmp, config) = setup_test_env("\n[context.strategies.recent]\nenabled = false\n");
    let (stdout, stderr, success) = run_corpus(&config, &["strategies"]);
    assert!(success, "strategies failed: {}", stderr);

    assert!(stdout.contains("STRATEGY"));
    let line = |name: &str| {
        stdout
            .lines()
            .find(|l| l.split_whitespace().next() == Some(name))
            .map(|l| l.to_string())
    };
    assert!(line("manual").unwrap().ends_with("true"));
    assert!(line("linked").unwrap().ends_with("true"));
    assert!(line("target").unwrap().ends_with("true"));
    assert!(line("recent").unwrap().ends_with("false"));
    // no provider, no semantic retrieval
    assert!(line("semantic").is_none());
}

#[test]
fn test_invalid_config_fails() {
    let (tmp, _config) = setup_test_env("");
    let bad = tmp.path().join("config/bad.toml");
    fs::write(
        &bad,
        format!(
            "[vault]\nroot = \"{}/vault\"\n\n[embedding]\nprovider = \"openai\"\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_stdout, stderr, success) = run_corpus(&bad, &["status"]);
    assert!(!success);
    assert!(stderr.contains("model") || stderr.contains("dims"), "unexpected stderr: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (_stdout, stderr, success) = run_corpus(&missing, &["status"]);
    assert!(!success);
    assert!(!stderr.is_empty());
}
