use assert_cmd::Command;
use predicates::prelude::*;

const KEY_VARS: &[&str] = &[
    "ANSWERPIPE_CONFIG",
    "ANSWERPIPE_ENV_FILE",
    "ANSWERPIPE_OPENAI_API_KEY",
    "OPENAI_API_KEY",
    "ANSWERPIPE_OPENAI_BASE_URL",
    "OPENAI_BASE_URL",
    "ANSWERPIPE_LLM_PROVIDER",
    "ANSWERPIPE_GOOGLE_API_KEY",
    "GOOGLE_API_KEY",
    "ANSWERPIPE_GOOGLE_CSE_ID",
    "CSE_ID",
    "ANSWERPIPE_SERPAPI_API_KEY",
    "SERPAPI_API_KEY",
    "ANSWERPIPE_NAVER_CLIENT_ID",
    "NAVER_CLIENT_ID",
    "ANSWERPIPE_NAVER_CLIENT_SECRET",
    "NAVER_CLIENT_SECRET",
    "ANSWERPIPE_RENDER_ENABLED",
];

/// A command that cannot see the caller's keys or config.
fn hermetic(home: &std::path::Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("answerpipe"));
    for k in KEY_VARS {
        cmd.env_remove(k);
    }
    cmd.env("HOME", home).env("XDG_CONFIG_HOME", home.join(".config"));
    cmd
}

#[test]
fn version_json_contract() {
    let home = tempfile::tempdir().unwrap();
    let out = hermetic(home.path()).arg("version").output().unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("version json");
    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("version"));
    assert_eq!(v["name"].as_str(), Some("answerpipe"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());
}

#[test]
fn version_text_contract() {
    let home = tempfile::tempdir().unwrap();
    hermetic(home.path())
        .args(["version", "--output", "text"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("answerpipe "));
}

#[test]
fn doctor_reports_booleans_only() {
    let home = tempfile::tempdir().unwrap();
    let cfg = home.path().join("config.json");
    std::fs::write(&cfg, r#"{"render": {"enabled": false}}"#).unwrap();

    let out = hermetic(home.path())
        .env("ANSWERPIPE_SERPAPI_API_KEY", "secret-serp-key")
        .args(["doctor", "--config"])
        .arg(&cfg)
        .output()
        .unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(!stdout.contains("secret-serp-key"));

    let v: serde_json::Value = serde_json::from_str(&stdout).expect("doctor json");
    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["name"].as_str(), Some("answerpipe"));
    assert!(v.get("elapsed_ms").is_some());
    assert_eq!(v["configured"]["engines"]["answer_box"].as_bool(), Some(true));
    assert_eq!(v["configured"]["engines"]["generic"].as_bool(), Some(false));
    assert_eq!(v["configured"]["engines"]["locale"].as_bool(), Some(false));
    assert_eq!(v["configured"]["render"].as_bool(), Some(false));

    let checks = v["checks"].as_array().expect("checks array");
    let config_check = checks
        .iter()
        .find(|c| c["name"].as_str() == Some("config_valid"))
        .expect("config_valid check");
    assert_eq!(config_check["ok"].as_bool(), Some(true));
    let llm_check = checks
        .iter()
        .find(|c| c["name"].as_str() == Some("llm_configured"))
        .expect("llm_configured check");
    assert_eq!(llm_check["ok"].as_bool(), Some(false));
}

#[test]
fn doctor_engine_flags_agree_with_search_backends() {
    let home = tempfile::tempdir().unwrap();
    // No Google keys, but the browser fallback is enabled by default.
    let out = hermetic(home.path()).arg("doctor").output().unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let flags = &v["configured"]["engines"];
    assert_eq!(flags["generic"].as_bool(), Some(true));
    assert_eq!(flags["generic_api"].as_bool(), Some(false));

    let backends = v["checks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"].as_str() == Some("search_backends"))
        .unwrap()
        .clone();
    let listed: Vec<&str> = backends["engines"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e.as_str())
        .collect();
    for (flag, id) in [("generic", "generic"), ("answer_box", "answer-box"), ("locale", "locale")] {
        assert_eq!(flags[flag].as_bool(), Some(listed.contains(&id)), "{flag} vs {listed:?}");
    }
}

#[test]
fn doctor_text_lists_checks() {
    let home = tempfile::tempdir().unwrap();
    hermetic(home.path())
        .args(["doctor", "--output", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("answerpipe "))
        .stdout(predicate::str::contains("checks:"));
}

#[test]
fn doctor_flags_invalid_config_without_failing() {
    let home = tempfile::tempdir().unwrap();
    let cfg = home.path().join("bad.json");
    std::fs::write(&cfg, r#"{"policy": {"default": ["bing"]}}"#).unwrap();

    let out = hermetic(home.path())
        .args(["doctor", "--config"])
        .arg(&cfg)
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["ok"].as_bool(), Some(false));
    let config_check = v["checks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"].as_str() == Some("config_valid"))
        .unwrap()
        .clone();
    assert_eq!(config_check["ok"].as_bool(), Some(false));
    assert!(config_check["error"].as_str().unwrap_or("").contains("bad.json"));
}

#[test]
fn answer_rejects_invalid_config() {
    let home = tempfile::tempdir().unwrap();
    let cfg = home.path().join("bad.json");
    std::fs::write(&cfg, "{not json").unwrap();
    hermetic(home.path())
        .args(["answer", "what time is it in Seoul", "--config"])
        .arg(&cfg)
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad.json"));
}

#[test]
fn answer_rejects_blank_query() {
    let home = tempfile::tempdir().unwrap();
    hermetic(home.path())
        .env("ANSWERPIPE_OPENAI_API_KEY", "test")
        .env("ANSWERPIPE_RENDER_ENABLED", "0")
        .args(["answer", "   "])
        .assert()
        .failure()
        .stderr(predicate::str::contains("empty query"));
}

#[test]
fn env_file_fills_unset_vars_only() {
    let home = tempfile::tempdir().unwrap();
    let env_file = home.path().join("answerpipe.env");
    std::fs::write(
        &env_file,
        "# keys\nANSWERPIPE_SERPAPI_API_KEY=from-file\nexport ANSWERPIPE_RENDER_ENABLED=\"0\"\n",
    )
    .unwrap();

    let out = hermetic(home.path())
        .env("ANSWERPIPE_ENV_FILE", &env_file)
        .arg("doctor")
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["configured"]["engines"]["answer_box"].as_bool(), Some(true));
    assert_eq!(v["configured"]["render"].as_bool(), Some(false));
}
