use std::fs;
use std::path::Path;

use predicates::prelude::*;

mod openai_stub;

fn generate_cmd(out: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pagewright");
    cmd.args([
        "generate",
        "--title",
        "Quiet Systems",
        "--subtitle",
        "Notes on calm software",
        "--description",
        "How small teams keep production boring.",
        "--pages",
        "50",
        "--genre",
        "technical",
        "--out",
        out.to_str().expect("utf-8 path"),
    ]);
    cmd
}

#[test]
fn plan_prints_calculated_structure() -> anyhow::Result<()> {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pagewright");
    let output = cmd.args(["plan", "--pages", "300"]).assert().success();
    let plan: serde_json::Value = serde_json::from_slice(&output.get_output().stdout)?;
    assert_eq!(plan["content_words"], 82_500);
    assert_eq!(plan["total_sections"], 55);
    assert_eq!(plan["total_chapters"], 13);
    assert_eq!(plan["num_parts"], 3);
    assert_eq!(plan["chapters_per_part"], 4);
    Ok(())
}

#[test]
fn plan_rejects_books_without_room_for_content() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pagewright");
    cmd.args(["plan", "--pages", "20"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("leaves no room for content"));
}

#[test]
fn noop_generate_then_gate_render_and_resume() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let out = temp.path().join("book");

    generate_cmd(&out)
        .args(["--format", "markdown", "--format", "json", "--format", "epub"])
        .assert()
        .success()
        .stdout(predicate::str::contains("status: completed"));

    for name in ["project.json", "book.md", "manuscript.json", "book.epub"] {
        assert!(out.join(name).exists(), "missing {name}");
    }
    let book = fs::read_to_string(out.join("book.md"))?;
    assert!(book.starts_with("# Quiet Systems\n\n## Notes on calm software"));
    assert!(book.contains("## Preface"));
    assert!(book.contains("## Resources and Further Reading"));

    let project: serde_json::Value = serde_json::from_str(&fs::read_to_string(out.join("project.json"))?)?;
    assert_eq!(project["status"], "completed");
    assert!(!project["quality_history"].as_array().map_or(true, Vec::is_empty));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pagewright");
    let gate = cmd
        .args(["gate", "--project", out.to_str().expect("utf-8 path")])
        .assert()
        .success();
    let report: serde_json::Value = serde_json::from_slice(&gate.get_output().stdout)?;
    assert_eq!(report["checks"].as_array().map(Vec::len), Some(5));

    let rendered = temp.path().join("rendered");
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pagewright");
    cmd.args([
        "render",
        "--project",
        out.to_str().expect("utf-8 path"),
        "--format",
        "markdown",
        "--out",
        rendered.to_str().expect("utf-8 path"),
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("markdown:"));
    assert_eq!(fs::read_to_string(rendered.join("book.md"))?, book);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pagewright");
    cmd.args(["resume", "--project", out.to_str().expect("utf-8 path")])
        .assert()
        .success()
        .stdout(predicate::str::contains("status: completed"));

    generate_cmd(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("project already exists"));
    Ok(())
}

#[test]
fn openai_engine_runs_against_stub() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let out = temp.path().join("book");
    let stub = openai_stub::OpenAiStub::spawn(openai_stub::StubBehavior::FillLength);

    generate_cmd(&out)
        .env("OPENAI_API_KEY", "test-key")
        .env("PAGEWRIGHT_OPENAI_BASE_URL", &stub.base_url)
        .args(["--engine", "openai", "--model", "stub-model", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("status: completed"));

    let requests = stub.requests();
    assert!(requests.len() > 10, "only {} requests", requests.len());
    assert!(requests.iter().all(|r| r["model"] == "stub-model"));
    assert!(out.join("manuscript.json").exists());
    Ok(())
}

#[test]
fn failing_provider_fails_the_run_and_keeps_the_project() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let out = temp.path().join("book");
    let config = temp.path().join("config.yaml");
    fs::write(&config, "generation:\n  retry_attempts: 1\n  retry_base_delay_ms: 0\n")?;
    let stub = openai_stub::OpenAiStub::spawn(openai_stub::StubBehavior::Error);

    generate_cmd(&out)
        .env("OPENAI_API_KEY", "test-key")
        .env("PAGEWRIGHT_OPENAI_BASE_URL", &stub.base_url)
        .args(["--engine", "openai", "--config", config.to_str().expect("utf-8 path")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("quota exceeded"));

    let project: serde_json::Value = serde_json::from_str(&fs::read_to_string(out.join("project.json"))?)?;
    assert_eq!(project["status"], "failed");
    assert_eq!(project["current_phase"], "structure");
    Ok(())
}

#[cfg(unix)]
#[test]
fn command_engine_with_noop_fallback() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let out = temp.path().join("book");
    let config = temp.path().join("config.yaml");
    fs::write(&config, "generation:\n  retry_attempts: 1\n  retry_base_delay_ms: 0\n")?;

    generate_cmd(&out)
        .args([
            "--config",
            config.to_str().expect("utf-8 path"),
            "--engine",
            "command",
            "--command",
            "sh",
            "--fallback-engine",
            "noop",
            "--format",
            "markdown",
            "--",
            "-c",
            "cat >/dev/null; exit 3",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("status: completed"));
    assert!(out.join("book.md").exists());
    Ok(())
}

#[test]
fn debug_logging_goes_to_stderr() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pagewright");
    cmd.env("RUST_LOG", "debug")
        .env_remove("PAGEWRIGHT_LOG")
        .args(["plan", "--pages", "120"])
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
}
