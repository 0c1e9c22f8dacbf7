//! End-to-end tests that drive the `archivist` binary as a black box:
//! init a database, add a program, ingest a document, retrieve it, and
//! generate a grounded answer, all against mock embedding/LLM providers so
//! no network access is required.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use tempfile::TempDir;

fn archivist_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("archivist");
    path
}

struct TestEnv {
    _tmp: TempDir,
    config_path: PathBuf,
}

fn setup() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    let db_path = data_dir.join("archivist.db");
    let config_path = config_dir.join("archivist.toml");
    fs::write(
        &config_path,
        format!(
            r#"
[db]
path = "{db}"

[embedding]
provider = "mock"
model = "mock-embed"
dims = 8

[llm]
provider = "mock"
model = "mock-llm"
"#,
            db = db_path.display().to_string().replace('\\', "\\\\"),
        ),
    )
    .unwrap();

    TestEnv {
        _tmp: tmp,
        config_path,
    }
}

fn run(env: &TestEnv, args: &[&str]) -> std::process::Output {
    Command::new(archivist_binary())
        .arg("--config")
        .arg(&env.config_path)
        .args(args)
        .output()
        .expect("failed to run archivist binary")
}

#[test]
fn init_creates_a_usable_database() {
    let env = setup();
    let output = run(&env, &["init"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("initialized"));
}

#[test]
fn program_lifecycle_add_list_remove() {
    let env = setup();
    run(&env, &["init"]);

    let add = run(&env, &["program", "add", "Youth Mentoring"]);
    assert!(add.status.success(), "{}", String::from_utf8_lossy(&add.stderr));

    let list = run(&env, &["program", "list"]);
    assert!(String::from_utf8_lossy(&list.stdout).contains("Youth Mentoring"));

    let remove = run(&env, &["program", "remove", "Youth Mentoring"]);
    assert!(remove.status.success(), "{}", String::from_utf8_lossy(&remove.stderr));

    let list_after = run(&env, &["program", "list"]);
    assert!(!String::from_utf8_lossy(&list_after.stdout).contains("Youth Mentoring"));
}

#[test]
fn ingest_then_retrieve_finds_the_document() {
    let env = setup();
    run(&env, &["init"]);
    run(&env, &["program", "add", "Youth Mentoring"]);

    let doc_path = env.config_path.parent().unwrap().join("report.txt");
    fs::write(
        &doc_path,
        "Our youth mentoring program paired forty at-risk teenagers with trained adult \
         mentors over the past year. Ninety percent of participants improved their school \
         attendance, and most reported stronger confidence in setting long-term goals.",
    )
    .unwrap();

    let ingest = run(
        &env,
        &[
            "ingest",
            doc_path.to_str().unwrap(),
            "--doc-type",
            "grant-report",
            "--year",
            "2024",
            "--outcome",
            "awarded",
            "--programs",
            "Youth Mentoring",
        ],
    );
    assert!(ingest.status.success(), "{}", String::from_utf8_lossy(&ingest.stderr));
    assert!(String::from_utf8_lossy(&ingest.stdout).contains("Ingested document"));

    let list = run(&env, &["list-documents"]);
    assert!(String::from_utf8_lossy(&list.stdout).contains("report.txt"));

    let retrieve = run(&env, &["retrieve", "youth mentoring outcomes"]);
    assert!(retrieve.status.success(), "{}", String::from_utf8_lossy(&retrieve.stderr));
    assert!(String::from_utf8_lossy(&retrieve.stdout).contains("report.txt"));
}

#[test]
fn ingest_rejects_unknown_program() {
    let env = setup();
    run(&env, &["init"]);

    let doc_path = env.config_path.parent().unwrap().join("orphan.txt");
    fs::write(&doc_path, "Some report text that is long enough to extract cleanly.").unwrap();

    let ingest = run(
        &env,
        &[
            "ingest",
            doc_path.to_str().unwrap(),
            "--doc-type",
            "grant-report",
            "--year",
            "2024",
            "--outcome",
            "pending",
            "--programs",
            "Nonexistent Program",
        ],
    );
    assert!(!ingest.status.success());
}

#[test]
fn delete_document_removes_it_from_listing() {
    let env = setup();
    run(&env, &["init"]);

    let doc_path = env.config_path.parent().unwrap().join("annual.txt");
    fs::write(
        &doc_path,
        "This annual report describes our overall organizational impact for the year.",
    )
    .unwrap();

    run(
        &env,
        &[
            "ingest",
            doc_path.to_str().unwrap(),
            "--doc-type",
            "annual-report",
            "--year",
            "2023",
            "--outcome",
            "na",
        ],
    );

    let listed = run(&env, &["list-documents"]);
    let stdout = String::from_utf8_lossy(&listed.stdout);
    let doc_id = stdout.lines().next().unwrap().split_whitespace().next().unwrap().to_string();

    let delete = run(&env, &["delete-document", &doc_id]);
    assert!(delete.status.success(), "{}", String::from_utf8_lossy(&delete.stderr));

    let listed_after = run(&env, &["list-documents"]);
    assert!(!String::from_utf8_lossy(&listed_after.stdout).contains(&doc_id));
}

#[test]
fn generate_produces_grounded_output_with_sources() {
    let env = setup();
    run(&env, &["init"]);
    run(&env, &["program", "add", "Food Security"]);

    let doc_path = env.config_path.parent().unwrap().join("impact.txt");
    fs::write(
        &doc_path,
        "The food pantry distributed twelve thousand meals this year across three \
         neighborhoods, serving roughly nine hundred households each month.",
    )
    .unwrap();

    run(
        &env,
        &[
            "ingest",
            doc_path.to_str().unwrap(),
            "--doc-type",
            "grant-report",
            "--year",
            "2025",
            "--outcome",
            "awarded",
            "--programs",
            "Food Security",
        ],
    );

    let generated = run(
        &env,
        &["generate", "Summarize our food security impact", "--audience", "Foundation Grant"],
    );
    assert!(generated.status.success(), "{}", String::from_utf8_lossy(&generated.stderr));
    let stdout = String::from_utf8_lossy(&generated.stdout);
    assert!(stdout.contains("sources"));
}

#[test]
fn chat_persists_a_conversation_across_invocations() {
    let env = setup();
    run(&env, &["init"]);

    let doc_path = env.config_path.parent().unwrap().join("notes.txt");
    fs::write(
        &doc_path,
        "Volunteer hours rose by thirty percent after the new onboarding program launched.",
    )
    .unwrap();

    run(
        &env,
        &[
            "ingest",
            doc_path.to_str().unwrap(),
            "--doc-type",
            "other",
            "--year",
            "2025",
            "--outcome",
            "na",
        ],
    );

    let first = run(&env, &["chat", "What changed with volunteer hours?"]);
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    let stdout = String::from_utf8_lossy(&first.stdout);
    let conversation_line = stdout.lines().find(|l| l.starts_with("conversation:")).unwrap();
    let conversation_id = conversation_line.split_whitespace().nth(1).unwrap();

    let second = run(
        &env,
        &["chat", "--conversation-id", conversation_id, "And what about this year specifically?"],
    );
    assert!(second.status.success(), "{}", String::from_utf8_lossy(&second.stderr));
}

#[test]
fn output_lifecycle_create_get_set_status_and_content() {
    let env = setup();
    run(&env, &["init"]);

    let draft_path = env.config_path.parent().unwrap().join("draft.txt");
    fs::write(&draft_path, "Draft proposal narrative describing our mentoring outcomes.").unwrap();

    let create = run(
        &env,
        &["output", "create", "grant-proposal", "Youth Mentoring FY26", "--content-file", draft_path.to_str().unwrap()],
    );
    assert!(create.status.success(), "{}", String::from_utf8_lossy(&create.stderr));
    let stdout = String::from_utf8_lossy(&create.stdout);
    let output_id = stdout.split_whitespace().nth(2).unwrap().trim_end_matches('(').to_string();

    let get = run(&env, &["output", "get", &output_id]);
    assert!(get.status.success(), "{}", String::from_utf8_lossy(&get.stderr));
    assert!(String::from_utf8_lossy(&get.stdout).contains("Youth Mentoring FY26"));

    let revised_path = env.config_path.parent().unwrap().join("draft2.txt");
    fs::write(&revised_path, "Revised narrative with updated impact numbers and a stronger ask.").unwrap();
    let set_content = run(&env, &["output", "set-content", &output_id, revised_path.to_str().unwrap()]);
    assert!(set_content.status.success(), "{}", String::from_utf8_lossy(&set_content.stderr));

    let submit = run(&env, &["output", "set-status", &output_id, "submitted"]);
    assert!(submit.status.success(), "{}", String::from_utf8_lossy(&submit.stderr));

    let invalid = run(&env, &["output", "set-status", &output_id, "draft"]);
    assert!(!invalid.status.success());
}
