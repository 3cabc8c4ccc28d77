use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_dir(tag: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.push(format!("plume_cli_{tag}_{nanos}_{counter}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn plume(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_plume"))
        .args(args)
        .current_dir(dir)
        .env_remove("PLUME_LOG")
        .env_remove("PLUME_RUNTIME_MEMORY_LIMIT_MB")
        .env_remove("PLUME_RUNTIME_EXECUTION_TIMEOUT_SECS")
        .env_remove("PLUME_RUNTIME_START_PROC")
        .output()
        .expect("run plume")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn assert_ok(output: &Output) {
    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        stdout(output),
        stderr(output)
    );
}

const DEFINITIONS: &str = r#"
[[module]]
path = "greeting"
source = "return { prefix = 'hello ' }"

[[routine]]
name = "add"
args = ["a int2", "b int2"]
returns = "int2"
source = "return a + b"

[[routine]]
name = "greet"
args = ["who text"]
returns = "text"
source = "return plume.loadModule('greeting').prefix .. who"

[[routine]]
name = "upto"
args = ["n int4"]
returns = "int4"
set = true
source = """
for i = 1, n do
  plume.publishRow(i)
end
"""

[[routine]]
name = "total"
args = ["xs int4[]"]
returns = "int8"
source = """
local sum = 0
for _, x in ipairs(xs) do sum = sum + x end
return sum
"""

[[routine]]
name = "describe"
args = ["n int4", "out doubled int4", "out label text"]
returns = "record"
source = "return { doubled = n * 2, label = 'n=' .. n }"

[[routine]]
name = "flip"
args = ["b bytea"]
returns = "bytea"
source = "return b:reverse()"
"#;

#[test]
fn define_then_call_routines() {
    let dir = temp_dir("define_call");
    fs::write(dir.join("routines.toml"), DEFINITIONS).expect("write definitions");

    let output = plume(&dir, &["define", "routines.toml"]);
    assert_ok(&output);
    let text = stdout(&output);
    assert!(text.contains("module greeting"), "{text}");
    assert!(text.contains("routine add ("), "{text}");
    assert!(dir.join("plume.db").exists());

    let output = plume(&dir, &["call", "add", "11", "13"]);
    assert_ok(&output);
    assert_eq!(stdout(&output).trim(), "24");

    let output = plume(&dir, &["call", "greet", "bob"]);
    assert_ok(&output);
    assert_eq!(stdout(&output).trim(), "hello bob");

    let output = plume(&dir, &["call", "upto", "3"]);
    assert_ok(&output);
    assert_eq!(stdout(&output), "1\n2\n3\n");

    let output = plume(&dir, &["call", "total", "[1, 2, 39]"]);
    assert_ok(&output);
    assert_eq!(stdout(&output).trim(), "42");

    let output = plume(&dir, &["call", "describe", "21"]);
    assert_ok(&output);
    assert_eq!(stdout(&output).trim(), r#"[42,"n=21"]"#);

    let output = plume(&dir, &["call", "flip", "\\x00dead"]);
    assert_ok(&output);
    assert_eq!(stdout(&output).trim(), "\\xadde00");

    let output = plume(&dir, &["check", "greet"]);
    assert_ok(&output);
    assert_eq!(stdout(&output).trim(), "ok");
}

#[test]
fn inline_blocks_and_queries_share_the_database() {
    let dir = temp_dir("do_sql");
    let output = plume(
        &dir,
        &[
            "do",
            "plume.execute('CREATE TABLE notes (body TEXT)')\nplume.execute('INSERT INTO notes VALUES ($1)', {'first'})\nplume.log(NOTICE, 'stored')",
        ],
    );
    assert_ok(&output);
    assert!(stderr(&output).contains("NOTICE: stored"), "{}", stderr(&output));

    let output = plume(&dir, &["sql", "INSERT INTO notes VALUES ('second')"]);
    assert_ok(&output);
    assert_eq!(stdout(&output).trim(), "1 row(s) affected");

    let output = plume(&dir, &["sql", "SELECT body FROM notes ORDER BY rowid"]);
    assert_ok(&output);
    assert_eq!(stdout(&output), "body\nfirst\nsecond\n");
}

#[test]
fn database_path_comes_from_the_config_file() {
    let dir = temp_dir("config");
    fs::write(
        dir.join("plume.toml"),
        "[runtime]\nexecution_timeout_secs = 5\n\n[database]\npath = \"data.sqlite\"\n",
    )
    .expect("write config");
    let output = plume(&dir, &["sql", "CREATE TABLE t (x INTEGER)"]);
    assert_ok(&output);
    assert!(dir.join("data.sqlite").exists());
    assert!(!dir.join("plume.db").exists());

    let output = plume(&dir, &["info"]);
    assert_ok(&output);
    let info: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("info json");
    assert!(info.get("runtime").is_some(), "{info}");
    assert!(info["build"]["target"].is_string(), "{info}");
}

#[test]
fn failures_exit_non_zero_with_error_reports() {
    let dir = temp_dir("errors");
    let output = plume(&dir, &["call", "missing"]);
    assert!(!output.status.success());
    let text = stderr(&output);
    assert!(text.starts_with("error: "), "{text}");
    assert!(text.contains("does not exist"), "{text}");

    let output = plume(&dir, &["call", "missing", "--json-errors"]);
    assert!(!output.status.success());
    let report: serde_json::Value =
        serde_json::from_str(stderr(&output).trim()).expect("error json");
    assert_eq!(report["error"]["code"], "host_error");

    let output = plume(&dir, &["do", "error('boom')"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("boom"), "{}", stderr(&output));

    let output = plume(&dir, &["frobnicate"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("unknown command: frobnicate"));

    let output = plume(&dir, &["call", "add", "--role"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("--role expects a role oid"));
}

#[test]
fn failed_calls_roll_back_their_writes() {
    let dir = temp_dir("rollback");
    assert_ok(&plume(&dir, &["sql", "CREATE TABLE log (v INTEGER)"]));
    let output = plume(
        &dir,
        &["do", "plume.execute('INSERT INTO log VALUES (1)')\nerror('abort')"],
    );
    assert!(!output.status.success());
    let output = plume(&dir, &["sql", "SELECT count(*) AS n FROM log"]);
    assert_ok(&output);
    assert_eq!(stdout(&output), "n\n0\n");
}
