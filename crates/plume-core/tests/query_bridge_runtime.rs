use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use plume_core::host::sqlite::Notice;
use plume_core::host::{Executor, LogLevel, QueryResult, RoutineKind};
use plume_core::{
    CallOutcome, CallRequest, Datum, PlumeError, RoutineDefinition, Runtime, RuntimeConfig,
    SqliteHost,
};

fn temp_db_path(tag: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    path.push(format!("plume_query_bridge_{tag}_{nanos}.sqlite"));
    path
}

fn runtime(tag: &str) -> Runtime<SqliteHost> {
    let host = SqliteHost::open(temp_db_path(tag)).expect("open host db");
    Runtime::new(host, RuntimeConfig::default()).expect("create runtime")
}

fn define(rt: &Runtime<SqliteHost>, name: &str, args: &[&str], returns: &str, source: &str) -> u32 {
    let def = RoutineDefinition::function(name, args, returns, source).expect("routine definition");
    rt.host_mut().create_routine(&def).expect("create routine")
}

fn define_procedure(rt: &Runtime<SqliteHost>, name: &str, source: &str) -> u32 {
    let def = RoutineDefinition::function(name, &[], "void", source)
        .expect("procedure definition")
        .with_kind(RoutineKind::Procedure);
    rt.host_mut().create_routine(&def).expect("create procedure")
}

fn column_values(rt: &Runtime<SqliteHost>, sql: &str) -> Vec<Datum> {
    match rt.host_mut().execute(sql, &[]).expect("run host query") {
        QueryResult::Rows(set) => set.rows.into_iter().map(|mut row| row.remove(0)).collect(),
        other => panic!("expected rows, got {other:?}"),
    }
}

#[test]
fn execute_returns_rows_and_affected_counts() {
    let mut rt = runtime("execute");
    let count = define(
        &rt,
        "insert_and_count",
        &[],
        "int4",
        r#"
plume.execute("CREATE TABLE items (id INTEGER, label TEXT)")
local inserted = plume.execute("INSERT INTO items VALUES ($1, $2), ($3, $4)", 1, "one", 2, "two")
local rows = plume.execute("SELECT id, label FROM items WHERE id > $1 ORDER BY id", { 0 })
return inserted * 100 + #rows * 10 + rows[2].id"#,
    );
    let outcome = rt.call(CallRequest::new(count, Vec::new())).expect("call");
    assert_eq!(outcome, CallOutcome::Value(Datum::Int4(222)));
    assert_eq!(rt.stats().statements, 3);

    let mismatch = define(
        &rt,
        "bad_params",
        &[],
        "int4",
        r#"return plume.execute("SELECT $1 AS v", 1, 2)"#,
    );
    let err = rt.call(CallRequest::new(mismatch, Vec::new())).expect_err("param count");
    assert!(
        err.to_string().contains("expected 1 parameters but 2 were passed"),
        "{err}"
    );
}

#[test]
fn failed_statements_leave_no_partial_effects() {
    let mut rt = runtime("statement_atomicity");
    rt.host_mut()
        .execute("CREATE TABLE uniq (id INTEGER PRIMARY KEY)", &[])
        .expect("create table");
    let insert = define(
        &rt,
        "insert_twice",
        &[],
        "void",
        r#"
plume.execute("INSERT INTO uniq VALUES (1)")
local ok = pcall(plume.execute, "INSERT INTO uniq VALUES (2), (1)")
assert(not ok, "duplicate key should fail")
plume.execute("INSERT INTO uniq VALUES (3)")"#,
    );
    rt.call(CallRequest::new(insert, Vec::new())).expect("call");
    assert_eq!(
        column_values(&rt, "SELECT id FROM uniq ORDER BY id"),
        [Datum::Int4(1), Datum::Int4(3)]
    );
}

#[test]
fn subtransactions_roll_back_only_their_own_work() {
    let mut rt = runtime("subtransaction");
    rt.host_mut()
        .execute("CREATE TABLE items (id INTEGER)", &[])
        .expect("create table");
    let work = define(
        &rt,
        "work",
        &[],
        "text",
        r#"
plume.execute("INSERT INTO items VALUES (1)")
local ok, err = pcall(plume.subtransaction, function()
  plume.execute("INSERT INTO items VALUES (2)")
  error("boom")
end)
local value = plume.subtransaction(function()
  plume.execute("INSERT INTO items VALUES (3)")
  return "kept"
end)
return tostring(ok) .. ":" .. value"#,
    );
    let outcome = rt.call(CallRequest::new(work, Vec::new())).expect("call");
    assert_eq!(outcome, CallOutcome::Value(Datum::text("false:kept")));
    assert_eq!(
        column_values(&rt, "SELECT id FROM items ORDER BY id"),
        [Datum::Int4(1), Datum::Int4(3)]
    );
}

#[test]
fn failed_statements_inside_a_subtransaction_undo_its_earlier_work() {
    let mut rt = runtime("subtransaction_sql_error");
    rt.host_mut()
        .execute("CREATE TABLE keyed (id INTEGER PRIMARY KEY)", &[])
        .expect("create table");
    let work = define(
        &rt,
        "keyed_work",
        &[],
        "text",
        r#"
plume.execute("INSERT INTO keyed VALUES (1)")
local ok, err = pcall(plume.subtransaction, function()
  plume.execute("INSERT INTO keyed VALUES (2)")
  plume.execute("INSERT INTO keyed VALUES (1)")
end)
plume.execute("INSERT INTO keyed VALUES (4)")
return tostring(ok) .. ":" .. tostring(err ~= nil)"#,
    );
    let outcome = rt.call(CallRequest::new(work, Vec::new())).expect("call");
    assert_eq!(outcome, CallOutcome::Value(Datum::text("false:true")));
    assert_eq!(
        column_values(&rt, "SELECT id FROM keyed ORDER BY id"),
        [Datum::Int4(1), Datum::Int4(4)]
    );
}

#[test]
fn plans_and_cursors_walk_results() {
    let mut rt = runtime("cursor");
    rt.host_mut()
        .execute("CREATE TABLE nums (v INTEGER)", &[])
        .expect("create table");
    let walk = define(
        &rt,
        "walk",
        &[],
        "int4",
        r#"
for i = 1, 5 do plume.execute("INSERT INTO nums VALUES ($1)", i) end
local plan = plume.prepare("SELECT v FROM nums WHERE v > $1 ORDER BY v", { "int4" })
local cursor = plan:cursor(1)
local first = cursor:fetch()
local rest = cursor:fetch(10)
local done = cursor:fetch()
cursor:move(-2)
local back = cursor:fetch()
cursor:close()
local again = plan:execute({ 3 })
plan:free()
assert(done == nil, "cursor should be exhausted")
return first.v * 1000 + #rest * 100 + back.v * 10 + #again"#,
    );
    let outcome = rt.call(CallRequest::new(walk, Vec::new())).expect("call");
    assert_eq!(outcome, CallOutcome::Value(Datum::Int4(2352)));
}

#[test]
fn freed_handles_are_rejected() {
    let mut rt = runtime("freed");
    let freed_plan = define(
        &rt,
        "freed_plan",
        &[],
        "void",
        r#"
local plan = plume.prepare("SELECT 1 AS one")
plan:free()
plan:execute()"#,
    );
    let err = rt.call(CallRequest::new(freed_plan, Vec::new())).expect_err("freed plan");
    assert_eq!(
        err,
        PlumeError::InvalidHandle("plan has already been freed".to_string())
    );

    let closed_cursor = define(
        &rt,
        "closed_cursor",
        &[],
        "void",
        r#"
local cursor = plume.prepare("SELECT 1 AS one"):cursor()
cursor:close()
cursor:fetch()"#,
    );
    let err = rt
        .call(CallRequest::new(closed_cursor, Vec::new()))
        .expect_err("closed cursor");
    assert!(matches!(err, PlumeError::InvalidHandle(_)), "{err:?}");
}

#[test]
fn transaction_control_requires_a_nonatomic_procedure() {
    let mut rt = runtime("commit");
    rt.host_mut()
        .execute("CREATE TABLE log (msg TEXT)", &[])
        .expect("create table");

    let atomic = define(&rt, "atomic_commit", &[], "void", "plume.commit()");
    let err = rt.call(CallRequest::new(atomic, Vec::new())).expect_err("atomic commit");
    assert_eq!(
        err,
        PlumeError::Transaction("invalid transaction termination".to_string())
    );

    let proc = define_procedure(
        &rt,
        "batch",
        r#"
plume.execute("INSERT INTO log VALUES ('kept')")
plume.commit()
plume.execute("INSERT INTO log VALUES ('dropped')")
plume.rollback()"#,
    );
    rt.host_mut().commit().expect("commit setup");
    let err = rt.call(CallRequest::new(proc, Vec::new())).expect_err("atomic call");
    assert!(matches!(err, PlumeError::Transaction(_)), "{err:?}");
    rt.host_mut().rollback().expect("discard failed attempt");

    rt.call(CallRequest::new(proc, Vec::new()).nonatomic())
        .expect("nonatomic call");
    assert_eq!(column_values(&rt, "SELECT msg FROM log"), [Datum::text("kept")]);

    let nested = define_procedure(
        &rt,
        "nested_commit",
        "plume.subtransaction(function() plume.commit() end)",
    );
    let err = rt
        .call(CallRequest::new(nested, Vec::new()).nonatomic())
        .expect_err("commit inside subtransaction");
    assert!(err.to_string().contains("subtransaction is active"), "{err}");
}

#[test]
fn inline_blocks_run_in_the_current_role() {
    let mut rt = runtime("inline");
    rt.inline(
        "plume.execute(\"CREATE TABLE t (v INTEGER)\")\nplume.execute(\"INSERT INTO t VALUES (42)\")",
        false,
    )
    .expect("inline block");
    assert_eq!(column_values(&rt, "SELECT v FROM t"), [Datum::Int4(42)]);

    let err = rt.inline("plume.commit()", false).expect_err("atomic inline");
    assert!(matches!(err, PlumeError::Transaction(_)), "{err:?}");
    rt.inline("plume.commit()", true).expect("nonatomic inline");
}

#[test]
fn find_routine_checks_execute_privilege() {
    let mut rt = runtime("privilege");
    let secret = define(&rt, "secret", &["x int4"], "int4", "return x * 3");
    let caller = define(
        &rt,
        "caller",
        &[],
        "int4",
        r#"local f = plume.findRoutine("secret(int4)")
return f(14)"#,
    );
    assert_eq!(
        rt.call(CallRequest::new(caller, Vec::new())).expect("superuser call"),
        CallOutcome::Value(Datum::Int4(42))
    );

    rt.host_mut().set_role(30);
    match rt.call(CallRequest::new(caller, Vec::new())) {
        Err(PlumeError::Host(err)) => {
            assert_eq!(err.sqlstate.as_deref(), Some("42501"));
            assert!(err.message.contains("permission denied"), "{}", err.message);
        }
        other => panic!("expected permission error, got {other:?}"),
    }

    rt.host_mut()
        .grant_execute(secret, 30)
        .expect("grant execute");
    assert_eq!(
        rt.call(CallRequest::new(caller, Vec::new())).expect("granted call"),
        CallOutcome::Value(Datum::Int4(42))
    );

    let missing = define(&rt, "missing", &[], "int4", r#"return plume.findRoutine("nope")()"#);
    let err = rt.call(CallRequest::new(missing, Vec::new())).expect_err("missing routine");
    assert!(err.to_string().contains("does not exist"), "{err}");
}

#[test]
fn modules_load_once_per_context() {
    let mut rt = runtime("modules");
    rt.host_mut()
        .define_module("util", "loads = (loads or 0) + 1\nreturn { double = function(x) return x * 2 end }")
        .expect("define module");
    let use_util = define(
        &rt,
        "use_util",
        &["n int4"],
        "int4",
        r#"local util = plume.loadModule("util")
local again = plume.loadModule("util")
assert(util == again)
return util.double(n) + loads"#,
    );
    assert_eq!(
        rt.call(CallRequest::new(use_util, vec![Datum::Int4(20)])).expect("call"),
        CallOutcome::Value(Datum::Int4(41))
    );
    assert_eq!(
        rt.call(CallRequest::new(use_util, vec![Datum::Int4(20)])).expect("call again"),
        CallOutcome::Value(Datum::Int4(41))
    );

    let missing = define(&rt, "no_module", &[], "void", r#"plume.loadModule("absent")"#);
    let err = rt.call(CallRequest::new(missing, Vec::new())).expect_err("missing module");
    assert!(err.to_string().contains("module absent not found"), "{err}");
}

#[test]
fn log_messages_reach_the_host() {
    let mut rt = runtime("log");
    let chatty = define(
        &rt,
        "chatty",
        &[],
        "void",
        r#"plume.log(NOTICE, "hello", 42, { a = 1 })
plume.log(WARNING, "careful")"#,
    );
    rt.call(CallRequest::new(chatty, Vec::new())).expect("call");
    let notices = rt.host_mut().take_notices();
    assert_eq!(
        notices,
        [
            Notice {
                level: LogLevel::Notice,
                message: r#"hello 42 {"a":1}"#.to_string(),
            },
            Notice {
                level: LogLevel::Warning,
                message: "careful".to_string(),
            },
        ]
    );

    let fail = define(&rt, "fail", &[], "void", r#"plume.log(ERROR, "stop here")"#);
    match rt.call(CallRequest::new(fail, Vec::new())) {
        Err(PlumeError::Host(err)) => assert_eq!(err.message, "stop here"),
        other => panic!("expected a host error, got {other:?}"),
    }

    let bogus = define(&rt, "bogus_level", &[], "void", r#"plume.log(99, "x")"#);
    let err = rt.call(CallRequest::new(bogus, Vec::new())).expect_err("bad level");
    assert!(matches!(err, PlumeError::ArgumentType(_)), "{err:?}");
}
