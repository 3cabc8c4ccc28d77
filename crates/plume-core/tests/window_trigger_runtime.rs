use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use plume_core::host::{
    Executor, QueryResult, RoutineKind, TriggerEvent, TriggerLevel, TriggerWhen,
};
use plume_core::{
    CallOutcome, CallRequest, Datum, PlumeError, RoutineDefinition, RowDatum, Runtime,
    RuntimeConfig, SqliteHost, TriggerAction, TriggerData, WindowPartition,
};

fn temp_db_path(tag: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    path.push(format!("plume_window_trigger_{tag}_{nanos}.sqlite"));
    path
}

fn runtime(tag: &str) -> Runtime<SqliteHost> {
    let host = SqliteHost::open(temp_db_path(tag)).expect("open host db");
    Runtime::new(host, RuntimeConfig::default()).expect("create runtime")
}

fn define_kind(
    rt: &Runtime<SqliteHost>,
    name: &str,
    args: &[&str],
    returns: &str,
    kind: RoutineKind,
    source: &str,
) -> u32 {
    let def = RoutineDefinition::function(name, args, returns, source)
        .expect("routine definition")
        .with_kind(kind);
    rt.host_mut().create_routine(&def).expect("create routine")
}

fn ints(values: &[i32]) -> Vec<Vec<Datum>> {
    values.iter().map(|v| vec![Datum::Int4(*v)]).collect()
}

#[test]
fn partition_local_state_accumulates_across_rows() {
    let mut rt = runtime("running_sum");
    let running = define_kind(
        &rt,
        "running_sum",
        &["v int4"],
        "int8",
        RoutineKind::Window,
        r#"local w = plume.getWindowFrame()
local state = w:getPartitionLocal() or { sum = 0 }
state.sum = state.sum + v
w:setPartitionLocal(state)
return state.sum"#,
    );
    let out = rt
        .evaluate_window(running, WindowPartition::new(ints(&[1, 2, 3])))
        .expect("evaluate window");
    assert_eq!(out, [Datum::Int8(1), Datum::Int8(3), Datum::Int8(6)]);
}

#[test]
fn frame_navigation_reads_neighbouring_rows() {
    let mut rt = runtime("lag");
    let lag = define_kind(
        &rt,
        "lag_of",
        &["v int4"],
        "int4",
        RoutineKind::Window,
        r#"local w = plume.getWindowFrame()
return w:getFuncArgInPartition(0, -1, w.SEEK_CURRENT)"#,
    );
    let out = rt
        .evaluate_window(lag, WindowPartition::new(ints(&[10, 20, 30])))
        .expect("evaluate lag");
    assert_eq!(out, [Datum::Null, Datum::Int4(10), Datum::Int4(20)]);

    let last = define_kind(
        &rt,
        "last_in_frame",
        &["v int4"],
        "int4",
        RoutineKind::Window,
        r#"local w = plume.getWindowFrame()
return w:getFuncArgInFrame(0, 0, w.SEEK_TAIL)"#,
    );
    let partition = WindowPartition::ordered_by(
        ints(&[1, 2, 3]),
        &[Datum::Int4(1), Datum::Int4(1), Datum::Int4(2)],
    );
    let out = rt.evaluate_window(last, partition).expect("evaluate frame tail");
    assert_eq!(out, [Datum::Int4(2), Datum::Int4(2), Datum::Int4(3)]);

    let shape = define_kind(
        &rt,
        "shape",
        &["v int4"],
        "text",
        RoutineKind::Window,
        r#"local w = plume.getWindowFrame()
return w:getCurrentPosition() .. "/" .. w:getPartitionRowCount() .. ":" .. tostring(w:rowsArePeers(0, 1))"#,
    );
    let partition = WindowPartition::ordered_by(ints(&[5, 5]), &[Datum::Int4(5), Datum::Int4(5)]);
    let out = rt.evaluate_window(shape, partition).expect("evaluate shape");
    assert_eq!(out, [Datum::text("0/2:true"), Datum::text("1/2:true")]);
}

#[test]
fn partition_local_overflow_keeps_the_previous_value() {
    let mut rt = runtime("overflow");
    let grow = define_kind(
        &rt,
        "grow",
        &["v int4"],
        "int4",
        RoutineKind::Window,
        r#"local w = plume.getWindowFrame()
local state = w:getPartitionLocal(64) or { n = 0 }
state.n = state.n + 1
if v == 2 then
  state.pad = string.rep("x", 200)
end
local ok = pcall(w.setPartitionLocal, w, state)
local stored = w:getPartitionLocal()
return ok and stored.n or -stored.n"#,
    );
    let out = rt
        .evaluate_window(grow, WindowPartition::new(ints(&[1, 2, 3])))
        .expect("evaluate overflow");
    assert_eq!(out, [Datum::Int4(1), Datum::Int4(-1), Datum::Int4(2)]);
}

#[test]
fn window_api_is_unavailable_in_plain_calls() {
    let mut rt = runtime("no_window");
    let plain = define_kind(
        &rt,
        "plain",
        &[],
        "int4",
        RoutineKind::Function,
        "return plume.getWindowFrame():getCurrentPosition()",
    );
    let err = rt.call(CallRequest::new(plain, Vec::new())).expect_err("no window");
    assert!(matches!(err, PlumeError::WindowContext(_)), "{err:?}");

    let err = rt
        .evaluate_window(plain, WindowPartition::new(ints(&[1])))
        .expect_err("not a window routine");
    assert!(matches!(err, PlumeError::WindowContext(_)), "{err:?}");
}

fn people_trigger(rt: &Runtime<SqliteHost>, event: TriggerEvent, new_row: Option<RowDatum>) -> TriggerData {
    let relation = rt.host_mut().relation("people").expect("describe people");
    TriggerData {
        name: "people_guard".to_string(),
        when: TriggerWhen::Before,
        level: TriggerLevel::Row,
        event,
        relation,
        new_row,
        old_row: None,
        args: vec!["audit".to_string()],
    }
}

#[test]
fn before_row_triggers_replace_skip_or_keep_rows() {
    let mut rt = runtime("trigger");
    rt.host_mut()
        .execute("CREATE TABLE people (name TEXT, age INTEGER)", &[])
        .expect("create table");
    let guard = define_kind(
        &rt,
        "people_guard",
        &[],
        "trigger",
        RoutineKind::Function,
        r#"assert(TG_OP == "INSERT" and TG_WHEN == "BEFORE" and TG_ARGV[1] == "audit")
assert(TG_TABLE_NAME == "people")
if NEW.age < 0 then return null end
if NEW.age == 0 then return end
NEW.name = string.upper(NEW.name)
return NEW"#,
    );
    let relation_type = rt.host_mut().relation("people").expect("describe people").oid;
    let row = |name: &str, age: i32| RowDatum {
        type_id: relation_type,
        values: vec![Datum::text(name), Datum::Int4(age)],
    };

    let data = people_trigger(&rt, TriggerEvent::Insert, Some(row("alice", 30)));
    let pending = data.pending_row().cloned();
    let replaced = rt.call(CallRequest::trigger(guard, data)).expect("replace");
    assert_eq!(
        replaced,
        CallOutcome::Trigger(TriggerAction::Replace(row("ALICE", 30)))
    );
    if let CallOutcome::Trigger(action) = replaced {
        let written = action.apply(pending).expect("row survives");
        rt.host_mut()
            .insert_row("people", &written)
            .expect("insert replaced row");
    }
    match rt
        .host_mut()
        .execute("SELECT name FROM people", &[])
        .expect("read people")
    {
        QueryResult::Rows(set) => assert_eq!(set.rows, [vec![Datum::text("ALICE")]]),
        other => panic!("expected rows, got {other:?}"),
    }

    let skipped = rt
        .call(CallRequest::trigger(
            guard,
            people_trigger(&rt, TriggerEvent::Insert, Some(row("bob", -1))),
        ))
        .expect("skip");
    assert_eq!(skipped, CallOutcome::Trigger(TriggerAction::Skip));

    let kept = rt
        .call(CallRequest::trigger(
            guard,
            people_trigger(&rt, TriggerEvent::Insert, Some(row("carol", 0))),
        ))
        .expect("proceed");
    assert_eq!(kept, CallOutcome::Trigger(TriggerAction::Proceed));

    let err = rt
        .call(CallRequest::new(guard, Vec::new()))
        .expect_err("trigger called directly");
    assert!(matches!(err, PlumeError::ArgumentType(_)), "{err:?}");

    let mut host = rt.into_host().expect("host released");
    match host.execute("SELECT count(*) AS n FROM people", &[]).expect("count people") {
        QueryResult::Rows(set) => assert_eq!(set.rows, [vec![Datum::Int8(1)]]),
        other => panic!("expected rows, got {other:?}"),
    }
}

#[test]
fn trigger_rows_with_unknown_columns_are_rejected() {
    let mut rt = runtime("trigger_mismatch");
    rt.host_mut()
        .execute("CREATE TABLE people (name TEXT, age INTEGER)", &[])
        .expect("create table");
    let bad = define_kind(
        &rt,
        "bad_guard",
        &[],
        "trigger",
        RoutineKind::Function,
        "NEW.nickname = 'x'\nreturn NEW",
    );
    let relation_type = rt.host_mut().relation("people").expect("describe people").oid;
    let data = people_trigger(
        &rt,
        TriggerEvent::Insert,
        Some(RowDatum {
            type_id: relation_type,
            values: vec![Datum::text("dave"), Datum::Int4(40)],
        }),
    );
    let err = rt.call(CallRequest::trigger(bad, data)).expect_err("unknown column");
    assert!(matches!(err, PlumeError::FieldMismatch(_)), "{err:?}");
}
