use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use plume_core::host::{Catalog, RoutineKind};
use plume_core::types;
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
    path.push(format!("plume_call_runtime_{tag}_{nanos}.sqlite"));
    path
}

fn runtime_with(tag: &str, config: RuntimeConfig) -> Runtime<SqliteHost> {
    let host = SqliteHost::open(temp_db_path(tag)).expect("open host db");
    Runtime::new(host, config).expect("create runtime")
}

fn runtime(tag: &str) -> Runtime<SqliteHost> {
    runtime_with(tag, RuntimeConfig::default())
}

fn define(rt: &Runtime<SqliteHost>, name: &str, args: &[&str], returns: &str, source: &str) -> u32 {
    let def = RoutineDefinition::function(name, args, returns, source).expect("routine definition");
    rt.host_mut().create_routine(&def).expect("create routine")
}

fn call_value(rt: &mut Runtime<SqliteHost>, oid: u32, args: Vec<Datum>) -> Datum {
    match rt.call(CallRequest::new(oid, args)).expect("call routine") {
        CallOutcome::Value(value) => value,
        other => panic!("expected a value, got {other:?}"),
    }
}

#[test]
fn scalar_arguments_and_results_follow_declared_types() {
    let mut rt = runtime("scalar");
    let add = define(&rt, "add", &["a int2", "b int2"], "int2", "return a + b");
    assert_eq!(
        call_value(&mut rt, add, vec![Datum::Int2(20), Datum::Int2(4)]),
        Datum::Int2(24)
    );

    let ident = define(&rt, "ident", &["v bigint"], "bigint", "return v");
    assert_eq!(
        call_value(&mut rt, ident, vec![Datum::Int8(i64::MAX)]),
        Datum::Int8(i64::MAX)
    );

    let pair = define(&rt, "pair", &[], "text[]", r#"return {"foo", "bar"}"#);
    match call_value(&mut rt, pair, Vec::new()) {
        Datum::Array(array) => {
            assert_eq!(array.element_type, types::TEXT);
            assert_eq!(array.values, [Datum::text("foo"), Datum::text("bar")]);
        }
        other => panic!("expected a text array, got {other:?}"),
    }

    let nothing = define(&rt, "nothing", &["v int4"], "int4", "if v ~= null and v > 0 then return v end");
    assert_eq!(call_value(&mut rt, nothing, vec![Datum::Int4(-1)]), Datum::Null);
    assert_eq!(call_value(&mut rt, nothing, vec![Datum::Null]), Datum::Null);
}

#[test]
fn out_of_range_results_are_conversion_errors() {
    let mut rt = runtime("range");
    let big = define(&rt, "too_big", &[], "int2", "return 40000");
    let err = rt.call(CallRequest::new(big, Vec::new())).expect_err("int2 overflow");
    assert!(matches!(err, PlumeError::Conversion(_)), "{err:?}");

    let lossy = define(&rt, "lossy", &[], "bigint", "return 2^60");
    let err = rt.call(CallRequest::new(lossy, Vec::new())).expect_err("float above 2^53");
    assert!(matches!(err, PlumeError::Conversion(_)), "{err:?}");

    let not_a_number = define(&rt, "not_a_number", &[], "int4", "return 'NaN'");
    let err = rt
        .call(CallRequest::new(not_a_number, Vec::new()))
        .expect_err("NaN text as int4");
    assert!(matches!(err, PlumeError::Conversion(_)), "{err:?}");

    let err = rt
        .call(CallRequest::new(big, vec![Datum::Int4(1)]))
        .expect_err("wrong arity");
    assert!(matches!(err, PlumeError::ArgumentType(_)), "{err:?}");
}

#[test]
fn bigint_arithmetic_fails_instead_of_wrapping() {
    let mut rt = runtime("bigint_math");
    let next = define(&rt, "next_id", &["v int8"], "int8", "return v + 1");
    assert_eq!(
        call_value(&mut rt, next, vec![Datum::Int8(41)]),
        Datum::Int8(42)
    );
    let err = rt
        .call(CallRequest::new(next, vec![Datum::Int8(i64::MAX)]))
        .expect_err("int8 overflow");
    assert!(matches!(err, PlumeError::Conversion(_)), "{err:?}");

    let mixed = define(
        &rt,
        "mixed",
        &["v int8"],
        "text",
        "return tostring(-v) .. ':' .. (v * 2 - 1) .. ':' .. tostring(v > 3) .. ':' .. v / 4",
    );
    assert_eq!(
        call_value(&mut rt, mixed, vec![Datum::Int8(5)]),
        Datum::text("-5:9:true:1.25")
    );
    let err = rt
        .call(CallRequest::new(mixed, vec![Datum::Int8(i64::MIN)]))
        .expect_err("negating the minimum");
    assert!(matches!(err, PlumeError::Conversion(_)), "{err:?}");
}

#[test]
fn composite_results_must_match_the_row_type() {
    let mut rt = runtime("composite");
    rt.host_mut()
        .define_composite("pair_t", &[("a", "int4"), ("b", "text")])
        .expect("define composite");
    let partial = define(&rt, "partial", &[], "pair_t", "return { a = 1 }");
    match call_value(&mut rt, partial, Vec::new()) {
        Datum::Row(row) => assert_eq!(row.values, [Datum::Int4(1), Datum::Null]),
        other => panic!("expected a row, got {other:?}"),
    }

    let extra = define(&rt, "extra", &[], "pair_t", "return { a = 1, c = 2 }");
    let err = rt.call(CallRequest::new(extra, Vec::new())).expect_err("unknown field");
    assert!(matches!(err, PlumeError::FieldMismatch(_)), "{err:?}");

    let echo = define(&rt, "echo_b", &["p pair_t"], "text", "return p.b .. ':' .. p.a");
    let arg = Datum::Row(plume_core::RowDatum {
        type_id: rt.host().type_by_name("pair_t").expect("composite type id"),
        values: vec![Datum::Int4(7), Datum::text("seven")],
    });
    assert_eq!(call_value(&mut rt, echo, vec![arg]), Datum::text("seven:7"));
}

#[test]
fn record_results_need_a_descriptor() {
    let mut rt = runtime("record");
    let rec = define(&rt, "rec", &[], "record", "return { x = 1 }");
    let err = rt.call(CallRequest::new(rec, Vec::new())).expect_err("no descriptor");
    assert!(matches!(err, PlumeError::TypeResolution { .. }), "{err:?}");

    let row = plume_core::types::RowDescriptor::new(
        types::RECORD,
        vec![plume_core::types::Attribute::new("x", types::INT4)],
    );
    let outcome = rt
        .call(CallRequest::new(rec, Vec::new()).with_result_descriptor(row))
        .expect("call with descriptor");
    match outcome {
        CallOutcome::Value(Datum::Row(row)) => assert_eq!(row.values, [Datum::Int4(1)]),
        other => panic!("expected a row, got {other:?}"),
    }
}

#[test]
fn polymorphic_arguments_resolve_at_the_call_site() {
    let mut rt = runtime("poly");
    let first = define(&rt, "first_of", &["xs anyarray"], "anyelement", "return xs[1]");
    let outcome = rt
        .call(
            CallRequest::new(
                first,
                vec![Datum::Array(plume_core::ArrayDatum::from_values(
                    types::INT4,
                    vec![Datum::Int4(5), Datum::Int4(6)],
                ))],
            )
            .with_arg_types(vec![types::INT4_ARRAY]),
        )
        .expect("polymorphic call");
    assert_eq!(outcome, CallOutcome::Value(Datum::Int4(5)));

    let err = rt
        .call(CallRequest::new(first, vec![Datum::Null]))
        .expect_err("unresolved polymorphic type");
    assert!(matches!(err, PlumeError::TypeResolution { .. }), "{err:?}");
}

#[test]
fn set_returning_routines_collect_published_and_returned_rows() {
    let mut rt = runtime("srf");
    let def = RoutineDefinition::function(
        "series",
        &["n int4"],
        "int4",
        "for i = 1, n do plume.publishRow(i) end\nreturn { 100 }",
    )
    .expect("definition")
    .returning_set();
    let series = rt.host_mut().create_routine(&def).expect("create series");
    let rows = rt
        .call(CallRequest::new(series, vec![Datum::Int4(3)]))
        .expect("call series")
        .into_rows()
        .expect("rows outcome");
    assert_eq!(
        rows,
        [Datum::Int4(1), Datum::Int4(2), Datum::Int4(3), Datum::Int4(100)]
    );

    let misplaced = define(&rt, "misplaced", &[], "int4", "plume.publishRow(1)\nreturn 1");
    let err = rt
        .call(CallRequest::new(misplaced, Vec::new()))
        .expect_err("publishRow outside a set");
    assert!(err.to_string().contains("cannot accept a set"), "{err}");
}

#[test]
fn published_composite_rows_follow_the_row_type() {
    let mut rt = runtime("srf_composite");
    rt.host_mut()
        .define_composite("pair_t", &[("a", "int4"), ("b", "text")])
        .expect("define composite");
    let pair_type = rt.host().type_by_name("pair_t").expect("composite type id");
    let def = RoutineDefinition::function(
        "pairs",
        &[],
        "pair_t",
        "plume.publishRow({ a = 1 })\nplume.publishRow({ a = 2, b = 'two' })",
    )
    .expect("definition")
    .returning_set();
    let pairs = rt.host_mut().create_routine(&def).expect("create pairs");
    let rows = rt
        .call(CallRequest::new(pairs, Vec::new()))
        .expect("call pairs")
        .into_rows()
        .expect("rows outcome");
    let row = |values: Vec<Datum>| {
        Datum::Row(plume_core::RowDatum {
            type_id: pair_type,
            values,
        })
    };
    assert_eq!(
        rows,
        [
            row(vec![Datum::Int4(1), Datum::Null]),
            row(vec![Datum::Int4(2), Datum::text("two")]),
        ]
    );

    let def = RoutineDefinition::function(
        "stray_pairs",
        &[],
        "pair_t",
        "plume.publishRow({ a = 1, c = 2 })",
    )
    .expect("definition")
    .returning_set();
    let stray = rt.host_mut().create_routine(&def).expect("create stray_pairs");
    let err = rt
        .call(CallRequest::new(stray, Vec::new()))
        .expect_err("unknown column in a published row");
    assert!(matches!(err, PlumeError::FieldMismatch(_)), "{err:?}");
}

#[test]
fn contexts_are_cached_per_role_and_routines_per_context() {
    let mut rt = runtime("cache");
    let bump = define(
        &rt,
        "bump",
        &[],
        "int4",
        "counter = (counter or 0) + 1\nreturn counter",
    );
    assert_eq!(call_value(&mut rt, bump, Vec::new()), Datum::Int4(1));
    assert_eq!(call_value(&mut rt, bump, Vec::new()), Datum::Int4(2));

    rt.host_mut().set_role(20);
    assert_eq!(call_value(&mut rt, bump, Vec::new()), Datum::Int4(1));

    let stats = rt.stats();
    assert_eq!(stats.contexts_created, 2);
    assert_eq!(stats.compilations, 2);
    assert_eq!(stats.cache_hits, 1);

    let info = rt.info();
    let roles: Vec<u32> = info.contexts.iter().map(|context| context.role).collect();
    assert_eq!(roles, [10, 20]);

    rt.reset();
    assert!(rt.info().contexts.is_empty());
    assert_eq!(call_value(&mut rt, bump, Vec::new()), Datum::Int4(1));
}

#[test]
fn redefined_routines_are_recompiled() {
    let mut rt = runtime("redefine");
    let answer = define(&rt, "answer", &[], "int4", "return 1");
    assert_eq!(call_value(&mut rt, answer, Vec::new()), Datum::Int4(1));

    let same = define(&rt, "answer", &[], "int4", "return 2");
    assert_eq!(same, answer);
    assert_eq!(call_value(&mut rt, answer, Vec::new()), Datum::Int4(2));
    assert_eq!(rt.stats().compilations, 2);
}

#[test]
fn start_proc_runs_once_per_new_context() {
    let config = RuntimeConfig {
        start_proc: Some("boot".to_string()),
        ..RuntimeConfig::default()
    };
    let mut rt = runtime_with("start_proc", config);
    define(&rt, "boot", &[], "void", "boots = (boots or 0) + 1");
    let probe = define(&rt, "probe", &[], "int4", "return boots");
    assert_eq!(call_value(&mut rt, probe, Vec::new()), Datum::Int4(1));
    assert_eq!(call_value(&mut rt, probe, Vec::new()), Datum::Int4(1));
}

#[test]
fn failing_start_proc_does_not_block_calls() {
    let config = RuntimeConfig {
        start_proc: Some("missing_boot".to_string()),
        ..RuntimeConfig::default()
    };
    let mut rt = runtime_with("start_proc_missing", config);
    let one = define(&rt, "one", &[], "int4", "return 1");
    assert_eq!(call_value(&mut rt, one, Vec::new()), Datum::Int4(1));
}

#[test]
fn validator_reports_compile_errors_with_lines() {
    let rt = runtime("validate");
    let good = define(&rt, "good", &["x int4"], "int4", "local y = x * 2\nreturn y");
    rt.validate(good).expect("valid routine");

    let bad = define(&rt, "bad", &[], "int4", "local a = 1\nlocal b = = 2\nreturn a");
    match rt.validate(bad) {
        Err(PlumeError::Compile { routine, line, .. }) => {
            assert_eq!(routine, "bad");
            assert_eq!(line, Some(2));
        }
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn runtime_errors_carry_message_and_stack() {
    let mut rt = runtime("errors");
    let boom = define(&rt, "boom", &[], "int4", "error(\"boom\")");
    match rt.call(CallRequest::new(boom, Vec::new())) {
        Err(PlumeError::Execution { message, .. }) => assert!(message.contains("boom"), "{message}"),
        other => panic!("expected an execution error, got {other:?}"),
    }
    // the context survives a failed call
    let ok = define(&rt, "ok", &[], "int4", "return 3");
    assert_eq!(call_value(&mut rt, ok, Vec::new()), Datum::Int4(3));
}

#[test]
fn long_running_calls_hit_the_timeout() {
    let config = RuntimeConfig {
        execution_timeout_secs: 1,
        ..RuntimeConfig::default()
    };
    let mut rt = runtime_with("timeout", config);
    let spin = define(&rt, "spin", &[], "int4", "while true do end");
    let err = rt.call(CallRequest::new(spin, Vec::new())).expect_err("timeout");
    assert_eq!(err, PlumeError::Timeout);

    let ok = define(&rt, "after_timeout", &[], "int4", "return 5");
    assert_eq!(call_value(&mut rt, ok, Vec::new()), Datum::Int4(5));
}

#[test]
fn pcall_cannot_swallow_a_timeout() {
    let config = RuntimeConfig {
        execution_timeout_secs: 1,
        ..RuntimeConfig::default()
    };
    let mut rt = runtime_with("timeout_pcall", config);
    let caught = define(
        &rt,
        "caught_spin",
        &[],
        "int4",
        "pcall(function() while true do end end)\nreturn 7",
    );
    let err = rt.call(CallRequest::new(caught, Vec::new())).expect_err("timeout despite pcall");
    assert_eq!(err, PlumeError::Timeout);

    let retry = define(
        &rt,
        "retry_spin",
        &[],
        "int4",
        "for _ = 1, 3 do pcall(function() while true do end end) end\nlocal n = 0\nwhile true do n = n + 1 end",
    );
    let err = rt.call(CallRequest::new(retry, Vec::new())).expect_err("timeout stays raised");
    assert_eq!(err, PlumeError::Timeout);

    let ok = define(&rt, "after_caught", &[], "int4", "return 5");
    assert_eq!(call_value(&mut rt, ok, Vec::new()), Datum::Int4(5));
}

#[test]
fn raised_interrupt_cancels_the_running_call() {
    let mut rt = runtime("interrupt");
    let spin = define(&rt, "spin", &[], "int4", "while true do end");
    let handle = rt.interrupt_handle();
    let raiser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        handle.raise();
    });
    let err = rt.call(CallRequest::new(spin, Vec::new())).expect_err("interrupted");
    raiser.join().expect("join interrupt thread");
    assert_eq!(err, PlumeError::Interrupted);
}

#[test]
fn runaway_allocation_is_reported_as_out_of_memory() {
    let mut rt = runtime("memory");
    let hog = define(
        &rt,
        "hog",
        &[],
        "int4",
        "local t = {}\nlocal chunk = string.rep('x', 1024 * 1024)\nfor i = 1, 1000 do t[i] = chunk .. i end\nreturn #t",
    );
    let err = rt.call(CallRequest::new(hog, Vec::new())).expect_err("memory limit");
    assert_eq!(err, PlumeError::OutOfMemory);
}

#[test]
fn procedures_return_nothing() {
    let mut rt = runtime("procedure");
    let def = RoutineDefinition::function("noop", &[], "void", "local x = 1")
        .expect("definition")
        .with_kind(RoutineKind::Procedure);
    let noop = rt.host_mut().create_routine(&def).expect("create procedure");
    assert_eq!(
        rt.call(CallRequest::new(noop, Vec::new())).expect("call procedure"),
        CallOutcome::Void
    );
}

#[test]
fn helpers_encode_json_and_build_dates() {
    let mut rt = runtime("helpers");
    let encode = define(
        &rt,
        "encode",
        &[],
        "text",
        "return plume.json.encode({ b = 1, a = { 1, 2 } })",
    );
    assert_eq!(
        call_value(&mut rt, encode, Vec::new()),
        Datum::text(r#"{"a":[1,2],"b":1}"#)
    );

    let decode = define(
        &rt,
        "decode",
        &["doc text"],
        "int4",
        "local v = plume.json.decode(doc)\nreturn v.items[2] + v.n",
    );
    assert_eq!(
        call_value(&mut rt, decode, vec![Datum::text(r#"{"items":[4,5],"n":10}"#)]),
        Datum::Int4(15)
    );

    let day = define(
        &rt,
        "epoch_day",
        &[],
        "date",
        "return plume.date(86400000)",
    );
    assert_eq!(
        call_value(&mut rt, day, Vec::new()),
        Datum::Date(plume_core::datum::unix_millis_to_date(86_400_000.0).expect("valid day"))
    );

    let far = define(
        &rt,
        "far_future",
        &[],
        "text",
        "local d = plume.date(8.5e15)
plume.log(NOTICE, d)
return tostring(d) .. '|' .. d:iso()",
    );
    assert_eq!(
        call_value(&mut rt, far, Vec::new()),
        Datum::text("Invalid Date|Invalid Date")
    );
}
