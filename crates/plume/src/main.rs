use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use plume_core::host::{Catalog, Executor, QueryResult, RoutineKind};
use plume_core::marshal::{Marshaler, json_to_script, script_to_json};
use plume_core::types::{self, TypeCategory};
use plume_core::{
    CallOutcome, CallRequest, Datum, Oid, PlumeError, RoutineDefinition, Runtime, RowDatum,
    RuntimeConfig, ScriptValue, SqliteHost,
};
use plume_rt::bytes::{decode_bytea_hex, encode_bytea_hex};
use plume_rt::error::error_json;
use plume_rt::json as rt_json;
use serde::Deserialize;

const USAGE: &str = r#"usage: plume <command> [options] [args]

commands:
  define <file.toml>     Create or replace the routines and modules listed in a file
  call <name> [args...]  Call a routine; arguments are parsed by declared type
  do <source>            Run an anonymous code block
  check <name>           Compile a routine without running it
  sql <query>            Run a query against the database
  info                   Print runtime and build information as JSON

options:
  --db <path>            Database file (defaults to [database] path, then plume.db)
  --config <path>        Config file (defaults to ./plume.toml when present)
  --role <oid>           Role to run as (defaults to the superuser role)
  --json-errors          Print errors as JSON reports
"#;

const DEFAULT_CONFIG_FILE: &str = "plume.toml";
const DEFAULT_DB_FILE: &str = "plume.db";
const BUILD_TARGET: &str = env!("PLUME_BUILD_TARGET");
const BUILD_PROFILE: &str = env!("PLUME_BUILD_PROFILE");
const BUILD_RUSTC_VERSION: &str = env!("PLUME_BUILD_RUSTC_VERSION");

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Command {
    Define,
    Call,
    Do,
    Check,
    Sql,
    Info,
}

impl Command {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "define" => Some(Self::Define),
            "call" => Some(Self::Call),
            "do" => Some(Self::Do),
            "check" => Some(Self::Check),
            "sql" => Some(Self::Sql),
            "info" => Some(Self::Info),
            _ => None,
        }
    }

    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Self::Define | Self::Do | Self::Check | Self::Sql => (1, Some(1)),
            Self::Call => (1, None),
            Self::Info => (0, Some(0)),
        }
    }
}

#[derive(Default)]
struct CommonArgs {
    db: Option<PathBuf>,
    config: Option<PathBuf>,
    role: Option<Oid>,
    json_errors: bool,
    positional: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CliConfig {
    #[serde(default)]
    database: DatabaseConfig,
}

#[derive(Debug, Default, Deserialize)]
struct DatabaseConfig {
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    routine: Vec<RoutineSpec>,
    #[serde(default)]
    module: Vec<ModuleSpec>,
}

#[derive(Debug, Deserialize)]
struct RoutineSpec {
    name: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_returns")]
    returns: String,
    #[serde(default)]
    set: bool,
    kind: Option<String>,
    source: String,
    #[serde(default)]
    grant: Vec<Oid>,
}

#[derive(Debug, Deserialize)]
struct ModuleSpec {
    path: String,
    source: String,
}

fn default_returns() -> String {
    "void".to_string()
}

/// A failure with the stable code used in `--json-errors` reports.
struct CliError {
    code: &'static str,
    message: String,
    detail: Option<String>,
}

impl CliError {
    fn usage(message: impl Into<String>) -> Self {
        Self {
            code: "usage_error",
            message: message.into(),
            detail: None,
        }
    }
}

impl From<PlumeError> for CliError {
    fn from(err: PlumeError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            detail: err.detail().map(str::to_string),
        }
    }
}

impl From<plume_core::HostError> for CliError {
    fn from(err: plume_core::HostError) -> Self {
        PlumeError::Host(err).into()
    }
}

fn main() {
    plume_rt::log::init();
    plume_core::interrupt::install_sigint_handler();
    let args: Vec<String> = env::args().skip(1).collect();
    let code = run(args);
    std::process::exit(code);
}

fn run(args: Vec<String>) -> i32 {
    let Some((cmd, rest)) = args.split_first() else {
        eprintln!("{USAGE}");
        return 1;
    };
    let Some(command) = Command::parse(cmd) else {
        emit_cli_error(&format!("unknown command: {cmd}"));
        eprintln!("{USAGE}");
        return 1;
    };
    let common = match parse_common_args(rest) {
        Ok(common) => common,
        Err(err) => {
            emit_cli_error(&err);
            eprintln!("{USAGE}");
            return 1;
        }
    };
    let (min, max) = command.arity();
    let count = common.positional.len();
    if count < min || max.is_some_and(|max| count > max) {
        emit_cli_error(&format!("{cmd} expects {min} argument(s), got {count}"));
        eprintln!("{USAGE}");
        return 1;
    }

    match execute(command, &common) {
        Ok(()) => 0,
        Err(err) => {
            if common.json_errors {
                eprintln!(
                    "{}",
                    error_json(err.code, &err.message, err.detail.as_deref())
                );
            } else {
                emit_cli_error(&err.message);
                if let Some(detail) = &err.detail {
                    eprintln!("{detail}");
                }
            }
            1
        }
    }
}

fn emit_cli_error(message: &str) {
    eprintln!("error: {message}");
}

fn parse_common_args(args: &[String]) -> Result<CommonArgs, String> {
    let mut out = CommonArgs::default();
    let mut idx = 0;
    while idx < args.len() {
        let arg = &args[idx];
        if arg == "--" {
            out.positional.extend(args[idx + 1..].iter().cloned());
            break;
        }
        if arg == "--db" {
            idx += 1;
            let Some(path) = args.get(idx) else {
                return Err("--db expects a path".to_string());
            };
            out.db = Some(PathBuf::from(path));
            idx += 1;
            continue;
        }
        if arg == "--config" {
            idx += 1;
            let Some(path) = args.get(idx) else {
                return Err("--config expects a path".to_string());
            };
            out.config = Some(PathBuf::from(path));
            idx += 1;
            continue;
        }
        if arg == "--role" {
            idx += 1;
            let Some(raw) = args.get(idx) else {
                return Err("--role expects a role oid".to_string());
            };
            let role = raw
                .parse::<Oid>()
                .map_err(|_| format!("invalid --role value: {raw}"))?;
            out.role = Some(role);
            idx += 1;
            continue;
        }
        if arg == "--json-errors" {
            out.json_errors = true;
            idx += 1;
            continue;
        }
        if arg.starts_with("--") {
            return Err(format!("unknown option: {arg}"));
        }
        out.positional.push(arg.clone());
        idx += 1;
    }
    Ok(out)
}

fn load_config(common: &CommonArgs) -> Result<(RuntimeConfig, CliConfig), CliError> {
    let path = match &common.config {
        Some(path) => Some(path.clone()),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        }
    };
    let Some(path) = path else {
        let runtime = RuntimeConfig::default().apply_env()?;
        return Ok((runtime, CliConfig::default()));
    };
    let text = fs::read_to_string(&path).map_err(|err| CliError {
        code: "config_error",
        message: format!("failed to read {}: {err}", path.display()),
        detail: None,
    })?;
    let runtime = RuntimeConfig::from_toml_str(&text)?.apply_env()?;
    let cli: CliConfig = toml::from_str(&text).map_err(|err| CliError {
        code: "config_error",
        message: format!("invalid config {}: {err}", path.display()),
        detail: None,
    })?;
    log::debug!("loaded config {}", path.display());
    Ok((runtime, cli))
}

fn open_runtime(common: &CommonArgs) -> Result<Runtime<SqliteHost>, CliError> {
    let (config, cli) = load_config(common)?;
    let db = common
        .db
        .clone()
        .or(cli.database.path)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE));
    let mut host = SqliteHost::open(&db)?;
    if let Some(role) = common.role {
        host.set_role(role);
    }
    Ok(Runtime::new(host, config)?)
}

fn execute(command: Command, common: &CommonArgs) -> Result<(), CliError> {
    let mut runtime = open_runtime(common)?;
    let result = match command {
        Command::Define => run_define(&mut runtime, Path::new(&common.positional[0])),
        Command::Call => run_call(&mut runtime, &common.positional[0], &common.positional[1..]),
        Command::Do => runtime
            .inline(&common.positional[0], true)
            .map_err(CliError::from),
        Command::Check => run_check(&runtime, &common.positional[0]),
        Command::Sql => run_sql(&runtime, &common.positional[0]),
        Command::Info => run_info(&runtime),
    };
    flush_notices(&runtime);
    match result {
        Ok(()) => {
            runtime.host_mut().commit()?;
            Ok(())
        }
        Err(err) => {
            if let Err(rollback) = runtime.host_mut().rollback() {
                log::warn!("rollback after failure failed: {rollback}");
            }
            Err(err)
        }
    }
}

fn flush_notices(runtime: &Runtime<SqliteHost>) {
    for notice in runtime.host_mut().take_notices() {
        eprintln!("{}: {}", notice.level.name(), notice.message);
    }
}

fn run_define(runtime: &mut Runtime<SqliteHost>, path: &Path) -> Result<(), CliError> {
    let text = fs::read_to_string(path).map_err(|err| {
        CliError::usage(format!("failed to read {}: {err}", path.display()))
    })?;
    let file: DefinitionFile = toml::from_str(&text).map_err(|err| CliError {
        code: "definition_error",
        message: format!("invalid definition file {}: {err}", path.display()),
        detail: None,
    })?;
    for module in &file.module {
        runtime
            .host_mut()
            .define_module(&module.path, &module.source)?;
        println!("module {}", module.path);
    }
    for spec in &file.routine {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        let mut def = RoutineDefinition::function(&spec.name, &args, &spec.returns, &spec.source)?;
        if spec.set {
            def = def.returning_set();
        }
        if let Some(kind) = &spec.kind {
            let kind = RoutineKind::parse(kind).ok_or_else(|| {
                CliError::usage(format!("unknown routine kind {kind} for {}", spec.name))
            })?;
            def = def.with_kind(kind);
        }
        let oid = runtime.host_mut().create_routine(&def)?;
        for role in &spec.grant {
            runtime.host_mut().grant_execute(oid, *role)?;
        }
        runtime.validate(oid)?;
        println!("routine {} ({oid})", spec.name);
    }
    Ok(())
}

fn run_check(runtime: &Runtime<SqliteHost>, name: &str) -> Result<(), CliError> {
    let oid = runtime.host().lookup_routine(name)?;
    runtime.validate(oid)?;
    println!("ok");
    Ok(())
}

fn run_call(
    runtime: &mut Runtime<SqliteHost>,
    name: &str,
    raw_args: &[String],
) -> Result<(), CliError> {
    let (oid, arg_types, return_type) = {
        let host = runtime.host();
        let oid = host.lookup_routine(name)?;
        let meta = host.routine(oid)?;
        let arg_types: Vec<Oid> = meta
            .input_args()
            .into_iter()
            .map(|(_, type_id)| call_site_type(type_id))
            .collect();
        (oid, arg_types, call_site_type(meta.return_type))
    };
    if raw_args.len() != arg_types.len() {
        return Err(CliError::usage(format!(
            "{name} expects {} arguments but {} were given",
            arg_types.len(),
            raw_args.len()
        )));
    }
    let args = {
        let host = runtime.host();
        raw_args
            .iter()
            .zip(&arg_types)
            .map(|(raw, type_id)| parse_arg(&*host, raw, *type_id))
            .collect::<Result<Vec<_>, CliError>>()?
    };
    let request = CallRequest::new(oid, args)
        .with_arg_types(arg_types)
        .with_return_type(return_type)
        .nonatomic();
    match runtime.call(request)? {
        CallOutcome::Value(value) => println!("{}", render(runtime, &value, return_type)?),
        CallOutcome::Rows(rows) => {
            for row in &rows {
                println!("{}", render(runtime, row, return_type)?);
            }
        }
        CallOutcome::Trigger(action) => println!("{action:?}"),
        CallOutcome::Void => {}
    }
    Ok(())
}

/// Command-line values are text, so polymorphic slots bind to text or text[].
fn call_site_type(declared: Oid) -> Oid {
    match declared {
        types::ANYARRAY => types::TEXT_ARRAY,
        other if types::is_polymorphic(other) => types::TEXT,
        other => other,
    }
}

/// Reads one command-line argument as a value of `type_id`; `null` is SQL NULL.
fn parse_arg(host: &SqliteHost, raw: &str, type_id: Oid) -> Result<Datum, CliError> {
    if raw == "null" {
        return Ok(Datum::Null);
    }
    let info = host.type_info(type_id)?;
    let value = match info.category {
        TypeCategory::Array | TypeCategory::Composite => {
            let json = rt_json::parse(raw).map_err(CliError::usage)?;
            json_to_script(&json)
        }
        _ if type_id == types::BOOL => match raw.to_ascii_lowercase().as_str() {
            "t" | "true" | "1" | "yes" | "on" => ScriptValue::Bool(true),
            "f" | "false" | "0" | "no" | "off" => ScriptValue::Bool(false),
            _ => return Err(CliError::usage(format!("invalid boolean argument: {raw}"))),
        },
        _ if type_id == types::BYTEA && raw.starts_with("\\x") => {
            ScriptValue::Bytes(decode_bytea_hex(raw).map_err(CliError::usage)?)
        }
        _ if type_id == types::BYTEA => ScriptValue::Bytes(raw.as_bytes().to_vec()),
        _ if type_id == types::JSON || type_id == types::JSONB => {
            let json = rt_json::parse(raw).map_err(CliError::usage)?;
            json_to_script(&json)
        }
        _ => ScriptValue::String(raw.to_string()),
    };
    Ok(Marshaler::new(host).from_script(&value, type_id)?)
}

fn render(runtime: &Runtime<SqliteHost>, value: &Datum, type_id: Oid) -> Result<String, CliError> {
    let type_id = match value {
        Datum::Row(row) => row.type_id,
        _ => type_id,
    };
    let host = runtime.host();
    let marshaler = Marshaler::new(&*host);
    let script = match value {
        Datum::Null => return Ok("NULL".to_string()),
        Datum::Row(row) if row.type_id == types::RECORD => record_to_script(&marshaler, row)?,
        _ => marshaler.to_script(value, type_id)?,
    };
    Ok(match script {
        ScriptValue::String(text) => text,
        ScriptValue::BigInt(v) => v.to_string(),
        ScriptValue::Bytes(bytes) => encode_bytea_hex(&bytes),
        other => rt_json::encode(&script_to_json(&other)),
    })
}

/// Anonymous records carry no column names, so they print as a JSON array.
fn record_to_script(
    marshaler: &Marshaler<'_, SqliteHost>,
    row: &RowDatum,
) -> Result<ScriptValue, CliError> {
    let items = row
        .values
        .iter()
        .map(|value| match value {
            Datum::Row(inner) if inner.type_id == types::RECORD => record_to_script(marshaler, inner),
            Datum::Array(array) => Ok(marshaler.to_script(value, array.element_type)?),
            other => Ok(marshaler.to_script(other, types::TEXT)?),
        })
        .collect::<Result<Vec<_>, CliError>>()?;
    Ok(ScriptValue::Array(items))
}

fn run_sql(runtime: &Runtime<SqliteHost>, query: &str) -> Result<(), CliError> {
    let result = runtime.host_mut().execute(query, &[])?;
    match result {
        QueryResult::Affected(count) => println!("{count} row(s) affected"),
        QueryResult::Rows(set) => {
            let header: Vec<&str> = set.columns.iter().map(|c| c.name.as_str()).collect();
            println!("{}", header.join(" | "));
            for row in &set.rows {
                let cells = row
                    .iter()
                    .zip(&set.columns)
                    .map(|(value, column)| render(runtime, value, column.type_id))
                    .collect::<Result<Vec<_>, _>>()?;
                println!("{}", cells.join(" | "));
            }
        }
    }
    Ok(())
}

fn run_info(runtime: &Runtime<SqliteHost>) -> Result<(), CliError> {
    let info = serde_json::json!({
        "runtime": runtime.info(),
        "stats": runtime.stats(),
        "build": {
            "target": BUILD_TARGET,
            "profile": BUILD_PROFILE,
            "rustc": BUILD_RUSTC_VERSION,
        },
    });
    let text = serde_json::to_string_pretty(&info).map_err(|err| CliError {
        code: "internal_error",
        message: err.to_string(),
        detail: None,
    })?;
    println!("{text}");
    Ok(())
}
