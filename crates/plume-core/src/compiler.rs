//! Builds Lua functions from routine source.

use std::sync::OnceLock;

use mlua::{Function, Lua};
use regex::Regex;

use crate::engine;
use crate::error::{PlumeError, Result};
use crate::host::RoutineMetadata;

/// Extra parameters every trigger routine receives after its declared ones.
pub const TRIGGER_PARAMS: [&str; 10] = [
    "NEW",
    "OLD",
    "TG_NAME",
    "TG_WHEN",
    "TG_LEVEL",
    "TG_OP",
    "TG_RELID",
    "TG_TABLE_NAME",
    "TG_TABLE_SCHEMA",
    "TG_ARGV",
];

pub const INLINE_BLOCK_NAME: &str = "inline_code_block";

const LUA_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        && !LUA_KEYWORDS.contains(&name)
}

/// Declared names in order; unnamed or unusable names become `_1`, `_2`, ...
pub fn parameter_names(meta: &RoutineMetadata) -> Vec<String> {
    let mut names: Vec<String> = meta
        .input_args()
        .iter()
        .enumerate()
        .map(|(idx, (name, _))| match name {
            Some(name) if is_identifier(name) => name.to_string(),
            _ => format!("_{}", idx + 1),
        })
        .collect();
    if meta.is_trigger() {
        names.extend(TRIGGER_PARAMS.iter().map(|name| name.to_string()));
    }
    names
}

/// Wraps the body so its first line stays line 1 in diagnostics.
pub fn synthesize(params: &[String], source: &str) -> String {
    format!("return function({}) {}\nend", params.join(", "), source)
}

fn chunk_name(name: &str) -> String {
    format!("={name}")
}

pub(crate) fn compile<'lua>(lua: &'lua Lua, meta: &RoutineMetadata) -> Result<Function<'lua>> {
    let chunk = synthesize(&parameter_names(meta), &meta.source);
    let name = chunk_name(&meta.name);
    log::debug!("compiling routine {} ({})", meta.name, meta.oid);
    lua.load(chunk.as_str())
        .set_name(name.as_str())
        .eval::<Function>()
        .map_err(|err| compile_error(&meta.name, err))
}

pub(crate) fn compile_inline<'lua>(lua: &'lua Lua, source: &str) -> Result<Function<'lua>> {
    let chunk = synthesize(&[], source);
    let name = chunk_name(INLINE_BLOCK_NAME);
    lua.load(chunk.as_str())
        .set_name(name.as_str())
        .eval::<Function>()
        .map_err(|err| compile_error(INLINE_BLOCK_NAME, err))
}

/// Compiles in a throwaway state without running or caching anything.
pub fn check(meta: &RoutineMetadata) -> Result<()> {
    let lua = Lua::new();
    let chunk = synthesize(&parameter_names(meta), &meta.source);
    let name = chunk_name(&meta.name);
    lua.load(chunk.as_str())
        .set_name(name.as_str())
        .into_function()
        .map(|_| ())
        .map_err(|err| compile_error(&meta.name, err))
}

fn position_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^:\n]*:(\d+): ").expect("position pattern should compile"))
}

fn compile_error(routine: &str, err: mlua::Error) -> PlumeError {
    let raw = match err {
        mlua::Error::SyntaxError { message, .. } => message,
        other => return engine::convert_error(other),
    };
    let (line, message) = match position_pattern().captures(&raw) {
        Some(caps) => {
            let line = caps.get(1).and_then(|m| m.as_str().parse::<usize>().ok());
            let rest = caps
                .get(0)
                .map(|whole| raw[whole.end()..].to_string())
                .unwrap_or_else(|| raw.clone());
            (line, rest)
        }
        None => (None, raw),
    };
    let message = match line {
        Some(line) => format!("line {line}: {message}"),
        None => message,
    };
    PlumeError::Compile {
        routine: routine.to_string(),
        message,
        line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ArgMode, RoutineKind};
    use crate::types;

    fn meta(source: &str, names: Vec<Option<String>>, return_type: u32) -> RoutineMetadata {
        RoutineMetadata {
            oid: 42,
            name: "demo".to_string(),
            source: source.to_string(),
            language: "plume".to_string(),
            kind: RoutineKind::Function,
            returns_set: false,
            arg_types: names.iter().map(|_| types::INT4).collect(),
            arg_modes: names.iter().map(|_| ArgMode::In).collect(),
            arg_names: names,
            return_type,
            owner: 10,
        }
    }

    #[test]
    fn parameters_fall_back_to_positional_names() {
        let routine = meta(
            "return 1",
            vec![Some("a".into()), None, Some("end".into())],
            types::INT4,
        );
        assert_eq!(parameter_names(&routine), ["a", "_2", "_3"]);
        let trigger = meta("return NEW", Vec::new(), types::TRIGGER);
        assert_eq!(parameter_names(&trigger), TRIGGER_PARAMS);
    }

    #[test]
    fn synthesized_body_keeps_source_lines() {
        let chunk = synthesize(&["a".to_string(), "b".to_string()], "return a + b");
        assert_eq!(chunk, "return function(a, b) return a + b\nend");
    }

    #[test]
    fn syntax_errors_report_source_line() {
        let routine = meta("local x = 1\nreturn x +", vec![], types::INT4);
        let err = check(&routine).expect_err("syntax error");
        match err {
            PlumeError::Compile { routine, line, message } => {
                assert_eq!(routine, "demo");
                assert_eq!(line, Some(3));
                assert!(message.starts_with("line 3: "), "{message}");
            }
            other => panic!("expected compile error, got {other:?}"),
        }
        assert!(check(&meta("return 1", vec![], types::INT4)).is_ok());
    }
}
