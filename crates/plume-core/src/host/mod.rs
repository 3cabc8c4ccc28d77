//! Interfaces to the embedding database and the SQLite reference host.

pub mod sqlite;
pub mod window;

use crate::datum::{Datum, Oid, RowDatum};
use crate::error::HostError;
use crate::types::{self, Attribute, RowDescriptor, TypeInfo};

pub type HostResult<T> = std::result::Result<T, HostError>;
pub type PlanId = u64;
pub type SubtransactionId = u64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArgMode {
    In,
    Out,
    InOut,
    Variadic,
    Table,
}

impl ArgMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "in" | "i" => Some(Self::In),
            "out" | "o" => Some(Self::Out),
            "inout" | "b" => Some(Self::InOut),
            "variadic" | "v" => Some(Self::Variadic),
            "table" | "t" => Some(Self::Table),
            _ => None,
        }
    }

    pub fn code(self) -> char {
        match self {
            Self::In => 'i',
            Self::Out => 'o',
            Self::InOut => 'b',
            Self::Variadic => 'v',
            Self::Table => 't',
        }
    }

    pub fn is_input(self) -> bool {
        matches!(self, Self::In | Self::InOut | Self::Variadic)
    }

    pub fn is_output(self) -> bool {
        matches!(self, Self::Out | Self::InOut | Self::Table)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RoutineKind {
    Function,
    Procedure,
    Window,
}

impl RoutineKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "function" => Some(Self::Function),
            "procedure" => Some(Self::Procedure),
            "window" => Some(Self::Window),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Procedure => "procedure",
            Self::Window => "window",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoutineMetadata {
    pub oid: Oid,
    pub name: String,
    pub source: String,
    pub language: String,
    pub kind: RoutineKind,
    pub returns_set: bool,
    pub arg_types: Vec<Oid>,
    pub arg_modes: Vec<ArgMode>,
    pub arg_names: Vec<Option<String>>,
    pub return_type: Oid,
    pub owner: Oid,
}

impl RoutineMetadata {
    pub fn is_trigger(&self) -> bool {
        self.return_type == types::TRIGGER
    }

    fn mode(&self, idx: usize) -> ArgMode {
        self.arg_modes.get(idx).copied().unwrap_or(ArgMode::In)
    }

    /// Parameters the script receives, in declaration order.
    pub fn input_args(&self) -> Vec<(Option<&str>, Oid)> {
        self.arg_types
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.mode(*idx).is_input())
            .map(|(idx, type_id)| {
                let name = self.arg_names.get(idx).and_then(|name| name.as_deref());
                (name, *type_id)
            })
            .collect()
    }

    /// Row layout implied by OUT/INOUT/TABLE parameters of a `record` routine.
    pub fn output_descriptor(&self) -> Option<RowDescriptor> {
        if self.return_type != types::RECORD {
            return None;
        }
        let attributes: Vec<Attribute> = self
            .arg_types
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.mode(*idx).is_output())
            .map(|(idx, type_id)| {
                let name = self
                    .arg_names
                    .get(idx)
                    .and_then(|name| name.clone())
                    .unwrap_or_else(|| format!("column{}", idx + 1));
                Attribute::new(name, *type_id)
            })
            .collect();
        if attributes.is_empty() {
            None
        } else {
            Some(RowDescriptor::new(types::RECORD, attributes))
        }
    }

    /// `name(type, type)` as shown in diagnostics.
    pub fn signature(&self) -> String {
        let args: Vec<String> = self
            .input_args()
            .iter()
            .map(|(_, type_id)| {
                types::builtin_type(*type_id)
                    .map(|info| info.name)
                    .unwrap_or_else(|| type_id.to_string())
            })
            .collect();
        format!("{}({})", self.name, args.join(", "))
    }
}

/// One parameter of a routine definition, written `[mode] [name] type`.
#[derive(Clone, Debug, PartialEq)]
pub struct ArgSpec {
    pub mode: ArgMode,
    pub name: Option<String>,
    pub type_name: String,
}

impl ArgSpec {
    pub fn parse(raw: &str) -> HostResult<Self> {
        let mut words: Vec<&str> = raw.split_whitespace().collect();
        if words.is_empty() {
            return Err(HostError::new("empty argument declaration"));
        }
        let mode = match ArgMode::parse(words[0]) {
            Some(mode) if words.len() > 1 && words[0].len() > 1 => {
                words.remove(0);
                mode
            }
            _ => ArgMode::In,
        };
        let (name, type_name) = if words.len() == 1 {
            (None, words[0].to_string())
        } else {
            let mut type_name = words[1..].join(" ");
            // `double precision` and friends without an argument name
            if types::builtin_type_by_name(&format!("{} {}", words[0], type_name)).is_some() {
                type_name = format!("{} {}", words[0], type_name);
                return Ok(Self {
                    mode,
                    name: None,
                    type_name,
                });
            }
            (Some(words[0].to_string()), type_name)
        };
        Ok(Self {
            mode,
            name,
            type_name,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoutineDefinition {
    pub name: String,
    pub args: Vec<ArgSpec>,
    pub returns: String,
    pub returns_set: bool,
    pub kind: RoutineKind,
    pub source: String,
}

impl RoutineDefinition {
    pub fn function(name: &str, args: &[&str], returns: &str, source: &str) -> HostResult<Self> {
        let args = args
            .iter()
            .map(|raw| ArgSpec::parse(raw))
            .collect::<HostResult<Vec<_>>>()?;
        Ok(Self {
            name: name.to_string(),
            args,
            returns: returns.to_string(),
            returns_set: false,
            kind: RoutineKind::Function,
            source: source.to_string(),
        })
    }

    pub fn returning_set(mut self) -> Self {
        self.returns_set = true;
        self
    }

    pub fn with_kind(mut self, kind: RoutineKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Host message severities, numbered like the server's elevels.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Debug5 = 10,
    Debug4 = 11,
    Debug3 = 12,
    Debug2 = 13,
    Debug1 = 14,
    Log = 15,
    Info = 17,
    Notice = 18,
    Warning = 19,
    Error = 21,
}

impl LogLevel {
    pub const ALL: [LogLevel; 10] = [
        LogLevel::Debug5,
        LogLevel::Debug4,
        LogLevel::Debug3,
        LogLevel::Debug2,
        LogLevel::Debug1,
        LogLevel::Log,
        LogLevel::Info,
        LogLevel::Notice,
        LogLevel::Warning,
        LogLevel::Error,
    ];

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|level| *level as i64 == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Debug5 => "DEBUG5",
            Self::Debug4 => "DEBUG4",
            Self::Debug3 => "DEBUG3",
            Self::Debug2 => "DEBUG2",
            Self::Debug1 => "DEBUG1",
            Self::Log => "LOG",
            Self::Info => "INFO",
            Self::Notice => "NOTICE",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    pub name: String,
    pub type_id: Oid,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Datum>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    Rows(RowSet),
    Affected(u64),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FetchDirection {
    Forward,
    Backward,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TriggerWhen {
    Before,
    After,
    InsteadOf,
}

impl TriggerWhen {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Before => "BEFORE",
            Self::After => "AFTER",
            Self::InsteadOf => "INSTEAD OF",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TriggerLevel {
    Row,
    Statement,
}

impl TriggerLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Row => "ROW",
            Self::Statement => "STATEMENT",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl TriggerEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelationInfo {
    pub oid: Oid,
    pub name: String,
    pub schema: String,
    pub row: RowDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TriggerData {
    pub name: String,
    pub when: TriggerWhen,
    pub level: TriggerLevel,
    pub event: TriggerEvent,
    pub relation: RelationInfo,
    pub new_row: Option<RowDatum>,
    pub old_row: Option<RowDatum>,
    pub args: Vec<String>,
}

impl TriggerData {
    /// The row a BEFORE ROW trigger would write if the routine changed nothing.
    pub fn pending_row(&self) -> Option<&RowDatum> {
        match self.event {
            TriggerEvent::Insert | TriggerEvent::Update => self.new_row.as_ref(),
            TriggerEvent::Delete => self.old_row.as_ref(),
            TriggerEvent::Truncate => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekType {
    Current,
    Head,
    Tail,
}

impl SeekType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Current),
            1 => Some(Self::Head),
            2 => Some(Self::Tail),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WindowArg {
    Value(Datum),
    OutOfRange,
}

/// Scratch slot owned by the host for one window partition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionLocal {
    pub capacity: Option<usize>,
    pub payload: Option<Vec<u8>>,
}

/// Host window machinery positioned on the current row of one partition.
pub trait WindowFrame {
    fn current_position(&self) -> i64;
    fn partition_row_count(&self) -> i64;
    fn set_mark_position(&mut self, pos: i64) -> HostResult<()>;
    fn rows_are_peers(&self, a: i64, b: i64) -> HostResult<bool>;
    fn arg_in_partition(
        &mut self,
        argno: usize,
        relpos: i64,
        seek: SeekType,
        set_mark: bool,
    ) -> HostResult<WindowArg>;
    fn arg_in_frame(
        &mut self,
        argno: usize,
        relpos: i64,
        seek: SeekType,
        set_mark: bool,
    ) -> HostResult<WindowArg>;
    fn arg_current(&self, argno: usize) -> HostResult<Datum>;
    fn partition_local(&mut self) -> &mut PartitionLocal;
}

pub trait Catalog {
    fn current_role(&self) -> Oid;
    fn routine(&self, oid: Oid) -> HostResult<RoutineMetadata>;
    /// Resolves `name` or `name(type, ...)` to a routine id.
    fn lookup_routine(&self, signature: &str) -> HostResult<Oid>;
    fn has_execute_privilege(&self, role: Oid, routine: Oid) -> HostResult<bool>;
    fn type_info(&self, type_id: Oid) -> HostResult<TypeInfo>;
    fn type_by_name(&self, name: &str) -> HostResult<Oid>;
    fn row_descriptor(&self, type_id: Oid) -> HostResult<RowDescriptor>;
    fn module_source(&self, path: &str) -> HostResult<Option<String>>;
}

pub trait Executor {
    fn in_transaction(&self) -> bool;
    /// Parameter types the host infers for `query`; `types::UNKNOWN` where it cannot tell.
    fn describe_params(&mut self, query: &str) -> HostResult<Vec<Oid>>;
    fn execute(&mut self, query: &str, params: &[Datum]) -> HostResult<QueryResult>;
    fn prepare(&mut self, query: &str, param_types: &[Oid]) -> HostResult<PlanId>;
    fn execute_plan(&mut self, plan: PlanId, params: &[Datum]) -> HostResult<QueryResult>;
    fn free_plan(&mut self, plan: PlanId) -> HostResult<()>;
    /// Opens a portal over the plan's result and returns its name.
    fn open_cursor(&mut self, plan: PlanId, params: &[Datum]) -> HostResult<String>;
    fn fetch(&mut self, portal: &str, direction: FetchDirection, count: u64) -> HostResult<RowSet>;
    fn move_cursor(&mut self, portal: &str, direction: FetchDirection, count: u64) -> HostResult<u64>;
    fn close_cursor(&mut self, portal: &str) -> HostResult<()>;
    fn begin_subtransaction(&mut self) -> HostResult<SubtransactionId>;
    fn release_subtransaction(&mut self, id: SubtransactionId) -> HostResult<()>;
    fn rollback_subtransaction(&mut self, id: SubtransactionId) -> HostResult<()>;
    /// Ends the top transaction and starts a new one.
    fn commit(&mut self) -> HostResult<()>;
    fn rollback(&mut self) -> HostResult<()>;
    /// Delivers a script log message; `LogLevel::Error` must come back as an error.
    fn emit_log(&mut self, level: LogLevel, message: &str) -> HostResult<()>;
}

pub trait Host: Catalog + Executor {}

impl<T: Catalog + Executor + ?Sized> Host for T {}
