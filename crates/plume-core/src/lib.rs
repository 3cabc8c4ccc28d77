pub mod api;
pub mod bridge;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod datum;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod host;
pub mod interrupt;
pub mod marshal;
pub mod runtime;
pub mod types;
pub mod value;
pub mod window;

pub use config::RuntimeConfig;
pub use datum::{ArrayDatum, Datum, Oid, RowDatum};
pub use dispatch::{CallKind, CallOutcome, CallRequest, TriggerAction};
pub use error::{HostError, PlumeError, Result};
pub use host::sqlite::SqliteHost;
pub use host::window::WindowPartition;
pub use host::{RoutineDefinition, RoutineKind, TriggerData};
pub use interrupt::InterruptHandle;
pub use runtime::{Runtime, RuntimeInfo, RuntimeStats};
pub use value::ScriptValue;
