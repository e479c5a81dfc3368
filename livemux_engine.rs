//! # Livemux Engine - One Livestatus Endpoint For Many Backends
//! 
//! A multiplexing query front-end for monitoring status data. Livemux keeps a
//! local, periodically refreshed mirror of the tables of any number of upstream
//! Livestatus sources and answers client queries against the merged data set.
//! 
//! ## Architecture Overview
//! 
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                             LIVEMUX ENGINE                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  LISTENER → REQUEST PARSER → PEER MAP → PEERS (TABLE STORES) → RESPONSE      │
//! │                                   ↑            ↑                             │
//! │                          WAIT COORDINATOR   REFRESH TASKS ← UPSTREAM SOURCES │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//! 
//! ## Features
//! 
//! - **Lock-free reads**: table snapshots are swapped atomically on refresh
//! - **Full request language**: filters, stats, group-by, sort, limit, waits
//! - **Correct merges**: averages merged from `(sum, count)` pairs, never from averages
//! - **Isolated peers**: a dead backend only removes its own rows
//! - **Operable**: `GET backends`, structured logging, Prometheus metrics
//! 
//! ## Author
//! 
//! Livemux Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// All external crate imports, organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![allow(unused_variables)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime Imports
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use arc_swap::ArcSwap;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// Data Structures & Buffers
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};
use bytes::{Buf, BytesMut};
use compact_str::{CompactString, ToCompactString};
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, instrument, trace, warn};
use tracing_subscriber::{
    fmt as log_fmt, fmt::writer::BoxMakeWriter, layer::SubscriberExt, EnvFilter,
};

// ----------------------------------------------------------------------------
// Pattern Matching, Sorting, Time
// ----------------------------------------------------------------------------
use chrono::Utc;
use memchr::memchr;
use ordered_float::OrderedFloat;
use regex::{Regex, RegexBuilder};

// ----------------------------------------------------------------------------
// Configuration, CLI, Metrics Export
// ----------------------------------------------------------------------------
use axum::{extract::State, routing::get, Router};
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry as PrometheusRegistry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & CONFIGURATION DEFAULTS
// ============================================================================
// Protocol constants, tuning defaults and limits.
// ============================================================================

/// Engine version from Cargo.toml
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name for identification
pub const ENGINE_NAME: &str = "livemux";

/// Full engine identifier
pub const ENGINE_FULL_NAME: &str = "Livemux Livestatus Multiplexer";

// ----------------------------------------------------------------------------
// Refresh & Network Timing
// ----------------------------------------------------------------------------

/// Default interval between two refresh cycles of a peer (seconds)
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 7;

/// Smallest accepted refresh interval (seconds)
pub const MIN_UPDATE_INTERVAL_SECS: u64 = 1;

/// Default timeout for a full request/response exchange with an upstream (seconds)
pub const DEFAULT_NET_TIMEOUT_SECS: u64 = 30;

/// Default timeout for establishing an upstream connection (seconds)
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default time granted to in-flight queries on shutdown (seconds)
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Wire Protocol
// ----------------------------------------------------------------------------

/// Size of the `fixed16` response header, newline included
pub const RESPONSE_HEADER_SIZE: usize = 16;

/// Default Livestatus TCP listen address
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:6557";

/// Upper bound for a single buffered client request
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// Upper bound for a single upstream response body
pub const MAX_UPSTREAM_RESPONSE_BYTES: usize = 1024 * 1024 * 1024;

/// Read chunk size for client connections
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Successful response
pub const STATUS_OK: u16 = 200;

/// Malformed or invalid request
pub const STATUS_BAD_REQUEST: u16 = 400;

/// Unknown table
pub const STATUS_NOT_FOUND: u16 = 404;

/// Upstream could not be reached while forwarding
pub const STATUS_BAD_GATEWAY: u16 = 502;

/// Wait trigger that fires after every refresh cycle
pub const WAIT_TRIGGER_ALL: &str = "all";

// ----------------------------------------------------------------------------
// Peer Status Codes (as exposed by the `backends` table)
// ----------------------------------------------------------------------------

/// Peer answered its last refresh
pub const PEER_STATUS_UP: u8 = 0;

/// Peer failed its last refresh
pub const PEER_STATUS_DOWN: u8 = 2;

/// Peer has not completed a refresh yet
pub const PEER_STATUS_PENDING: u8 = 4;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM & SCHEMA REGISTRY
// ============================================================================
// The typed value model shared by every component, and the static registry
// describing each table, its columns and how each column gets its value:
// - Stored columns live in the mirrored row
// - Virtual columns are computed from the answering peer
// - Reference columns are looked up in another table's row
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Column Types & Values
// ----------------------------------------------------------------------------

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Int,
    Float,
    /// Unix timestamp in seconds
    Time,
    StringList,
    IntList,
    /// Map of custom variable name to value
    CustomVars,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Int | ColumnType::Float | ColumnType::Time)
    }

    pub fn is_list(&self) -> bool {
        matches!(self, ColumnType::StringList | ColumnType::IntList)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Time => "time",
            ColumnType::StringList => "list",
            ColumnType::IntList => "list",
            ColumnType::CustomVars => "dict",
        }
    }
}

impl Display for ColumnType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    String(CompactString),
    StringList(Vec<CompactString>),
    IntList(Vec<i64>),
    CustomVars(Vec<(CompactString, CompactString)>),
}

impl Value {
    /// The value a missing or null cell of the given type decodes to.
    pub fn default_for(column_type: ColumnType) -> Value {
        match column_type {
            ColumnType::String => Value::String(CompactString::default()),
            ColumnType::Int | ColumnType::Time => Value::Int(0),
            ColumnType::Float => Value::Float(0.0),
            ColumnType::StringList => Value::StringList(Vec::new()),
            ColumnType::IntList => Value::IntList(Vec::new()),
            ColumnType::CustomVars => Value::CustomVars(Vec::new()),
        }
    }

    /// Numeric view of the value, `None` when not meaningfully numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Looks up a custom variable by name. Names compare case-insensitively.
    pub fn custom_var(&self, key: &str) -> Option<&str> {
        match self {
            Value::CustomVars(vars) => vars
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(key))
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }

    /// Lenient decoding of an upstream JSON cell into the declared column type.
    pub fn from_json(json: &JsonValue, column_type: ColumnType) -> Value {
        match column_type {
            ColumnType::String => Value::String(json_to_text(json)),
            ColumnType::Int | ColumnType::Time => Value::Int(json_to_i64(json)),
            ColumnType::Float => Value::Float(json_to_f64(json)),
            ColumnType::StringList => match json {
                JsonValue::Array(items) => Value::StringList(items.iter().map(list_item_text).collect()),
                JsonValue::String(s) if s.is_empty() => Value::StringList(Vec::new()),
                JsonValue::String(s) => Value::StringList(vec![s.to_compact_string()]),
                _ => Value::StringList(Vec::new()),
            },
            ColumnType::IntList => match json {
                JsonValue::Array(items) => Value::IntList(items.iter().map(json_to_i64).collect()),
                _ => Value::IntList(Vec::new()),
            },
            ColumnType::CustomVars => match json {
                JsonValue::Object(map) => Value::CustomVars(
                    map.iter()
                        .map(|(k, v)| (k.to_compact_string(), json_to_text(v)))
                        .collect(),
                ),
                JsonValue::Array(items) => Value::CustomVars(
                    items
                        .iter()
                        .filter_map(|pair| match pair {
                            JsonValue::Array(kv) if kv.len() == 2 => {
                                Some((json_to_text(&kv[0]), json_to_text(&kv[1])))
                            }
                            _ => None,
                        })
                        .collect(),
                ),
                _ => Value::CustomVars(Vec::new()),
            },
        }
    }

    /// Ordering used by `Sort:`. `args` selects the custom variable for map columns.
    pub fn sort_cmp(&self, other: &Value, args: Option<&str>) -> Ordering {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::StringList(a), Value::StringList(b)) => a.cmp(b),
            (Value::IntList(a), Value::IntList(b)) => a.cmp(b),
            (Value::CustomVars(_), Value::CustomVars(_)) => {
                let key = args.unwrap_or_default();
                self.custom_var(key)
                    .unwrap_or_default()
                    .cmp(other.custom_var(key).unwrap_or_default())
            }
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => OrderedFloat(a).cmp(&OrderedFloat(b)),
                _ => self.to_string().cmp(&other.to_string()),
            },
        }
    }

    /// Appends an unambiguous representation used as a group-by key.
    ///
    /// Text is length-prefixed, so no content can imitate a value boundary.
    pub fn write_group_key(&self, out: &mut String) {
        use std::fmt::Write as _;
        fn text(out: &mut String, s: &str) {
            let _ = write!(out, "{}:{}", s.len(), s);
        }
        let _ = match self {
            Value::Null => write!(out, "n;"),
            Value::Int(v) => write!(out, "i{};", v),
            Value::Float(v) => write!(out, "f{};", v),
            Value::String(s) => {
                out.push('s');
                text(out, s);
                Ok(())
            }
            Value::StringList(items) => {
                let _ = write!(out, "l{}:", items.len());
                items.iter().for_each(|item| text(out, item));
                Ok(())
            }
            Value::IntList(items) => write!(out, "j{:?};", items),
            Value::CustomVars(vars) => {
                let _ = write!(out, "c{}:", vars.len());
                for (key, value) in vars {
                    text(out, key);
                    text(out, value);
                }
                Ok(())
            }
        };
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::StringList(items) => write!(f, "{}", items.join(",")),
            Value::IntList(items) => {
                let joined: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", joined.join(","))
            }
            Value::CustomVars(vars) => {
                let joined: Vec<String> = vars.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{}", joined.join(","))
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::String(s) => serializer.serialize_str(s),
            Value::StringList(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item.as_str())?;
                }
                seq.end()
            }
            Value::IntList(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::CustomVars(vars) => {
                let mut map = serializer.serialize_map(Some(vars.len()))?;
                for (k, v) in vars {
                    map.serialize_entry(k.as_str(), v.as_str())?;
                }
                map.end()
            }
        }
    }
}

fn json_to_text(json: &JsonValue) -> CompactString {
    match json {
        JsonValue::String(s) => s.to_compact_string(),
        JsonValue::Null => CompactString::default(),
        other => other.to_compact_string(),
    }
}

// Nested arrays (e.g. servicegroup members as [host, service]) are joined with ';'.
fn list_item_text(json: &JsonValue) -> CompactString {
    match json {
        JsonValue::Array(parts) => {
            let parts: Vec<CompactString> = parts.iter().map(json_to_text).collect();
            parts.join(";").to_compact_string()
        }
        other => json_to_text(other),
    }
}

fn json_to_i64(json: &JsonValue) -> i64 {
    match json {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        JsonValue::String(s) => parse_int_lenient(s).unwrap_or(0),
        JsonValue::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

fn json_to_f64(json: &JsonValue) -> f64 {
    match json {
        JsonValue::Number(n) => n.as_f64().unwrap_or(0.0),
        JsonValue::String(s) => s.trim().parse().unwrap_or(0.0),
        JsonValue::Bool(b) => f64::from(u8::from(*b)),
        _ => 0.0,
    }
}

/// Parses an integer, accepting float notation by truncation.
pub fn parse_int_lenient(text: &str) -> Option<i64> {
    let text = text.trim();
    text.parse::<i64>()
        .ok()
        .or_else(|| text.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
}

// ----------------------------------------------------------------------------
// 3.2 Columns & Tables
// ----------------------------------------------------------------------------

/// Values computed from the peer answering the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualColumn {
    PeerKey,
    PeerName,
}

/// Where a column's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    /// Position within the mirrored row
    Stored { slot: usize },
    /// Computed from the answering peer
    Virtual(VirtualColumn),
    /// Value of `target_slot` in the `table` row whose key equals our `key_slot`
    Reference {
        key_slot: usize,
        table: CompactString,
        target_slot: usize,
    },
    /// Requested but not part of the table; always null
    Unknown,
}

/// A column definition. Immutable once the registry is built.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: CompactString,
    pub column_type: ColumnType,
    /// Position within the table's column list
    pub index: usize,
    pub kind: ColumnKind,
}

impl Column {
    /// Placeholder for names requested in `Columns:` that the table lacks.
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_compact_string(),
            column_type: ColumnType::String,
            index: usize::MAX,
            kind: ColumnKind::Unknown,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self.kind, ColumnKind::Stored { .. })
    }
}

/// Table behaviour flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableFlags {
    /// Rows are computed on demand instead of mirrored
    pub virtual_table: bool,
    /// Never mirrored; every query is forwarded upstream
    pub passthrough_only: bool,
}

/// Group-by tables explode one multi-value column of a backing table.
#[derive(Debug, Clone)]
pub struct GroupBySpec {
    pub backing: CompactString,
    /// Column of the backing table holding the list to explode
    pub explode: Column,
}

/// A table definition.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: CompactString,
    pub columns: Vec<Column>,
    by_name: AHashMap<CompactString, usize>,
    /// Number of stored columns, i.e. the width of a mirrored row
    pub stored_count: usize,
    pub flags: TableFlags,
    pub group_by: Option<GroupBySpec>,
    /// Columns identifying a row, used by `WaitObject` and reference lookups
    pub key_columns: Vec<CompactString>,
    /// Prefix accepted in front of column names, e.g. `host_name` on hosts
    pub column_prefix: Option<&'static str>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        if let Some(idx) = self.by_name.get(name) {
            return self.columns.get(*idx);
        }
        let stripped = name.strip_prefix(self.column_prefix?)?;
        self.by_name.get(stripped).and_then(|idx| self.columns.get(*idx))
    }

    pub fn stored_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_stored())
    }

    /// Mirrored tables are fetched by the refresh cycle.
    pub fn is_mirrored(&self) -> bool {
        !self.flags.virtual_table && !self.flags.passthrough_only && self.group_by.is_none()
    }

    /// Row key, key column values joined by `;`.
    pub fn row_key(&self, row: &[Value]) -> Option<CompactString> {
        let mut parts: SmallVec<[String; 2]> = SmallVec::new();
        for key in &self.key_columns {
            match self.column(key).map(|c| &c.kind) {
                Some(ColumnKind::Stored { slot }) => parts.push(row.get(*slot)?.to_string()),
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(parts.join(";").to_compact_string())
    }
}

struct TableBuilder {
    table: Table,
}

impl TableBuilder {
    fn new(name: &str) -> Self {
        Self {
            table: Table {
                name: name.to_compact_string(),
                columns: Vec::new(),
                by_name: AHashMap::new(),
                stored_count: 0,
                flags: TableFlags::default(),
                group_by: None,
                key_columns: Vec::new(),
                column_prefix: None,
            },
        }
    }

    /// Starts a group-by table with all columns of `backing` plus the
    /// exploded `output_column`.
    fn group_by(name: &str, backing: &Table, explode_column: &str, output_column: &str) -> Self {
        let mut builder = Self::new(name);
        for column in backing.columns.iter().filter(|c| !matches!(c.kind, ColumnKind::Virtual(_))) {
            builder.push(column.name.as_str(), column.column_type, column.kind.clone());
        }
        builder.table.stored_count = backing.stored_count;
        builder = builder.column(output_column, ColumnType::String);
        builder.table.column_prefix = backing.column_prefix;
        builder.table.key_columns = backing.key_columns.clone();
        let explode = backing
            .column(explode_column)
            .cloned()
            .unwrap_or_else(|| Column::unknown(explode_column));
        builder.table.group_by = Some(GroupBySpec {
            backing: backing.name.clone(),
            explode,
        });
        builder
    }

    fn push(&mut self, name: &str, column_type: ColumnType, kind: ColumnKind) {
        let index = self.table.columns.len();
        self.table.by_name.insert(name.to_compact_string(), index);
        self.table.columns.push(Column {
            name: name.to_compact_string(),
            column_type,
            index,
            kind,
        });
    }

    fn column(mut self, name: &str, column_type: ColumnType) -> Self {
        let slot = self.table.stored_count;
        self.table.stored_count += 1;
        self.push(name, column_type, ColumnKind::Stored { slot });
        self
    }

    fn strings(mut self, names: &[&str]) -> Self {
        for name in names {
            self = self.column(name, ColumnType::String);
        }
        self
    }

    fn ints(mut self, names: &[&str]) -> Self {
        for name in names {
            self = self.column(name, ColumnType::Int);
        }
        self
    }

    fn floats(mut self, names: &[&str]) -> Self {
        for name in names {
            self = self.column(name, ColumnType::Float);
        }
        self
    }

    fn times(mut self, names: &[&str]) -> Self {
        for name in names {
            self = self.column(name, ColumnType::Time);
        }
        self
    }

    fn string_lists(mut self, names: &[&str]) -> Self {
        for name in names {
            self = self.column(name, ColumnType::StringList);
        }
        self
    }

    fn int_lists(mut self, names: &[&str]) -> Self {
        for name in names {
            self = self.column(name, ColumnType::IntList);
        }
        self
    }

    fn reference(mut self, name: &str, key_column: &str, target: &Table, target_column: &str) -> Self {
        let key_slot = match self.table.column(key_column).map(|c| &c.kind) {
            Some(ColumnKind::Stored { slot }) => Some(*slot),
            _ => None,
        };
        let (kind, column_type) = match (key_slot, target.column(target_column)) {
            (Some(key_slot), Some(Column { kind: ColumnKind::Stored { slot }, column_type, .. })) => (
                ColumnKind::Reference {
                    key_slot,
                    table: target.name.clone(),
                    target_slot: *slot,
                },
                *column_type,
            ),
            _ => (ColumnKind::Unknown, ColumnType::String),
        };
        self.push(name, column_type, kind);
        self
    }

    fn keys(mut self, keys: &[&str]) -> Self {
        self.table.key_columns = keys.iter().map(|k| k.to_compact_string()).collect();
        self
    }

    fn prefix(mut self, prefix: &'static str) -> Self {
        self.table.column_prefix = Some(prefix);
        self
    }

    fn passthrough(mut self) -> Self {
        self.table.flags.passthrough_only = true;
        self
    }

    fn virtual_table(mut self) -> Self {
        self.table.flags.virtual_table = true;
        self
    }

    fn build(mut self) -> Table {
        self.push("peer_key", ColumnType::String, ColumnKind::Virtual(VirtualColumn::PeerKey));
        self.push("peer_name", ColumnType::String, ColumnKind::Virtual(VirtualColumn::PeerName));
        self.table
    }
}

// ----------------------------------------------------------------------------
// 3.3 Schema Registry
// ----------------------------------------------------------------------------

/// Registry of all known tables. Built once, never mutated.
#[derive(Debug)]
pub struct Schema {
    tables: Vec<Arc<Table>>,
    by_name: AHashMap<CompactString, Arc<Table>>,
}

/// Global schema instance
pub static SCHEMA: Lazy<Schema> = Lazy::new(Schema::builtin);

/// Returns the global schema registry.
pub fn schema() -> &'static Schema {
    &SCHEMA
}

const CHECKABLE_STRINGS: &[&str] = &[
    "display_name",
    "check_command",
    "plugin_output",
    "long_plugin_output",
    "perf_data",
    "icon_image",
    "notes",
    "notes_url",
    "action_url",
];

const CHECKABLE_INTS: &[&str] = &[
    "state",
    "state_type",
    "has_been_checked",
    "is_executing",
    "check_type",
    "active_checks_enabled",
    "notifications_enabled",
    "acknowledged",
    "scheduled_downtime_depth",
    "current_attempt",
    "max_check_attempts",
];

const CHECKABLE_FLOATS: &[&str] = &["latency", "execution_time", "percent_state_change"];

const CHECKABLE_TIMES: &[&str] = &["last_check", "next_check", "last_state_change"];

impl Schema {
    /// Builds the registry of all Livestatus tables served by the multiplexer.
    pub fn builtin() -> Self {
        let status = TableBuilder::new("status")
            .strings(&["program_version", "livestatus_version"])
            .ints(&["nagios_pid", "interval_length", "enable_notifications", "execute_host_checks", "execute_service_checks"])
            .times(&["program_start", "last_command_check"])
            .build();

        let timeperiods = TableBuilder::new("timeperiods")
            .strings(&["name", "alias"])
            .ints(&["in"])
            .keys(&["name"])
            .prefix("timeperiod_")
            .build();

        let contacts = TableBuilder::new("contacts")
            .strings(&["name", "alias", "email", "pager"])
            .ints(&["can_submit_commands", "host_notifications_enabled", "service_notifications_enabled"])
            .keys(&["name"])
            .prefix("contact_")
            .build();

        let contactgroups = TableBuilder::new("contactgroups")
            .strings(&["name", "alias"])
            .string_lists(&["members"])
            .keys(&["name"])
            .prefix("contactgroup_")
            .build();

        let commands = TableBuilder::new("commands")
            .strings(&["name", "line"])
            .keys(&["name"])
            .prefix("command_")
            .build();

        let hostgroups = TableBuilder::new("hostgroups")
            .strings(&["name", "alias", "notes", "action_url"])
            .string_lists(&["members"])
            .keys(&["name"])
            .prefix("hostgroup_")
            .build();

        let servicegroups = TableBuilder::new("servicegroups")
            .strings(&["name", "alias", "notes", "action_url"])
            .string_lists(&["members"])
            .keys(&["name"])
            .prefix("servicegroup_")
            .build();

        let hosts = TableBuilder::new("hosts")
            .strings(&["name", "alias", "address"])
            .strings(CHECKABLE_STRINGS)
            .ints(CHECKABLE_INTS)
            .floats(CHECKABLE_FLOATS)
            .times(CHECKABLE_TIMES)
            .string_lists(&["contacts", "contact_groups", "groups", "parents"])
            .int_lists(&["comments", "downtimes"])
            .column("custom_variables", ColumnType::CustomVars)
            .ints(&["num_services", "worst_service_state"])
            .keys(&["name"])
            .prefix("host_")
            .build();

        let services = TableBuilder::new("services")
            .strings(&["host_name", "description"])
            .strings(CHECKABLE_STRINGS)
            .ints(CHECKABLE_INTS)
            .floats(CHECKABLE_FLOATS)
            .times(CHECKABLE_TIMES)
            .string_lists(&["contacts", "contact_groups", "groups"])
            .int_lists(&["comments", "downtimes"])
            .column("custom_variables", ColumnType::CustomVars)
            .reference("host_alias", "host_name", &hosts, "alias")
            .reference("host_address", "host_name", &hosts, "address")
            .reference("host_display_name", "host_name", &hosts, "display_name")
            .reference("host_state", "host_name", &hosts, "state")
            .reference("host_has_been_checked", "host_name", &hosts, "has_been_checked")
            .reference("host_latency", "host_name", &hosts, "latency")
            .reference("host_check_command", "host_name", &hosts, "check_command")
            .reference("host_groups", "host_name", &hosts, "groups")
            .reference("host_custom_variables", "host_name", &hosts, "custom_variables")
            .keys(&["host_name", "description"])
            .prefix("service_")
            .build();

        let comments = TableBuilder::new("comments")
            .ints(&["id", "entry_type", "is_service", "expires"])
            .strings(&["host_name", "service_description", "author", "comment"])
            .times(&["entry_time", "expire_time"])
            .keys(&["id"])
            .prefix("comment_")
            .build();

        let downtimes = TableBuilder::new("downtimes")
            .ints(&["id", "fixed", "duration", "is_service", "triggered_by"])
            .strings(&["host_name", "service_description", "author", "comment"])
            .times(&["entry_time", "start_time", "end_time"])
            .keys(&["id"])
            .prefix("downtime_")
            .build();

        let log = TableBuilder::new("log")
            .times(&["time"])
            .ints(&["lineno", "class", "state", "attempt"])
            .strings(&[
                "type",
                "state_type",
                "host_name",
                "service_description",
                "plugin_output",
                "message",
                "contact_name",
                "command_name",
            ])
            .passthrough()
            .build();

        let hostsbygroup = TableBuilder::group_by("hostsbygroup", &hosts, "groups", "hostgroup_name").build();
        let servicesbygroup =
            TableBuilder::group_by("servicesbygroup", &services, "groups", "servicegroup_name").build();
        let servicesbyhostgroup =
            TableBuilder::group_by("servicesbyhostgroup", &services, "host_groups", "hostgroup_name").build();

        let backends = TableBuilder::new("backends")
            .strings(&["key", "name", "addr", "last_error"])
            .ints(&["status", "queries", "bytes_send", "bytes_received", "idling"])
            .times(&["last_update", "last_online"])
            .floats(&["response_time"])
            .keys(&["key"])
            .virtual_table()
            .build();

        let tables: Vec<Arc<Table>> = vec![
            status,
            timeperiods,
            contacts,
            contactgroups,
            commands,
            hostgroups,
            servicegroups,
            hosts,
            services,
            comments,
            downtimes,
            log,
            hostsbygroup,
            servicesbygroup,
            servicesbyhostgroup,
            backends,
        ]
        .into_iter()
        .map(Arc::new)
        .collect();

        let by_name = tables.iter().map(|t| (t.name.clone(), Arc::clone(t))).collect();
        Self { tables, by_name }
    }

    pub fn table(&self, name: &str) -> Option<&Arc<Table>> {
        self.by_name.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<Table>> {
        self.tables.iter()
    }

    /// Tables fetched by every refresh cycle, in refresh order.
    pub fn mirrored_tables(&self) -> impl Iterator<Item = &Arc<Table>> {
        self.tables.iter().filter(|t| t.is_mirrored())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Row Access
// ----------------------------------------------------------------------------

/// A mirrored row, positionally aligned with the table's stored columns.
pub type Row = Vec<Value>;

/// Everything besides the row itself needed to resolve a column value.
#[derive(Debug, Clone, Default)]
pub struct RowContext {
    pub peer_key: CompactString,
    pub peer_name: CompactString,
    /// Snapshots of the tables reference columns point into
    references: AHashMap<CompactString, Arc<TableSnapshot>>,
}

impl RowContext {
    pub fn new(peer_key: &str, peer_name: &str) -> Self {
        Self {
            peer_key: peer_key.to_compact_string(),
            peer_name: peer_name.to_compact_string(),
            references: AHashMap::new(),
        }
    }

    pub fn with_reference(mut self, table: &str, snapshot: Arc<TableSnapshot>) -> Self {
        self.references.insert(table.to_compact_string(), snapshot);
        self
    }

    fn reference(&self, table: &str, key: &str) -> Option<&[Value]> {
        self.references.get(table)?.lookup(key)
    }
}

/// A row together with its resolution context.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    row: &'a [Value],
    ctx: &'a RowContext,
}

impl<'a> RowView<'a> {
    pub fn new(row: &'a [Value], ctx: &'a RowContext) -> Self {
        Self { row, ctx }
    }

    pub fn value(&self, column: &Column) -> Cow<'a, Value> {
        match &column.kind {
            ColumnKind::Stored { slot } => match self.row.get(*slot) {
                Some(value) => Cow::Borrowed(value),
                None => Cow::Owned(Value::default_for(column.column_type)),
            },
            ColumnKind::Virtual(VirtualColumn::PeerKey) => Cow::Owned(Value::String(self.ctx.peer_key.clone())),
            ColumnKind::Virtual(VirtualColumn::PeerName) => Cow::Owned(Value::String(self.ctx.peer_name.clone())),
            ColumnKind::Reference {
                key_slot,
                table,
                target_slot,
            } => {
                let target = self
                    .row
                    .get(*key_slot)
                    .and_then(Value::as_str)
                    .and_then(|key| self.ctx.reference(table, key))
                    .and_then(|row| row.get(*target_slot));
                match target {
                    Some(value) => Cow::Borrowed(value),
                    None => Cow::Owned(Value::default_for(column.column_type)),
                }
            }
            ColumnKind::Unknown => Cow::Owned(Value::Null),
        }
    }

    /// Projects the row onto the given output columns.
    pub fn project(&self, columns: &[Column]) -> Row {
        columns.iter().map(|c| self.value(c).into_owned()).collect()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the multiplexer:
// - Request errors carry the exact text sent back to clients
// - Peer errors are isolated per backend and never fail a whole query
// - Configuration errors stop startup
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the Livemux engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum MuxError {
    // ---- Request Errors ----
    #[error(transparent)]
    Request(#[from] RequestError),

    // ---- Peer Errors ----
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl MuxError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            MuxError::Request(_) => true,
            MuxError::Peer(e) => e.is_recoverable(),
            MuxError::Config(_) => false,
            MuxError::Io(_) => true,
            MuxError::Serialization(_) => false,
            MuxError::Internal(_) => false,
            MuxError::ShuttingDown => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            MuxError::Request(_) => "request",
            MuxError::Peer(_) => "peer",
            MuxError::Config(_) => "config",
            MuxError::Io(_) => "io",
            MuxError::Serialization(_) => "serialization",
            MuxError::Internal(_) => "internal",
            MuxError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            MuxError::Request(_) => RecoveryHint::FixRequest,
            MuxError::Peer(e) => e.recovery_hint(),
            MuxError::Config(_) => RecoveryHint::FixConfiguration,
            MuxError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }

    /// Status code reported to clients for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            MuxError::Request(e) => e.status_code(),
            MuxError::Peer(_) => STATUS_BAD_GATEWAY,
            _ => STATUS_BAD_REQUEST,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// The client must send a corrected request
    FixRequest,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Reconnect, possibly to the next configured source
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
}

// ----------------------------------------------------------------------------
// 4.2 Request Errors
// ----------------------------------------------------------------------------

/// Errors detected while parsing or validating a client request.
/// The `Display` text is sent to the client unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("bad request: empty request")]
    Empty,

    #[error("bad request: {0}")]
    UnknownVerb(String),

    #[error("bad request: missing table name in {0}")]
    MissingTable(String),

    #[error("bad request: table {0} does not exist")]
    TableNotFound(String),

    #[error("bad request header: {0}")]
    MalformedHeader(String),

    #[error("bad request: unrecognized header {0}")]
    UnrecognizedHeader(String),

    #[error("bad request: limit must be a positive number")]
    InvalidLimit,

    #[error("bad request: offset must be a positive number")]
    InvalidOffset,

    #[error("bad request: invalid sort header, must be 'Sort: <field> <asc|desc>' or 'Sort: custom_variables <name> <asc|desc>'")]
    InvalidSortHeader,

    #[error("bad request: unrecognized sort direction, must be asc or desc")]
    InvalidSortDirection,

    #[error("bad request: sort column {0} not in result set")]
    SortColumnNotInResult(String),

    #[error("bad request: unrecognized responseformat, only fixed16 is supported")]
    InvalidResponseHeader,

    #[error("bad request: unrecognized outputformat, only json and wrapped_json is supported")]
    InvalidOutputFormat,

    #[error("bad request: not enough filter on stack in {line}")]
    NotEnoughFilters { line: String },

    #[error("bad request: {keyword} must be a positive number in: {line}")]
    InvalidGroupCount { keyword: String, line: String },

    #[error("bad request: only filter stats can be grouped in {line}")]
    StatsGroupOfReducers { line: String },

    #[error("bad request: WaitTrigger without WaitCondition")]
    WaitWithoutCondition,

    #[error("bad request: WaitTrigger without WaitTimeout")]
    WaitWithoutTimeout,

    #[error("bad request: WaitTrigger without WaitObject")]
    WaitWithoutObject,

    #[error("bad request: waittimeout must be a positive number")]
    InvalidWaitTimeout,

    #[error("bad request: filter header, must be Filter: <field> <operator> <value>")]
    InvalidFilter,

    #[error("bad request: unrecognized column from filter: {column} in {line}")]
    UnknownFilterColumn { column: String, line: String },

    #[error("bad request: unrecognized filter operator: {operator} in {line}")]
    UnknownOperator { operator: String, line: String },

    #[error("bad request: invalid regular expression: {message} in filter {line}")]
    InvalidRegex { message: String, line: String },

    #[error("bad request: could not convert {value} to number in filter {line}")]
    InvalidNumber { value: String, line: String },

    #[error("bad request: stats header, must be Stats: <field> <operator> <value> OR Stats: <sum|avg|min|max> <field>")]
    InvalidStats,

    #[error("bad request: unrecognized column from stats: {column} in {line}")]
    UnknownStatsColumn { column: String, line: String },

    #[error("bad request: custom variable filter must have form \"Filter: custom_variables <op> <variable> [<value>]\" in {line}")]
    InvalidCustomVarFilter { line: String },

    #[error("bad request: must be 'on' or 'off' in {line}")]
    InvalidKeepalive { line: String },

    #[error("bad request: backend {0} does not exist")]
    UnknownBackend(String),
}

impl RequestError {
    /// Status code of the error response.
    pub fn status_code(&self) -> u16 {
        match self {
            RequestError::TableNotFound(_) => STATUS_NOT_FOUND,
            _ => STATUS_BAD_REQUEST,
        }
    }

    pub fn invalid_group_count(keyword: &str, line: &str) -> Self {
        RequestError::InvalidGroupCount {
            keyword: keyword.to_ascii_lowercase(),
            line: line.to_string(),
        }
    }

    pub fn not_enough_filters(line: &str) -> Self {
        RequestError::NotEnoughFilters { line: line.to_string() }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Peer Errors
// ----------------------------------------------------------------------------

/// Transport and upstream failures of a single peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("connection to {address} failed: {message}")]
    ConnectionFailed { address: String, message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("invalid response from {address}: {message}")]
    InvalidResponse { address: String, message: String },

    #[error("upstream {address} answered {status}: {message}")]
    Upstream { address: String, status: u16, message: String },

    #[error("peer {peer} is down: {message}")]
    Down { peer: String, message: String },

    #[error("peer {peer} has no sources configured")]
    NoSources { peer: String },
}

impl PeerError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PeerError::NoSources { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PeerError::ConnectionFailed { .. } => RecoveryHint::Reconnect,
            PeerError::Timeout { .. } => RecoveryHint::RetryWithBackoff,
            PeerError::InvalidResponse { .. } => RecoveryHint::Skip,
            PeerError::Upstream { .. } => RecoveryHint::Skip,
            PeerError::Down { .. } => RecoveryHint::RetryWithBackoff,
            PeerError::NoSources { .. } => RecoveryHint::FixConfiguration,
        }
    }

    pub fn connection_failed(address: impl Into<String>, message: impl Display) -> Self {
        PeerError::ConnectionFailed {
            address: address.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_response(address: impl Into<String>, message: impl Display) -> Self {
        PeerError::InvalidResponse {
            address: address.into(),
            message: message.to_string(),
        }
    }

    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        PeerError::Timeout {
            operation: operation.into(),
            timeout_ms: duration.as_millis() as u64,
        }
    }

    /// Only connection level failures are worth trying the next source for.
    pub fn should_failover(&self) -> bool {
        matches!(self, PeerError::ConnectionFailed { .. } | PeerError::Timeout { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.4 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField { field: field.into() }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Result Types & Error Context
// ----------------------------------------------------------------------------

/// Result type for engine level operations
pub type MuxResult<T> = Result<T, MuxError>;

/// Result type for request parsing
pub type RequestResult<T> = Result<T, RequestError>;

/// Result type for upstream operations
pub type PeerResult<T> = Result<T, PeerError>;

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn mux_context(self, context: impl Into<String>) -> Result<T, MuxError>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<MuxError>,
{
    fn mux_context(self, context: impl Into<String>) -> Result<T, MuxError> {
        self.map_err(|e| {
            let err: MuxError = e.into();
            MuxError::Internal(format!("{}: {}", context.into(), err))
        })
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (LIVEMUX_SECTION__FIELD)
// - Validation
// - Sensible defaults
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the multiplexer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Client listener settings
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Upstream connections, one peer each
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: GeneralConfig::default(),
            listener: ListenerConfig::default(),
            connections: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LIVEMUX_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.update_interval_secs < MIN_UPDATE_INTERVAL_SECS {
            return Err(ConfigError::invalid_value(
                "engine.update_interval_secs",
                format!("Update interval must be at least {}s", MIN_UPDATE_INTERVAL_SECS),
            ));
        }

        if self.engine.net_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "engine.net_timeout_secs",
                "Network timeout must be greater than 0",
            ));
        }

        if self.listener.listen.is_empty() {
            return Err(ConfigError::missing_field("listener.listen"));
        }

        if self.connections.is_empty() {
            return Err(ConfigError::missing_field("connections"));
        }

        let mut seen = AHashSet::new();
        for connection in &self.connections {
            if connection.id.trim().is_empty() {
                return Err(ConfigError::missing_field("connections.id"));
            }
            if !seen.insert(connection.id.as_str()) {
                return Err(ConfigError::invalid_value(
                    "connections.id",
                    format!("Duplicate connection id '{}'", connection.id),
                ));
            }
            if connection.source.is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("connections.{}.source", connection.id),
                    "At least one source address is required",
                ));
            }
        }

        Ok(())
    }

    /// Generate a default configuration file
    pub fn generate_default_config() -> String {
        let mut config = Self::default();
        config.connections.push(ConnectionConfig {
            id: "site1".to_string(),
            name: "Site One".to_string(),
            source: vec!["/var/cache/naemon/live".to_string()],
        });
        let body = toml::to_string_pretty(&config).unwrap_or_default();
        format!(
            "# {} configuration\n# Every value can be overridden with LIVEMUX_<SECTION>__<FIELD>\n\n{}",
            ENGINE_FULL_NAME, body
        )
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.engine.update_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.shutdown_timeout_secs)
    }

    /// Transport timeouts shared by all peers
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.engine.connect_timeout_secs),
            net: Duration::from_secs(self.engine.net_timeout_secs),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 Section Structures
// ----------------------------------------------------------------------------

/// General engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name of this instance, used in logs
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Seconds between two refresh cycles of each peer
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,

    /// Timeout for a whole upstream exchange
    #[serde(default = "default_net_timeout")]
    pub net_timeout_secs: u64,

    /// Timeout for connecting to an upstream source
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Time granted to in-flight queries on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            update_interval_secs: default_update_interval(),
            net_timeout_secs: default_net_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// Client listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// `host:port` for TCP, anything else is a unix socket path
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Address of the Prometheus endpoint
    #[serde(default)]
    pub listen_prometheus: Option<String>,

    /// Largest accepted request
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            listen_prometheus: None,
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

/// One upstream Livestatus backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Unique key of the backend, used by `Backends:`
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Addresses tried in order
    #[serde(default)]
    pub source: Vec<String>,
}

impl ConnectionConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to this file instead of stderr
    #[serde(default)]
    pub file: Option<String>,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.3 Default Value Functions
// ----------------------------------------------------------------------------

fn default_instance_name() -> String {
    ENGINE_NAME.to_string()
}

fn default_update_interval() -> u64 {
    DEFAULT_UPDATE_INTERVAL_SECS
}

fn default_net_timeout() -> u64 {
    DEFAULT_NET_TIMEOUT_SECS
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_shutdown_timeout() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

fn default_listen() -> Vec<String> {
    vec![DEFAULT_LISTEN_ADDRESS.to_string()]
}

fn default_max_request_bytes() -> usize {
    DEFAULT_MAX_REQUEST_BYTES
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING SETUP
// ============================================================================

/// Keeps the non-blocking file writer flushing until dropped.
pub type LogGuard = tracing_appender::non_blocking::WorkerGuard;

/// Initialize the logging system
pub fn init_logging(config: &LoggingConfig) -> MuxResult<Option<LogGuard>> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let (writer, guard, ansi) = match &config.file {
        Some(file) => {
            let path = Path::new(file);
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| MuxError::Internal(format!("Invalid log file path: {}", file)))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(io::stderr), None, config.colors),
    };

    // Build the subscriber based on format
    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                log_fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| MuxError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                log_fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| MuxError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            // Pretty format (default)
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                log_fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| MuxError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    Ok(guard)
}

// ============================================================================
// SECTION 7: CLI & COMMAND LINE INTERFACE
// ============================================================================
// Command-line interface for the multiplexer with:
// - Subcommands for running, validating and generating configuration
// - A raw query client for poking at a running instance
// - Environment variable support
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Livemux CLI
#[derive(Parser, Debug)]
#[command(
    name = "livemux",
    author = "Livemux Team",
    version,
    about = "Livestatus multiplexer for many monitoring backends",
    long_about = "Livemux mirrors the status tables of any number of Livestatus \
                  backends and answers Livestatus queries against the merged data, \
                  as if all backends were a single core."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "livemux.toml", env = "LIVEMUX_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "LIVEMUX_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "LIVEMUX_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the multiplexer (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,

    /// Send one raw request to a Livestatus endpoint and print the answer
    Query {
        /// `host:port` or unix socket path
        #[arg(short, long, default_value = DEFAULT_LISTEN_ADDRESS)]
        address: String,

        /// Request text, `\n` escapes are expanded
        request: String,
    },
}

// ----------------------------------------------------------------------------
// 7.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> MuxResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.engine.instance_name);
            println!("  • Update interval: {}s", config.engine.update_interval_secs);
            println!("  • Listeners: {}", config.listener.listen.join(", "));
            println!("  • Backends:");
            for connection in &config.connections {
                println!(
                    "    - {} ({}): {}",
                    connection.id,
                    connection.display_name(),
                    connection.source.join(", ")
                );
            }
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(MuxError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> MuxResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Tables:");
    for table in schema().tables() {
        println!("  • {}", table.name);
    }
}

/// Handle the query subcommand
async fn handle_query(address: &str, request: &str) -> MuxResult<()> {
    let request = request.replace("\\n", "\n");
    let answer = send_request(address, &request, Timeouts::default()).await?;
    print!("{}", String::from_utf8_lossy(&answer));
    Ok(())
}

// ============================================================================
// SECTION 8: ENGINE LIFECYCLE
// ============================================================================
// Wires peers, listeners and the metrics endpoint together and owns the
// shutdown sequence: stop accepting, drain connections, join refresh tasks.
// ============================================================================

/// The running multiplexer.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    peer_map: Arc<PeerMap>,
    metrics: Arc<MuxMetrics>,
    shutdown: CancellationToken,
    running: AtomicBool,
    started_at: Instant,
}

impl Engine {
    /// Create a new engine instance
    pub fn new(config: EngineConfig) -> MuxResult<Self> {
        let metrics = Arc::new(MuxMetrics::new()?);
        let peer_map = Arc::new(PeerMap::from_config(&config, Arc::clone(&metrics)));
        Ok(Self {
            config,
            peer_map,
            metrics,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    /// Create engine from configuration file
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> MuxResult<Self> {
        let config = EngineConfig::load(path)?;
        Self::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn peer_map(&self) -> &Arc<PeerMap> {
        &self.peer_map
    }

    pub fn metrics(&self) -> &Arc<MuxMetrics> {
        &self.metrics
    }

    /// Check if engine is running
    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "livemux::engine", "Shutdown requested");
        self.shutdown.cancel();
    }

    /// Run until a signal or `shutdown()`.
    pub async fn run(&self) -> MuxResult<()> {
        info!(
            target: "livemux::engine",
            version = ENGINE_VERSION,
            instance = %self.config.engine.instance_name,
            backends = self.peer_map.len(),
            "Starting Livemux"
        );
        self.running.store(true, AtomicOrdering::Release);

        let listener = Arc::new(ClientListener::new(
            Arc::clone(&self.peer_map),
            self.config.listener.max_request_bytes,
            self.shutdown.child_token(),
        ));
        let mut accept_tasks = Vec::with_capacity(self.config.listener.listen.len() + 1);
        for address in &self.config.listener.listen {
            let bound = listener.serve(address).await;
            match bound {
                Ok(bound) => accept_tasks.push(bound.task),
                Err(e) => return Err(self.abort_start(e)),
            }
        }
        if let Some(address) = &self.config.listener.listen_prometheus {
            let bound = Arc::clone(&self.metrics).serve(address, self.shutdown.child_token()).await;
            match bound {
                Ok(bound) => accept_tasks.push(bound.task),
                Err(e) => return Err(self.abort_start(e)),
            }
        }

        self.peer_map.start(self.config.update_interval()).await;

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_signal() => shutdown.cancel(),
                _ = shutdown.cancelled() => {}
            }
        });

        info!(target: "livemux::engine", "Engine started");
        self.shutdown.cancelled().await;

        // Graceful shutdown
        info!(target: "livemux::engine", "Starting graceful shutdown");
        let shutdown_start = Instant::now();

        join_all(accept_tasks).await;
        let connections = listener.connections();
        connections.close();
        if timeout(self.config.shutdown_timeout(), connections.wait()).await.is_err() {
            warn!(
                target: "livemux::engine",
                open = connections.len(),
                "Shutdown timeout reached with connections still open"
            );
        }
        self.peer_map.stop().await;
        self.running.store(false, AtomicOrdering::Release);

        info!(
            target: "livemux::engine",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            "Engine shutdown complete"
        );
        Ok(())
    }

    /// Stops the listeners bound so far.
    fn abort_start(&self, error: MuxError) -> MuxError {
        error!(target: "livemux::engine", error = %error, "Startup failed");
        self.shutdown.cancel();
        self.running.store(false, AtomicOrdering::Release);
        error
    }
}

/// Resolves on SIGTERM or SIGINT.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!(target: "livemux::engine", "Received SIGTERM"),
                _ = sigint.recv() => info!(target: "livemux::engine", "Received SIGINT"),
            }
        }
        _ => {
            warn!(target: "livemux::engine", "Unix signal handlers unavailable, waiting for ctrl-c");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(target: "livemux::engine", error = %e, "ctrl-c handler failed");
                std::future::pending::<()>().await;
            }
        }
    }
}

// ============================================================================
// SECTION 9: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the Livemux binary
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Some(Commands::Query { address, request }) => {
            handle_query(address, request).await?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    // Load configuration
    let config = EngineConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Override log level if specified
    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    // Initialize logging; the guard flushes the log file on exit
    let _log_guard = init_logging(&logging_config)?;

    info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let engine = Engine::new(config)?;
    engine.run().await?;
    Ok(())
}

// ============================================================================
// SECTION 10: PHASE 1 TESTS
// ============================================================================

#[cfg(test)]
mod phase1_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ---- Schema ----

    #[test]
    fn test_schema_has_all_tables() {
        let names: Vec<&str> = schema().tables().map(|t| t.name.as_str()).collect();
        for expected in [
            "status",
            "hosts",
            "services",
            "hostgroups",
            "servicegroups",
            "contacts",
            "contactgroups",
            "commands",
            "timeperiods",
            "comments",
            "downtimes",
            "log",
            "hostsbygroup",
            "servicesbygroup",
            "servicesbyhostgroup",
            "backends",
        ] {
            assert!(names.contains(&expected), "missing table {}", expected);
        }
    }

    #[test]
    fn test_mirrored_tables_exclude_computed_ones() {
        let mirrored: Vec<&str> = schema().mirrored_tables().map(|t| t.name.as_str()).collect();
        assert!(mirrored.contains(&"hosts"));
        assert!(mirrored.contains(&"status"));
        assert!(!mirrored.contains(&"log"));
        assert!(!mirrored.contains(&"hostsbygroup"));
        assert!(!mirrored.contains(&"backends"));
    }

    #[test]
    fn test_every_table_has_peer_columns() {
        for table in schema().tables() {
            let key = table.column("peer_key").expect("peer_key");
            assert_eq!(key.kind, ColumnKind::Virtual(VirtualColumn::PeerKey));
            let name = table.column("peer_name").expect("peer_name");
            assert_eq!(name.kind, ColumnKind::Virtual(VirtualColumn::PeerName));
        }
    }

    #[test]
    fn test_column_prefix_alias() {
        let hosts = schema().table("hosts").unwrap();
        let by_alias = hosts.column("host_name").unwrap();
        assert_eq!(by_alias.name, "name");
        assert!(hosts.column("service_name").is_none());
    }

    #[test]
    fn test_service_reference_columns_resolve_through_hosts() {
        let services = schema().table("services").unwrap();
        let latency = services.column("host_latency").unwrap();
        assert_eq!(latency.column_type, ColumnType::Float);
        match &latency.kind {
            ColumnKind::Reference { table, .. } => assert_eq!(table.as_str(), "hosts"),
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(services.key_columns, vec!["host_name", "description"]);
    }

    #[test]
    fn test_group_by_table_appends_exploded_column() {
        let hosts = schema().table("hosts").unwrap();
        let by_group = schema().table("hostsbygroup").unwrap();
        let spec = by_group.group_by.as_ref().unwrap();
        assert_eq!(spec.backing, "hosts");
        assert_eq!(spec.explode.name, "groups");

        let output = by_group.column("hostgroup_name").unwrap();
        assert_eq!(output.kind, ColumnKind::Stored { slot: hosts.stored_count });
        assert_eq!(by_group.stored_count, hosts.stored_count + 1);
    }

    #[test]
    fn test_row_key_joins_key_columns() {
        let services = schema().table("services").unwrap();
        let mut row: Row = services
            .stored_columns()
            .map(|c| Value::default_for(c.column_type))
            .collect();
        row[0] = Value::String("web01".into());
        row[1] = Value::String("http".into());
        assert_eq!(services.row_key(&row).unwrap(), "web01;http");

        let comments = schema().table("comments").unwrap();
        let mut row: Row = comments
            .stored_columns()
            .map(|c| Value::default_for(c.column_type))
            .collect();
        row[0] = Value::Int(42);
        assert_eq!(comments.row_key(&row).unwrap(), "42");
    }

    // ---- Values ----

    #[test]
    fn test_value_from_json_is_lenient() {
        assert_eq!(Value::from_json(&json!("17"), ColumnType::Int), Value::Int(17));
        assert_eq!(Value::from_json(&json!(2.9), ColumnType::Int), Value::Int(2));
        assert_eq!(Value::from_json(&json!(null), ColumnType::Float), Value::Float(0.0));
        assert_eq!(Value::from_json(&json!(5), ColumnType::String), Value::String("5".into()));
        assert_eq!(
            Value::from_json(&json!(["a", ["h", "s"]]), ColumnType::StringList),
            Value::StringList(vec!["a".into(), "h;s".into()])
        );
    }

    #[test]
    fn test_custom_variables_accept_map_and_pairs() {
        let from_map = Value::from_json(&json!({"OS": "linux"}), ColumnType::CustomVars);
        let from_pairs = Value::from_json(&json!([["OS", "linux"]]), ColumnType::CustomVars);
        assert_eq!(from_map, from_pairs);
        assert_eq!(from_map.custom_var("os"), Some("linux"));
        assert_eq!(serde_json::to_string(&from_map).unwrap(), r#"{"OS":"linux"}"#);
    }

    #[test]
    fn test_value_sort_order() {
        assert_eq!(Value::Int(2).sort_cmp(&Value::Float(10.0), None), Ordering::Less);
        assert_eq!(Value::String("b".into()).sort_cmp(&Value::String("a".into()), None), Ordering::Greater);
        assert_eq!(Value::Null.sort_cmp(&Value::Int(0), None), Ordering::Less);

        let a = Value::CustomVars(vec![("PRIO".into(), "1".into())]);
        let b = Value::CustomVars(vec![("PRIO".into(), "2".into())]);
        assert_eq!(a.sort_cmp(&b, Some("PRIO")), Ordering::Less);
    }

    // ---- Errors ----

    #[test]
    fn test_error_status_codes() {
        let not_found = MuxError::from(RequestError::TableNotFound("nope".into()));
        assert_eq!(not_found.status_code(), STATUS_NOT_FOUND);
        assert_eq!(not_found.to_string(), "bad request: table nope does not exist");

        let bad = MuxError::from(RequestError::InvalidLimit);
        assert_eq!(bad.status_code(), STATUS_BAD_REQUEST);
        assert_eq!(bad.category(), "request");
        assert_eq!(bad.recovery_hint(), RecoveryHint::FixRequest);

        let peer = MuxError::from(PeerError::connection_failed("/tmp/live", "refused"));
        assert_eq!(peer.status_code(), STATUS_BAD_GATEWAY);
        assert!(peer.is_recoverable());
    }

    #[test]
    fn test_peer_error_failover_classification() {
        assert!(PeerError::connection_failed("a", "x").should_failover());
        assert!(PeerError::timeout("read", Duration::from_secs(1)).should_failover());
        assert!(!PeerError::invalid_response("a", "x").should_failover());
        assert_eq!(
            PeerError::NoSources { peer: "p".into() }.recovery_hint(),
            RecoveryHint::FixConfiguration
        );
    }

    #[test]
    fn test_error_context_wraps_message() {
        let result: Result<(), io::Error> = Err(io::Error::new(io::ErrorKind::Other, "boom"));
        let err = result.mux_context("opening socket").unwrap_err();
        assert!(err.to_string().contains("opening socket"));
        assert!(err.to_string().contains("boom"));
    }

    // ---- Configuration ----

    const SAMPLE_CONFIG: &str = r#"
        [engine]
        update_interval_secs = 3

        [listener]
        listen = ["127.0.0.1:6557", "/tmp/livemux.sock"]

        [[connections]]
        id = "site1"
        name = "Site One"
        source = ["/var/cache/naemon/live", "10.0.0.2:6557"]

        [[connections]]
        id = "site2"
        source = ["10.0.0.3:6557"]
    "#;

    #[test]
    fn test_config_parses_and_defaults() {
        let config = EngineConfig::from_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.engine.update_interval_secs, 3);
        assert_eq!(config.engine.net_timeout_secs, DEFAULT_NET_TIMEOUT_SECS);
        assert_eq!(config.connections.len(), 2);
        assert_eq!(config.connections[0].display_name(), "Site One");
        assert_eq!(config.connections[1].display_name(), "site2");
        assert_eq!(config.update_interval(), Duration::from_secs(3));
        assert_eq!(config.timeouts().connect, Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS));
    }

    #[test]
    fn test_config_rejects_duplicate_ids() {
        let toml = r#"
            [[connections]]
            id = "a"
            source = ["/tmp/a"]
            [[connections]]
            id = "a"
            source = ["/tmp/b"]
        "#;
        let err = EngineConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_config_rejects_missing_sources_and_short_interval() {
        let no_source = "[[connections]]\nid = \"a\"\n";
        assert!(matches!(
            EngineConfig::from_str(no_source).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));

        let no_connections = "[engine]\nupdate_interval_secs = 5\n";
        assert!(matches!(
            EngineConfig::from_str(no_connections).unwrap_err(),
            ConfigError::MissingField { .. }
        ));

        let too_fast = "[engine]\nupdate_interval_secs = 0\n[[connections]]\nid = \"a\"\nsource = [\"/tmp/a\"]\n";
        assert!(EngineConfig::from_str(too_fast).is_err());
    }

    #[test]
    fn test_generated_config_is_valid() {
        let text = EngineConfig::generate_default_config();
        let config = EngineConfig::from_str(&text).unwrap();
        assert_eq!(config.connections[0].id, "site1");
        assert_eq!(config.listener.listen, vec![DEFAULT_LISTEN_ADDRESS.to_string()]);
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livemux.toml");
        fs::write(&path, SAMPLE_CONFIG).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.connections[0].source.len(), 2);

        let missing = EngineConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::FileNotFound { .. }));
    }

    // ---- CLI & Engine ----

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["livemux", "--config", "/etc/livemux.toml", "validate", "--verbose"]);
        assert_eq!(cli.config, PathBuf::from("/etc/livemux.toml"));
        assert!(matches!(cli.command, Some(Commands::Validate { verbose: true })));

        let cli = Cli::parse_from(["livemux", "query", "--address", "/tmp/live", "GET status"]);
        match cli.command {
            Some(Commands::Query { address, request }) => {
                assert_eq!(address, "/tmp/live");
                assert_eq!(request, "GET status");
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::parse_from(["livemux"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_engine_builds_one_peer_per_connection() {
        let config = EngineConfig::from_str(SAMPLE_CONFIG).unwrap();
        let engine = Engine::new(config).unwrap();
        let ids: Vec<&str> = engine.peer_map().peers().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["site1", "site2"]);
        assert!(!engine.is_running());
        assert_eq!(engine.peer_map().peers()[0].status(), PEER_STATUS_PENDING);
    }

    #[tokio::test]
    async fn test_engine_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("livemux.sock");
        let mut config = EngineConfig::default();
        config.listener.listen = vec![socket.display().to_string()];
        config.connections.push(ConnectionConfig {
            id: "dead".into(),
            name: String::new(),
            source: vec![dir.path().join("nothing-here").display().to_string()],
        });

        let engine = Arc::new(Engine::new(config).unwrap());
        let runner = Arc::clone(&engine);
        let task = tokio::spawn(async move { runner.run().await });

        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(socket.exists());
        engine.shutdown();

        let result = timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(!engine.is_running());
        assert!(!socket.exists());
    }
}


// ============================================================================
// ██████╗ ██╗  ██╗ █████╗ ███████╗███████╗    ██████╗ 
// ██╔══██╗██║  ██║██╔══██╗██╔════╝██╔════╝    ╚════██╗
// ██████╔╝███████║███████║███████╗█████╗       █████╔╝
// ██╔═══╝ ██╔══██║██╔══██║╚════██║██╔══╝      ██╔═══╝ 
// ██║     ██║  ██║██║  ██║███████║███████╗    ███████╗
// ╚═╝     ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝╚══════╝    ╚══════╝
// THE QUERY LANGUAGE - REQUESTS, FILTERS, STATS
// ============================================================================

// ============================================================================
// SECTION 11: REQUEST PARSER
// ============================================================================
// Turns the line based request text into a structured Request:
// - `GET <table>` followed by header lines, or `COMMAND [<ts>] <text>`
// - requests end at a blank line or at the end of the input
// - concatenated requests are parsed one at a time, reporting bytes consumed
// - filter and stats groups are built on explicit per-parse stacks
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Request Types
// ----------------------------------------------------------------------------

/// Encoding of the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Plain array of row arrays
    #[default]
    Json,
    /// Object with data, total and failed backends
    WrappedJson,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::WrappedJson => "wrapped_json",
        }
    }
}

/// Framing of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseHeader {
    #[default]
    None,
    /// `<status> <length>\n`, 16 bytes
    Fixed16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// One `Sort:` header.
#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub name: CompactString,
    pub direction: SortDirection,
    /// Position within the response columns
    pub index: usize,
    /// Custom variable name for sorts on variable maps
    pub args: Option<CompactString>,
}

/// A parsed client request, either a query or a command.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Target table, `None` for commands
    pub table: Option<Arc<Table>>,
    /// Full `COMMAND [...] ...` line
    pub command: Option<String>,
    /// Columns as requested
    pub columns: Vec<CompactString>,
    /// Filter stack; top-level nodes are combined with And
    pub filter: Vec<FilterNode>,
    pub stats: Vec<StatsSpec>,
    pub sort: Vec<SortField>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub backends: Vec<CompactString>,
    pub output_format: Option<OutputFormat>,
    pub response_header: ResponseHeader,
    pub wait_trigger: Option<CompactString>,
    pub wait_object: Option<CompactString>,
    /// Milliseconds
    pub wait_timeout: Option<u64>,
    pub wait_condition: Vec<FilterNode>,
    pub keepalive: Option<bool>,
    /// Resolved response layout
    pub output_columns: Vec<Column>,
}

// ----------------------------------------------------------------------------
// 11.2 Parsing
// ----------------------------------------------------------------------------

/// Byte offsets of the first request in a buffer.
///
/// Lines are judged after trimming whitespace, so `\r\n` line ends and
/// whitespace-only lines delimit requests like a bare `\n` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame {
    /// First byte after the leading blank lines
    pub start: usize,
    /// End of the request text
    pub end: usize,
    /// Bytes up to and including the terminating blank line, once one is seen
    pub terminated: Option<usize>,
}

impl RequestFrame {
    pub fn locate(input: &[u8]) -> Self {
        let mut start = 0;
        let mut in_request = false;
        let mut line_start = 0;

        while line_start < input.len() {
            let newline = memchr(b'\n', &input[line_start..]).map(|i| line_start + i);
            let line_end = newline.unwrap_or(input.len());
            let blank = input[line_start..line_end].iter().all(u8::is_ascii_whitespace);
            match newline {
                Some(newline) if blank && in_request => {
                    return Self { start, end: line_start, terminated: Some(newline + 1) };
                }
                Some(newline) if blank => start = newline + 1,
                _ if !blank => in_request = true,
                _ => {}
            }
            match newline {
                Some(newline) => line_start = newline + 1,
                None => break,
            }
        }
        Self { start, end: input.len(), terminated: None }
    }
}

impl Request {
    /// Parses the first request in `input`.
    ///
    /// Returns the request and the number of bytes it occupied, including the
    /// terminating blank line and any blank lines in front of it.
    pub fn parse(input: &[u8]) -> RequestResult<(Request, usize)> {
        let frame = RequestFrame::locate(input);
        let body = &input[frame.start..frame.end];
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(RequestError::Empty);
        }

        let consumed = frame.terminated.unwrap_or(input.len());
        let text = String::from_utf8_lossy(body);
        let mut lines = text.split('\n').map(|line| line.trim_end());

        let first = lines.next().unwrap_or_default().trim();
        let mut request = Request::default();
        let (verb, rest) = split_token(first);
        match verb {
            "GET" => {
                let name = rest.trim();
                if name.is_empty() {
                    return Err(RequestError::MissingTable(first.to_string()));
                }
                let table = schema()
                    .table(name)
                    .cloned()
                    .ok_or_else(|| RequestError::TableNotFound(name.to_string()))?;
                request.table = Some(table);
            }
            "COMMAND" if !rest.is_empty() => request.command = Some(first.to_string()),
            _ => return Err(RequestError::UnknownVerb(first.to_string())),
        }

        let table = request.table.clone();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            request.apply_header(table.as_deref(), line)?;
        }

        if request.table.is_some() {
            request.validate_wait()?;
            request.build_response_indexes()?;
        }
        Ok((request, consumed))
    }

    /// Parses a single request from text.
    pub fn parse_str(text: &str) -> RequestResult<Request> {
        Self::parse(text.as_bytes()).map(|(request, _)| request)
    }

    fn apply_header(&mut self, table: Option<&Table>, line: &str) -> RequestResult<()> {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| RequestError::MalformedHeader(line.to_string()))?;
        let keyword = key.trim();
        let value = value.trim();

        match keyword.to_ascii_lowercase().as_str() {
            "backends" => {
                self.backends.extend(value.split_whitespace().map(|b| b.to_compact_string()));
                return Ok(());
            }
            "keepalive" => {
                self.keepalive = Some(match value.to_ascii_lowercase().as_str() {
                    "on" => true,
                    "off" => false,
                    _ => return Err(RequestError::InvalidKeepalive { line: line.to_string() }),
                });
                return Ok(());
            }
            "responseheader" => {
                if !value.eq_ignore_ascii_case("fixed16") {
                    return Err(RequestError::InvalidResponseHeader);
                }
                self.response_header = ResponseHeader::Fixed16;
                return Ok(());
            }
            "outputformat" => {
                self.output_format = Some(match value.to_ascii_lowercase().as_str() {
                    "json" => OutputFormat::Json,
                    "wrapped_json" => OutputFormat::WrappedJson,
                    _ => return Err(RequestError::InvalidOutputFormat),
                });
                return Ok(());
            }
            _ => {}
        }

        // Everything below needs a target table.
        let Some(table) = table else {
            return Err(RequestError::UnrecognizedHeader(line.to_string()));
        };

        match keyword.to_ascii_lowercase().as_str() {
            "columns" => {
                self.columns.extend(value.split_whitespace().map(|c| c.to_compact_string()));
            }
            "filter" => {
                let leaf = FilterLeaf::parse(table, value, line, RequestError::InvalidFilter)?;
                self.filter.push(FilterNode::Leaf(leaf));
            }
            "and" | "or" => {
                let count = parse_group_count(keyword, value, line)?;
                let operator = if keyword.eq_ignore_ascii_case("and") {
                    GroupOperator::And
                } else {
                    GroupOperator::Or
                };
                FilterNode::group_stack(&mut self.filter, operator, count, line)?;
            }
            "stats" => self.stats.push(StatsSpec::parse(table, value, line)?),
            "statsand" | "statsor" => {
                let count = parse_group_count(keyword, value, line)?;
                let operator = if keyword.eq_ignore_ascii_case("statsand") {
                    GroupOperator::And
                } else {
                    GroupOperator::Or
                };
                StatsSpec::group_stack(&mut self.stats, operator, count, line)?;
            }
            "sort" => self.sort.push(parse_sort(table, value)?),
            "limit" => self.limit = Some(parse_non_negative(value).ok_or(RequestError::InvalidLimit)?),
            "offset" => self.offset = Some(parse_non_negative(value).ok_or(RequestError::InvalidOffset)?),
            "waittrigger" => self.wait_trigger = Some(value.to_compact_string()),
            "waitobject" => self.wait_object = Some(value.to_compact_string()),
            "waittimeout" => {
                let millis = parse_non_negative(value).ok_or(RequestError::InvalidWaitTimeout)?;
                self.wait_timeout = Some(millis as u64);
            }
            "waitcondition" => {
                let leaf = FilterLeaf::parse(table, value, line, RequestError::InvalidFilter)?;
                self.wait_condition.push(FilterNode::Leaf(leaf));
            }
            "waitconditionand" | "waitconditionor" => {
                let count = parse_group_count(keyword, value, line)?;
                let operator = if keyword.eq_ignore_ascii_case("waitconditionand") {
                    GroupOperator::And
                } else {
                    GroupOperator::Or
                };
                FilterNode::group_stack(&mut self.wait_condition, operator, count, line)?;
            }
            _ => return Err(RequestError::UnrecognizedHeader(line.to_string())),
        }
        Ok(())
    }

    fn validate_wait(&self) -> RequestResult<()> {
        if self.wait_trigger.is_none() {
            return Ok(());
        }
        if self.wait_condition.is_empty() {
            return Err(RequestError::WaitWithoutCondition);
        }
        if self.wait_timeout.is_none() {
            return Err(RequestError::WaitWithoutTimeout);
        }
        if self.wait_object.is_none() {
            return Err(RequestError::WaitWithoutObject);
        }
        Ok(())
    }

    /// Resolves the response columns and the sort indexes into them.
    pub fn build_response_indexes(&mut self) -> RequestResult<()> {
        let Some(table) = self.table.clone() else {
            return Ok(());
        };

        self.output_columns = if !self.columns.is_empty() {
            self.columns
                .iter()
                .map(|name| table.column(name).cloned().unwrap_or_else(|| Column::unknown(name)))
                .collect()
        } else if self.stats.is_empty() {
            table.columns.clone()
        } else {
            Vec::new()
        };

        for sort in &mut self.sort {
            let canonical = table.column(&sort.name).map(|c| c.name.clone());
            let position = self.output_columns.iter().position(|c| {
                c.name == sort.name || canonical.as_ref().map_or(false, |name| *name == c.name)
            });
            sort.index = position.ok_or_else(|| RequestError::SortColumnNotInResult(sort.name.to_string()))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn is_command(&self) -> bool {
        self.command.is_some()
    }

    pub fn is_stats(&self) -> bool {
        !self.stats.is_empty()
    }

    /// Columns and Stats together aggregate per distinct column tuple.
    pub fn is_group_by(&self) -> bool {
        !self.stats.is_empty() && !self.columns.is_empty()
    }

    pub fn table_name(&self) -> &str {
        self.table.as_ref().map(|t| t.name.as_str()).unwrap_or_default()
    }

    pub fn format(&self) -> OutputFormat {
        self.output_format.unwrap_or_default()
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive.unwrap_or(false)
    }

    pub fn wait_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.wait_timeout.unwrap_or(0))
    }

    // ------------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------------

    /// Writes the request back in canonical header order.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(command) = &self.command {
            out.push_str(command);
            out.push('\n');
        } else if let Some(table) = &self.table {
            out.push_str(&format!("GET {}\n", table.name));
        }
        if !self.columns.is_empty() {
            out.push_str(&format!("Columns: {}\n", self.columns.join(" ")));
        }
        for node in &self.filter {
            node.write_to(&mut out, FILTER_KEYWORDS);
        }
        for spec in &self.stats {
            spec.write_to(&mut out);
        }
        for sort in &self.sort {
            match &sort.args {
                Some(args) => out.push_str(&format!("Sort: {} {} {}\n", sort.name, args, sort.direction.as_str())),
                None => out.push_str(&format!("Sort: {} {}\n", sort.name, sort.direction.as_str())),
            }
        }
        if let Some(limit) = self.limit {
            out.push_str(&format!("Limit: {}\n", limit));
        }
        if let Some(offset) = self.offset {
            out.push_str(&format!("Offset: {}\n", offset));
        }
        if !self.backends.is_empty() {
            out.push_str(&format!("Backends: {}\n", self.backends.join(" ")));
        }
        if let Some(format) = self.output_format {
            out.push_str(&format!("OutputFormat: {}\n", format.as_str()));
        }
        if self.response_header == ResponseHeader::Fixed16 {
            out.push_str("ResponseHeader: fixed16\n");
        }
        if let Some(trigger) = &self.wait_trigger {
            out.push_str(&format!("WaitTrigger: {}\n", trigger));
        }
        if let Some(object) = &self.wait_object {
            out.push_str(&format!("WaitObject: {}\n", object));
        }
        if let Some(timeout) = self.wait_timeout {
            out.push_str(&format!("WaitTimeout: {}\n", timeout));
        }
        for node in &self.wait_condition {
            node.write_to(&mut out, WAIT_KEYWORDS);
        }
        if let Some(keepalive) = self.keepalive {
            out.push_str(&format!("Keepalive: {}\n", if keepalive { "on" } else { "off" }));
        }
        out.push('\n');
        out
    }

    /// Request forwarded upstream for passthrough tables: all stored
    /// columns, plus the filters upstream can evaluate on its own.
    pub fn passthrough_text(&self) -> String {
        let Some(table) = &self.table else {
            return String::new();
        };
        let mut out = table_dump_request_head(table);
        for node in self.filter.iter().filter(|n| n.is_upstream_safe()) {
            node.write_to(&mut out, FILTER_KEYWORDS);
        }
        out.push_str("OutputFormat: json\nResponseHeader: fixed16\n\n");
        out
    }
}

impl Display for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl FilterNode {
    /// True when every leaf refers to a column the upstream stores itself.
    pub fn is_upstream_safe(&self) -> bool {
        match self {
            FilterNode::Leaf(leaf) => leaf.column.is_stored(),
            FilterNode::Group { children, .. } => children.iter().all(FilterNode::is_upstream_safe),
        }
    }
}

fn parse_non_negative(value: &str) -> Option<usize> {
    value.trim().parse::<i64>().ok().filter(|v| *v >= 0).map(|v| v as usize)
}

fn parse_group_count(keyword: &str, value: &str, line: &str) -> RequestResult<usize> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|count| *count > 0)
        .ok_or_else(|| RequestError::invalid_group_count(keyword, line))
}

fn parse_sort(table: &Table, value: &str) -> RequestResult<SortField> {
    let tokens: SmallVec<[&str; 3]> = value.split_whitespace().collect();
    let is_custom_vars = |name: &str| {
        table.column(name).map_or(false, |c| c.column_type == ColumnType::CustomVars)
            || name.ends_with("custom_variables")
    };
    let (name, args, direction) = match tokens.as_slice() {
        [name, direction] => (*name, None, *direction),
        [name, args, direction] if is_custom_vars(name) => (*name, Some(*args), *direction),
        _ => return Err(RequestError::InvalidSortHeader),
    };
    let direction = match direction.to_ascii_lowercase().as_str() {
        "asc" => SortDirection::Asc,
        "desc" => SortDirection::Desc,
        _ => return Err(RequestError::InvalidSortDirection),
    };
    Ok(SortField {
        name: name.to_compact_string(),
        direction,
        index: 0,
        args: args.map(|a| a.to_compact_string()),
    })
}

/// `GET <table>` and the list of stored columns.
pub fn table_dump_request_head(table: &Table) -> String {
    let columns: Vec<&str> = table.stored_columns().map(|c| c.name.as_str()).collect();
    format!("GET {}\nColumns: {}\n", table.name, columns.join(" "))
}

// ============================================================================
// SECTION 12: FILTER ENGINE
// ============================================================================
// Filter trees bound to schema columns at parse time, evaluated per row with
// type-aware comparison:
// - numeric columns compare numerically even though literals arrive as text
// - list columns implement membership instead of ordering
// - custom variable maps compare the value stored under a named key
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Operators
// ----------------------------------------------------------------------------

/// Comparison operator of a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `=~`
    EqualNocase,
    /// `!=~`
    NotEqualNocase,
    /// `~`
    RegexMatch,
    /// `!~`
    RegexNoMatch,
    /// `~~`
    RegexMatchNocase,
    /// `!~~`
    RegexNoMatchNocase,
    /// `<`
    Less,
    /// `>`
    Greater,
    /// `<=`
    LessEqual,
    /// `>=`
    GreaterEqual,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Equal => "=",
            FilterOperator::NotEqual => "!=",
            FilterOperator::EqualNocase => "=~",
            FilterOperator::NotEqualNocase => "!=~",
            FilterOperator::RegexMatch => "~",
            FilterOperator::RegexNoMatch => "!~",
            FilterOperator::RegexMatchNocase => "~~",
            FilterOperator::RegexNoMatchNocase => "!~~",
            FilterOperator::Less => "<",
            FilterOperator::Greater => ">",
            FilterOperator::LessEqual => "<=",
            FilterOperator::GreaterEqual => ">=",
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(
            self,
            FilterOperator::RegexMatch
                | FilterOperator::RegexNoMatch
                | FilterOperator::RegexMatchNocase
                | FilterOperator::RegexNoMatchNocase
        )
    }

    pub fn is_nocase(&self) -> bool {
        matches!(
            self,
            FilterOperator::EqualNocase
                | FilterOperator::NotEqualNocase
                | FilterOperator::RegexMatchNocase
                | FilterOperator::RegexNoMatchNocase
        )
    }

    pub fn is_negated(&self) -> bool {
        matches!(
            self,
            FilterOperator::NotEqual
                | FilterOperator::NotEqualNocase
                | FilterOperator::RegexNoMatch
                | FilterOperator::RegexNoMatchNocase
        )
    }
}

impl FromStr for FilterOperator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "=" => FilterOperator::Equal,
            "!=" => FilterOperator::NotEqual,
            "=~" => FilterOperator::EqualNocase,
            "!=~" => FilterOperator::NotEqualNocase,
            "~" => FilterOperator::RegexMatch,
            "!~" => FilterOperator::RegexNoMatch,
            "~~" => FilterOperator::RegexMatchNocase,
            "!~~" => FilterOperator::RegexNoMatchNocase,
            "<" => FilterOperator::Less,
            ">" => FilterOperator::Greater,
            "<=" => FilterOperator::LessEqual,
            ">=" => FilterOperator::GreaterEqual,
            _ => return Err(()),
        })
    }
}

impl Display for FilterOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combinator of a filter group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOperator {
    And,
    Or,
}

impl GroupOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupOperator::And => "And",
            GroupOperator::Or => "Or",
        }
    }
}

// ----------------------------------------------------------------------------
// 12.2 Filter Tree
// ----------------------------------------------------------------------------

/// Comparison value compiled for the column type and operator.
#[derive(Debug, Clone)]
pub enum FilterValue {
    Text(CompactString),
    Number(f64),
    Pattern(Regex),
    /// Regex on a numeric column, never matches
    Never,
}

/// A single comparison `<column> <operator> [<custom key>] <value>`.
#[derive(Debug, Clone)]
pub struct FilterLeaf {
    /// Column name as written by the client
    pub name: CompactString,
    pub column: Column,
    pub operator: FilterOperator,
    /// Variable name for custom variable filters
    pub custom_key: Option<CompactString>,
    /// Literal as written by the client
    pub raw: CompactString,
    pub value: FilterValue,
}

/// A node of the filter tree.
#[derive(Debug, Clone)]
pub enum FilterNode {
    Leaf(FilterLeaf),
    Group {
        operator: GroupOperator,
        children: Vec<FilterNode>,
    },
}

/// Header keywords used when writing a filter tree back out.
#[derive(Debug, Clone, Copy)]
pub struct FilterKeywords {
    pub leaf: &'static str,
    pub and: &'static str,
    pub or: &'static str,
}

pub const FILTER_KEYWORDS: FilterKeywords = FilterKeywords {
    leaf: "Filter",
    and: "And",
    or: "Or",
};

pub const STATS_KEYWORDS: FilterKeywords = FilterKeywords {
    leaf: "Stats",
    and: "StatsAnd",
    or: "StatsOr",
};

pub const WAIT_KEYWORDS: FilterKeywords = FilterKeywords {
    leaf: "WaitCondition",
    and: "WaitConditionAnd",
    or: "WaitConditionOr",
};

impl FilterLeaf {
    /// Parses `<column> <operator> <value>` against `table`.
    ///
    /// `line` is the complete header line, used in error messages. `arity`
    /// is the error reported when column or operator are missing.
    pub fn parse(table: &Table, text: &str, line: &str, arity: RequestError) -> RequestResult<Self> {
        let (name, rest) = split_token(text.trim());
        let (operator, rest) = split_token(rest);
        if name.is_empty() || operator.is_empty() {
            return Err(arity);
        }

        let column = table.column(name).cloned().ok_or_else(|| RequestError::UnknownFilterColumn {
            column: name.to_string(),
            line: line.to_string(),
        })?;
        let operator = FilterOperator::from_str(operator).map_err(|_| RequestError::UnknownOperator {
            operator: operator.to_string(),
            line: line.to_string(),
        })?;

        let mut literal = rest.trim();
        let mut custom_key = None;
        if column.column_type == ColumnType::CustomVars {
            let (key, value) = split_token(literal);
            if key.is_empty() {
                return Err(RequestError::InvalidCustomVarFilter { line: line.to_string() });
            }
            custom_key = Some(key.to_compact_string());
            literal = value.trim();
        }

        let value = Self::compile_value(&column, operator, literal, line)?;
        Ok(Self {
            name: name.to_compact_string(),
            column,
            operator,
            custom_key,
            raw: literal.to_compact_string(),
            value,
        })
    }

    fn compile_value(column: &Column, operator: FilterOperator, literal: &str, line: &str) -> RequestResult<FilterValue> {
        let numeric = column.column_type.is_numeric() || column.column_type == ColumnType::IntList;
        if numeric {
            if operator.is_regex() {
                return Ok(FilterValue::Never);
            }
            if literal.is_empty() {
                return Ok(FilterValue::Number(0.0));
            }
            return literal
                .parse::<f64>()
                .map(FilterValue::Number)
                .map_err(|_| RequestError::InvalidNumber {
                    value: literal.to_string(),
                    line: line.to_string(),
                });
        }

        if operator.is_regex() {
            let regex = RegexBuilder::new(literal)
                .case_insensitive(operator.is_nocase())
                .build()
                .map_err(|e| RequestError::InvalidRegex {
                    message: e.to_string(),
                    line: line.to_string(),
                })?;
            return Ok(FilterValue::Pattern(regex));
        }

        if operator.is_nocase() {
            return Ok(FilterValue::Text(literal.to_lowercase().to_compact_string()));
        }
        Ok(FilterValue::Text(literal.to_compact_string()))
    }

    pub fn matches(&self, row: &RowView<'_>) -> bool {
        let value = row.value(&self.column);
        match value.as_ref() {
            Value::Int(_) | Value::Float(_) => match (value.as_f64(), &self.value) {
                (Some(actual), FilterValue::Number(expected)) => compare_numbers(self.operator, actual, *expected),
                _ => false,
            },
            Value::String(s) => self.match_text(s),
            Value::StringList(items) => self.match_string_list(items),
            Value::IntList(items) => self.match_int_list(items),
            Value::CustomVars(_) => {
                let key = self.custom_key.as_deref().unwrap_or_default();
                self.match_text(value.custom_var(key).unwrap_or_default())
            }
            Value::Null => self.match_text(""),
        }
    }

    fn match_text(&self, actual: &str) -> bool {
        match &self.value {
            FilterValue::Pattern(regex) => regex.is_match(actual) != self.operator.is_negated(),
            FilterValue::Text(expected) => match self.operator {
                FilterOperator::Equal => actual == expected.as_str(),
                FilterOperator::NotEqual => actual != expected.as_str(),
                FilterOperator::EqualNocase => actual.to_lowercase() == expected.as_str(),
                FilterOperator::NotEqualNocase => actual.to_lowercase() != expected.as_str(),
                FilterOperator::Less => actual < expected.as_str(),
                FilterOperator::Greater => actual > expected.as_str(),
                FilterOperator::LessEqual => actual <= expected.as_str(),
                FilterOperator::GreaterEqual => actual >= expected.as_str(),
                _ => false,
            },
            // Numeric literal against a text value, compare the text forms.
            FilterValue::Number(_) => actual == self.raw.as_str(),
            FilterValue::Never => false,
        }
    }

    fn match_string_list(&self, items: &[CompactString]) -> bool {
        let contains = |needle: &str| items.iter().any(|item| item.as_str() == needle);
        let contains_nocase = |needle: &str| items.iter().any(|item| item.to_lowercase() == needle.to_lowercase());
        match &self.value {
            FilterValue::Pattern(regex) => {
                let any = items.iter().any(|item| regex.is_match(item));
                any != self.operator.is_negated()
            }
            FilterValue::Text(expected) => match self.operator {
                FilterOperator::Equal if expected.is_empty() => items.is_empty(),
                FilterOperator::NotEqual if expected.is_empty() => !items.is_empty(),
                FilterOperator::Equal | FilterOperator::GreaterEqual => contains(expected.as_str()),
                FilterOperator::NotEqual | FilterOperator::Less => !contains(expected.as_str()),
                FilterOperator::EqualNocase | FilterOperator::LessEqual => contains_nocase(expected.as_str()),
                FilterOperator::NotEqualNocase | FilterOperator::Greater => !contains_nocase(expected.as_str()),
                _ => false,
            },
            FilterValue::Number(_) | FilterValue::Never => false,
        }
    }

    fn match_int_list(&self, items: &[i64]) -> bool {
        let expected = match &self.value {
            FilterValue::Number(n) => *n,
            _ => return false,
        };
        let contains = items.iter().any(|item| *item as f64 == expected);
        match self.operator {
            FilterOperator::Equal if self.raw.is_empty() => items.is_empty(),
            FilterOperator::NotEqual if self.raw.is_empty() => !items.is_empty(),
            FilterOperator::Equal | FilterOperator::GreaterEqual | FilterOperator::EqualNocase | FilterOperator::LessEqual => {
                contains
            }
            FilterOperator::NotEqual | FilterOperator::Less | FilterOperator::NotEqualNocase | FilterOperator::Greater => {
                !contains
            }
            _ => false,
        }
    }

    fn write_to(&self, out: &mut String, keyword: &str) {
        let mut line = format!("{}: {} {}", keyword, self.name, self.operator);
        if let Some(key) = &self.custom_key {
            line.push(' ');
            line.push_str(key);
        }
        if !self.raw.is_empty() {
            line.push(' ');
            line.push_str(&self.raw);
        }
        out.push_str(&line);
        out.push('\n');
    }
}

impl FilterNode {
    /// Evaluates the node, short-circuiting groups left to right.
    pub fn matches(&self, row: &RowView<'_>) -> bool {
        match self {
            FilterNode::Leaf(leaf) => leaf.matches(row),
            FilterNode::Group {
                operator: GroupOperator::And,
                children,
            } => children.iter().all(|child| child.matches(row)),
            FilterNode::Group {
                operator: GroupOperator::Or,
                children,
            } => children.iter().any(|child| child.matches(row)),
        }
    }

    /// Pops `count` nodes off `stack` and pushes them back as one group.
    pub fn group_stack(stack: &mut Vec<FilterNode>, operator: GroupOperator, count: usize, line: &str) -> RequestResult<()> {
        if count > stack.len() {
            return Err(RequestError::not_enough_filters(line));
        }
        let children = stack.split_off(stack.len() - count);
        stack.push(FilterNode::Group { operator, children });
        Ok(())
    }

    pub fn write_to(&self, out: &mut String, keywords: FilterKeywords) {
        match self {
            FilterNode::Leaf(leaf) => leaf.write_to(out, keywords.leaf),
            FilterNode::Group { operator, children } => {
                for child in children {
                    child.write_to(out, keywords);
                }
                let keyword = match operator {
                    GroupOperator::And => keywords.and,
                    GroupOperator::Or => keywords.or,
                };
                out.push_str(&format!("{}: {}\n", keyword, children.len()));
            }
        }
    }

    /// Number of children for groups, 1 for leaves.
    pub fn declared_count(&self) -> usize {
        match self {
            FilterNode::Leaf(_) => 1,
            FilterNode::Group { children, .. } => children.len(),
        }
    }
}

/// A row passes when every top-level node matches. No filters match all rows.
pub fn matches_all(filters: &[FilterNode], row: &RowView<'_>) -> bool {
    filters.iter().all(|f| f.matches(row))
}

fn compare_numbers(operator: FilterOperator, actual: f64, expected: f64) -> bool {
    match operator {
        FilterOperator::Equal | FilterOperator::EqualNocase => actual == expected,
        FilterOperator::NotEqual | FilterOperator::NotEqualNocase => actual != expected,
        FilterOperator::Less => actual < expected,
        FilterOperator::Greater => actual > expected,
        FilterOperator::LessEqual => actual <= expected,
        FilterOperator::GreaterEqual => actual >= expected,
        _ => false,
    }
}

/// Splits off the first whitespace separated token.
fn split_token(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(pos) => (&text[..pos], text[pos..].trim_start()),
        None => (text, ""),
    }
}

// ============================================================================
// SECTION 13: STATS ENGINE
// ============================================================================
// Per-request aggregation. Accumulators keep mergeable partial state so the
// peer map can combine results of different peers exactly:
// - counters and sums add up
// - averages carry (sum, count) and divide only when finalized
// - min/max keep the global extreme
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Stats Specs
// ----------------------------------------------------------------------------

/// Numeric reduction applied to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsFunction {
    Sum,
    Avg,
    Min,
    Max,
}

impl StatsFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatsFunction::Sum => "sum",
            StatsFunction::Avg => "avg",
            StatsFunction::Min => "min",
            StatsFunction::Max => "max",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "sum" => Some(StatsFunction::Sum),
            "avg" => Some(StatsFunction::Avg),
            "min" => Some(StatsFunction::Min),
            "max" => Some(StatsFunction::Max),
            _ => None,
        }
    }
}

/// One `Stats:` entry.
#[derive(Debug, Clone)]
pub enum StatsSpec {
    /// Counts rows matching the filter
    Counter(FilterNode),
    /// Reduces a column over all rows passing the request filter
    Reducer {
        function: StatsFunction,
        /// Column name as written by the client
        name: CompactString,
        column: Column,
    },
}

impl StatsSpec {
    /// Parses the value of a `Stats:` header.
    pub fn parse(table: &Table, text: &str, line: &str) -> RequestResult<Self> {
        let tokens: SmallVec<[&str; 3]> = text.split_whitespace().collect();
        if tokens.len() == 2 {
            if let Some(function) = StatsFunction::parse(tokens[0]) {
                let column = table
                    .column(tokens[1])
                    .cloned()
                    .ok_or_else(|| RequestError::UnknownStatsColumn {
                        column: tokens[1].to_string(),
                        line: line.to_string(),
                    })?;
                return Ok(StatsSpec::Reducer {
                    function,
                    name: tokens[1].to_compact_string(),
                    column,
                });
            }
        }
        let leaf = FilterLeaf::parse(table, text, line, RequestError::InvalidStats)?;
        Ok(StatsSpec::Counter(FilterNode::Leaf(leaf)))
    }

    /// Applies `StatsAnd: N`/`StatsOr: N` to the stats stack.
    pub fn group_stack(stack: &mut Vec<StatsSpec>, operator: GroupOperator, count: usize, line: &str) -> RequestResult<()> {
        if count > stack.len() {
            return Err(RequestError::not_enough_filters(line));
        }
        let popped = stack.split_off(stack.len() - count);
        let mut children = Vec::with_capacity(popped.len());
        for spec in popped {
            match spec {
                StatsSpec::Counter(node) => children.push(node),
                StatsSpec::Reducer { .. } => {
                    return Err(RequestError::StatsGroupOfReducers { line: line.to_string() });
                }
            }
        }
        stack.push(StatsSpec::Counter(FilterNode::Group { operator, children }));
        Ok(())
    }

    pub fn accumulator(&self) -> StatsAccumulator {
        match self {
            StatsSpec::Counter(_) => StatsAccumulator::new(StatsKind::Counter),
            StatsSpec::Reducer { function, .. } => StatsAccumulator::new(match function {
                StatsFunction::Sum => StatsKind::Sum,
                StatsFunction::Avg => StatsKind::Avg,
                StatsFunction::Min => StatsKind::Min,
                StatsFunction::Max => StatsKind::Max,
            }),
        }
    }

    pub fn write_to(&self, out: &mut String) {
        match self {
            StatsSpec::Counter(node) => node.write_to(out, STATS_KEYWORDS),
            StatsSpec::Reducer { function, name, .. } => {
                out.push_str(&format!("Stats: {} {}\n", function.as_str(), name));
            }
        }
    }

    /// Feeds one row (already passing the request filter) into `acc`.
    pub fn observe(&self, acc: &mut StatsAccumulator, row: &RowView<'_>) {
        match self {
            StatsSpec::Counter(filter) => {
                if filter.matches(row) {
                    acc.count += 1;
                }
            }
            StatsSpec::Reducer { column, .. } => acc.observe(row.value(column).as_f64()),
        }
    }
}

// ----------------------------------------------------------------------------
// 13.2 Accumulators
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsKind {
    Counter,
    Sum,
    Avg,
    Min,
    Max,
}

/// Mergeable partial aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsAccumulator {
    pub kind: StatsKind,
    /// Matching rows for counters, numeric samples for reducers
    pub count: u64,
    pub sum: f64,
    /// Tracked minimum or maximum
    pub extreme: Option<f64>,
}

impl StatsAccumulator {
    pub fn new(kind: StatsKind) -> Self {
        Self {
            kind,
            count: 0,
            sum: 0.0,
            extreme: None,
        }
    }

    /// Records one sample. Non-numeric samples are skipped.
    pub fn observe(&mut self, sample: Option<f64>) {
        let Some(value) = sample else {
            return;
        };
        self.count += 1;
        self.sum += value;
        self.extreme = match (self.kind, self.extreme) {
            (_, None) => Some(value),
            (StatsKind::Min, Some(current)) if value < current => Some(value),
            (StatsKind::Max, Some(current)) if value > current => Some(value),
            (_, current) => current,
        };
    }

    pub fn merge(&mut self, other: &StatsAccumulator) {
        self.count += other.count;
        self.sum += other.sum;
        self.extreme = match (self.extreme, other.extreme) {
            (None, theirs) => theirs,
            (ours, None) => ours,
            (Some(a), Some(b)) => Some(match self.kind {
                StatsKind::Min => a.min(b),
                _ => a.max(b),
            }),
        };
    }

    /// Final value of the aggregate.
    pub fn finalize(&self) -> Value {
        match self.kind {
            StatsKind::Counter => Value::Int(self.count as i64),
            StatsKind::Sum => Value::Float(self.sum),
            StatsKind::Avg if self.count == 0 => Value::Float(0.0),
            StatsKind::Avg => Value::Float(self.sum / self.count as f64),
            StatsKind::Min | StatsKind::Max => Value::Float(self.extreme.unwrap_or(0.0)),
        }
    }
}

/// Fresh accumulators for a list of specs.
pub fn new_accumulators(specs: &[StatsSpec]) -> Vec<StatsAccumulator> {
    specs.iter().map(StatsSpec::accumulator).collect()
}

pub fn observe_row(specs: &[StatsSpec], accumulators: &mut [StatsAccumulator], row: &RowView<'_>) {
    for (spec, acc) in specs.iter().zip(accumulators.iter_mut()) {
        spec.observe(acc, row);
    }
}

pub fn merge_accumulators(into: &mut [StatsAccumulator], from: &[StatsAccumulator]) {
    for (ours, theirs) in into.iter_mut().zip(from) {
        ours.merge(theirs);
    }
}

// ----------------------------------------------------------------------------
// 13.3 Group-By Aggregation
// ----------------------------------------------------------------------------

/// Accumulators partitioned by the tuple of requested column values.
/// Groups keep first-seen order.
#[derive(Debug, Clone, Default)]
pub struct GroupedStats {
    groups: Vec<(Row, Vec<StatsAccumulator>)>,
    index: AHashMap<String, usize>,
}

impl GroupedStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_of(values: &[Value]) -> String {
        let mut key = String::new();
        for value in values {
            value.write_group_key(&mut key);
        }
        key
    }

    /// Accumulators of the group `key`, created from `specs` if new.
    pub fn group_mut(&mut self, key: Row, specs: &[StatsSpec]) -> &mut Vec<StatsAccumulator> {
        let hash_key = Self::key_of(&key);
        let idx = match self.index.get(&hash_key) {
            Some(idx) => *idx,
            None => {
                self.groups.push((key, new_accumulators(specs)));
                self.index.insert(hash_key, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        &mut self.groups[idx].1
    }

    /// Unions groups by key, merging the accumulators of shared groups.
    pub fn merge(&mut self, other: GroupedStats) {
        for (key, accumulators) in other.groups {
            let hash_key = Self::key_of(&key);
            match self.index.get(&hash_key) {
                Some(idx) => merge_accumulators(&mut self.groups[*idx].1, &accumulators),
                None => {
                    self.groups.push((key, accumulators));
                    self.index.insert(hash_key, self.groups.len() - 1);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Output rows: key columns followed by final stats values.
    pub fn into_rows(self) -> Vec<Row> {
        self.groups
            .into_iter()
            .map(|(mut key, accumulators)| {
                key.extend(accumulators.iter().map(StatsAccumulator::finalize));
                key
            })
            .collect()
    }
}

/// Partial stats state produced by one peer.
#[derive(Debug, Clone)]
pub enum PartialStats {
    Single(Vec<StatsAccumulator>),
    Grouped(GroupedStats),
}

impl PartialStats {
    pub fn merge(&mut self, other: PartialStats) {
        match (self, other) {
            (PartialStats::Single(ours), PartialStats::Single(theirs)) => merge_accumulators(ours, &theirs),
            (PartialStats::Grouped(ours), PartialStats::Grouped(theirs)) => ours.merge(theirs),
            _ => {}
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            PartialStats::Single(accumulators) => vec![accumulators.iter().map(StatsAccumulator::finalize).collect()],
            PartialStats::Grouped(groups) => groups.into_rows(),
        }
    }
}

// ============================================================================
// SECTION 14: PHASE 2 TESTS
// ============================================================================

#[cfg(test)]
mod phase2_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;

    fn parse(text: &str) -> Request {
        Request::parse_str(text).unwrap_or_else(|e| panic!("{:?} failed: {}", text, e))
    }

    fn parse_err(text: &str) -> String {
        match Request::parse_str(text) {
            Ok(request) => panic!("{:?} parsed into {:?}", text, request),
            Err(e) => e.to_string(),
        }
    }

    /// A `table` row with defaults everywhere except `values`.
    fn row_for(table: &Table, values: &[(&str, Value)]) -> Row {
        let mut row: Row = table
            .stored_columns()
            .map(|c| Value::default_for(c.column_type))
            .collect();
        for (name, value) in values {
            match table.column(name).map(|c| &c.kind) {
                Some(ColumnKind::Stored { slot }) => row[*slot] = value.clone(),
                other => panic!("{} is not stored: {:?}", name, other),
            }
        }
        row
    }

    fn gearman() -> Row {
        row_for(
            schema().table("hosts").unwrap(),
            &[
                ("name", Value::String("gearman".into())),
                ("state", Value::Int(0)),
                ("latency", Value::Float(0.75)),
                ("last_check", Value::Int(1_473_760_500)),
                ("groups", Value::StringList(vec!["linux".into(), "web".into()])),
                ("comments", Value::IntList(vec![5, 7])),
                ("custom_variables", Value::CustomVars(vec![("OS".into(), "linux".into())])),
            ],
        )
    }

    fn host_matches(filter: &str) -> bool {
        let request = parse(&format!("GET hosts\n{}\n\n", filter));
        let row = gearman();
        let ctx = RowContext::new("site1", "Site One");
        matches_all(&request.filter, &RowView::new(&row, &ctx))
    }

    // ---- Parser: round trips ----

    const ROUND_TRIPS: &[&str] = &[
        "GET hosts\n\n",
        "GET hosts\nColumns: name state\n\n",
        "GET hosts\nColumns: name state\nFilter: state != 1\n\n",
        "GET hosts\nOutputFormat: wrapped_json\n\n",
        "GET hosts\nResponseHeader: fixed16\n\n",
        "GET hosts\nColumns: name state\nFilter: state != 1\nFilter: is_executing = 1\nOr: 2\n\n",
        "GET hosts\nColumns: name state\nFilter: state != 1\nFilter: is_executing = 1\nAnd: 2\nFilter: state = 1\nOr: 2\nFilter: name = test\n\n",
        "GET hosts\nBackends: mockid0\n\n",
        "GET hosts\nLimit: 25\nOffset: 5\n\n",
        "GET hosts\nSort: name asc\nSort: state desc\n\n",
        "GET hosts\nStats: state = 1\nStats: avg latency\nStats: state = 3\nStats: state != 1\nStatsAnd: 2\n\n",
        "GET hosts\nColumns: name\nFilter: name ~~ test\n\n",
        "GET hosts\nColumns: name\nFilter: name !~ Test\n\n",
        "GET hosts\nColumns: name\nFilter: name !~~ test\n\n",
        "GET hosts\nColumns: name\nFilter: custom_variables ~~ TAGS test\n\n",
        "GET hosts\nColumns: name\nFilter: custom_variables = TAGS\n\n",
        "GET hosts\nColumns: name\nFilter: name !=\n\n",
        "COMMAND [123456] TEST\n\n",
        "GET hosts\nColumns: name\nFilter: name = test\nWaitTrigger: all\nWaitObject: test\nWaitTimeout: 10000\nWaitCondition: last_check > 1473760401\n\n",
        "GET hosts\nColumns: name\nFilter: latency != 1.23456789012345\n\n",
        "GET hosts\nColumns: name comments\nFilter: comments >= 1\n\n",
        "GET hosts\nColumns: name contact_groups\nFilter: contact_groups >= test\n\n",
        "GET hosts\nColumns: name\nFilter: last_check >= 123456789\n\n",
        "GET hosts\nColumns: name\nFilter: last_check =\n\n",
        "GET hosts\nKeepalive: on\n\n",
        "GET hosts\nColumns: name\nWaitTrigger: state\nWaitObject: test\nWaitTimeout: 5000\nWaitCondition: state = 1\nWaitCondition: state = 2\nWaitConditionOr: 2\nWaitCondition: has_been_checked = 1\nWaitConditionAnd: 2\n\n",
    ];

    #[test]
    fn test_round_trip() {
        for text in ROUND_TRIPS {
            let request = parse(text);
            assert_eq!(*text, request.serialize());
            assert_eq!(*text, request.to_string());
        }
    }

    // ---- Parser: headers ----

    #[test]
    fn test_header_table_limit_offset_columns() {
        assert_eq!(parse("GET hosts\n").table_name(), "hosts");
        assert_eq!(parse("GET hosts\nLimit: 10\n").limit, Some(10));
        assert_eq!(parse("GET hosts\nOffset: 3\n").offset, Some(3));
        assert_eq!(parse("GET hosts\nColumns: name state\n").columns, vec!["name", "state"]);
    }

    #[test]
    fn test_header_keys_are_case_insensitive() {
        let request = parse("GET hosts\ncolumns: name\nLIMIT: 2\nresponseheader: fixed16\n");
        assert_eq!(request.columns, vec!["name"]);
        assert_eq!(request.limit, Some(2));
        assert_eq!(request.response_header, ResponseHeader::Fixed16);
    }

    #[test]
    fn test_sort_indexes_point_into_response_columns() {
        let request = parse("GET hosts\nColumns: latency state name\nSort: name desc\nSort: state asc\n");
        assert_eq!(
            request.sort,
            vec![
                SortField { name: "name".into(), direction: SortDirection::Desc, index: 2, args: None },
                SortField { name: "state".into(), direction: SortDirection::Asc, index: 1, args: None },
            ]
        );
    }

    #[test]
    fn test_sort_on_custom_variable() {
        let request = parse("GET hosts\nColumns: name custom_variables\nSort: custom_variables TEST asc\n");
        assert_eq!(
            request.sort[0],
            SortField {
                name: "custom_variables".into(),
                direction: SortDirection::Asc,
                index: 1,
                args: Some("TEST".into()),
            }
        );
    }

    #[test]
    fn test_filter_values_are_trimmed() {
        let request = parse("GET hosts\nFilter: state != 1\nFilter: name = with spaces \n");
        assert_eq!(request.filter.len(), 2);
        match &request.filter[1] {
            FilterNode::Leaf(leaf) => {
                assert_eq!(leaf.column.name, "name");
                assert_eq!(leaf.raw, "with spaces");
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_or_groups_two_filters() {
        let request = parse("GET hosts\nColumns: name state\nFilter: state != 1\nFilter: is_executing = 1\nOr: 2\n\n");
        assert_eq!(request.columns, vec!["name", "state"]);
        assert_eq!(request.filter.len(), 1);
        match &request.filter[0] {
            FilterNode::Group { operator, children } => {
                assert_eq!(*operator, GroupOperator::Or);
                assert_eq!(children.len(), 2);
                assert!(children.iter().all(|c| matches!(c, FilterNode::Leaf(_))));
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_wait_conditions_group_like_filters() {
        let request = parse(
            "GET hosts\nWaitTrigger: check\nWaitObject: gearman\nWaitTimeout: 1000\nWaitCondition: state = 1\nWaitCondition: name = gearman\nWaitConditionOr: 2\n",
        );
        assert_eq!(request.wait_condition.len(), 1);
        assert_eq!(request.wait_condition[0].declared_count(), 2);

        let row = gearman();
        let ctx = RowContext::new("site1", "Site One");
        assert!(matches_all(&request.wait_condition, &RowView::new(&row, &ctx)));

        let request = parse(
            "GET hosts\nWaitTrigger: check\nWaitObject: gearman\nWaitTimeout: 1000\nWaitCondition: state = 1\nWaitCondition: name = gearman\nWaitConditionAnd: 2\n",
        );
        assert!(!matches_all(&request.wait_condition, &RowView::new(&row, &ctx)));
    }

    #[test]
    fn test_group_with_exact_count_consumes_whole_stack() {
        let request = parse("GET hosts\nFilter: state = 0\nFilter: state = 1\nFilter: state = 2\nAnd: 3\n");
        assert_eq!(request.filter.len(), 1);
        assert_eq!(request.filter[0].declared_count(), 3);
    }

    #[test]
    fn test_concatenated_commands_report_consumed_bytes() {
        let input = "COMMAND [1473627610] SCHEDULE_FORCED_SVC_CHECK;demo;Web1;1473627610\nBackends: mockid0\n\nCOMMAND [1473627610] SCHEDULE_FORCED_SVC_CHECK;demo;Web2;1473627610";
        let (first, size) = Request::parse(input.as_bytes()).unwrap();
        assert_eq!(size, 87);
        assert_eq!(
            first.command.as_deref(),
            Some("COMMAND [1473627610] SCHEDULE_FORCED_SVC_CHECK;demo;Web1;1473627610")
        );
        assert_eq!(first.backends, vec!["mockid0"]);

        let (second, size) = Request::parse(&input.as_bytes()[87..]).unwrap();
        assert_eq!(size, 67);
        assert_eq!(
            second.command.as_deref(),
            Some("COMMAND [1473627610] SCHEDULE_FORCED_SVC_CHECK;demo;Web2;1473627610")
        );
        assert!(second.backends.is_empty());
    }

    #[test]
    fn test_leading_blank_lines_are_consumed() {
        let (request, size) = Request::parse(b"\n\nGET status\n\nGET hosts\n\n").unwrap();
        assert_eq!(request.table_name(), "status");
        assert_eq!(size, "\n\nGET status\n\n".len());
    }

    #[test]
    fn test_crlf_requests_split_on_blank_lines() {
        let input = b"GET hosts\r\nColumns: name\r\n\r\nGET services\r\nColumns: host_name description\r\n\r\n";
        let (first, size) = Request::parse(input).unwrap();
        assert_eq!(size, 28);
        assert_eq!(first.table_name(), "hosts");
        assert_eq!(first.columns, vec!["name"]);

        let (second, size) = Request::parse(&input[28..]).unwrap();
        assert_eq!(size, input.len() - 28);
        assert_eq!(second.table_name(), "services");
        assert_eq!(second.columns, vec!["host_name", "description"]);
    }

    #[test]
    fn test_whitespace_only_line_ends_request() {
        let input = b"\r\n  \r\nGET status\nColumns: program_start\n \t \nGET hosts\n\n";
        let (request, size) = Request::parse(input).unwrap();
        assert_eq!(request.table_name(), "status");
        assert_eq!(request.columns, vec!["program_start"]);
        assert_eq!(size, "\r\n  \r\nGET status\nColumns: program_start\n \t \n".len());
        assert_eq!(Request::parse(&input[size..]).unwrap().0.table_name(), "hosts");
    }

    #[test_case(b"GET hosts\r\n\r\n", Some(13) ; "crlf")]
    #[test_case(b"\n\nGET hosts\n", None ; "open request")]
    #[test_case(b"GET hosts\nColumns: name\n  \n", Some(27) ; "spaces")]
    #[test_case(b"\r\n\r\n", None ; "only blank lines")]
    fn test_request_frame_termination(input: &[u8], terminated: Option<usize>) {
        assert_eq!(RequestFrame::locate(input).terminated, terminated);
    }

    #[test]
    fn test_unknown_columns_are_deferred_to_null() {
        let request = parse("GET hosts\nColumns: name nope\n");
        assert_eq!(request.output_columns[1].kind, ColumnKind::Unknown);

        let row = gearman();
        let ctx = RowContext::new("site1", "Site One");
        let projected = RowView::new(&row, &ctx).project(&request.output_columns);
        assert_eq!(projected, vec![Value::String("gearman".into()), Value::Null]);
    }

    #[test]
    fn test_default_output_columns() {
        let hosts = schema().table("hosts").unwrap();
        assert_eq!(parse("GET hosts\n").output_columns.len(), hosts.columns.len());
        assert!(parse("GET hosts\nStats: state = 0\n").output_columns.is_empty());
        assert!(parse("GET hosts\nColumns: name\nStats: state = 0\n").is_group_by());
    }

    #[test]
    fn test_command_accepts_output_headers() {
        let request = parse("COMMAND [1] DISABLE_NOTIFICATIONS\nResponseHeader: fixed16\nKeepalive: on\n");
        assert!(request.is_command());
        assert!(request.keepalive());
        assert_eq!(request.response_header, ResponseHeader::Fixed16);
        assert_eq!(
            parse_err("COMMAND [1] TEST\nColumns: name\n"),
            "bad request: unrecognized header Columns: name"
        );
    }

    #[test]
    fn test_passthrough_text_keeps_upstream_safe_filters() {
        let request = parse("GET log\nColumns: time message\nFilter: time > 10\nFilter: peer_key = site1\nLimit: 5\n");
        let text = request.passthrough_text();
        assert!(text.starts_with("GET log\nColumns: time lineno"));
        assert!(text.contains("Filter: time > 10\n"));
        assert!(!text.contains("peer_key"));
        assert!(!text.contains("Limit"));
        assert!(text.ends_with("OutputFormat: json\nResponseHeader: fixed16\n\n"));
    }

    // ---- Parser: errors ----

    #[test_case("", "bad request: empty request" ; "empty")]
    #[test_case("NOE", "bad request: NOE" ; "unknown verb")]
    #[test_case("GET none\nColumns: none", "bad request: table none does not exist" ; "unknown table")]
    #[test_case("GET hosts\nnone", "bad request header: none" ; "malformed header")]
    #[test_case("GET hosts\nNone: blah", "bad request: unrecognized header None: blah" ; "unknown header")]
    #[test_case("GET hosts\nLimit: x", "bad request: limit must be a positive number" ; "limit text")]
    #[test_case("GET hosts\nLimit: -1", "bad request: limit must be a positive number" ; "limit negative")]
    #[test_case("GET hosts\nOffset: x", "bad request: offset must be a positive number" ; "offset text")]
    #[test_case("GET hosts\nOffset: -1", "bad request: offset must be a positive number" ; "offset negative")]
    #[test_case("GET hosts\nSort: 1", "bad request: invalid sort header, must be 'Sort: <field> <asc|desc>' or 'Sort: custom_variables <name> <asc|desc>'" ; "sort arity")]
    #[test_case("GET hosts\nSort: name none", "bad request: unrecognized sort direction, must be asc or desc" ; "sort direction")]
    #[test_case("GET hosts\nSort: name", "bad request: invalid sort header, must be 'Sort: <field> <asc|desc>' or 'Sort: custom_variables <name> <asc|desc>'" ; "sort without direction")]
    #[test_case("GET hosts\nColumns: name\nSort: state asc", "bad request: sort column state not in result set" ; "sort column missing")]
    #[test_case("GET hosts\nResponseheader: none", "bad request: unrecognized responseformat, only fixed16 is supported" ; "response header")]
    #[test_case("GET hosts\nOutputFormat: csv: none", "bad request: unrecognized outputformat, only json and wrapped_json is supported" ; "output format")]
    #[test_case("GET hosts\nStatsAnd: 1", "bad request: not enough filter on stack in StatsAnd: 1" ; "stats and empty")]
    #[test_case("GET hosts\nStatsOr: 1", "bad request: not enough filter on stack in StatsOr: 1" ; "stats or empty")]
    #[test_case("GET hosts\nFilter: state = 1\nOr: 2", "bad request: not enough filter on stack in Or: 2" ; "or short")]
    #[test_case("GET hosts\nWaitTrigger: all", "bad request: WaitTrigger without WaitCondition" ; "wait condition")]
    #[test_case("GET hosts\nWaitTrigger: all\nWaitCondition: last_check > 0", "bad request: WaitTrigger without WaitTimeout" ; "wait timeout")]
    #[test_case("GET hosts\nWaitTrigger: all\nWaitCondition: last_check > 0\nWaitTimeout: 10000", "bad request: WaitTrigger without WaitObject" ; "wait object")]
    #[test_case("GET hosts\nWaitCondition: state = 1\nWaitConditionOr: 2", "bad request: not enough filter on stack in WaitConditionOr: 2" ; "wait condition or short")]
    #[test_case("GET hosts\nWaitTimeout: -5", "bad request: waittimeout must be a positive number" ; "wait timeout negative")]
    #[test_case("GET hosts\nFilter: name", "bad request: filter header, must be Filter: <field> <operator> <value>" ; "filter arity")]
    #[test_case("GET hosts\nFilter: nope = 1", "bad request: unrecognized column from filter: nope in Filter: nope = 1" ; "filter column")]
    #[test_case("GET hosts\nFilter: name <> x", "bad request: unrecognized filter operator: <> in Filter: name <> x" ; "filter operator")]
    #[test_case("GET hosts\nFilter: state = abc", "bad request: could not convert abc to number in filter Filter: state = abc" ; "filter number")]
    #[test_case("GET hosts\nStats: name", "bad request: stats header, must be Stats: <field> <operator> <value> OR Stats: <sum|avg|min|max> <field>" ; "stats arity")]
    #[test_case("GET hosts\nStats: avg none", "bad request: unrecognized column from stats: none in Stats: avg none" ; "stats column")]
    #[test_case("GET hosts\nStats: avg latency\nStatsAnd: 1", "bad request: only filter stats can be grouped in StatsAnd: 1" ; "stats group of reducers")]
    #[test_case("GET hosts\nFilter: name !=\nAnd: x", "bad request: and must be a positive number in: And: x" ; "and count")]
    #[test_case("GET hosts\nFilter: name !=\nOr: 0", "bad request: or must be a positive number in: Or: 0" ; "or zero")]
    #[test_case("GET hosts\nColumns: name\nFilter: custom_variables =", "bad request: custom variable filter must have form \"Filter: custom_variables <op> <variable> [<value>]\" in Filter: custom_variables =" ; "custom variable")]
    #[test_case("GET hosts\nKeepalive: broke", "bad request: must be 'on' or 'off' in Keepalive: broke" ; "keepalive")]
    fn test_request_errors(request: &str, expected: &str) {
        assert_eq!(parse_err(request), expected);
    }

    #[test]
    fn test_invalid_regex_error() {
        let message = parse_err("GET hosts\nFilter: name ~~ *^");
        assert!(message.starts_with("bad request: invalid regular expression: "), "{}", message);
        assert!(message.ends_with(" in filter Filter: name ~~ *^"), "{}", message);
    }

    #[test]
    fn test_unknown_table_is_not_found() {
        let err = Request::parse_str("GET nothing\n").unwrap_err();
        assert_eq!(err.status_code(), STATUS_NOT_FOUND);
    }

    // ---- Filter engine ----

    #[test_case("Filter: state != 1", true ; "int not equal")]
    #[test_case("Filter: state = 0", true ; "int equal")]
    #[test_case("Filter: state >= 1", false ; "int greater equal")]
    #[test_case("Filter: latency > 0.5", true ; "float greater")]
    #[test_case("Filter: latency <= 0.5", false ; "float less equal")]
    #[test_case("Filter: last_check > 1473760401", true ; "time greater")]
    #[test_case("Filter: name = gearman", true ; "string equal")]
    #[test_case("Filter: name = GEARMAN", false ; "string equal is exact")]
    #[test_case("Filter: name =~ GEARMAN", true ; "string equal nocase")]
    #[test_case("Filter: name !=~ GEARMAN", false ; "string not equal nocase")]
    #[test_case("Filter: name ~ ^gear", true ; "regex")]
    #[test_case("Filter: name ~ ^GEAR", false ; "regex is case sensitive")]
    #[test_case("Filter: name ~~ ^GEAR", true ; "regex nocase")]
    #[test_case("Filter: name !~ ^x", true ; "negated regex")]
    #[test_case("Filter: name !~~ MAN$", false ; "negated regex nocase")]
    #[test_case("Filter: name < h", true ; "string lexical less")]
    #[test_case("Filter: name >= h", false ; "string lexical greater equal")]
    #[test_case("Filter: groups >= linux", true ; "list contains")]
    #[test_case("Filter: groups < linux", false ; "list does not contain")]
    #[test_case("Filter: groups =", false ; "list empty")]
    #[test_case("Filter: groups !=", true ; "list not empty")]
    #[test_case("Filter: groups ~ ^we", true ; "list regex any element")]
    #[test_case("Filter: comments >= 7", true ; "int list contains")]
    #[test_case("Filter: comments < 7", false ; "int list does not contain")]
    #[test_case("Filter: custom_variables = OS linux", true ; "custom variable equal")]
    #[test_case("Filter: custom_variables ~~ os LIN", true ; "custom variable regex")]
    #[test_case("Filter: custom_variables = MISSING", true ; "missing custom variable is empty")]
    #[test_case("Filter: custom_variables != MISSING value", true ; "missing custom variable differs")]
    #[test_case("Filter: state ~ 0", false ; "regex on number never matches")]
    #[test_case("Filter: state !~ 0", false ; "negated regex on number never matches")]
    #[test_case("Filter: peer_key = site1", true ; "virtual peer key")]
    #[test_case("Filter: peer_name = Site One", true ; "virtual peer name")]
    #[test_case("Filter: state = 1\nFilter: name = gearman\nOr: 2", true ; "or group")]
    #[test_case("Filter: state = 1\nFilter: name = gearman\nAnd: 2", false ; "and group")]
    #[test_case("Filter: state = 0\nFilter: name = gearman", true ; "top level and")]
    fn test_filter_semantics(filter: &str, expected: bool) {
        assert_eq!(host_matches(filter), expected);
    }

    #[test]
    fn test_empty_numeric_literal_compares_as_zero() {
        assert!(host_matches("Filter: state ="));
        assert!(!host_matches("Filter: latency ="));
    }

    // ---- Stats engine ----

    fn evaluate_stats(stats: &str, rows: &[Row]) -> Vec<Value> {
        let request = parse(&format!("GET hosts\n{}\n", stats));
        let ctx = RowContext::new("site1", "Site One");
        let mut accumulators = new_accumulators(&request.stats);
        for row in rows {
            let view = RowView::new(row, &ctx);
            if matches_all(&request.filter, &view) {
                observe_row(&request.stats, &mut accumulators, &view);
            }
        }
        accumulators.iter().map(StatsAccumulator::finalize).collect()
    }

    fn hosts_with_latencies(latencies: &[f64]) -> Vec<Row> {
        let hosts = schema().table("hosts").unwrap();
        latencies
            .iter()
            .enumerate()
            .map(|(i, latency)| {
                row_for(
                    hosts,
                    &[
                        ("name", Value::String(format!("host{}", i).into())),
                        ("state", Value::Int((i % 2) as i64)),
                        ("latency", Value::Float(*latency)),
                    ],
                )
            })
            .collect()
    }

    #[test]
    fn test_stats_reducers_and_counters() {
        let rows = hosts_with_latencies(&[1.0, 2.0, 3.0]);
        let values = evaluate_stats(
            "Stats: state = 0\nStats: sum latency\nStats: avg latency\nStats: min latency\nStats: max latency",
            &rows,
        );
        assert_eq!(
            values,
            vec![Value::Int(2), Value::Float(6.0), Value::Float(2.0), Value::Float(1.0), Value::Float(3.0)]
        );
    }

    #[test]
    fn test_stats_without_rows_are_zero() {
        let values = evaluate_stats("Stats: state = 0\nStats: avg latency\nStats: min latency", &[]);
        assert_eq!(values, vec![Value::Int(0), Value::Float(0.0), Value::Float(0.0)]);
    }

    #[test]
    fn test_stats_over_non_numeric_columns_degrade_to_zero() {
        let rows = hosts_with_latencies(&[1.0]);
        let values = evaluate_stats("Stats: sum name\nStats: avg contacts\nStats: min plugin_output", &rows);
        assert_eq!(values, vec![Value::Float(0.0), Value::Float(0.0), Value::Float(0.0)]);
    }

    #[test]
    fn test_grouped_stats_counter() {
        let rows = hosts_with_latencies(&[1.0, 2.0, 3.0, 4.0]);
        let values = evaluate_stats("Stats: state = 0\nStats: state = 1\nStatsOr: 2\nStats: state = 1", &rows);
        assert_eq!(values, vec![Value::Int(4), Value::Int(2)]);
    }

    #[test]
    fn test_grouped_stats_keep_first_seen_order_and_merge() {
        let request = parse("GET hosts\nColumns: state\nStats: avg latency\n");
        let ctx = RowContext::new("site1", "Site One");
        let rows = hosts_with_latencies(&[1.0, 10.0, 3.0]);

        let mut first = GroupedStats::new();
        for row in &rows {
            let view = RowView::new(row, &ctx);
            let accumulators = first.group_mut(view.project(&request.output_columns), &request.stats);
            observe_row(&request.stats, accumulators, &view);
        }
        assert_eq!(first.len(), 2);

        let mut second = GroupedStats::new();
        let view_rows = hosts_with_latencies(&[5.0]);
        let view = RowView::new(&view_rows[0], &ctx);
        let accumulators = second.group_mut(view.project(&request.output_columns), &request.stats);
        observe_row(&request.stats, accumulators, &view);

        let mut merged = PartialStats::Grouped(first);
        merged.merge(PartialStats::Grouped(second));
        assert_eq!(
            merged.into_rows(),
            vec![
                vec![Value::Int(0), Value::Float(3.0)],
                vec![Value::Int(1), Value::Float(10.0)],
            ]
        );
    }

    #[test]
    fn test_group_keys_do_not_collide_on_embedded_separators() {
        let request = parse("GET hosts\nColumns: name alias\nStats: state = 0\n");
        let keys = [
            vec![Value::String("a\u{1f}sb".into()), Value::String("c".into())],
            vec![Value::String("a".into()), Value::String("b\u{1f}sc".into())],
            vec![Value::StringList(vec!["x\u{1e}y".into()]), Value::Null],
            vec![Value::StringList(vec!["x".into(), "y".into()]), Value::Null],
            vec![Value::String("3:abc".into()), Value::Null],
            vec![Value::String("3".into()), Value::Null],
        ];

        let mut grouped = GroupedStats::new();
        for key in &keys {
            grouped.group_mut(key.clone(), &request.stats);
        }
        assert_eq!(grouped.len(), keys.len());

        grouped.group_mut(keys[1].clone(), &request.stats);
        assert_eq!(grouped.len(), keys.len());
    }

    #[test]
    fn test_avg_is_not_an_average_of_averages() {
        let mut a = StatsAccumulator::new(StatsKind::Avg);
        a.observe(Some(1.0));
        let mut b = StatsAccumulator::new(StatsKind::Avg);
        for v in [2.0, 3.0, 4.0] {
            b.observe(Some(v));
        }
        a.merge(&b);
        assert_eq!(a.finalize(), Value::Float(2.5));
    }

    fn partition(values: &[f64], cuts: &[usize]) -> Vec<Vec<f64>> {
        let mut cuts: Vec<usize> = cuts.iter().map(|c| (*c).min(values.len())).collect();
        cuts.sort_unstable();
        let mut parts = Vec::new();
        let mut start = 0;
        for cut in cuts {
            parts.push(values[start..cut].to_vec());
            start = cut;
        }
        parts.push(values[start..].to_vec());
        parts
    }

    fn reduce(kind: StatsKind, values: &[f64]) -> StatsAccumulator {
        let mut acc = StatsAccumulator::new(kind);
        for v in values {
            acc.observe(Some(*v));
        }
        acc
    }

    fn merged(kind: StatsKind, parts: &[Vec<f64>]) -> StatsAccumulator {
        let mut acc = StatsAccumulator::new(kind);
        for part in parts {
            acc.merge(&reduce(kind, part));
        }
        acc
    }

    proptest! {
        #[test]
        fn prop_avg_merge_equals_unpartitioned(
            values in prop::collection::vec(-1.0e6f64..1.0e6, 0..64),
            cuts in prop::collection::vec(0usize..64, 0..5),
        ) {
            let parts = partition(&values, &cuts);
            let whole = reduce(StatsKind::Avg, &values).finalize().as_f64().unwrap();
            let combined = merged(StatsKind::Avg, &parts).finalize().as_f64().unwrap();
            prop_assert!((whole - combined).abs() <= 1e-6 * (1.0 + whole.abs()));
            if values.is_empty() {
                prop_assert_eq!(combined, 0.0);
            }
        }

        #[test]
        fn prop_min_max_merge_equals_unpartitioned(
            values in prop::collection::vec(-1.0e6f64..1.0e6, 0..64),
            cuts in prop::collection::vec(0usize..64, 0..5),
        ) {
            let parts = partition(&values, &cuts);
            for kind in [StatsKind::Min, StatsKind::Max] {
                let whole = reduce(kind, &values).finalize();
                let combined = merged(kind, &parts).finalize();
                prop_assert_eq!(whole, combined);
            }
        }
    }
}


// ============================================================================
// ██████╗ ██╗  ██╗ █████╗ ███████╗███████╗    ██████╗ 
// ██╔══██╗██║  ██║██╔══██╗██╔════╝██╔════╝    ╚════██╗
// ██████╔╝███████║███████║███████╗█████╗       █████╔╝
// ██╔═══╝ ██╔══██║██╔══██║╚════██║██╔══╝       ╚═══██╗
// ██║     ██║  ██║██║  ██║███████║███████╗    ██████╔╝
// ╚═╝     ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝╚══════╝    ╚═════╝ 
// THE DATA MIRROR - TABLE STORES, UPSTREAMS, WAITS, PEERS
// ============================================================================

// ============================================================================
// SECTION 15: TABLE STORE
// ============================================================================
// Immutable per-table snapshots published through ArcSwap. A refresh builds a
// complete new snapshot and swaps the pointer; readers holding the previous
// snapshot keep using it undisturbed.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Snapshots
// ----------------------------------------------------------------------------

/// Immutable rows of one table of one peer.
#[derive(Debug, Default)]
pub struct TableSnapshot {
    pub rows: Vec<Row>,
    /// Row key to position, see `Table::row_key`
    key_index: AHashMap<CompactString, usize>,
    /// Unix timestamp of the refresh that produced the snapshot
    pub updated_at: i64,
}

impl TableSnapshot {
    pub fn new(table: &Table, rows: Vec<Row>) -> Self {
        let mut key_index = AHashMap::with_capacity(rows.len());
        for (pos, row) in rows.iter().enumerate() {
            if let Some(key) = table.row_key(row) {
                key_index.entry(key).or_insert(pos);
            }
        }
        Self {
            rows,
            key_index,
            updated_at: Utc::now().timestamp(),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<&[Value]> {
        self.key_index
            .get(key)
            .and_then(|pos| self.rows.get(*pos))
            .map(|row| row.as_slice())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 15.2 Store
// ----------------------------------------------------------------------------

/// The mirrored tables of one peer.
#[derive(Debug)]
pub struct TableStore {
    tables: AHashMap<CompactString, ArcSwap<TableSnapshot>>,
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new(schema())
    }
}

impl TableStore {
    pub fn new(schema: &Schema) -> Self {
        let tables = schema
            .mirrored_tables()
            .map(|t| (t.name.clone(), ArcSwap::from_pointee(TableSnapshot::default())))
            .collect();
        Self { tables }
    }

    /// Current snapshot of `table`; unknown tables yield an empty snapshot.
    pub fn snapshot(&self, table: &str) -> Arc<TableSnapshot> {
        match self.tables.get(table) {
            Some(slot) => slot.load_full(),
            None => Arc::new(TableSnapshot::default()),
        }
    }

    pub fn publish(&self, table: &str, snapshot: TableSnapshot) {
        if let Some(slot) = self.tables.get(table) {
            slot.store(Arc::new(snapshot));
        }
    }
}

/// Decodes a JSON row dump into rows aligned with the table's stored columns.
pub fn decode_rows(table: &Table, body: &[u8]) -> Result<Vec<Row>, serde_json::Error> {
    let raw: Vec<Vec<JsonValue>> = serde_json::from_slice(body)?;
    let columns: SmallVec<[&Column; 64]> = table.stored_columns().collect();
    Ok(raw
        .iter()
        .map(|cells| {
            columns
                .iter()
                .enumerate()
                .map(|(pos, column)| match cells.get(pos) {
                    Some(cell) => Value::from_json(cell, column.column_type),
                    None => Value::default_for(column.column_type),
                })
                .collect()
        })
        .collect())
}

/// Request fetching every stored column of `table`.
pub fn table_dump_request(table: &Table) -> String {
    let mut request = table_dump_request_head(table);
    request.push_str("OutputFormat: json\nResponseHeader: fixed16\n\n");
    request
}

// ============================================================================
// SECTION 16: UPSTREAM CLIENT
// ============================================================================
// Livestatus client used by peers. One request per connection, fixed16
// framed responses, TCP or unix sockets picked by address shape.
// ============================================================================

/// Transport timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub net: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            net: Duration::from_secs(DEFAULT_NET_TIMEOUT_SECS),
        }
    }
}

/// A successful upstream answer.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub bytes_sent: u64,
    pub elapsed: Duration,
}

/// One upstream address.
#[async_trait]
pub trait Upstream: Send + Sync + Debug {
    fn address(&self) -> &str;

    /// Sends a query and reads the fixed16 framed response.
    async fn query(&self, request: &str) -> PeerResult<UpstreamResponse>;

    /// Delivers a command. Upstreams do not answer commands.
    async fn command(&self, command: &str) -> PeerResult<u64>;
}

/// Livestatus source reachable over TCP (`host:port`) or a unix socket path.
#[derive(Debug, Clone)]
pub struct LivestatusSource {
    address: String,
    timeouts: Timeouts,
}

impl LivestatusSource {
    pub fn new(address: impl Into<String>, timeouts: Timeouts) -> Self {
        Self {
            address: address.into(),
            timeouts,
        }
    }

    pub fn is_tcp(&self) -> bool {
        is_tcp_address(&self.address)
    }

    async fn exchange(&self, payload: &[u8], expect_response: bool) -> PeerResult<(u16, Vec<u8>)> {
        let address = self.address.as_str();
        let connect = self.timeouts.connect;
        if self.is_tcp() {
            let stream = timeout(connect, TcpStream::connect(address))
                .await
                .map_err(|_| PeerError::timeout(format!("connect to {}", address), connect))?
                .map_err(|e| PeerError::connection_failed(address, e))?;
            self.exchange_on(stream, payload, expect_response).await
        } else {
            let stream = timeout(connect, UnixStream::connect(address))
                .await
                .map_err(|_| PeerError::timeout(format!("connect to {}", address), connect))?
                .map_err(|e| PeerError::connection_failed(address, e))?;
            self.exchange_on(stream, payload, expect_response).await
        }
    }

    async fn exchange_on<S>(&self, mut stream: S, payload: &[u8], expect_response: bool) -> PeerResult<(u16, Vec<u8>)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let address = self.address.as_str();
        let net = self.timeouts.net;
        let exchange = async {
            stream
                .write_all(payload)
                .await
                .map_err(|e| PeerError::connection_failed(address, e))?;
            stream.flush().await.map_err(|e| PeerError::connection_failed(address, e))?;
            if !expect_response {
                let _ = stream.shutdown().await;
                return Ok((STATUS_OK, Vec::new()));
            }

            let mut header = [0u8; RESPONSE_HEADER_SIZE];
            stream
                .read_exact(&mut header)
                .await
                .map_err(|e| PeerError::connection_failed(address, format!("no response header: {}", e)))?;
            let (status, length) = parse_response_header(&header)
                .ok_or_else(|| PeerError::invalid_response(address, "malformed response header"))?;
            if length > MAX_UPSTREAM_RESPONSE_BYTES {
                return Err(PeerError::invalid_response(address, format!("response of {} bytes too large", length)));
            }

            let mut body = vec![0u8; length];
            stream
                .read_exact(&mut body)
                .await
                .map_err(|e| PeerError::invalid_response(address, format!("short body: {}", e)))?;
            Ok::<_, PeerError>((status, body))
        };

        timeout(net, exchange)
            .await
            .map_err(|_| PeerError::timeout(format!("request to {}", address), net))?
    }
}

#[async_trait]
impl Upstream for LivestatusSource {
    fn address(&self) -> &str {
        &self.address
    }

    async fn query(&self, request: &str) -> PeerResult<UpstreamResponse> {
        let started = Instant::now();
        let (status, body) = self.exchange(request.as_bytes(), true).await?;
        if status != STATUS_OK {
            return Err(PeerError::Upstream {
                address: self.address.clone(),
                status,
                message: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        Ok(UpstreamResponse {
            status,
            body,
            bytes_sent: request.len() as u64,
            elapsed: started.elapsed(),
        })
    }

    async fn command(&self, command: &str) -> PeerResult<u64> {
        self.exchange(command.as_bytes(), false).await?;
        Ok(command.len() as u64)
    }
}

/// `host:port` addresses are TCP, everything else is a unix socket path.
pub fn is_tcp_address(address: &str) -> bool {
    !address.starts_with('/') && !address.starts_with('.') && address.contains(':')
}

/// Parses `<status> <length>\n`.
pub fn parse_response_header(header: &[u8]) -> Option<(u16, usize)> {
    if header.len() < RESPONSE_HEADER_SIZE || header[RESPONSE_HEADER_SIZE - 1] != b'\n' {
        return None;
    }
    let text = std::str::from_utf8(&header[..RESPONSE_HEADER_SIZE - 1]).ok()?;
    let status = text.get(..3)?.parse().ok()?;
    let length = text.get(4..)?.trim().parse().ok()?;
    Some((status, length))
}

// ============================================================================
// SECTION 17: WAIT COORDINATOR
// ============================================================================
// Blocking `WaitTrigger` queries. Each trigger owns a watch channel whose
// version is bumped by the refresh task; a waiter re-checks its condition on
// every bump and gives up at its deadline. Waiters hold no locks while
// suspended, so other queries and the refresh task never wait on them.
// ============================================================================

/// Lifecycle of one waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Idle,
    Armed,
    Satisfied,
    TimedOut,
}

impl WaitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WaitState::Satisfied | WaitState::TimedOut)
    }
}

/// Per-peer registry of wait triggers.
#[derive(Debug, Default)]
pub struct WaitCoordinator {
    triggers: DashMap<CompactString, watch::Sender<u64>>,
    armed: AtomicU64,
}

impl WaitCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe(&self, name: &str) -> watch::Receiver<u64> {
        self.triggers
            .entry(name.to_compact_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Number of trigger names with at least one waiter.
    pub fn registered(&self) -> usize {
        self.triggers.len()
    }

    /// Wakes every waiter of `trigger` so it re-checks its condition.
    pub fn fire(&self, trigger: &str) {
        if let Some(sender) = self.triggers.get(trigger.to_ascii_lowercase().as_str()) {
            sender.send_modify(|version| *version = version.wrapping_add(1));
        }
    }

    /// Number of waiters currently suspended.
    pub fn armed(&self) -> u64 {
        self.armed.load(AtomicOrdering::Relaxed)
    }

    /// Suspends until `condition` holds after a firing of `trigger`, or until
    /// `limit` elapses. A zero `limit` waits without deadline.
    pub async fn wait<F>(&self, trigger: &str, limit: Duration, condition: F) -> WaitState
    where
        F: Fn() -> bool,
    {
        let name = trigger.to_ascii_lowercase().to_compact_string();
        // Declared before the receiver so it runs after the receiver is dropped.
        let _release = TriggerRelease { triggers: &self.triggers, name: &name };
        let mut receiver = self.subscribe(&name);
        if condition() {
            return WaitState::Satisfied;
        }

        self.armed.fetch_add(1, AtomicOrdering::Relaxed);
        let _armed = ArmedGuard(&self.armed);
        let deadline = (!limit.is_zero()).then(|| tokio::time::Instant::now() + limit);
        let state = loop {
            let changed = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, receiver.changed()).await {
                    Ok(changed) => changed,
                    Err(_) => break WaitState::TimedOut,
                },
                None => receiver.changed().await,
            };
            if changed.is_err() {
                break WaitState::TimedOut;
            }
            if condition() {
                break WaitState::Satisfied;
            }
        };

        trace!(target: "livemux::wait", trigger, state = ?state, "wait finished");
        state
    }
}

// Forgets a trigger name once its last waiter is gone.
struct TriggerRelease<'a> {
    triggers: &'a DashMap<CompactString, watch::Sender<u64>>,
    name: &'a str,
}

impl Drop for TriggerRelease<'_> {
    fn drop(&mut self) {
        self.triggers.remove_if(self.name, |_, sender| sender.receiver_count() == 0);
    }
}

// Keeps the armed count right when a waiting query is dropped.
struct ArmedGuard<'a>(&'a AtomicU64);

impl Drop for ArmedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, AtomicOrdering::Relaxed);
    }
}

/// Livestatus trigger names fired together with a refreshed table.
pub fn trigger_aliases(table: &str) -> &'static [&'static str] {
    match table {
        "hosts" | "services" => &["check", "state"],
        "comments" => &["comment"],
        "downtimes" => &["downtime"],
        "status" => &["program", "command"],
        "log" => &["log"],
        _ => &[],
    }
}

// ============================================================================
// SECTION 18: PEER
// ============================================================================
// One upstream backend: its sources, its table store, its wait coordinator
// and the background refresh task keeping the store current. Queries are
// answered from the local mirror only; passthrough tables are fetched live.
// ============================================================================

// ----------------------------------------------------------------------------
// 18.1 Peer State
// ----------------------------------------------------------------------------

/// Mutable health information of a peer.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// One of the `PEER_STATUS_*` codes
    pub status: u8,
    pub last_error: String,
    /// Unix timestamp of the last refresh attempt
    pub last_update: i64,
    /// Unix timestamp of the last successful refresh
    pub last_online: i64,
    /// Duration of the last successful refresh
    pub response_time: Duration,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            status: PEER_STATUS_PENDING,
            last_error: String::new(),
            last_update: 0,
            last_online: 0,
            response_time: Duration::ZERO,
        }
    }
}

/// Traffic counters exposed through the `backends` table.
#[derive(Debug, Default)]
pub struct PeerCounters {
    pub queries: AtomicU64,
    pub bytes_send: AtomicU64,
    pub bytes_received: AtomicU64,
}

/// Result of executing a request on one peer.
#[derive(Debug, Clone)]
pub enum PeerOutcome {
    /// Projected rows, sorted; `total` counts rows before the limit pushdown
    Rows { rows: Vec<Row>, total: usize },
    /// Unfinalized aggregates for the peer map to merge
    Stats(PartialStats),
}

// ----------------------------------------------------------------------------
// 18.2 Peer
// ----------------------------------------------------------------------------

/// A mirrored upstream backend.
#[derive(Debug)]
pub struct Peer {
    pub id: CompactString,
    pub name: CompactString,
    sources: Vec<Arc<dyn Upstream>>,
    /// Index into `sources` of the source currently in use
    active_source: AtomicU64,
    store: TableStore,
    state: RwLock<PeerState>,
    counters: PeerCounters,
    waits: WaitCoordinator,
    metrics: Arc<MuxMetrics>,
    refresh_task: TokioMutex<Option<TokioJoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Peer {
    pub fn new(config: &ConnectionConfig, timeouts: Timeouts, metrics: Arc<MuxMetrics>) -> Self {
        let sources = config
            .source
            .iter()
            .map(|address| Arc::new(LivestatusSource::new(address.clone(), timeouts)) as Arc<dyn Upstream>)
            .collect();
        Self::with_sources(&config.id, config.display_name(), sources, metrics)
    }

    pub fn with_sources(id: &str, name: &str, sources: Vec<Arc<dyn Upstream>>, metrics: Arc<MuxMetrics>) -> Self {
        Self {
            id: id.to_compact_string(),
            name: name.to_compact_string(),
            sources,
            active_source: AtomicU64::new(0),
            store: TableStore::new(schema()),
            state: RwLock::new(PeerState::default()),
            counters: PeerCounters::default(),
            waits: WaitCoordinator::new(),
            metrics,
            refresh_task: TokioMutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> PeerState {
        self.state.read().clone()
    }

    pub fn status(&self) -> u8 {
        self.state.read().status
    }

    pub fn is_up(&self) -> bool {
        self.status() == PEER_STATUS_UP
    }

    pub fn last_error(&self) -> String {
        self.state.read().last_error.clone()
    }

    pub fn waits(&self) -> &WaitCoordinator {
        &self.waits
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    /// Address of the source currently in use.
    pub fn active_address(&self) -> &str {
        let idx = self.active_source.load(AtomicOrdering::Relaxed) as usize;
        self.sources.get(idx).map(|s| s.address()).unwrap_or_default()
    }

    fn mark_up(&self, elapsed: Duration) {
        let now = Utc::now().timestamp();
        let mut state = self.state.write();
        if state.status != PEER_STATUS_UP {
            info!(target: "livemux::peer", peer = %self.id, address = %self.active_address(), "peer is up");
        }
        state.status = PEER_STATUS_UP;
        state.last_error.clear();
        state.last_update = now;
        state.last_online = now;
        state.response_time = elapsed;
        self.metrics.set_peer_status(&self.id, PEER_STATUS_UP);
    }

    fn mark_down(&self, error: &PeerError) {
        let mut state = self.state.write();
        if state.status != PEER_STATUS_DOWN {
            warn!(target: "livemux::peer", peer = %self.id, error = %error, "peer is down");
        }
        state.status = PEER_STATUS_DOWN;
        state.last_error = error.to_string();
        state.last_update = Utc::now().timestamp();
        self.metrics.set_peer_status(&self.id, PEER_STATUS_DOWN);
    }

    // ------------------------------------------------------------------------
    // Upstream Access
    // ------------------------------------------------------------------------

    /// Runs `op` against the sources, starting with the active one and
    /// failing over to the next on connection level errors.
    async fn with_failover<T, F, Fut>(&self, op: F) -> PeerResult<T>
    where
        F: Fn(Arc<dyn Upstream>) -> Fut,
        Fut: std::future::Future<Output = PeerResult<T>>,
    {
        if self.sources.is_empty() {
            return Err(PeerError::NoSources { peer: self.id.to_string() });
        }
        let first = self.active_source.load(AtomicOrdering::Relaxed) as usize % self.sources.len();
        let mut last_error = None;
        for attempt in 0..self.sources.len() {
            let idx = (first + attempt) % self.sources.len();
            let source = Arc::clone(&self.sources[idx]);
            match op(source).await {
                Ok(value) => {
                    if idx != first {
                        info!(target: "livemux::peer", peer = %self.id, address = %self.sources[idx].address(), "failed over to source");
                    }
                    self.active_source.store(idx as u64, AtomicOrdering::Relaxed);
                    return Ok(value);
                }
                Err(e) if e.should_failover() => {
                    debug!(target: "livemux::peer", peer = %self.id, error = %e, "source unavailable");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or(PeerError::NoSources { peer: self.id.to_string() }))
    }

    async fn query_upstream(&self, request: &str) -> PeerResult<UpstreamResponse> {
        let response = self.with_failover(|source| async move { source.query(request).await }).await?;
        self.counters.bytes_send.fetch_add(response.bytes_sent, AtomicOrdering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add((response.body.len() + RESPONSE_HEADER_SIZE) as u64, AtomicOrdering::Relaxed);
        Ok(response)
    }

    /// Forwards a command. Success means delivery, not acceptance.
    #[instrument(skip(self), fields(peer = %self.id))]
    pub async fn command(&self, command: &str) -> PeerResult<()> {
        let payload = format!("{}\n\n", command.trim_end());
        let result = self
            .with_failover(|source| {
                let payload = payload.clone();
                async move { source.command(&payload).await }
            })
            .await;
        match result {
            Ok(sent) => {
                self.counters.bytes_send.fetch_add(sent, AtomicOrdering::Relaxed);
                Ok(())
            }
            Err(e) => {
                if e.should_failover() {
                    self.mark_down(&e);
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------------

    /// Fetches every mirrored table and publishes the new snapshots.
    /// On failure the previous snapshots stay in place and the peer is down.
    pub async fn refresh_once(&self) -> PeerResult<()> {
        let started = Instant::now();
        let result = self.fetch_all().await;
        let elapsed = started.elapsed();

        match result {
            Ok(snapshots) => {
                let mut refreshed = Vec::with_capacity(snapshots.len());
                for (table, snapshot) in snapshots {
                    self.store.publish(&table, snapshot);
                    refreshed.push(table);
                }
                self.mark_up(elapsed);
                self.metrics.peer_updates.with_label_values(&[self.id.as_str()]).inc();

                for table in &refreshed {
                    self.waits.fire(table);
                    for alias in trigger_aliases(table) {
                        self.waits.fire(alias);
                    }
                }
                self.waits.fire(WAIT_TRIGGER_ALL);

                debug!(
                    target: "livemux::peer",
                    peer = %self.id,
                    tables = refreshed.len(),
                    duration_ms = elapsed.as_millis() as u64,
                    "refresh complete"
                );
                Ok(())
            }
            Err(e) => {
                self.mark_down(&e);
                self.metrics.peer_update_errors.with_label_values(&[self.id.as_str()]).inc();
                Err(e)
            }
        }
    }

    async fn fetch_all(&self) -> PeerResult<Vec<(CompactString, TableSnapshot)>> {
        let mut snapshots = Vec::new();
        for table in schema().mirrored_tables() {
            let response = self.query_upstream(&table_dump_request(table)).await?;
            let rows = decode_rows(table, &response.body)
                .map_err(|e| PeerError::invalid_response(self.active_address(), e))?;
            snapshots.push((table.name.clone(), TableSnapshot::new(table, rows)));
        }
        Ok(snapshots)
    }

    /// Starts the background refresh loop.
    pub async fn start(self: &Arc<Self>, every: Duration) {
        let peer = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            result = peer.refresh_once() => {
                                if let Err(e) = result {
                                    trace!(target: "livemux::peer", peer = %peer.id, error = %e, "refresh failed");
                                }
                            }
                        }
                    }
                }
            }
            debug!(target: "livemux::peer", peer = %peer.id, "refresh task stopped");
        });

        *self.refresh_task.lock().await = Some(handle);
    }

    /// Stops the refresh loop and joins it.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.refresh_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!(target: "livemux::peer", peer = %self.id, error = %e, "refresh task panicked");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Query Execution
    // ------------------------------------------------------------------------

    /// Answers `request` from this peer's data.
    pub async fn execute(&self, request: &Request) -> PeerResult<PeerOutcome> {
        let Some(table) = request.table.clone() else {
            return Ok(PeerOutcome::Rows { rows: Vec::new(), total: 0 });
        };
        self.counters.queries.fetch_add(1, AtomicOrdering::Relaxed);

        if !table.flags.virtual_table && !self.is_up() {
            return Err(PeerError::Down {
                peer: self.id.to_string(),
                message: self.last_error(),
            });
        }

        if let Some(trigger) = &request.wait_trigger {
            let state = self
                .waits
                .wait(trigger, request.wait_timeout_duration(), || self.wait_condition_met(&table, request))
                .await;
            debug!(target: "livemux::wait", peer = %self.id, trigger = %trigger, state = ?state, "wait resumed");
        }

        let ctx = self.row_context(&table);
        let owned: Vec<Row>;
        let snapshot: Arc<TableSnapshot>;
        let rows: &[Row] = if table.flags.passthrough_only {
            owned = self.fetch_passthrough(request, &table).await?;
            &owned
        } else if let Some(spec) = &table.group_by {
            snapshot = self.store.snapshot(&spec.backing);
            owned = explode_rows(&snapshot.rows, spec, &ctx);
            &owned
        } else {
            snapshot = self.current_snapshot(&table);
            &snapshot.rows
        };

        Ok(evaluate_request(request, rows, &ctx))
    }

    async fn fetch_passthrough(&self, request: &Request, table: &Table) -> PeerResult<Vec<Row>> {
        match self.query_upstream(&request.passthrough_text()).await {
            Ok(response) => {
                decode_rows(table, &response.body).map_err(|e| PeerError::invalid_response(self.active_address(), e))
            }
            Err(e) => {
                if e.should_failover() {
                    self.mark_down(&e);
                }
                Err(e)
            }
        }
    }

    /// Snapshot answering queries on `table` right now.
    fn current_snapshot(&self, table: &Table) -> Arc<TableSnapshot> {
        if table.flags.virtual_table {
            return Arc::new(TableSnapshot::new(table, vec![self.backend_row(table)]));
        }
        match &table.group_by {
            Some(spec) => self.store.snapshot(&spec.backing),
            None => self.store.snapshot(&table.name),
        }
    }

    fn row_context(&self, table: &Table) -> RowContext {
        let mut ctx = RowContext::new(&self.id, &self.name);
        let explode = table.group_by.as_ref().map(|spec| &spec.explode);
        let mut seen: SmallVec<[&str; 2]> = SmallVec::new();
        for column in table.columns.iter().chain(explode) {
            if let ColumnKind::Reference { table: target, .. } = &column.kind {
                if !seen.contains(&target.as_str()) {
                    seen.push(target.as_str());
                    ctx = ctx.with_reference(target, self.store.snapshot(target));
                }
            }
        }
        ctx
    }

    /// Evaluates the wait condition against the current `WaitObject` row.
    fn wait_condition_met(&self, table: &Table, request: &Request) -> bool {
        let Some(object) = request.wait_object.as_deref() else {
            return false;
        };
        let snapshot = self.current_snapshot(table);
        let row = snapshot
            .lookup(object)
            .or_else(|| snapshot.lookup(&object.replacen(' ', ";", 1)));
        let Some(row) = row else {
            return false;
        };
        let ctx = self.row_context(table);
        matches_all(&request.wait_condition, &RowView::new(row, &ctx))
    }

    /// The row describing this peer in the `backends` table.
    fn backend_row(&self, table: &Table) -> Row {
        let state = self.state.read();
        table
            .stored_columns()
            .map(|column| match column.name.as_str() {
                "key" => Value::String(self.id.clone()),
                "name" => Value::String(self.name.clone()),
                "addr" => Value::String(self.active_address().to_compact_string()),
                "last_error" => Value::String(state.last_error.to_compact_string()),
                "status" => Value::Int(i64::from(state.status)),
                "queries" => Value::Int(self.counters.queries.load(AtomicOrdering::Relaxed) as i64),
                "bytes_send" => Value::Int(self.counters.bytes_send.load(AtomicOrdering::Relaxed) as i64),
                "bytes_received" => Value::Int(self.counters.bytes_received.load(AtomicOrdering::Relaxed) as i64),
                "idling" => Value::Int(0),
                "last_update" => Value::Int(state.last_update),
                "last_online" => Value::Int(state.last_online),
                "response_time" => Value::Float(state.response_time.as_secs_f64()),
                _ => Value::default_for(column.column_type),
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// 18.3 Local Evaluation
// ----------------------------------------------------------------------------

/// Synthesizes group-by rows: one row per element of the exploded list,
/// the element appended as the last stored value.
pub fn explode_rows(rows: &[Row], spec: &GroupBySpec, ctx: &RowContext) -> Vec<Row> {
    let mut exploded = Vec::with_capacity(rows.len());
    for row in rows {
        let view = RowView::new(row, ctx);
        if let Value::StringList(items) = view.value(&spec.explode).as_ref() {
            for item in items {
                let mut synthesized = row.clone();
                synthesized.push(Value::String(item.clone()));
                exploded.push(synthesized);
            }
        }
    }
    exploded
}

/// Filters, aggregates or projects and sorts `rows` for `request`.
pub fn evaluate_request(request: &Request, rows: &[Row], ctx: &RowContext) -> PeerOutcome {
    let matching = rows
        .iter()
        .map(|row| RowView::new(row, ctx))
        .filter(|view| matches_all(&request.filter, view));

    if request.is_group_by() {
        let mut groups = GroupedStats::new();
        for view in matching {
            let key = view.project(&request.output_columns);
            let accumulators = groups.group_mut(key, &request.stats);
            observe_row(&request.stats, accumulators, &view);
        }
        return PeerOutcome::Stats(PartialStats::Grouped(groups));
    }

    if request.is_stats() {
        let mut accumulators = new_accumulators(&request.stats);
        for view in matching {
            observe_row(&request.stats, &mut accumulators, &view);
        }
        return PeerOutcome::Stats(PartialStats::Single(accumulators));
    }

    let mut projected: Vec<Row> = matching.map(|view| view.project(&request.output_columns)).collect();
    let total = projected.len();
    sort_rows(&mut projected, &request.sort);
    if let Some(limit) = request.limit {
        projected.truncate(request.offset.unwrap_or(0).saturating_add(limit));
    }
    PeerOutcome::Rows { rows: projected, total }
}

/// Stable multi-key sort.
pub fn sort_rows(rows: &mut [Row], sort: &[SortField]) {
    if sort.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for field in sort {
            let ordering = match (a.get(field.index), b.get(field.index)) {
                (Some(x), Some(y)) => x.sort_cmp(y, field.args.as_deref()),
                _ => Ordering::Equal,
            };
            let ordering = match field.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

// ============================================================================
// SECTION 19: PHASE 3 TESTS
// ============================================================================




// ============================================================================
// ██████╗ ██╗  ██╗ █████╗ ███████╗███████╗    ██╗  ██╗
// ██╔══██╗██║  ██║██╔══██╗██╔════╝██╔════╝    ██║  ██║
// ██████╔╝███████║███████║███████╗█████╗      ███████║
// ██╔═══╝ ██╔══██║██╔══██║╚════██║██╔══╝      ╚════██║
// ██║     ██║  ██║██║  ██║███████║███████╗         ██║
// ╚═╝     ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝╚══════╝         ╚═╝
// THE SERVICE SURFACE - MULTIPLEXER, RESPONSES, LISTENER, METRICS
// ============================================================================

// ============================================================================
// SECTION 20: PEER MAP / MULTIPLEXER
// ============================================================================
// Fans a request out to the selected peers concurrently and merges what comes
// back:
// - plain rows are concatenated, sorted and windowed globally
// - stats are merged from unfinalized accumulators, so averages stay exact
// - failing peers are reported in `failed` and never fail the whole query
// ============================================================================

// ----------------------------------------------------------------------------
// 20.1 Query Result
// ----------------------------------------------------------------------------

/// Merged answer of all selected peers.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Matching rows before Limit and Offset
    pub total: usize,
    /// Peer id to error text
    pub failed: BTreeMap<String, String>,
}

// ----------------------------------------------------------------------------
// 20.2 Peer Map
// ----------------------------------------------------------------------------

/// All configured peers, in configuration order.
#[derive(Debug)]
pub struct PeerMap {
    peers: Vec<Arc<Peer>>,
    metrics: Arc<MuxMetrics>,
}

impl PeerMap {
    pub fn new(peers: Vec<Arc<Peer>>, metrics: Arc<MuxMetrics>) -> Self {
        Self { peers, metrics }
    }

    /// One peer per configured connection.
    pub fn from_config(config: &EngineConfig, metrics: Arc<MuxMetrics>) -> Self {
        let timeouts = config.timeouts();
        let peers = config
            .connections
            .iter()
            .map(|connection| Arc::new(Peer::new(connection, timeouts, Arc::clone(&metrics))))
            .collect();
        Self::new(peers, metrics)
    }

    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Peer>> {
        self.peers.iter().find(|peer| peer.id == id)
    }

    pub fn metrics(&self) -> &Arc<MuxMetrics> {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers named by `backends`, or all peers when empty.
    pub fn select(&self, backends: &[CompactString]) -> RequestResult<Vec<Arc<Peer>>> {
        if backends.is_empty() {
            return Ok(self.peers.clone());
        }
        backends
            .iter()
            .map(|id| {
                self.get(id)
                    .cloned()
                    .ok_or_else(|| RequestError::UnknownBackend(id.to_string()))
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub async fn start(&self, every: Duration) {
        for peer in &self.peers {
            peer.start(every).await;
        }
        info!(target: "livemux::engine", peers = self.peers.len(), interval_secs = every.as_secs(), "refresh tasks started");
    }

    pub async fn stop(&self) {
        join_all(self.peers.iter().map(|peer| peer.stop())).await;
        info!(target: "livemux::engine", "refresh tasks stopped");
    }

    /// Runs one refresh cycle on every peer concurrently.
    pub async fn refresh_all(&self) {
        join_all(self.peers.iter().map(|peer| peer.refresh_once())).await;
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Executes a query on the selected peers and merges the results.
    pub async fn execute(&self, request: &Request) -> MuxResult<QueryResult> {
        let peers = self.select(&request.backends)?;
        self.metrics.queries.with_label_values(&[request.table_name()]).inc();

        let outcomes = join_all(peers.iter().map(|peer| async move { (peer, peer.execute(request).await) })).await;

        let mut result = QueryResult::default();
        let mut partial: Option<PartialStats> = None;
        for (peer, outcome) in outcomes {
            match outcome {
                Ok(PeerOutcome::Rows { rows, total }) => {
                    result.rows.extend(rows);
                    result.total += total;
                }
                Ok(PeerOutcome::Stats(stats)) => match partial.as_mut() {
                    Some(merged) => merged.merge(stats),
                    None => partial = Some(stats),
                },
                Err(e) => {
                    debug!(target: "livemux::engine", peer = %peer.id, error = %e, "peer excluded from result");
                    result.failed.insert(peer.id.to_string(), e.to_string());
                }
            }
        }

        if request.is_stats() {
            let merged = partial.unwrap_or_else(|| {
                if request.is_group_by() {
                    PartialStats::Grouped(GroupedStats::new())
                } else {
                    PartialStats::Single(new_accumulators(&request.stats))
                }
            });
            result.rows = merged.into_rows();
            result.total = result.rows.len();
        }

        sort_rows(&mut result.rows, &request.sort);
        result.rows = apply_window(std::mem::take(&mut result.rows), request.offset, request.limit);
        Ok(result)
    }

    /// Forwards a command to the selected peers. Every peer is tried; the
    /// first failure is returned.
    pub async fn command(&self, request: &Request) -> MuxResult<()> {
        let Some(command) = request.command.as_deref() else {
            return Ok(());
        };
        let peers = self.select(&request.backends)?;
        self.metrics.commands.inc();

        let results = join_all(peers.iter().map(|peer| async move { (peer, peer.command(command).await) })).await;

        let mut first_error = None;
        for (peer, result) in results {
            if let Err(e) = result {
                warn!(target: "livemux::engine", peer = %peer.id, error = %e, "command not delivered");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Answers a parsed request with the bytes to write back.
    /// A delivered command produces no bytes.
    pub async fn respond(&self, request: &Request) -> Vec<u8> {
        let header = request.response_header;
        if request.is_command() {
            return match self.command(request).await {
                Ok(()) => Vec::new(),
                Err(e) => error_response(header, &e),
            };
        }

        let encoded = match self.execute(request).await {
            Ok(result) => encode_result(&result, request.format()),
            Err(e) => Err(e),
        };
        match encoded {
            Ok(body) => frame_response(header, STATUS_OK, &body),
            Err(e) => {
                self.metrics.query_errors.inc();
                error_response(header, &e)
            }
        }
    }
}

fn apply_window(rows: Vec<Row>, offset: Option<usize>, limit: Option<usize>) -> Vec<Row> {
    let rows = rows.into_iter().skip(offset.unwrap_or(0));
    match limit {
        Some(limit) => rows.take(limit).collect(),
        None => rows.collect(),
    }
}

// ============================================================================
// SECTION 21: RESPONSE ENCODING
// ============================================================================

#[derive(Debug, Serialize)]
struct WrappedResponse<'a> {
    data: &'a [Row],
    total: usize,
    failed: &'a BTreeMap<String, String>,
}

/// JSON body for `result`, newline terminated.
pub fn encode_result(result: &QueryResult, format: OutputFormat) -> MuxResult<Vec<u8>> {
    let mut body = match format {
        OutputFormat::Json => serde_json::to_vec(&result.rows)?,
        OutputFormat::WrappedJson => serde_json::to_vec(&WrappedResponse {
            data: &result.rows,
            total: result.total,
            failed: &result.failed,
        })?,
    };
    body.push(b'\n');
    Ok(body)
}

/// Prefixes `body` with the fixed16 header when requested.
pub fn frame_response(header: ResponseHeader, status: u16, body: &[u8]) -> Vec<u8> {
    match header {
        ResponseHeader::None => body.to_vec(),
        ResponseHeader::Fixed16 => {
            let mut out = Vec::with_capacity(RESPONSE_HEADER_SIZE + body.len());
            out.extend_from_slice(format!("{:03} {:>11}\n", status, body.len()).as_bytes());
            out.extend_from_slice(body);
            out
        }
    }
}

/// The error text as response body, with the status of the error.
pub fn error_response(header: ResponseHeader, error: &MuxError) -> Vec<u8> {
    let body = format!("{}\n", error);
    frame_response(header, error.status_code(), body.as_bytes())
}

// ============================================================================
// SECTION 22: CLIENT LISTENER
// ============================================================================
// Accepts Livestatus clients on TCP and unix sockets:
// - bytes are buffered until a blank line or EOF
// - every request in the buffer is answered in order
// - `Keepalive: on` keeps the connection open for the next request
// - connection tasks are tracked so shutdown can drain them
// ============================================================================

// ----------------------------------------------------------------------------
// 22.1 Listener
// ----------------------------------------------------------------------------

/// A listening socket and its accept task.
#[derive(Debug)]
pub struct BoundListener {
    /// Resolved address, with the real port for `:0` binds
    pub address: String,
    pub task: TokioJoinHandle<()>,
}

/// Serves client connections for a peer map.
#[derive(Debug)]
pub struct ClientListener {
    peer_map: Arc<PeerMap>,
    max_request_bytes: usize,
    shutdown: CancellationToken,
    connections: TaskTracker,
    accepted: AtomicU64,
}

impl ClientListener {
    pub fn new(peer_map: Arc<PeerMap>, max_request_bytes: usize, shutdown: CancellationToken) -> Self {
        Self {
            peer_map,
            max_request_bytes,
            shutdown,
            connections: TaskTracker::new(),
            accepted: AtomicU64::new(0),
        }
    }

    /// Tracker of the spawned connection tasks.
    pub fn connections(&self) -> &TaskTracker {
        &self.connections
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(AtomicOrdering::Relaxed)
    }

    /// Binds `address` and spawns its accept loop.
    pub async fn serve(self: &Arc<Self>, address: &str) -> MuxResult<BoundListener> {
        if is_tcp_address(address) {
            let listener = TcpListener::bind(address)
                .await
                .mux_context(format!("failed to listen on {}", address))?;
            let local = listener.local_addr()?.to_string();
            info!(target: "livemux::listener", address = %local, "listening for tcp clients");
            let task = tokio::spawn(Arc::clone(self).accept_tcp(listener));
            Ok(BoundListener { address: local, task })
        } else {
            if Path::new(address).exists() {
                fs::remove_file(address)?;
            }
            let listener = UnixListener::bind(address)
                .mux_context(format!("failed to listen on {}", address))?;
            info!(target: "livemux::listener", address = %address, "listening for unix socket clients");
            let task = tokio::spawn(Arc::clone(self).accept_unix(listener, PathBuf::from(address)));
            Ok(BoundListener {
                address: address.to_string(),
                task,
            })
        }
    }

    async fn accept_tcp(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let _ = stream.set_nodelay(true);
                        self.spawn_connection(stream, remote.to_string());
                    }
                    Err(e) => {
                        warn!(target: "livemux::listener", error = %e, "accept failed");
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!(target: "livemux::listener", "tcp accept loop stopped");
    }

    async fn accept_unix(self: Arc<Self>, listener: UnixListener, path: PathBuf) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => self.spawn_connection(stream, path.display().to_string()),
                    Err(e) => {
                        warn!(target: "livemux::listener", error = %e, "accept failed");
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        if let Err(e) = fs::remove_file(&path) {
            debug!(target: "livemux::listener", path = %path.display(), error = %e, "socket file not removed");
        }
        debug!(target: "livemux::listener", "unix accept loop stopped");
    }

    fn spawn_connection<S>(self: &Arc<Self>, stream: S, remote: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.accepted.fetch_add(1, AtomicOrdering::Relaxed);
        let this = Arc::clone(self);
        self.connections.spawn(async move {
            trace!(target: "livemux::listener", remote = %remote, "client connected");
            if let Err(e) = this.handle_connection(stream).await {
                debug!(target: "livemux::listener", remote = %remote, error = %e, "connection closed with error");
            }
        });
    }

    // ------------------------------------------------------------------------
    // Connection Handling
    // ------------------------------------------------------------------------

    /// Reads and answers requests until the client is done.
    pub async fn handle_connection<S>(&self, mut stream: S) -> MuxResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let mut eof = false;

        loop {
            while !eof && !holds_complete_request(&buffer) {
                let idle = is_blank(&buffer);
                let read = tokio::select! {
                    _ = self.shutdown.cancelled(), if idle => return Ok(()),
                    read = stream.read_buf(&mut buffer) => read?,
                };
                if read == 0 {
                    eof = true;
                }
                if buffer.len() > self.max_request_bytes {
                    let error = MuxError::Request(RequestError::MalformedHeader(format!(
                        "request exceeds {} bytes",
                        self.max_request_bytes
                    )));
                    stream.write_all(&error_response(requested_header(&buffer), &error)).await?;
                    return Ok(());
                }
            }

            if is_blank(&buffer) {
                break;
            }

            let (response, keepalive) = match Request::parse(&buffer) {
                Ok((request, consumed)) => {
                    buffer.advance(consumed);
                    trace!(target: "livemux::listener", request = %request, "request parsed");
                    let response = self.peer_map.respond(&request).await;
                    (response, request.keepalive())
                }
                Err(e) => {
                    let header = requested_header(&buffer);
                    debug!(target: "livemux::listener", error = %e, "invalid request");
                    self.peer_map.metrics().query_errors.inc();
                    let response = error_response(header, &MuxError::from(e));
                    buffer.clear();
                    (response, false)
                }
            };

            if !response.is_empty() {
                stream.write_all(&response).await?;
                stream.flush().await?;
            }
            if !keepalive && is_blank(&buffer) {
                break;
            }
        }

        let _ = stream.shutdown().await;
        Ok(())
    }
}

fn is_blank(buffer: &[u8]) -> bool {
    buffer.iter().all(|b| b.is_ascii_whitespace())
}

/// True once `buffer` holds a request terminated by a blank line.
fn holds_complete_request(buffer: &[u8]) -> bool {
    RequestFrame::locate(buffer).terminated.is_some()
}

/// The framing asked for by a request that could not be parsed.
fn requested_header(raw: &[u8]) -> ResponseHeader {
    let frame = RequestFrame::locate(raw);
    let fixed16 = String::from_utf8_lossy(&raw[frame.start..frame.end])
        .to_ascii_lowercase()
        .lines()
        .any(|line| line.trim() == "responseheader: fixed16");
    if fixed16 {
        ResponseHeader::Fixed16
    } else {
        ResponseHeader::None
    }
}

// ----------------------------------------------------------------------------
// 22.2 Raw Client
// ----------------------------------------------------------------------------

/// Sends one raw request to a Livestatus endpoint and returns the raw answer.
pub async fn send_request(address: &str, request: &str, timeouts: Timeouts) -> MuxResult<Vec<u8>> {
    let payload = format!("{}\n\n", request.trim_end());
    let connect = timeouts.connect;
    if is_tcp_address(address) {
        let stream = timeout(connect, TcpStream::connect(address))
            .await
            .map_err(|_| PeerError::timeout(format!("connect to {}", address), connect))?
            .map_err(|e| PeerError::connection_failed(address, e))?;
        exchange_raw(stream, payload.as_bytes(), timeouts.net).await
    } else {
        let stream = timeout(connect, UnixStream::connect(address))
            .await
            .map_err(|_| PeerError::timeout(format!("connect to {}", address), connect))?
            .map_err(|e| PeerError::connection_failed(address, e))?;
        exchange_raw(stream, payload.as_bytes(), timeouts.net).await
    }
}

async fn exchange_raw<S>(mut stream: S, payload: &[u8], limit: Duration) -> MuxResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        stream.write_all(payload).await?;
        stream.shutdown().await?;
        let mut answer = Vec::new();
        stream.read_to_end(&mut answer).await?;
        Ok::<_, io::Error>(answer)
    };
    let answer = timeout(limit, exchange)
        .await
        .map_err(|_| PeerError::timeout("raw request", limit))??;
    Ok(answer)
}

// ============================================================================
// SECTION 23: PROMETHEUS METRICS
// ============================================================================
// Engine counters in a dedicated registry, served as text exposition on
// `/metrics` when `listener.listen_prometheus` is set.
// ============================================================================

/// Counters and gauges of one engine instance.
#[derive(Debug, Clone)]
pub struct MuxMetrics {
    registry: PrometheusRegistry,
    /// Completed refresh cycles per peer
    pub peer_updates: IntCounterVec,
    /// Failed refresh cycles per peer
    pub peer_update_errors: IntCounterVec,
    /// Current `PEER_STATUS_*` code per peer
    pub peer_status: IntGaugeVec,
    /// Queries per table
    pub queries: IntCounterVec,
    /// Requests answered with an error
    pub query_errors: IntCounter,
    /// Commands forwarded
    pub commands: IntCounter,
}

impl MuxMetrics {
    pub fn new() -> MuxResult<Self> {
        let registry = PrometheusRegistry::new_custom(Some(ENGINE_NAME.to_string()), None).map_err(metrics_error)?;

        let peer_updates = IntCounterVec::new(
            Opts::new("peer_updates_total", "Completed refresh cycles"),
            &["peer"],
        )
        .map_err(metrics_error)?;
        let peer_update_errors = IntCounterVec::new(
            Opts::new("peer_update_errors_total", "Failed refresh cycles"),
            &["peer"],
        )
        .map_err(metrics_error)?;
        let peer_status = IntGaugeVec::new(
            Opts::new("peer_status", "Peer status (0 up, 2 down, 4 pending)"),
            &["peer"],
        )
        .map_err(metrics_error)?;
        let queries = IntCounterVec::new(Opts::new("queries_total", "Queries by table"), &["table"])
            .map_err(metrics_error)?;
        let query_errors = IntCounter::with_opts(Opts::new("query_errors_total", "Requests answered with an error"))
            .map_err(metrics_error)?;
        let commands = IntCounter::with_opts(Opts::new("commands_total", "Commands forwarded"))
            .map_err(metrics_error)?;

        registry.register(Box::new(peer_updates.clone())).map_err(metrics_error)?;
        registry.register(Box::new(peer_update_errors.clone())).map_err(metrics_error)?;
        registry.register(Box::new(peer_status.clone())).map_err(metrics_error)?;
        registry.register(Box::new(queries.clone())).map_err(metrics_error)?;
        registry.register(Box::new(query_errors.clone())).map_err(metrics_error)?;
        registry.register(Box::new(commands.clone())).map_err(metrics_error)?;
        #[cfg(target_os = "linux")]
        registry
            .register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            peer_updates,
            peer_update_errors,
            peer_status,
            queries,
            query_errors,
            commands,
        })
    }

    pub fn set_peer_status(&self, peer: &str, status: u8) {
        self.peer_status.with_label_values(&[peer]).set(i64::from(status));
    }

    /// Text exposition of all metrics.
    pub fn render(&self) -> MuxResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| MuxError::Internal(format!("metrics are not utf-8: {}", e)))
    }

    /// Serves `/metrics` on `address` until `shutdown` is cancelled.
    pub async fn serve(self: Arc<Self>, address: &str, shutdown: CancellationToken) -> MuxResult<BoundListener> {
        let listener = TcpListener::bind(address)
            .await
            .mux_context(format!("failed to listen on {}", address))?;
        let local = listener.local_addr()?.to_string();
        let app = Router::new().route("/metrics", get(metrics_handler)).with_state(self);
        info!(target: "livemux::engine", address = %local, "prometheus endpoint listening");

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(target: "livemux::engine", error = %e, "prometheus endpoint failed");
            }
        });
        Ok(BoundListener { address: local, task })
    }
}

async fn metrics_handler(State(metrics): State<Arc<MuxMetrics>>) -> Result<String, (axum::http::StatusCode, String)> {
    metrics
        .render()
        .map_err(|e| (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

fn metrics_error(e: prometheus::Error) -> MuxError {
    MuxError::Internal(format!("metrics registry: {}", e))
}

// ============================================================================
// SECTION 24: PHASE 4 TESTS
// ============================================================================
