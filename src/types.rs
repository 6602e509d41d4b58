//! Core data types for telewatch-rs
//!
//! This module contains the fundamental data structures shared by the
//! datastore, the device handler and the client API.
//!
//! # Main Types
//!
//! - [`EntryId`] - Stable identifier of a datastore entry
//! - [`IdAllocator`] - Explicit id source owned by a registry
//! - [`WatchableType`] - Variable or alias
//! - [`WatchableValue`] - Opaque last-known value of an entry
//! - [`VariableType`] - Storage type of a device variable (used for sizing reads)
//! - [`VariableDescription`] - Address/type/bit layout of a device variable
//! - [`VariableLookup`] - Boundary to the debug-symbol provider
//!
//! Values are kept opaque: the core never decodes raw device bytes into typed
//! numbers, it only needs to know how many bytes a variable occupies.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Identifier of a datastore entry. Never reused within a datastore lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u32);

impl EntryId {
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequential id source.
///
/// Each registry holds its own allocator, so tests can seed it and get
/// deterministic ids without any process-wide counter.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    /// Create an allocator whose first id is `seed`
    pub fn new(seed: u32) -> Self {
        Self { next: seed }
    }

    /// Hand out the next id
    pub fn allocate(&mut self) -> EntryId {
        let id = EntryId(self.next);
        self.next = self.next.wrapping_add(1);
        id
    }

    /// Peek at the id the next call to [`allocate`](Self::allocate) returns
    pub fn peek(&self) -> EntryId {
        EntryId(self.next)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Kind of a watchable entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WatchableType {
    /// A variable living in device memory
    #[serde(rename = "var")]
    Variable,
    /// A named alias referencing a variable
    #[serde(rename = "alias")]
    Alias,
}

impl WatchableType {
    /// All watchable types, in listing order
    pub fn all() -> &'static [WatchableType] {
        &[WatchableType::Variable, WatchableType::Alias]
    }

    /// Short name used on the client API
    pub fn api_name(&self) -> &'static str {
        match self {
            WatchableType::Variable => "var",
            WatchableType::Alias => "alias",
        }
    }

    /// Parse the client API name
    pub fn from_api_name(name: &str) -> Option<Self> {
        match name {
            "var" => Some(WatchableType::Variable),
            "alias" => Some(WatchableType::Alias),
            _ => None,
        }
    }
}

impl fmt::Display for WatchableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.api_name())
    }
}

/// Last-known value of an entry.
///
/// The device path stores raw bytes; clients may push any of the scalar forms
/// as a target value. No conversion happens between them here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WatchableValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl WatchableValue {
    /// Raw byte form of the value, if it carries one
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            WatchableValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for WatchableValue {
    fn from(bytes: Vec<u8>) -> Self {
        WatchableValue::Bytes(bytes)
    }
}

impl From<&[u8]> for WatchableValue {
    fn from(bytes: &[u8]) -> Self {
        WatchableValue::Bytes(bytes.to_vec())
    }
}

impl From<i64> for WatchableValue {
    fn from(v: i64) -> Self {
        WatchableValue::Int(v)
    }
}

impl From<f64> for WatchableValue {
    fn from(v: f64) -> Self {
        WatchableValue::Float(v)
    }
}

impl From<bool> for WatchableValue {
    fn from(v: bool) -> Self {
        WatchableValue::Bool(v)
    }
}

/// Represents the storage type of a device variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VariableType {
    /// 8-bit unsigned integer
    U8,
    /// 16-bit unsigned integer
    U16,
    /// 32-bit unsigned integer
    #[default]
    U32,
    /// 64-bit unsigned integer
    U64,
    /// 8-bit signed integer
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
    /// Boolean value
    Bool,
    /// Raw bytes (for custom interpretation)
    Raw(usize),
}

impl VariableType {
    /// Returns the size in bytes of this variable type
    pub fn size_bytes(&self) -> usize {
        match self {
            VariableType::U8 | VariableType::I8 | VariableType::Bool => 1,
            VariableType::U16 | VariableType::I16 => 2,
            VariableType::U32 | VariableType::I32 | VariableType::F32 => 4,
            VariableType::U64 | VariableType::I64 | VariableType::F64 => 8,
            VariableType::Raw(size) => *size,
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableType::U8 => write!(f, "u8"),
            VariableType::U16 => write!(f, "u16"),
            VariableType::U32 => write!(f, "u32"),
            VariableType::U64 => write!(f, "u64"),
            VariableType::I8 => write!(f, "i8"),
            VariableType::I16 => write!(f, "i16"),
            VariableType::I32 => write!(f, "i32"),
            VariableType::I64 => write!(f, "i64"),
            VariableType::F32 => write!(f, "f32"),
            VariableType::F64 => write!(f, "f64"),
            VariableType::Bool => write!(f, "bool"),
            VariableType::Raw(size) => write!(f, "raw[{}]", size),
        }
    }
}

/// Byte order of a description set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Enum attached to a variable description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDefinition {
    pub name: String,
    pub values: BTreeMap<String, i64>,
}

/// Location and layout of a device variable, as produced by the symbol parser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDescription {
    /// Identifier of the type in the symbol database
    pub type_id: Option<String>,
    /// Storage type
    pub var_type: VariableType,
    /// Absolute address in device memory
    pub address: u64,
    /// Bitfield width, for bitfield members
    #[serde(default)]
    pub bitsize: Option<u8>,
    /// Bitfield offset, for bitfield members
    #[serde(default)]
    pub bitoffset: Option<u8>,
    /// Attached enum, if any
    #[serde(default)]
    pub enum_def: Option<EnumDefinition>,
}

impl VariableDescription {
    /// Create a plain (non-bitfield, non-enum) description
    pub fn new(address: u64, var_type: VariableType) -> Self {
        Self {
            type_id: None,
            var_type,
            address,
            bitsize: None,
            bitoffset: None,
            enum_def: None,
        }
    }

    /// Attach a bitfield layout
    pub fn with_bitfield(mut self, bitoffset: u8, bitsize: u8) -> Self {
        self.bitoffset = Some(bitoffset);
        self.bitsize = Some(bitsize);
        self
    }

    /// Attach an enum
    pub fn with_enum(mut self, enum_def: EnumDefinition) -> Self {
        self.enum_def = Some(enum_def);
        self
    }

    /// Number of bytes that must be read from the device for this variable
    pub fn byte_len(&self) -> usize {
        self.var_type.size_bytes()
    }

    /// True if the variable is a bitfield member
    pub fn is_bitfield(&self) -> bool {
        self.bitsize.is_some()
    }
}

/// Provider of variable descriptions, keyed by fully-qualified path
pub trait VariableLookup {
    /// Describe the variable at `path`
    fn lookup(&self, path: &str) -> Option<VariableDescription>;

    /// All paths known to the provider, in a stable order
    fn paths(&self) -> Vec<String>;

    /// Byte order shared by every description of the set
    fn endianness(&self) -> Endianness;
}

/// In-memory description set, as loaded from a symbol export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableDescriptionSet {
    #[serde(default)]
    pub endianness: Endianness,
    #[serde(default)]
    pub variables: HashMap<String, VariableDescription>,
}

impl VariableDescriptionSet {
    pub fn new(endianness: Endianness) -> Self {
        Self {
            endianness,
            variables: HashMap::new(),
        }
    }

    /// Add or replace a description
    pub fn insert(&mut self, path: impl Into<String>, desc: VariableDescription) {
        self.variables.insert(path.into(), desc);
    }
}

impl VariableLookup for VariableDescriptionSet {
    fn lookup(&self, path: &str) -> Option<VariableDescription> {
        self.variables.get(path).cloned()
    }

    fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.variables.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn endianness(&self) -> Endianness {
        self.endianness
    }
}
