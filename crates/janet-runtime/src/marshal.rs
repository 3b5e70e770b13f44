//! Point-to-point wire format for shipping `Value`s between processes
//! (spec §6 "Marshal format").
//!
//! Grounded on `serialize.rs`'s `TypedValue`: an owned, serde-derived mirror
//! of the runtime value type, moved across a boundary with `bincode`. That
//! type is flat (no arena pointers survive the trip); this one has the same
//! job for a GC-heap value, which adds two things `TypedValue` didn't need:
//!
//! - containers are heap-indexed (`ArrayRef`/`TableRef`/`FunctionRef`), so
//!   encoding needs a live `Heap` to read through, and a table/array can
//!   reference itself, so encoding must reserve a pool slot *before*
//!   recursing into a container's contents, not after.
//! - tuples and structs are hash-consed; two inputs built from the same
//!   `Arc` must decode back to the same shared value, not two copies. Both
//! containers and hash-consed values use the same trick: a pool of `Wire*`
//! records plus a by-identity `seen` map, so a repeated reference becomes a
//! back-index instead of a second copy.
//!
//! `CFunction`/`Fiber`/`Abstract`/`Pointer` are process-local identifiers
//! with no portable meaning and are rejected, the same way `serialize.rs`
//! rejects `Quotation`/`Closure`/`Channel`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use janet_core::value::{ArrayRef, FunctionRef, TableRef};
use janet_core::{BracketKind, InternTable, JanetString, Struct, StructBuilder, Tuple, TupleBuilder, Value};

use crate::array::ArrayData;
use crate::buffer::BufferData;
use crate::funcdef::{verify, EnvSource, FuncDef, FuncDefData};
use crate::funcenv::{FuncEnvData, FuncEnvStorage, FunctionData};
use crate::gc::Heap;
use crate::table::{TableData, WeakKind};
use crate::vm::Vm;

#[derive(Debug)]
pub enum MarshalError {
    /// A value kind with no portable meaning across processes.
    NotMarshalable(&'static str),
    /// A `GcRef` the wire data or the live heap no longer backs.
    Dangling(&'static str),
    InvalidData(String),
    Bincode(Box<bincode::Error>),
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::NotMarshalable(kind) => write!(f, "{kind} is not marshalable"),
            MarshalError::Dangling(kind) => write!(f, "dangling {kind} reference"),
            MarshalError::InvalidData(msg) => write!(f, "invalid marshal data: {msg}"),
            MarshalError::Bincode(e) => write!(f, "bincode error: {e}"),
        }
    }
}

impl std::error::Error for MarshalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MarshalError::Bincode(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<bincode::Error> for MarshalError {
    fn from(e: bincode::Error) -> Self {
        MarshalError::Bincode(Box::new(e))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum WireBracket {
    Paren,
    Bracket,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum WireWeakKind {
    None,
    Key,
    Value,
    Both,
}

impl From<WeakKind> for WireWeakKind {
    fn from(w: WeakKind) -> Self {
        match w {
            WeakKind::None => WireWeakKind::None,
            WeakKind::Key => WireWeakKind::Key,
            WeakKind::Value => WireWeakKind::Value,
            WeakKind::Both => WireWeakKind::Both,
        }
    }
}

impl From<WireWeakKind> for WeakKind {
    fn from(w: WireWeakKind) -> Self {
        match w {
            WireWeakKind::None => WeakKind::None,
            WireWeakKind::Key => WeakKind::Key,
            WireWeakKind::Value => WeakKind::Value,
            WireWeakKind::Both => WeakKind::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum WireEnvSource {
    OnStack,
    Shared(u32),
}

/// A `Value`, with hash-consed and heap-indexed containers replaced by an
/// index into one of `WirePools`'s tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireValue {
    Nil,
    Boolean(bool),
    Number(f64),
    String(Vec<u8>),
    Symbol(Vec<u8>),
    Keyword(Vec<u8>),
    Array(u32),
    Tuple(u32),
    Table(u32),
    Struct(u32),
    Buffer(Vec<u8>),
    Function(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireTuple {
    bracket: WireBracket,
    values: Vec<WireValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireStruct {
    pairs: Vec<(WireValue, WireValue)>,
    proto: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireArray {
    values: Vec<WireValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireTable {
    pairs: Vec<(WireValue, WireValue)>,
    proto: Option<u32>,
    weak: WireWeakKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFuncDef {
    name: Option<String>,
    source: Option<String>,
    source_path: Option<String>,
    arity: u32,
    min_arity: u32,
    max_arity: u32,
    vararg: bool,
    slot_count: u32,
    constants: Vec<WireValue>,
    child_defs: Vec<u32>,
    environments: Vec<WireEnvSource>,
    closure_bitset: Option<Vec<bool>>,
    bytecode: Vec<u32>,
    source_map: Vec<(u32, u32)>,
    symbol_map: Vec<(u32, Vec<u8>)>,
}

fn placeholder_funcdef() -> WireFuncDef {
    WireFuncDef {
        name: None,
        source: None,
        source_path: None,
        arity: 0,
        min_arity: 0,
        max_arity: 0,
        vararg: false,
        slot_count: 0,
        constants: Vec::new(),
        child_defs: Vec::new(),
        environments: Vec::new(),
        closure_bitset: None,
        bytecode: Vec::new(),
        source_map: Vec::new(),
        symbol_map: Vec::new(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunction {
    funcdef: u32,
    /// One entry per `FunctionData::envs` slot; `None` for an unused
    /// environment slot, `Some(values)` for a detached closure's captured
    /// upvalues. An `OnStack` env is a hard marshal error, caught during
    /// encoding, so decoding never has to account for it.
    envs: Vec<Option<Vec<WireValue>>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WirePools {
    tuples: Vec<WireTuple>,
    structs: Vec<WireStruct>,
    arrays: Vec<WireArray>,
    tables: Vec<WireTable>,
    functions: Vec<WireFunction>,
    funcdefs: Vec<WireFuncDef>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireDocument {
    root: WireValue,
    pools: WirePools,
}

struct Encoder<'h> {
    heap: &'h Heap,
    pools: WirePools,
    tuple_seen: HashMap<usize, u32>,
    struct_seen: HashMap<usize, u32>,
    array_seen: HashMap<(u32, u32), u32>,
    table_seen: HashMap<(u32, u32), u32>,
    function_seen: HashMap<(u32, u32), u32>,
    funcdef_seen: HashMap<usize, u32>,
}

impl<'h> Encoder<'h> {
    fn new(heap: &'h Heap) -> Self {
        Encoder {
            heap,
            pools: WirePools::default(),
            tuple_seen: HashMap::new(),
            struct_seen: HashMap::new(),
            array_seen: HashMap::new(),
            table_seen: HashMap::new(),
            function_seen: HashMap::new(),
            funcdef_seen: HashMap::new(),
        }
    }

    fn encode(&mut self, v: &Value) -> Result<WireValue, MarshalError> {
        Ok(match v {
            Value::Nil => WireValue::Nil,
            Value::Boolean(b) => WireValue::Boolean(*b),
            Value::Number(n) => WireValue::Number(*n),
            Value::String(s) => WireValue::String(s.as_bytes().to_vec()),
            Value::Symbol(s) => WireValue::Symbol(s.as_bytes().to_vec()),
            Value::Keyword(k) => WireValue::Keyword(k.as_bytes().to_vec()),
            Value::Array(r) => WireValue::Array(self.encode_array(*r)?),
            Value::Tuple(t) => WireValue::Tuple(self.encode_tuple(t)?),
            Value::Table(r) => WireValue::Table(self.encode_table(*r)?),
            Value::Struct(s) => WireValue::Struct(self.encode_struct(s)?),
            Value::Buffer(r) => {
                let bytes = self
                    .heap
                    .buffers
                    .get(*r)
                    .ok_or(MarshalError::Dangling("buffer"))?
                    .as_bytes()
                    .to_vec();
                WireValue::Buffer(bytes)
            }
            Value::Function(r) => WireValue::Function(self.encode_function(*r)?),
            Value::CFunction(_) => return Err(MarshalError::NotMarshalable("cfunction")),
            Value::Fiber(_) => return Err(MarshalError::NotMarshalable("fiber")),
            Value::Abstract(_) => return Err(MarshalError::NotMarshalable("abstract")),
            Value::Pointer(_) => return Err(MarshalError::NotMarshalable("pointer")),
        })
    }

    fn encode_tuple(&mut self, t: &Tuple) -> Result<u32, MarshalError> {
        let key = t.ptr_identity();
        if let Some(&idx) = self.tuple_seen.get(&key) {
            return Ok(idx);
        }
        let idx = self.pools.tuples.len() as u32;
        self.pools.tuples.push(WireTuple { bracket: WireBracket::Paren, values: Vec::new() });
        self.tuple_seen.insert(key, idx);

        let bracket = match t.bracket_kind() {
            BracketKind::Paren => WireBracket::Paren,
            BracketKind::Bracket => WireBracket::Bracket,
        };
        let values = t.as_slice().to_vec();
        let encoded = values.iter().map(|v| self.encode(v)).collect::<Result<Vec<_>, _>>()?;
        self.pools.tuples[idx as usize] = WireTuple { bracket, values: encoded };
        Ok(idx)
    }

    fn encode_struct(&mut self, s: &Struct) -> Result<u32, MarshalError> {
        let key = s.ptr_identity();
        if let Some(&idx) = self.struct_seen.get(&key) {
            return Ok(idx);
        }
        let idx = self.pools.structs.len() as u32;
        self.pools.structs.push(WireStruct { pairs: Vec::new(), proto: None });
        self.struct_seen.insert(key, idx);

        let pairs: Vec<(Value, Value)> = s.pairs().cloned().collect();
        let proto = s.proto().cloned();
        let encoded_pairs = pairs
            .iter()
            .map(|(k, v)| Ok((self.encode(k)?, self.encode(v)?)))
            .collect::<Result<Vec<_>, MarshalError>>()?;
        let proto_idx = match proto {
            Some(p) => Some(self.encode_struct(&p)?),
            None => None,
        };
        self.pools.structs[idx as usize] = WireStruct { pairs: encoded_pairs, proto: proto_idx };
        Ok(idx)
    }

    fn encode_array(&mut self, r: ArrayRef) -> Result<u32, MarshalError> {
        let key = (r.index(), r.generation());
        if let Some(&idx) = self.array_seen.get(&key) {
            return Ok(idx);
        }
        let idx = self.pools.arrays.len() as u32;
        self.pools.arrays.push(WireArray { values: Vec::new() });
        self.array_seen.insert(key, idx);

        let values = self
            .heap
            .arrays
            .get(r)
            .ok_or(MarshalError::Dangling("array"))?
            .as_slice()
            .to_vec();
        let encoded = values.iter().map(|v| self.encode(v)).collect::<Result<Vec<_>, _>>()?;
        self.pools.arrays[idx as usize] = WireArray { values: encoded };
        Ok(idx)
    }

    fn encode_table(&mut self, r: TableRef) -> Result<u32, MarshalError> {
        let key = (r.index(), r.generation());
        if let Some(&idx) = self.table_seen.get(&key) {
            return Ok(idx);
        }
        let idx = self.pools.tables.len() as u32;
        self.pools.tables.push(WireTable { pairs: Vec::new(), proto: None, weak: WireWeakKind::None });
        self.table_seen.insert(key, idx);

        let data = self.heap.tables.get(r).ok_or(MarshalError::Dangling("table"))?;
        let pairs: Vec<(Value, Value)> = data.entries().map(|(k, v)| (k.clone(), v.clone())).collect();
        let proto = data.proto;
        let weak = data.weak;

        let encoded_pairs = pairs
            .iter()
            .map(|(k, v)| Ok((self.encode(k)?, self.encode(v)?)))
            .collect::<Result<Vec<_>, MarshalError>>()?;
        let proto_idx = match proto {
            Some(p) => Some(self.encode_table(p)?),
            None => None,
        };
        self.pools.tables[idx as usize] = WireTable { pairs: encoded_pairs, proto: proto_idx, weak: weak.into() };
        Ok(idx)
    }

    fn encode_function(&mut self, r: FunctionRef) -> Result<u32, MarshalError> {
        let key = (r.index(), r.generation());
        if let Some(&idx) = self.function_seen.get(&key) {
            return Ok(idx);
        }
        let idx = self.pools.functions.len() as u32;
        self.pools.functions.push(WireFunction { funcdef: 0, envs: Vec::new() });
        self.function_seen.insert(key, idx);

        let data = self.heap.functions.get(r).ok_or(MarshalError::Dangling("function"))?;
        let def = data.def.clone();
        let env_refs = data.envs.clone();

        let funcdef_idx = self.encode_funcdef(&def)?;
        let mut envs = Vec::with_capacity(env_refs.len());
        for env_ref in &env_refs {
            let wire_env = match env_ref {
                None => None,
                Some(e) => {
                    let env_data = self.heap.func_envs.get(*e).ok_or(MarshalError::Dangling("func_env"))?;
                    match &env_data.storage {
                        FuncEnvStorage::OnStack { .. } => {
                            return Err(MarshalError::NotMarshalable(
                                "function closes over a live stack frame",
                            ))
                        }
                        FuncEnvStorage::Detached { values } => {
                            let values = values.clone();
                            let encoded = values.iter().map(|v| self.encode(v)).collect::<Result<Vec<_>, _>>()?;
                            Some(encoded)
                        }
                    }
                }
            };
            envs.push(wire_env);
        }
        self.pools.functions[idx as usize] = WireFunction { funcdef: funcdef_idx, envs };
        Ok(idx)
    }

    fn encode_funcdef(&mut self, def: &FuncDef) -> Result<u32, MarshalError> {
        let key = Arc::as_ptr(def) as usize;
        if let Some(&idx) = self.funcdef_seen.get(&key) {
            return Ok(idx);
        }
        let idx = self.pools.funcdefs.len() as u32;
        self.pools.funcdefs.push(placeholder_funcdef());
        self.funcdef_seen.insert(key, idx);

        let constants = def.constants.iter().map(|v| self.encode(v)).collect::<Result<Vec<_>, _>>()?;
        let child_defs = def
            .child_defs
            .iter()
            .map(|c| self.encode_funcdef(c))
            .collect::<Result<Vec<_>, _>>()?;
        let environments = def
            .environments
            .iter()
            .map(|e| match e {
                EnvSource::OnStack => WireEnvSource::OnStack,
                EnvSource::Shared(k) => WireEnvSource::Shared(*k),
            })
            .collect();
        let symbol_map = def.symbol_map.iter().map(|(i, s)| (*i, s.as_bytes().to_vec())).collect();

        self.pools.funcdefs[idx as usize] = WireFuncDef {
            name: def.name.clone(),
            source: def.source.clone(),
            source_path: def.source_path.clone(),
            arity: def.arity,
            min_arity: def.min_arity,
            max_arity: def.max_arity,
            vararg: def.vararg,
            slot_count: def.slot_count,
            constants,
            child_defs,
            environments,
            closure_bitset: def.closure_bitset.clone(),
            bytecode: def.bytecode.clone(),
            source_map: def.source_map.clone(),
            symbol_map,
        };
        Ok(idx)
    }
}

/// Serializes `value` to the wire format (spec §6), reading containers
/// through `vm`'s heap.
pub fn marshal(vm: &Vm, value: &Value) -> Result<Vec<u8>, MarshalError> {
    let mut encoder = Encoder::new(&vm.heap);
    let root = encoder.encode(value)?;
    let doc = WireDocument { root, pools: encoder.pools };
    bincode::serialize(&doc).map_err(MarshalError::from)
}

struct Decoder<'h> {
    heap: &'h mut Heap,
    interns: &'h mut InternTable,
    pools: WirePools,
    array_refs: Vec<ArrayRef>,
    table_refs: Vec<TableRef>,
    function_refs: Vec<FunctionRef>,
    tuple_cache: Vec<Option<Tuple>>,
    tuple_in_progress: Vec<bool>,
    struct_cache: Vec<Option<Struct>>,
    struct_in_progress: Vec<bool>,
    funcdef_cache: Vec<Option<FuncDef>>,
    funcdef_in_progress: Vec<bool>,
}

impl<'h> Decoder<'h> {
    fn new(heap: &'h mut Heap, interns: &'h mut InternTable, pools: WirePools) -> Self {
        let tuples = pools.tuples.len();
        let structs = pools.structs.len();
        let funcdefs = pools.funcdefs.len();
        Decoder {
            heap,
            interns,
            pools,
            array_refs: Vec::new(),
            table_refs: Vec::new(),
            function_refs: Vec::new(),
            tuple_cache: vec![None; tuples],
            tuple_in_progress: vec![false; tuples],
            struct_cache: vec![None; structs],
            struct_in_progress: vec![false; structs],
            funcdef_cache: vec![None; funcdefs],
            funcdef_in_progress: vec![false; funcdefs],
        }
    }

    /// Allocates heap slots for every pooled array/table/function up front,
    /// so that cyclic references between them (a table that contains
    /// itself, say) resolve to an already-known `GcRef` instead of
    /// recursing forever.
    fn preallocate(&mut self) {
        for _ in 0..self.pools.arrays.len() {
            self.array_refs.push(self.heap.alloc_array(ArrayData::new(0)));
        }
        for _ in 0..self.pools.tables.len() {
            self.table_refs.push(self.heap.alloc_table(TableData::new(0)));
        }
        for _ in 0..self.pools.functions.len() {
            let def: FuncDef = Arc::new(empty_funcdef());
            self.function_refs
                .push(self.heap.alloc_function(FunctionData { def, envs: Vec::new() }));
        }
    }

    fn fill(&mut self) -> Result<(), MarshalError> {
        for i in 0..self.pools.arrays.len() {
            let values = self.pools.arrays[i].values.clone();
            let mut decoded = Vec::with_capacity(values.len());
            for w in &values {
                decoded.push(self.decode_value(w)?);
            }
            let r = self.array_refs[i];
            if let Some(data) = self.heap.arrays.get_mut(r) {
                for v in decoded {
                    data.push(v);
                }
            }
        }

        for i in 0..self.pools.tables.len() {
            let pairs = self.pools.tables[i].pairs.clone();
            let proto = self.pools.tables[i].proto;
            let weak = self.pools.tables[i].weak;
            let mut decoded_pairs = Vec::with_capacity(pairs.len());
            for (k, v) in &pairs {
                decoded_pairs.push((self.decode_value(k)?, self.decode_value(v)?));
            }
            let proto_ref = match proto {
                Some(p) => Some(*self.table_refs.get(p as usize).ok_or_else(|| {
                    MarshalError::InvalidData("table proto index out of range".to_string())
                })?),
                None => None,
            };
            let r = self.table_refs[i];
            if let Some(data) = self.heap.tables.get_mut(r) {
                for (k, v) in decoded_pairs {
                    if !matches!(k, Value::Nil) {
                        data.put(k, v);
                    }
                }
                data.proto = proto_ref;
                data.weak = weak.into();
            }
        }

        for i in 0..self.pools.functions.len() {
            let funcdef_idx = self.pools.functions[i].funcdef;
            let envs_wire = self.pools.functions[i].envs.clone();
            let def = self.decode_funcdef(funcdef_idx)?;
            let mut envs = Vec::with_capacity(envs_wire.len());
            for env in &envs_wire {
                match env {
                    None => envs.push(None),
                    Some(values_wire) => {
                        let mut values = Vec::with_capacity(values_wire.len());
                        for w in values_wire {
                            values.push(self.decode_value(w)?);
                        }
                        let length = values.len();
                        let env_ref = self
                            .heap
                            .alloc_func_env(FuncEnvData { storage: FuncEnvStorage::Detached { values }, length });
                        envs.push(Some(env_ref));
                    }
                }
            }
            let r = self.function_refs[i];
            if let Some(data) = self.heap.functions.get_mut(r) {
                data.def = def;
                data.envs = envs;
            }
        }

        Ok(())
    }

    fn decode_value(&mut self, w: &WireValue) -> Result<Value, MarshalError> {
        Ok(match w {
            WireValue::Nil => Value::Nil,
            WireValue::Boolean(b) => Value::Boolean(*b),
            WireValue::Number(n) => Value::Number(*n),
            WireValue::String(bytes) => Value::String(JanetString::new(bytes.clone())),
            WireValue::Symbol(bytes) => Value::Symbol(self.interns.intern(bytes)),
            WireValue::Keyword(bytes) => Value::Keyword(JanetString::new(bytes.clone())),
            WireValue::Array(idx) => Value::Array(
                *self
                    .array_refs
                    .get(*idx as usize)
                    .ok_or_else(|| MarshalError::InvalidData("array index out of range".to_string()))?,
            ),
            WireValue::Table(idx) => Value::Table(
                *self
                    .table_refs
                    .get(*idx as usize)
                    .ok_or_else(|| MarshalError::InvalidData("table index out of range".to_string()))?,
            ),
            WireValue::Function(idx) => Value::Function(
                *self
                    .function_refs
                    .get(*idx as usize)
                    .ok_or_else(|| MarshalError::InvalidData("function index out of range".to_string()))?,
            ),
            WireValue::Buffer(bytes) => Value::Buffer(self.heap.alloc_buffer(BufferData::from_bytes(bytes.clone()))),
            WireValue::Tuple(idx) => Value::Tuple(self.decode_tuple(*idx)?),
            WireValue::Struct(idx) => Value::Struct(self.decode_struct(*idx)?),
        })
    }

    fn decode_tuple(&mut self, idx: u32) -> Result<Tuple, MarshalError> {
        let i = idx as usize;
        if let Some(Some(t)) = self.tuple_cache.get(i) {
            return Ok(t.clone());
        }
        if *self
            .tuple_in_progress
            .get(i)
            .ok_or_else(|| MarshalError::InvalidData("tuple index out of range".to_string()))?
        {
            return Err(MarshalError::InvalidData("cyclic tuple reference".to_string()));
        }
        self.tuple_in_progress[i] = true;
        let wire = self.pools.tuples[i].clone();
        let mut builder = TupleBuilder::begin(wire.values.len());
        for w in &wire.values {
            builder.put(self.decode_value(w)?);
        }
        let bracket = match wire.bracket {
            WireBracket::Paren => BracketKind::Paren,
            WireBracket::Bracket => BracketKind::Bracket,
        };
        let t = builder.end(bracket);
        self.tuple_in_progress[i] = false;
        self.tuple_cache[i] = Some(t.clone());
        Ok(t)
    }

    fn decode_struct(&mut self, idx: u32) -> Result<Struct, MarshalError> {
        let i = idx as usize;
        if let Some(Some(s)) = self.struct_cache.get(i) {
            return Ok(s.clone());
        }
        if *self
            .struct_in_progress
            .get(i)
            .ok_or_else(|| MarshalError::InvalidData("struct index out of range".to_string()))?
        {
            return Err(MarshalError::InvalidData("cyclic struct reference".to_string()));
        }
        self.struct_in_progress[i] = true;
        let wire = self.pools.structs[i].clone();
        let mut builder = StructBuilder::begin(wire.pairs.len());
        for (k, v) in &wire.pairs {
            builder.put(self.decode_value(k)?, self.decode_value(v)?);
        }
        let proto = match wire.proto {
            Some(p) => Some(self.decode_struct(p)?),
            None => None,
        };
        let s = builder.end_with_proto(proto);
        self.struct_in_progress[i] = false;
        self.struct_cache[i] = Some(s.clone());
        Ok(s)
    }

    fn decode_funcdef(&mut self, idx: u32) -> Result<FuncDef, MarshalError> {
        let i = idx as usize;
        if let Some(Some(d)) = self.funcdef_cache.get(i) {
            return Ok(d.clone());
        }
        if *self
            .funcdef_in_progress
            .get(i)
            .ok_or_else(|| MarshalError::InvalidData("funcdef index out of range".to_string()))?
        {
            return Err(MarshalError::InvalidData("cyclic funcdef reference".to_string()));
        }
        self.funcdef_in_progress[i] = true;
        let wire = self.pools.funcdefs[i].clone();

        let mut constants = Vec::with_capacity(wire.constants.len());
        for w in &wire.constants {
            constants.push(self.decode_value(w)?);
        }
        let mut child_defs = Vec::with_capacity(wire.child_defs.len());
        for &c in &wire.child_defs {
            child_defs.push(self.decode_funcdef(c)?);
        }
        let environments = wire
            .environments
            .iter()
            .map(|e| match e {
                WireEnvSource::OnStack => EnvSource::OnStack,
                WireEnvSource::Shared(k) => EnvSource::Shared(*k),
            })
            .collect();
        let symbol_map = wire
            .symbol_map
            .iter()
            .map(|(i, bytes)| (*i, self.interns.intern(bytes)))
            .collect();

        let def: FuncDef = Arc::new(FuncDefData {
            name: wire.name,
            source: wire.source,
            source_path: wire.source_path,
            arity: wire.arity,
            min_arity: wire.min_arity,
            max_arity: wire.max_arity,
            vararg: wire.vararg,
            slot_count: wire.slot_count,
            constants,
            child_defs,
            environments,
            closure_bitset: wire.closure_bitset,
            bytecode: wire.bytecode,
            source_map: wire.source_map,
            symbol_map,
        });
        verify(&def).map_err(|e| MarshalError::InvalidData(format!("funcdef failed verification: {e}")))?;

        self.funcdef_in_progress[i] = false;
        self.funcdef_cache[i] = Some(def.clone());
        Ok(def)
    }
}

fn empty_funcdef() -> FuncDefData {
    FuncDefData {
        name: None,
        source: None,
        source_path: None,
        arity: 0,
        min_arity: 0,
        max_arity: 0,
        vararg: false,
        slot_count: 0,
        constants: Vec::new(),
        child_defs: Vec::new(),
        environments: Vec::new(),
        closure_bitset: None,
        bytecode: vec![crate::opcodes::Op::ReturnNil.encode()],
        source_map: Vec::new(),
        symbol_map: Vec::new(),
    }
}

/// Deserializes a wire-format value, allocating any containers it needs
/// into `vm`'s heap and interning any symbols into `vm`'s symbol cache.
pub fn unmarshal(vm: &mut Vm, bytes: &[u8]) -> Result<Value, MarshalError> {
    let doc: WireDocument = bincode::deserialize(bytes).map_err(MarshalError::from)?;
    let WireDocument { root, pools } = doc;
    let mut decoder = Decoder::new(&mut vm.heap, &mut vm.interns, pools);
    decoder.preallocate();
    decoder.fill()?;
    decoder.decode_value(&root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmConfig;

    #[test]
    fn scalar_roundtrip() {
        let vm = Vm::new(VmConfig::default());
        let bytes = marshal(&vm, &Value::number(42.0)).unwrap();
        let mut vm = vm;
        let back = unmarshal(&mut vm, &bytes).unwrap();
        assert_eq!(back.unwrap_number(), Some(42.0));
    }

    #[test]
    fn string_roundtrip() {
        let vm = Vm::new(VmConfig::default());
        let bytes = marshal(&vm, &Value::string("hello")).unwrap();
        let mut vm = vm;
        let back = unmarshal(&mut vm, &bytes).unwrap();
        assert!(back.equals(&Value::string("hello")));
    }

    #[test]
    fn tuple_sharing_survives_roundtrip() {
        let vm = Vm::new(VmConfig::default());
        let mut b = TupleBuilder::begin(2);
        b.put(Value::number(1.0));
        b.put(Value::number(2.0));
        let shared = b.end(BracketKind::Paren);

        let mut outer = TupleBuilder::begin(2);
        outer.put(Value::Tuple(shared.clone()));
        outer.put(Value::Tuple(shared));
        let outer = outer.end(BracketKind::Paren);

        let bytes = marshal(&vm, &Value::Tuple(outer)).unwrap();
        let mut vm = vm;
        let back = unmarshal(&mut vm, &bytes).unwrap();
        let back = back.unwrap_tuple().unwrap();
        let a = back.get(0).unwrap().unwrap_tuple().unwrap();
        let b = back.get(1).unwrap().unwrap_tuple().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn array_roundtrips_through_heap() {
        let mut vm = Vm::new(VmConfig::default());
        let inner = vm.heap.alloc_array(ArrayData::from_values(vec![Value::number(1.0), Value::number(2.0)]));
        let bytes = marshal(&vm, &Value::Array(inner)).unwrap();
        let back = unmarshal(&mut vm, &bytes).unwrap();
        let back_ref = back.unwrap_array().unwrap();
        let data = vm.heap.arrays.get(back_ref).unwrap();
        assert_eq!(data.as_slice().len(), 2);
    }

    #[test]
    fn self_referential_array_does_not_overflow() {
        let mut vm = Vm::new(VmConfig::default());
        let r = vm.heap.alloc_array(ArrayData::new(1));
        vm.heap.arrays.get_mut(r).unwrap().push(Value::Array(r));
        let bytes = marshal(&vm, &Value::Array(r)).unwrap();
        let back = unmarshal(&mut vm, &bytes).unwrap();
        let back_ref = back.unwrap_array().unwrap();
        let data = vm.heap.arrays.get(back_ref).unwrap();
        assert!(matches!(data.as_slice()[0], Value::Array(r2) if r2.index() == back_ref.index()));
    }

    #[test]
    fn cfunction_is_not_marshalable() {
        let vm = Vm::new(VmConfig::default());
        let result = marshal(&vm, &Value::CFunction(janet_core::value::CFunctionId(0)));
        assert!(matches!(result, Err(MarshalError::NotMarshalable("cfunction"))));
    }

    #[test]
    fn corrupted_bytes_return_error() {
        let mut vm = Vm::new(VmConfig::default());
        let result = unmarshal(&mut vm, &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }
}
