//! The explicit VM handle (spec §5/§9 design note): rather than recreating
//! `arena.rs`'s thread-local-pointer pattern, every piece of per-VM state —
//! heap, symbol cache, scratch memory, registered C functions — is a field
//! on an ordinary struct an embedder owns and passes around explicitly.

use std::collections::HashMap;

use janet_core::value::{CFunctionId, FiberRef, FunctionRef};
use janet_core::{InternTable, Value};

use crate::error::VmError;
use crate::fiber::{FiberData, Signal, SignalMask};
use crate::gc::{GcLockGuard, Heap};

/// Signature every registered C function must have (spec §6 "C-function
/// ABI"), expressed in Rust as a plain `fn` pointer rather than the C
/// `fn(argc, argv) -> Value` form: `Vm` replaces the implicit global state
/// a C function would reach for, and a `Result` replaces `panic`/`panicv`.
pub type CFunction = fn(&mut Vm, &[Value]) -> Result<Value, VmError>;

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_stack: usize,
    pub gc_interval: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_stack: 1 << 16,
            gc_interval: 4096,
        }
    }
}

pub struct Vm {
    pub heap: Heap,
    pub interns: InternTable,
    pub config: VmConfig,
    cfunctions: Vec<CFunction>,
    cfunction_names: HashMap<&'static str, CFunctionId>,
    pub current_fiber: Option<FiberRef>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let mut heap = Heap::new();
        heap.pressure(0);
        Vm {
            heap,
            interns: InternTable::new(),
            config,
            cfunctions: Vec::new(),
            cfunction_names: HashMap::new(),
            current_fiber: None,
        }
    }

    pub fn register_cfunction(&mut self, name: &'static str, f: CFunction) -> CFunctionId {
        let id = CFunctionId(self.cfunctions.len() as u32);
        self.cfunctions.push(f);
        self.cfunction_names.insert(name, id);
        id
    }

    pub fn lookup_cfunction(&self, name: &str) -> Option<CFunctionId> {
        self.cfunction_names.get(name).copied()
    }

    pub fn call_cfunction(&mut self, id: CFunctionId, args: &[Value]) -> Result<Value, VmError> {
        let f = *self
            .cfunctions
            .get(id.0 as usize)
            .ok_or_else(|| VmError::Panic(format!("no cfunction registered at id {}", id.0)))?;
        f(self, args)
    }

    pub fn spawn_fiber(&mut self, func: FunctionRef, mask: SignalMask) -> FiberRef {
        let data = FiberData::new(func, self.config.max_stack, mask);
        self.heap.alloc_fiber(data)
    }

    pub fn gc_lock(&mut self) -> GcLockGuard {
        self.heap.lock()
    }

    /// Resumes `fiber` with `value` as either its first argument (if
    /// `NEW`) or the value delivered to its pending `YIELD` (spec §4.E
    /// state machine).
    pub fn resume(&mut self, fiber: FiberRef, value: Value) -> Result<(Signal, Value), VmError> {
        crate::interp::resume(self, fiber, value)
    }

    /// Schedules delivery of an `ERROR` signal carrying `value` on the next
    /// `resume` (spec §4.E "cancel"). Non-preemptive: a fiber currently
    /// running is unaffected until it next suspends and is resumed. A dead
    /// fiber cannot be cancelled.
    pub fn cancel(&mut self, fiber: FiberRef, value: Value) {
        if let Some(data) = self.heap.fibers.get_mut(fiber) {
            if !matches!(data.status, crate::fiber::FiberStatus::Dead) {
                data.last_value = value.clone();
                data.pending_cancel = Some(value);
                data.status = crate::fiber::FiberStatus::Pending;
            }
        }
    }

    pub fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            let roots: Vec<Value> = self.current_fiber.map(Value::Fiber).into_iter().collect();
            self.heap.collect(&roots);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_cfn(_vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
        Ok(args.first().cloned().unwrap_or(Value::Nil))
    }

    #[test]
    fn register_and_call_cfunction_roundtrips() {
        let mut vm = Vm::new(VmConfig::default());
        let id = vm.register_cfunction("identity", noop_cfn);
        assert_eq!(vm.lookup_cfunction("identity"), Some(id));
        let result = vm.call_cfunction(id, &[Value::number(7.0)]).unwrap();
        assert_eq!(result.unwrap_number(), Some(7.0));
    }

    #[test]
    fn cancel_marks_fiber_pending_with_value() {
        let mut vm = Vm::new(VmConfig::default());
        let def = std::sync::Arc::new(crate::funcdef::FuncDefData {
            name: None,
            source: None,
            source_path: None,
            arity: 0,
            min_arity: 0,
            max_arity: 0,
            vararg: false,
            slot_count: 1,
            constants: Vec::new(),
            child_defs: Vec::new(),
            environments: Vec::new(),
            closure_bitset: None,
            bytecode: vec![crate::opcodes::Op::ReturnNil.encode()],
            source_map: Vec::new(),
            symbol_map: Vec::new(),
        });
        let func = vm.heap.alloc_function(crate::funcenv::FunctionData { def, envs: Vec::new() });
        let fiber = vm.spawn_fiber(func, SignalMask::default());
        vm.cancel(fiber, Value::string("boom"));
        let data = vm.heap.fibers.get(fiber).unwrap();
        assert_eq!(data.status, crate::fiber::FiberStatus::Pending);
        assert!(data.last_value.equals(&Value::string("boom")));
    }

    #[test]
    fn resume_after_cancel_delivers_queued_error() {
        let mut vm = Vm::new(VmConfig::default());
        let def = std::sync::Arc::new(crate::funcdef::FuncDefData {
            name: None,
            source: None,
            source_path: None,
            arity: 0,
            min_arity: 0,
            max_arity: 0,
            vararg: false,
            slot_count: 1,
            constants: Vec::new(),
            child_defs: Vec::new(),
            environments: Vec::new(),
            closure_bitset: None,
            bytecode: vec![crate::opcodes::Op::ReturnNil.encode()],
            source_map: Vec::new(),
            symbol_map: Vec::new(),
        });
        let func = vm.heap.alloc_function(crate::funcenv::FunctionData { def, envs: Vec::new() });
        let fiber = vm.spawn_fiber(func, SignalMask::default());

        vm.cancel(fiber, Value::string("cancelled"));
        let (signal, value) = vm.resume(fiber, Value::Nil).unwrap();

        assert_eq!(signal, Signal::Error);
        assert!(value.equals(&Value::string("cancelled")));
        let data = vm.heap.fibers.get(fiber).unwrap();
        assert_eq!(data.status, crate::fiber::FiberStatus::Error);
    }
}
