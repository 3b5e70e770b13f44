//! The green-thread execution context (spec §4.E).
//!
//! A fiber owns its own value stack and frame chain; resuming one runs the
//! interpreter loop (`interp.rs`) until it yields, errors, or dies. Rather
//! than literally interleaving frame headers and locals in one array (the
//! C layout this is modeled on), `FiberData` keeps the locals (`data`) and
//! frame metadata (`frames`) as two parallel Rust vectors — easier to keep
//! memory-safe, and `base`/`FRAME_SIZE` still describe the same logical
//! layout the spec requires.

use janet_core::value::{FiberRef, FunctionRef, TableRef};
use janet_core::Value;

use crate::funcenv::FuncEnvRef;

/// Fixed per-frame metadata size, kept as a named constant because the
/// spec's stack-growth arithmetic (`stackstart + FRAME_SIZE + slotcount`)
/// references it directly even though this layout stores metadata
/// out-of-band (supplemented resolution, since no source value was
/// recoverable for it).
pub const FRAME_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    New,
    Alive,
    Pending,
    Dead,
    Error,
    Debug,
    User(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ok,
    Yield,
    Error,
    Debug,
    User(u8),
}

/// Parsed form of the caller-provided mask string (spec §4.E "Signal
/// mask"): `y`=yield, `e`=error, `d`=debug, `u`=all user slots, digits
/// select individual user slots, `a`=all.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalMask {
    pub yield_: bool,
    pub error: bool,
    pub debug: bool,
    pub user: [bool; 10],
}

impl SignalMask {
    pub fn parse(spec: &str) -> SignalMask {
        let mut mask = SignalMask::default();
        for c in spec.chars() {
            match c {
                'y' => mask.yield_ = true,
                'e' => mask.error = true,
                'd' => mask.debug = true,
                'u' => mask.user = [true; 10],
                'a' => {
                    mask.yield_ = true;
                    mask.error = true;
                    mask.debug = true;
                    mask.user = [true; 10];
                }
                '0'..='9' => mask.user[c as usize - '0' as usize] = true,
                _ => {}
            }
        }
        mask
    }

    pub fn catches(&self, signal: Signal) -> bool {
        match signal {
            Signal::Ok => true,
            Signal::Yield => self.yield_,
            Signal::Error => self.error,
            Signal::Debug => self.debug,
            Signal::User(n) => self.user.get(n as usize).copied().unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Index into `FiberData::frames` of the caller's frame; `None` marks
    /// the root frame.
    pub prevframe: Option<usize>,
    /// Offset into `FiberData::data` where this frame's locals begin.
    pub base: usize,
    pub slot_count: u32,
    pub pc: usize,
    pub func: Option<FunctionRef>,
    /// An on-stack env this frame allocated by being captured via
    /// `CLOSURE`, if any (spec §4.D "Env detachment").
    pub env: Option<FuncEnvRef>,
    pub tailcall: bool,
    /// Dest slot a suspended `SIGNAL`/`YIELD` should refill with the value
    /// delivered by the next `resume` (spec §4.E state machine).
    pub pending_resume_slot: Option<u8>,
    /// Dest slot of the `CALL` this frame is returning into, read by the
    /// caller's frame once the callee's `RETURN` pops back to it.
    pub call_dest_slot: Option<u8>,
}

impl StackFrame {
    pub fn pending_resume_slot(&self) -> Option<u8> {
        self.pending_resume_slot
    }

    pub fn set_pending_resume_slot(&mut self, slot: u8) {
        self.pending_resume_slot = Some(slot);
    }

    pub fn call_dest_slot(&self) -> Option<u8> {
        self.call_dest_slot
    }
}

#[derive(Debug, Clone)]
pub struct FiberData {
    pub data: Vec<Value>,
    pub frames: Vec<StackFrame>,
    /// Index into `frames` of the currently active frame.
    pub frame: usize,
    /// Arguments staged by `PUSH`/`PUSH2`/`PUSH3`/`PUSH_ARRAY` for the next
    /// `CALL`/`TAILCALL`/`MAKE_*`, consumed when that instruction executes.
    /// Kept as its own vector rather than a `[stackstart, stacktop)` window
    /// into `data` — same staging contract, simpler bookkeeping.
    pub arg_stage: Vec<Value>,
    pub status: FiberStatus,
    pub mask: SignalMask,
    pub last_value: Value,
    pub child: Option<FiberRef>,
    pub env: Option<TableRef>,
    pub max_stack: usize,
    /// Set by `cancel`: a queued `ERROR` delivery, consumed and cleared by
    /// the next `resume` instead of continuing bytecode execution (spec
    /// §4.E "cancel").
    pub pending_cancel: Option<Value>,
}

impl FiberData {
    pub fn new(func: FunctionRef, max_stack: usize, mask: SignalMask) -> Self {
        let root = StackFrame {
            prevframe: None,
            base: 0,
            slot_count: 0,
            pc: 0,
            func: Some(func),
            env: None,
            tailcall: false,
            pending_resume_slot: None,
            call_dest_slot: None,
        };
        FiberData {
            data: Vec::new(),
            frames: vec![root],
            frame: 0,
            arg_stage: Vec::new(),
            status: FiberStatus::New,
            mask,
            last_value: Value::Nil,
            child: None,
            env: None,
            max_stack,
            pending_cancel: None,
        }
    }

    pub fn current_frame(&self) -> &StackFrame {
        &self.frames[self.frame]
    }

    pub fn current_frame_mut(&mut self) -> &mut StackFrame {
        &mut self.frames[self.frame]
    }

    pub fn slot(&self, index: u32) -> &Value {
        &self.data[self.current_frame().base + index as usize]
    }

    pub fn set_slot(&mut self, index: u32, value: Value) {
        let base = self.current_frame().base;
        self.data[base + index as usize] = value;
    }

    pub fn ensure_locals(&mut self, base: usize, slot_count: u32) {
        let needed = base + slot_count as usize;
        if self.data.len() < needed {
            self.data.resize(needed, Value::Nil);
        }
    }

    pub fn is_at_root(&self) -> bool {
        self.current_frame().prevframe.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_parses_named_classes() {
        let m = SignalMask::parse("ye3");
        assert!(m.yield_);
        assert!(m.error);
        assert!(!m.debug);
        assert!(m.user[3]);
        assert!(!m.user[4]);
    }

    #[test]
    fn mask_all_catches_everything() {
        let m = SignalMask::parse("a");
        assert!(m.catches(Signal::Yield));
        assert!(m.catches(Signal::Error));
        assert!(m.catches(Signal::Debug));
        assert!(m.catches(Signal::User(7)));
    }

    #[test]
    fn new_fiber_has_one_root_frame() {
        let func: FunctionRef = janet_core::GcRef::from_raw(0, 0);
        let fiber = FiberData::new(func, 1024, SignalMask::default());
        assert_eq!(fiber.frames.len(), 1);
        assert!(fiber.is_at_root());
        assert_eq!(fiber.status, FiberStatus::New);
    }
}
