//! Call-type history and the call-stack walker.
//!
//! The hook layer records every entry into the VM (public execs) and out of
//! it (native calls) in a single process-wide history, because a crash can
//! land while several independent instances are interleaved on one thread.
//! The walker turns that history plus the frame chain in VM stack memory into
//! logical frames.  It only ever reads: the history is snapshotted, the VM
//! memory accessed through bounds-checked views, and nothing is cached
//! between invocations since the memory must reflect the failing state.

use std::cell::RefCell;

use crate::debug_info::{DebugInfo, SymbolEntry, SymbolKind};
use crate::image::{UCell, VmId, VmInstance, CELL_BYTES};

/// Hard cap on frames recovered per call boundary, guarding against cyclic
/// chains in corrupted stacks.
const MAX_WALK_DEPTH: usize = 128;

/// Data-segment offset of the first argument slot above a frame header.
const FIRST_ARGUMENT_OFFSET: i32 = 3 * CELL_BYTES as i32;

/// Kind of an active invocation recorded by the hook layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Native,
    Public,
}

/// One active invocation: which instance, which function index, and the
/// frame pointer at the moment control transferred.
#[derive(Debug, Clone, Copy)]
pub struct CallRecord {
    pub kind: CallKind,
    pub vm: VmId,
    pub index: i32,
    pub frame: UCell,
}

/// Process-wide, time-ordered stack of active invocations across every
/// loaded instance.  Pushed and popped strictly around call boundaries.
#[derive(Debug, Clone, Default)]
pub struct CallHistory {
    records: Vec<CallRecord>,
}

impl CallHistory {
    pub fn push(&mut self, record: CallRecord) {
        self.records.push(record);
    }

    pub fn pop(&mut self) -> Option<CallRecord> {
        self.records.pop()
    }

    /// Most recent active call.
    pub fn top(&self) -> Option<&CallRecord> {
        self.records.last()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Oldest-first view of the active calls.
    pub fn records(&self) -> &[CallRecord] {
        &self.records
    }

    /// Owned copy for side-effect-free walking.
    pub fn snapshot(&self) -> Vec<CallRecord> {
        self.records.clone()
    }
}

/// Scoped history entry: pushes on construction, pops on drop, so the
/// push/pop pairing holds on every exit path including error returns.
#[derive(Debug)]
pub struct CallGuard<'a> {
    history: &'a RefCell<CallHistory>,
}

impl<'a> CallGuard<'a> {
    pub fn push(history: &'a RefCell<CallHistory>, record: CallRecord) -> Self {
        history.borrow_mut().push(record);
        Self { history }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.history.borrow_mut().pop();
    }
}

/// Logical stack frame reconstructed from VM memory.  Produced fresh on
/// every diagnostic request.
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Entry address of the function owning the frame; zero when unknown.
    pub function_address: UCell,
    pub function_name: Option<String>,
    /// Whether the frame belongs to a public entry point.
    pub is_public: bool,
    /// Return address stored by the frame; zero for the entry stub.
    pub call_address: UCell,
    /// Frame pointer, relative to the data segment.
    pub frame: UCell,
    pub file: Option<String>,
    pub line: Option<u32>,
    /// Formatted argument list, only available with debug info.
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct RawFrame {
    frame: UCell,
    call_address: UCell,
}

/// Reconstructs logical frames for one public-call boundary.
#[derive(Debug)]
pub struct StackWalker<'a> {
    vm: &'a VmInstance,
    debug: &'a DebugInfo,
}

impl<'a> StackWalker<'a> {
    pub fn new(vm: &'a VmInstance, debug: &'a DebugInfo) -> Self {
        Self { vm, debug }
    }

    /// Walk the frame chain starting at `frame`, most recent call first.
    ///
    /// `live_code_address` is the instruction pointer to attribute the
    /// innermost frame to; pass it for the most recent boundary only.  For
    /// older boundaries the innermost function is recovered from the call
    /// instruction preceding the frame's stored return address.
    ///
    /// A chain that cannot be followed at all yields zero frames; a chain
    /// that breaks mid-walk yields the frames recovered so far.
    pub fn walk(
        &self,
        entry_index: i32,
        frame: UCell,
        live_code_address: Option<UCell>,
    ) -> Vec<StackFrame> {
        let raw = self.follow_chain(frame);
        self.resolve(entry_index, &raw, live_code_address)
    }

    fn follow_chain(&self, start: UCell) -> Vec<RawFrame> {
        let mut raw = Vec::new();
        let mut frame = start;
        while raw.len() < MAX_WALK_DEPTH {
            if !self.vm.stack_contains(frame) {
                break;
            }
            let Some(call_address) = self.vm.image.data_cell(frame + CELL_BYTES) else {
                break;
            };
            let Some(saved) = self.vm.image.data_cell(frame) else {
                break;
            };
            raw.push(RawFrame {
                frame,
                call_address: call_address as UCell,
            });
            if call_address == 0 {
                // Entry stub; the chain ends here.
                break;
            }
            let next = saved as UCell;
            if next <= frame {
                // The chain must ascend toward the stack top.
                break;
            }
            frame = next;
        }
        raw
    }

    fn resolve(
        &self,
        entry_index: i32,
        raw: &[RawFrame],
        live_code_address: Option<UCell>,
    ) -> Vec<StackFrame> {
        raw.iter()
            .enumerate()
            .map(|(depth, frame)| {
                let code_address = if depth == 0 {
                    live_code_address.or_else(|| self.call_target(frame.call_address))
                } else {
                    Some(raw[depth - 1].call_address)
                };
                let is_entry = frame.call_address == 0;
                match code_address.and_then(|address| self.debug.function_at(address)) {
                    Some(symbol) => StackFrame {
                        function_address: symbol.code_start,
                        function_name: Some(symbol.name.clone()),
                        is_public: is_entry || self.vm.is_public_address(symbol.code_start),
                        call_address: frame.call_address,
                        frame: frame.frame,
                        file: code_address
                            .and_then(|address| self.debug.file_name(address))
                            .map(str::to_owned),
                        line: code_address.and_then(|address| self.debug.line_at(address)),
                        arguments: self.format_arguments(symbol, frame.frame),
                    },
                    None if is_entry => self.entry_frame(entry_index, frame),
                    None => StackFrame {
                        function_address: code_address.unwrap_or(0),
                        function_name: None,
                        is_public: false,
                        call_address: frame.call_address,
                        frame: frame.frame,
                        file: None,
                        line: None,
                        arguments: None,
                    },
                }
            })
            .collect()
    }

    /// The call instruction stores its target in the cell directly before
    /// the return address it pushes.
    fn call_target(&self, return_address: UCell) -> Option<UCell> {
        let operand = self
            .vm
            .image
            .code_cell(return_address.checked_sub(CELL_BYTES)?)?;
        UCell::try_from(operand).ok()
    }

    /// By the time unwinding reaches the actual entry stub no debug data can
    /// place it, so the public table names it instead.
    fn entry_frame(&self, entry_index: i32, frame: &RawFrame) -> StackFrame {
        StackFrame {
            function_address: self.vm.entry_address(entry_index).unwrap_or(0),
            function_name: self.vm.entry_name(entry_index).map(str::to_owned),
            is_public: true,
            call_address: frame.call_address,
            frame: frame.frame,
            file: None,
            line: None,
            arguments: None,
        }
    }

    fn format_arguments(&self, function: &SymbolEntry, frame: UCell) -> Option<String> {
        let mut parts = Vec::new();
        for symbol in self.debug.symbols_in_scope(function.code_start) {
            if symbol.address < FIRST_ARGUMENT_OFFSET {
                // Locals live below the frame header; only arguments are
                // rendered.
                continue;
            }
            parts.push(self.describe_symbol(symbol, frame));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }

    fn describe_symbol(&self, symbol: &SymbolEntry, frame: UCell) -> String {
        let mut text = String::new();
        if let Some(tag) = self.debug.tag_name(symbol.tag) {
            text.push_str(tag);
            text.push(':');
        }
        text.push_str(&symbol.name);
        match symbol.kind {
            SymbolKind::Array | SymbolKind::ArrayReference => {
                for dim in symbol.dimensions() {
                    text.push_str(&format!("[{}]", dim.size));
                }
            }
            _ => {
                if let Some(value) = symbol.value(self.vm, Some(frame)) {
                    text.push_str(&format!("={value}"));
                }
            }
        }
        text
    }
}
