//! VM image model shared with the host interpreter.
//!
//! The diagnostics engine never owns a running interpreter.  The host hands it
//! a read-only view of a loaded program: one contiguous memory block described
//! by a header, plus the registers and export tables of the instance executing
//! it.  All memory accessors are bounds-checked and return `Option` so that a
//! corrupted instance can be inspected without faulting the inspector itself.

use serde::{Deserialize, Serialize};

/// Machine word of the interpreter.
pub type Cell = i32;

/// Unsigned view of a cell, used for addresses and offsets.
pub type UCell = u32;

/// Width of a cell in bytes.
pub const CELL_BYTES: UCell = 4;

/// Entry index naming the image's `main` function.
pub const ENTRY_MAIN: i32 = -1;

/// Entry index the host probes when it looks for optional callbacks.  An
/// invalid-entry fault raised for this index is a probe miss, not a failure.
pub const ENTRY_PROBE: i32 = -10;

/// Identity of one loaded VM instance, assigned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmId(pub u64);

/// Image header recorded by the toolchain at the front of every program.
///
/// `stack_top` and `heap_bottom` are relative to the data segment; the stack
/// grows downward from `stack_top` toward the heap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHeader {
    /// Total size of the image block in bytes.
    pub size: u32,
    /// Byte offset of the code segment within the image.
    pub code_offset: u32,
    /// Byte offset of the data segment within the image.
    pub data_offset: u32,
    /// Address of `main` within the code segment, when the image has one.
    pub entry_point: Option<UCell>,
    /// Top of the stack region.
    pub stack_top: UCell,
    /// Bottom of the heap region.
    pub heap_bottom: UCell,
    /// Whether the toolchain emitted a debug table alongside this image.
    pub debug_info: bool,
}

/// A loaded program image.  Owned by the host; the diagnostics core only
/// reads it.
#[derive(Debug, Clone)]
pub struct VmImage {
    pub header: ImageHeader,
    memory: Vec<u8>,
}

impl VmImage {
    pub fn new(header: ImageHeader, memory: Vec<u8>) -> Self {
        Self { header, memory }
    }

    /// Raw little-endian cell read at an absolute byte offset.
    pub fn cell_at(&self, offset: u32) -> Option<Cell> {
        let start = offset as usize;
        let end = start.checked_add(CELL_BYTES as usize)?;
        let bytes = self.memory.get(start..end)?;
        Some(Cell::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Cell read relative to the data segment.
    pub fn data_cell(&self, offset: UCell) -> Option<Cell> {
        self.cell_at(self.header.data_offset.checked_add(offset)?)
    }

    /// Cell read relative to the code segment.
    pub fn code_cell(&self, offset: UCell) -> Option<Cell> {
        self.cell_at(self.header.code_offset.checked_add(offset)?)
    }
}

/// Live register snapshot of a VM instance.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VmRegisters {
    /// Frame pointer, relative to the data segment.
    pub frm: UCell,
    /// Instruction pointer, relative to the code segment.
    pub cip: UCell,
    /// Stack index.
    pub stk: UCell,
    /// Heap index.
    pub hea: UCell,
    /// Primary accumulator.
    pub pri: Cell,
}

/// Native-function table entry.  An address of zero means the host never
/// registered an implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeEntry {
    pub name: String,
    pub address: usize,
}

impl NativeEntry {
    pub fn is_registered(&self) -> bool {
        self.address != 0
    }
}

/// Public-function table entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicEntry {
    pub name: String,
    pub address: UCell,
}

/// One loaded, running program inside the host interpreter.
#[derive(Debug, Clone)]
pub struct VmInstance {
    pub id: VmId,
    pub image: VmImage,
    pub regs: VmRegisters,
    pub natives: Vec<NativeEntry>,
    pub publics: Vec<PublicEntry>,
}

impl VmInstance {
    pub fn native(&self, index: i32) -> Option<&NativeEntry> {
        usize::try_from(index).ok().and_then(|i| self.natives.get(i))
    }

    pub fn public(&self, index: i32) -> Option<&PublicEntry> {
        usize::try_from(index).ok().and_then(|i| self.publics.get(i))
    }

    /// Name of an entry point as invoked through the execution interface.
    pub fn entry_name(&self, index: i32) -> Option<&str> {
        if index == ENTRY_MAIN {
            Some("main")
        } else {
            self.public(index).map(|entry| entry.name.as_str())
        }
    }

    /// Code address of an entry point.
    pub fn entry_address(&self, index: i32) -> Option<UCell> {
        if index == ENTRY_MAIN {
            self.image.header.entry_point
        } else {
            self.public(index).map(|entry| entry.address)
        }
    }

    /// Whether a data-segment offset can hold a frame header inside the
    /// stack region.
    pub fn stack_contains(&self, offset: UCell) -> bool {
        let header = &self.image.header;
        offset >= header.heap_bottom
            && offset.saturating_add(2 * CELL_BYTES) <= header.stack_top
    }

    pub fn is_public_address(&self, address: UCell) -> bool {
        self.publics.iter().any(|entry| entry.address == address)
    }
}
