//! Debug-symbol store for Faultline images.
//!
//! The toolchain can emit a versioned table alongside a compiled image that
//! maps code addresses back to source files, lines, functions, variables and
//! tags.  Shipping without the table is the common case, so loading failures
//! leave the store empty instead of propagating: every query answers with an
//! explicit `Option` and callers degrade their output rather than fail.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::image::{Cell, UCell, VmInstance};

/// Table format version understood by this store.
pub const DEBUG_TABLE_VERSION: u32 = 1;

/// Leading character of symbols the compiler emits for forward-declared
/// publics that were never implemented.  A known compiler defect registers
/// them with a function kind anyway; address lookups must skip them.
pub const FORWARD_STUB_MARKER: char = '@';

/// Marks the first instruction address belonging to a source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub address: UCell,
    pub name: String,
}

/// Marks the first instruction address of a source line.  Line numbers are
/// stored zero-based.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LineEntry {
    pub address: UCell,
    pub line: u32,
}

/// Nominal type label attachable to a symbol, used only for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagEntry {
    pub id: u32,
    pub name: String,
}

/// Classification of a symbol-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Variable,
    Reference,
    Array,
    ArrayReference,
    Function,
}

/// One declared array dimension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolDim {
    pub tag: u32,
    pub size: u32,
}

/// Function or variable symbol.
///
/// For functions, `address` is meaningless and `[code_start, code_end)` is
/// the validity range.  For data symbols the range names the enclosing
/// function and `address` locates the storage: code-segment absolute, data
/// segment absolute, or frame-relative (possibly negative) depending on how
/// it compares to the segment bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub address: Cell,
    pub name: String,
    pub kind: SymbolKind,
    pub tag: u32,
    pub code_start: UCell,
    pub code_end: UCell,
    #[serde(default)]
    pub dims: Vec<SymbolDim>,
}

impl SymbolEntry {
    pub fn is_function(&self) -> bool {
        self.kind == SymbolKind::Function
    }

    /// Declared array dimensions; empty for non-array symbols.
    pub fn dimensions(&self) -> &[SymbolDim] {
        match self.kind {
            SymbolKind::Array | SymbolKind::ArrayReference => &self.dims,
            _ => &[],
        }
    }

    /// Read the symbol's current value from VM memory.
    ///
    /// The address is relative to the code segment, the data segment, or the
    /// frame of the function executing at `frame` (the instance's live frame
    /// pointer when `None`), decided by comparing it to the segment bounds.
    /// Returns the raw cell; no type-specific decoding is applied.
    pub fn value(&self, vm: &VmInstance, frame: Option<UCell>) -> Option<Cell> {
        let header = &vm.image.header;
        let address = self.address as i64;
        if address > header.code_offset as i64 {
            vm.image.cell_at(u32::try_from(header.code_offset as i64 + address).ok()?)
        } else if address > header.data_offset as i64 && address < header.code_offset as i64 {
            vm.image.cell_at(u32::try_from(header.data_offset as i64 + address).ok()?)
        } else {
            let frame = frame.unwrap_or(vm.regs.frm) as i64;
            let target = header.data_offset as i64 + frame + address;
            vm.image.cell_at(u32::try_from(target).ok()?)
        }
    }
}

/// Complete debug table as serialized by the toolchain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugTable {
    pub version: u32,
    pub files: Vec<FileEntry>,
    pub lines: Vec<LineEntry>,
    pub symbols: Vec<SymbolEntry>,
    pub tags: Vec<TagEntry>,
}

/// Queryable symbol store.  Default-constructed it is unloaded and every
/// lookup reports "not found".
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    table: Option<DebugTable>,
}

impl DebugInfo {
    /// Build a store from an already-parsed table (embedded images, tests).
    pub fn from_table(mut table: DebugTable) -> Self {
        sort_table(&mut table);
        Self { table: Some(table) }
    }

    /// Parse the debug table from a file.  Any failure (missing file, parse
    /// error, unknown version) leaves the store unloaded; most programs ship
    /// without debug info and that must remain a normal case.
    pub fn load(&mut self, path: impl AsRef<Path>) {
        self.table = read_table(path.as_ref());
    }

    pub fn is_loaded(&self) -> bool {
        self.table.is_some()
    }

    /// Source file covering `address`.
    pub fn file_at(&self, address: UCell) -> Option<&FileEntry> {
        floor_entry(&self.table.as_ref()?.files, address, |entry| entry.address)
    }

    pub fn file_name(&self, address: UCell) -> Option<&str> {
        self.file_at(address).map(|entry| entry.name.as_str())
    }

    /// One-based source line covering `address`.  Table entries are
    /// zero-based marks of line starts, hence the increment.
    pub fn line_at(&self, address: UCell) -> Option<u32> {
        let entry = floor_entry(&self.table.as_ref()?.lines, address, |entry| entry.address)?;
        Some(entry.line + 1)
    }

    /// Function symbol whose code range covers `address`.  Bugged forward
    /// stubs never match, even when they are the best candidate.
    pub fn function_at(&self, address: UCell) -> Option<&SymbolEntry> {
        self.table.as_ref()?.symbols.iter().find(|symbol| {
            symbol.is_function()
                && symbol.code_start <= address
                && address < symbol.code_end
                && !symbol.name.starts_with(FORWARD_STUB_MARKER)
        })
    }

    /// Reverse lookup of a function symbol by name.
    pub fn function_named(&self, name: &str) -> Option<&SymbolEntry> {
        self.table
            .as_ref()?
            .symbols
            .iter()
            .find(|symbol| symbol.is_function() && symbol.name == name)
    }

    pub fn tag_name(&self, id: u32) -> Option<&str> {
        self.table
            .as_ref()?
            .tags
            .iter()
            .find(|tag| tag.id == id)
            .map(|tag| tag.name.as_str())
    }

    /// Data symbols whose enclosing code range covers `address`, in table
    /// order (ascending by storage address).
    pub fn symbols_in_scope(&self, address: UCell) -> impl Iterator<Item = &SymbolEntry> {
        self.table.iter().flat_map(move |table| {
            table.symbols.iter().filter(move |symbol| {
                !symbol.is_function()
                    && symbol.code_start <= address
                    && address < symbol.code_end
            })
        })
    }
}

fn read_table(path: &Path) -> Option<DebugTable> {
    let file = File::open(path).ok()?;
    let mut table: DebugTable = serde_json::from_reader(BufReader::new(file)).ok()?;
    if table.version != DEBUG_TABLE_VERSION {
        return None;
    }
    sort_table(&mut table);
    Some(table)
}

fn sort_table(table: &mut DebugTable) {
    table.files.sort_by_key(|entry| entry.address);
    table.lines.sort_by_key(|entry| entry.address);
    table.symbols.sort_by_key(|entry| entry.address);
}

/// Last entry whose address is at or below `address`; `None` when the table
/// is empty or `address` precedes every entry.
fn floor_entry<T>(entries: &[T], address: UCell, key: impl Fn(&T) -> UCell) -> Option<&T> {
    let index = entries.partition_point(|entry| key(entry) <= address);
    if index == 0 {
        None
    } else {
        entries.get(index - 1)
    }
}
