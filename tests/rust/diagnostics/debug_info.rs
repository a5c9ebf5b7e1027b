//! Symbol-store lookup tests: address-to-source mapping, function ranges,
//! symbol addressing modes, and the silent-failure loading contract.

use std::fs;
use std::path::PathBuf;

use faultline_diagnostics::debug_info::{
    DebugInfo, DebugTable, FileEntry, LineEntry, SymbolDim, SymbolEntry, SymbolKind, TagEntry,
    DEBUG_TABLE_VERSION,
};
use faultline_diagnostics::image::{ImageHeader, VmId, VmImage, VmInstance, VmRegisters};

fn symbol(
    address: i32,
    name: &str,
    kind: SymbolKind,
    tag: u32,
    code_start: u32,
    code_end: u32,
) -> SymbolEntry {
    SymbolEntry {
        address,
        name: name.to_owned(),
        kind,
        tag,
        code_start,
        code_end,
        dims: Vec::new(),
    }
}

fn sample_table() -> DebugTable {
    DebugTable {
        version: DEBUG_TABLE_VERSION,
        files: vec![
            FileEntry {
                address: 0x00,
                name: "scripts/core.p".to_owned(),
            },
            FileEntry {
                address: 0x80,
                name: "scripts/combat.p".to_owned(),
            },
        ],
        lines: vec![
            LineEntry {
                address: 0x00,
                line: 0,
            },
            LineEntry {
                address: 0x1C,
                line: 11,
            },
            LineEntry {
                address: 0x8C,
                line: 41,
            },
        ],
        symbols: vec![
            symbol(0, "on_tick", SymbolKind::Function, 0, 0x00, 0x40),
            symbol(1, "apply_damage", SymbolKind::Function, 0, 0x80, 0xC0),
            symbol(2, "@handler", SymbolKind::Function, 0, 0x00, 0xC0),
            symbol(12, "amount", SymbolKind::Variable, 1, 0x80, 0xC0),
        ],
        tags: vec![TagEntry {
            id: 1,
            name: "Float".to_owned(),
        }],
    }
}

fn test_instance() -> VmInstance {
    let header = ImageHeader {
        size: 0x1000,
        code_offset: 0x400,
        data_offset: 0x40,
        entry_point: Some(0),
        stack_top: 0x3C0,
        heap_bottom: 0x100,
        debug_info: true,
    };
    let mut memory = vec![0u8; 0x1000];
    // Data-absolute slot at data offset 0x80, frame slots around frm 0x200.
    memory[0xC0..0xC4].copy_from_slice(&99i32.to_le_bytes());
    memory[0x24C..0x250].copy_from_slice(&37i32.to_le_bytes());
    memory[0x23C..0x240].copy_from_slice(&(-5i32).to_le_bytes());
    // Code-absolute slot addressed past the code segment boundary.
    memory[0x804..0x808].copy_from_slice(&77i32.to_le_bytes());
    VmInstance {
        id: VmId(1),
        image: VmImage::new(header, memory),
        regs: VmRegisters {
            frm: 0x200,
            cip: 0x90,
            stk: 0x1F0,
            hea: 0x110,
            pri: 0,
        },
        natives: Vec::new(),
        publics: Vec::new(),
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("faultline_{}_{name}.dbg", std::process::id()))
}

#[test]
fn unloaded_store_answers_nothing() {
    let debug = DebugInfo::default();
    assert!(!debug.is_loaded());
    assert!(debug.file_at(0x20).is_none());
    assert!(debug.line_at(0x20).is_none());
    assert!(debug.function_at(0x20).is_none());
    assert!(debug.tag_name(1).is_none());
    assert_eq!(debug.symbols_in_scope(0x90).count(), 0);
}

#[test]
fn address_before_first_entry_is_not_found() {
    let table = DebugTable {
        lines: vec![LineEntry {
            address: 0x1C,
            line: 11,
        }],
        files: vec![FileEntry {
            address: 0x10,
            name: "late.p".to_owned(),
        }],
        ..sample_table()
    };
    let debug = DebugInfo::from_table(table);
    assert!(debug.line_at(0x10).is_none());
    assert!(debug.file_at(0x08).is_none());
}

#[test]
fn line_lookup_is_floor_and_one_based() {
    let debug = DebugInfo::from_table(sample_table());
    assert_eq!(debug.line_at(0x00), Some(1));
    assert_eq!(debug.line_at(0x1C), Some(12));
    assert_eq!(debug.line_at(0x20), Some(12));
    assert_eq!(debug.line_at(0x90), Some(42));
}

#[test]
fn file_lookup_covers_trailing_addresses() {
    let debug = DebugInfo::from_table(sample_table());
    assert_eq!(debug.file_name(0x20), Some("scripts/core.p"));
    assert_eq!(debug.file_name(0x80), Some("scripts/combat.p"));
    assert_eq!(debug.file_name(0xFFF), Some("scripts/combat.p"));
}

#[test]
fn function_lookup_respects_code_range() {
    let debug = DebugInfo::from_table(sample_table());
    assert_eq!(debug.function_at(0x00).unwrap().name, "on_tick");
    assert_eq!(debug.function_at(0x3F).unwrap().name, "on_tick");
    // End of range is exclusive and 0x40..0x80 belongs to no function.
    assert!(debug.function_at(0x40).is_none());
    assert_eq!(debug.function_at(0x90).unwrap().name, "apply_damage");
}

#[test]
fn forward_stub_symbols_never_match() {
    let mut table = sample_table();
    table.symbols.retain(|symbol| symbol.name != "on_tick");
    let debug = DebugInfo::from_table(table);
    // "@handler" covers 0x20 but is a compiler artifact, not a function.
    assert!(debug.function_at(0x20).is_none());
}

#[test]
fn function_lookup_by_name() {
    let debug = DebugInfo::from_table(sample_table());
    assert_eq!(debug.function_named("apply_damage").unwrap().code_start, 0x80);
    assert!(debug.function_named("amount").is_none());
    assert!(debug.function_named("no_such").is_none());
}

#[test]
fn tag_names_resolve_by_id() {
    let debug = DebugInfo::from_table(sample_table());
    assert_eq!(debug.tag_name(1), Some("Float"));
    assert!(debug.tag_name(2).is_none());
}

#[test]
fn scope_query_skips_functions_and_foreign_ranges() {
    let debug = DebugInfo::from_table(sample_table());
    let in_scope: Vec<_> = debug
        .symbols_in_scope(0x90)
        .map(|symbol| symbol.name.as_str())
        .collect();
    assert_eq!(in_scope, vec!["amount"]);
    assert_eq!(debug.symbols_in_scope(0x20).count(), 0);
}

#[test]
fn dimensions_only_for_array_kinds() {
    let mut array = symbol(20, "grid", SymbolKind::Array, 0, 0x00, 0x40);
    array.dims = vec![SymbolDim { tag: 0, size: 8 }];
    assert_eq!(array.dimensions().len(), 1);

    let mut scalar = symbol(24, "count", SymbolKind::Variable, 0, 0x00, 0x40);
    scalar.dims = vec![SymbolDim { tag: 0, size: 8 }];
    assert!(scalar.dimensions().is_empty());
}

#[test]
fn symbol_values_follow_addressing_mode() {
    let vm = test_instance();
    // Frame-relative: positive argument slot and negative local slot.
    let arg = symbol(12, "amount", SymbolKind::Variable, 1, 0x80, 0xC0);
    assert_eq!(arg.value(&vm, Some(0x200)), Some(37));
    let local = symbol(-4, "scratch", SymbolKind::Variable, 0, 0x80, 0xC0);
    assert_eq!(local.value(&vm, Some(0x200)), Some(-5));
    // Without an explicit frame the live frame pointer is used.
    assert_eq!(arg.value(&vm, None), Some(37));
    // Data-absolute: between the segment offsets.
    let global = symbol(0x80, "world_seed", SymbolKind::Variable, 0, 0x00, 0xC0);
    assert_eq!(global.value(&vm, None), Some(99));
    // Code-absolute: past the code segment offset.
    let packed = symbol(0x404, "lookup", SymbolKind::Variable, 0, 0x00, 0xC0);
    assert_eq!(packed.value(&vm, None), Some(77));
}

#[test]
fn loading_a_missing_file_leaves_the_store_empty() {
    let mut debug = DebugInfo::default();
    debug.load(temp_path("missing_nonexistent"));
    assert!(!debug.is_loaded());
}

#[test]
fn loading_garbage_leaves_the_store_empty() {
    let path = temp_path("garbage");
    fs::write(&path, b"not a debug table").unwrap();
    let mut debug = DebugInfo::default();
    debug.load(&path);
    assert!(!debug.is_loaded());
    let _ = fs::remove_file(&path);
}

#[test]
fn unknown_table_version_is_rejected() {
    let mut table = sample_table();
    table.version = DEBUG_TABLE_VERSION + 1;
    let path = temp_path("version");
    fs::write(&path, serde_json::to_vec(&table).unwrap()).unwrap();
    let mut debug = DebugInfo::default();
    debug.load(&path);
    assert!(!debug.is_loaded());
    let _ = fs::remove_file(&path);
}

#[test]
fn loaded_table_is_sorted_before_queries() {
    let mut table = sample_table();
    table.lines.reverse();
    table.files.reverse();
    let path = temp_path("sorted");
    fs::write(&path, serde_json::to_vec(&table).unwrap()).unwrap();
    let mut debug = DebugInfo::default();
    debug.load(&path);
    assert!(debug.is_loaded());
    assert_eq!(debug.line_at(0x20), Some(12));
    assert_eq!(debug.file_name(0x20), Some("scripts/core.p"));
    let _ = fs::remove_file(&path);
}
