//! Diagnostic orchestrator.
//!
//! One monitor exists per loaded VM instance; the `Diagnostics` registry owns
//! them with an explicit create-on-load/destroy-on-unload lifecycle.  It
//! reacts to runtime-error codes, failing native calls, and asynchronous
//! crash/interrupt notifications by reconstructing a backtrace and emitting
//! formatted text through the `log` facade.  Every handler builds its lines
//! eagerly from read-only state, so reporting is safe to invoke reentrantly
//! from a failure path nested inside another in-progress call.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::process;

use log::error;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call_stack::{CallGuard, CallHistory, CallKind, CallRecord, StackFrame, StackWalker};
use crate::debug_info::DebugInfo;
use crate::image::{Cell, VmId, VmInstance, CELL_BYTES, ENTRY_PROBE};

/// Error codes surfaced by the host interpreter's execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RuntimeFault {
    #[error("forced exit")]
    Exit,
    #[error("stack and heap collide")]
    StackError,
    #[error("array index out of bounds")]
    Bounds,
    #[error("invalid memory access")]
    MemoryAccess,
    #[error("invalid instruction")]
    InvalidInstruction,
    #[error("stack underflow")]
    StackLow,
    #[error("heap underflow")]
    HeapLow,
    #[error("native function failed")]
    Native,
    #[error("divide by zero")]
    Divide,
    #[error("entry point index out of range")]
    EntryIndex,
    #[error("native function is not registered")]
    NativeNotFound,
    #[error("unknown error")]
    Unknown,
}

impl RuntimeFault {
    /// Numeric code matching the interpreter's error table.
    pub fn code(&self) -> u32 {
        match self {
            RuntimeFault::Exit => 1,
            RuntimeFault::StackError => 3,
            RuntimeFault::Bounds => 4,
            RuntimeFault::MemoryAccess => 5,
            RuntimeFault::InvalidInstruction => 6,
            RuntimeFault::StackLow => 7,
            RuntimeFault::HeapLow => 8,
            RuntimeFault::Native => 10,
            RuntimeFault::Divide => 11,
            RuntimeFault::EntryIndex => 12,
            RuntimeFault::NativeNotFound => 13,
            RuntimeFault::Unknown => 27,
        }
    }
}

/// Behaviour switches read from the host configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Terminate the process after any reported failure.
    pub die_on_error: bool,
}

/// Resolves a native implementation's code address to the shared module
/// providing it.  Used only for "from <module>" annotations.
pub trait ModuleResolver {
    fn module_of(&self, address: usize) -> Option<String>;
}

/// Resolver used when the host supplies none.
#[derive(Debug, Default)]
pub struct UnknownModules;

impl ModuleResolver for UnknownModules {
    fn module_of(&self, _address: usize) -> Option<String> {
        None
    }
}

/// Host-side lookup of loaded instances by identity.  The backtrace can span
/// several instances, so the renderer resolves each record through this.
pub trait InstanceProvider {
    fn instance(&self, id: VmId) -> Option<&VmInstance>;
}

impl InstanceProvider for VmInstance {
    fn instance(&self, id: VmId) -> Option<&VmInstance> {
        (self.id == id).then_some(self)
    }
}

impl InstanceProvider for HashMap<VmId, VmInstance> {
    fn instance(&self, id: VmId) -> Option<&VmInstance> {
        self.get(&id)
    }
}

/// Interception points of the host interpreter.  The diagnostics layer wraps
/// the previously installed hooks and forwards to them; it never replaces
/// host behaviour.
pub trait VmHooks {
    /// Execute a public entry point.
    fn exec(&mut self, id: VmId, index: i32) -> Result<Cell, RuntimeFault>;
    /// Invoke a native function.
    fn native_call(&mut self, id: VmId, index: i32) -> Result<Cell, RuntimeFault>;
    /// Per-instruction debug notification.
    fn debug_step(&mut self, _id: VmId) -> Result<(), RuntimeFault> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    Installed,
    /// A nested native failure was already reported during the current
    /// execution step.
    ErrorPending,
    Reported,
}

#[derive(Debug)]
struct Monitor {
    image_name: String,
    debug: DebugInfo,
    state: MonitorState,
}

impl Monitor {
    fn unknown() -> Self {
        Self {
            image_name: "<unknown>".to_owned(),
            debug: DebugInfo::default(),
            state: MonitorState::Installed,
        }
    }
}

/// Process-wide diagnostics state: configuration, the shared call history,
/// and one monitor per loaded instance.
pub struct Diagnostics {
    config: DiagnosticsConfig,
    resolver: Box<dyn ModuleResolver>,
    history: RefCell<CallHistory>,
    monitors: RefCell<HashMap<VmId, Monitor>>,
    last_report: RefCell<Vec<String>>,
}

impl Diagnostics {
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self::with_resolver(config, Box::new(UnknownModules))
    }

    pub fn with_resolver(config: DiagnosticsConfig, resolver: Box<dyn ModuleResolver>) -> Self {
        Self {
            config,
            resolver,
            history: RefCell::new(CallHistory::default()),
            monitors: RefCell::new(HashMap::new()),
            last_report: RefCell::new(Vec::new()),
        }
    }

    /// Register a freshly loaded instance.  When the image flags debug info
    /// and a path is known, the sidecar table (`<image>.dbg`) is loaded;
    /// failures leave the monitor without symbols, which is not an error.
    pub fn on_load(&self, vm: &VmInstance, image_path: Option<&Path>) {
        let image_name = image_path
            .and_then(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "<unknown>".to_owned());
        let mut debug = DebugInfo::default();
        if vm.image.header.debug_info {
            if let Some(path) = image_path {
                debug.load(path.with_extension("dbg"));
            }
        }
        self.monitors.borrow_mut().insert(
            vm.id,
            Monitor {
                image_name,
                debug,
                state: MonitorState::Installed,
            },
        );
    }

    /// Attach an already-parsed symbol store, for hosts that embed the debug
    /// table in the image instead of shipping a sidecar file.
    pub fn attach_debug_info(&self, id: VmId, debug: DebugInfo) {
        let mut monitors = self.monitors.borrow_mut();
        monitors.entry(id).or_insert_with(Monitor::unknown).debug = debug;
    }

    /// Drop the monitor for an unloaded instance.  No further diagnostics
    /// are possible for it.
    pub fn on_unload(&self, id: VmId) {
        self.monitors.borrow_mut().remove(&id);
    }

    /// Lines of the most recent report, for hosts that surface diagnostics
    /// through their own channels.
    pub fn take_last_report(&self) -> Vec<String> {
        std::mem::take(&mut self.last_report.borrow_mut())
    }

    /// Wrap one execution of a public entry point.  The call is recorded in
    /// the history for the duration of `exec`; a returned fault is reported
    /// here unless a nested native failure already was.
    pub fn watch_public_call<H, F>(
        &self,
        host: &mut H,
        id: VmId,
        index: i32,
        exec: F,
    ) -> Result<Cell, RuntimeFault>
    where
        H: InstanceProvider,
        F: FnOnce(&mut H) -> Result<Cell, RuntimeFault>,
    {
        let frame = host.instance(id).map(|vm| vm.regs.frm).unwrap_or(0);
        let guard = CallGuard::push(
            &self.history,
            CallRecord {
                kind: CallKind::Public,
                vm: id,
                index,
                frame,
            },
        );
        let outcome = exec(host);
        if let Err(fault) = outcome {
            let pending = self
                .monitors
                .borrow()
                .get(&id)
                .map(|monitor| monitor.state == MonitorState::ErrorPending)
                .unwrap_or(false);
            if pending {
                self.set_state(id, MonitorState::Reported);
            } else {
                self.report_runtime_fault(host, id, index, fault);
            }
        }
        drop(guard);
        let active = self
            .history
            .borrow()
            .records()
            .iter()
            .any(|record| record.vm == id);
        if !active {
            self.set_state(id, MonitorState::Installed);
        }
        outcome
    }

    /// Wrap one native callback.  A failure signalled by the native is
    /// reported here and the error flag consumed, so the enclosing execution
    /// step does not report it a second time.
    pub fn watch_native_call<H, F>(&self, host: &mut H, id: VmId, index: i32, call: F) -> Cell
    where
        H: InstanceProvider,
        F: FnOnce(&mut H) -> Result<Cell, RuntimeFault>,
    {
        let frame = host.instance(id).map(|vm| vm.regs.frm).unwrap_or(0);
        let guard = CallGuard::push(
            &self.history,
            CallRecord {
                kind: CallKind::Native,
                vm: id,
                index,
                frame,
            },
        );
        let value = match call(host) {
            Ok(value) => value,
            Err(_) => {
                self.report_native_failure(host, id, index);
                self.set_state(id, MonitorState::ErrorPending);
                0
            }
        };
        drop(guard);
        value
    }

    /// Report a runtime fault raised by an execution step: one generic line,
    /// code-specific detail lines, and a full backtrace.
    pub fn report_runtime_fault<H: InstanceProvider>(
        &self,
        host: &H,
        id: VmId,
        index: i32,
        fault: RuntimeFault,
    ) -> Vec<String> {
        if fault == RuntimeFault::EntryIndex && index == ENTRY_PROBE {
            // The probed entry point does not exist; fail silently.
            return Vec::new();
        }
        self.ensure_monitor(id);
        self.set_state(id, MonitorState::Reported);
        let mut lines = vec![format!("Run time error {}: \"{}\"", fault.code(), fault)];
        if let Some(vm) = host.instance(id) {
            lines.extend(fault_details(vm, fault));
        }
        lines.extend(self.render_backtrace(host, id));
        self.finish_report(lines)
    }

    /// Report a native function that signalled failure through the error
    /// flag rather than the execution-step return code.
    pub fn report_native_failure<H: InstanceProvider>(
        &self,
        host: &H,
        id: VmId,
        index: i32,
    ) -> Vec<String> {
        self.ensure_monitor(id);
        let name = host
            .instance(id)
            .and_then(|vm| vm.native(index))
            .map(|native| native.name.clone())
            .unwrap_or_else(|| "??".to_owned());
        let mut lines = vec![format!("Native function {name}() failed")];
        lines.extend(self.render_backtrace(host, id));
        self.finish_report(lines)
    }

    /// Out-of-band crash notification.  Attributed to the innermost active
    /// call; with no call active only an unattributable line is emitted.
    pub fn on_crash<H: InstanceProvider>(&self, host: &H) -> Vec<String> {
        let top = self.history.borrow().top().copied();
        let lines = match top {
            Some(record) => {
                self.ensure_monitor(record.vm);
                let name = self
                    .monitors
                    .borrow()
                    .get(&record.vm)
                    .map(|monitor| monitor.image_name.clone())
                    .unwrap_or_default();
                let mut lines = vec![format!("Server crashed while executing {name}")];
                lines.extend(self.render_backtrace(host, record.vm));
                lines
            }
            None => vec!["Server crashed due to an unknown error".to_owned()],
        };
        emit(&lines);
        *self.last_report.borrow_mut() = lines.clone();
        lines
    }

    /// Out-of-band interrupt notification.  Always subject to the abort
    /// policy: an interrupt is an operator-requested termination.
    pub fn on_interrupt<H: InstanceProvider>(&self, host: &H) -> Vec<String> {
        let top = self.history.borrow().top().copied();
        let mut lines = vec!["Keyboard interrupt".to_owned()];
        if let Some(record) = top {
            lines.extend(self.render_backtrace(host, record.vm));
        }
        emit(&lines);
        *self.last_report.borrow_mut() = lines.clone();
        self.apply_abort_policy();
        lines
    }

    /// Render the current backtrace, most recent call first.  Native entries
    /// resolve through the native table and module resolver; public entries
    /// are walked through VM stack memory, re-seeding the frame pointer from
    /// each history record.
    pub fn render_backtrace<H: InstanceProvider>(&self, host: &H, id: VmId) -> Vec<String> {
        let records = self.history.borrow().snapshot();
        if records.is_empty() {
            return Vec::new();
        }
        let mut lines = vec!["Backtrace (most recent call first):".to_owned()];
        let mut frame = host.instance(id).map(|vm| vm.regs.frm).unwrap_or(0);
        let mut depth = 0usize;
        let mut newest_boundary = true;
        let monitors = self.monitors.borrow();
        let fallback = DebugInfo::default();
        for record in records.iter().rev() {
            let monitor = monitors.get(&record.vm);
            let image_name = monitor
                .map(|monitor| monitor.image_name.as_str())
                .unwrap_or("<unknown>");
            let Some(vm) = host.instance(record.vm) else {
                frame = record.frame;
                continue;
            };
            match record.kind {
                CallKind::Native => {
                    lines.push(native_frame_line(
                        depth,
                        vm,
                        record.index,
                        self.resolver.as_ref(),
                    ));
                    depth += 1;
                }
                CallKind::Public => {
                    let debug = monitor.map(|monitor| &monitor.debug).unwrap_or(&fallback);
                    let walker = StackWalker::new(vm, debug);
                    let live = newest_boundary.then_some(vm.regs.cip);
                    let frames = walker.walk(record.index, frame, live);
                    newest_boundary = false;
                    if frames.is_empty() {
                        lines.push("Stack corrupted".to_owned());
                    }
                    for (position, logical) in frames.iter().enumerate() {
                        let line = if debug.is_loaded() {
                            symbolic_frame_line(depth, logical)
                        } else {
                            raw_frame_line(depth, &frames, position, vm, image_name)
                        };
                        lines.push(line);
                        depth += 1;
                    }
                }
            }
            frame = record.frame;
        }
        lines
    }

    fn finish_report(&self, lines: Vec<String>) -> Vec<String> {
        emit(&lines);
        *self.last_report.borrow_mut() = lines.clone();
        self.apply_abort_policy();
        lines
    }

    fn ensure_monitor(&self, id: VmId) {
        self.monitors
            .borrow_mut()
            .entry(id)
            .or_insert_with(Monitor::unknown);
    }

    fn set_state(&self, id: VmId, state: MonitorState) {
        if let Some(monitor) = self.monitors.borrow_mut().get_mut(&id) {
            monitor.state = state;
        }
    }

    fn apply_abort_policy(&self) {
        if self.config.die_on_error {
            error!("Aborting...");
            process::exit(1);
        }
    }
}

/// Decorator wrapping the hooks a host had installed before diagnostics.
pub struct DiagnosticHooks<H> {
    diagnostics: Diagnostics,
    prev: H,
}

impl<H: VmHooks + InstanceProvider> DiagnosticHooks<H> {
    pub fn new(diagnostics: Diagnostics, prev: H) -> Self {
        Self { diagnostics, prev }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn into_inner(self) -> (Diagnostics, H) {
        (self.diagnostics, self.prev)
    }
}

impl<H: VmHooks + InstanceProvider> VmHooks for DiagnosticHooks<H> {
    fn exec(&mut self, id: VmId, index: i32) -> Result<Cell, RuntimeFault> {
        self.diagnostics
            .watch_public_call(&mut self.prev, id, index, |host| host.exec(id, index))
    }

    fn native_call(&mut self, id: VmId, index: i32) -> Result<Cell, RuntimeFault> {
        Ok(self
            .diagnostics
            .watch_native_call(&mut self.prev, id, index, |host| {
                host.native_call(id, index)
            }))
    }

    fn debug_step(&mut self, id: VmId) -> Result<(), RuntimeFault> {
        self.prev.debug_step(id)
    }
}

/// Code-specific detail lines accompanying the generic fault message.
fn fault_details(vm: &VmInstance, fault: RuntimeFault) -> Vec<String> {
    let regs = &vm.regs;
    match fault {
        RuntimeFault::Bounds => {
            let index = regs.pri;
            if index < 0 {
                vec![format!("Accessing element at negative index {index}")]
            } else {
                // The bound operand sits in the cell preceding the faulting
                // instruction pointer.
                match vm.image.code_cell(regs.cip.wrapping_sub(CELL_BYTES)) {
                    Some(bound) => vec![format!(
                        "Accessing element at index {index} past array upper bound {bound}"
                    )],
                    None => Vec::new(),
                }
            }
        }
        RuntimeFault::NativeNotFound => {
            let mut lines = vec!["The following natives are not registered:".to_owned()];
            for native in vm.natives.iter().filter(|native| !native.is_registered()) {
                lines.push(native.name.clone());
            }
            lines
        }
        RuntimeFault::StackError => vec![format!(
            "Stack index (STK) is 0x{:X}, heap index (HEA) is 0x{:X}",
            regs.stk, regs.hea
        )],
        RuntimeFault::StackLow => vec![format!(
            "Stack index (STK) is 0x{:X}, stack top (STP) is 0x{:X}",
            regs.stk, vm.image.header.stack_top
        )],
        RuntimeFault::HeapLow => vec![format!(
            "Heap index (HEA) is 0x{:X}, heap bottom (HLW) is 0x{:X}",
            regs.hea, vm.image.header.heap_bottom
        )],
        RuntimeFault::InvalidInstruction => {
            let address = regs.cip.wrapping_sub(CELL_BYTES);
            match vm.image.code_cell(address) {
                Some(opcode) => vec![format!(
                    "Invalid opcode 0x{opcode:X} at address 0x{address:X}"
                )],
                None => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

fn native_frame_line(
    depth: usize,
    vm: &VmInstance,
    index: i32,
    resolver: &dyn ModuleResolver,
) -> String {
    match vm.native(index) {
        Some(native) if native.is_registered() => {
            let module = resolver
                .module_of(native.address)
                .map(|module| base_name(&module).to_owned())
                .unwrap_or_else(|| "??".to_owned());
            format!("#{depth:<2} native {}() from {module}", native.name)
        }
        _ => format!("#{depth:<2} native ??"),
    }
}

fn symbolic_frame_line(depth: usize, frame: &StackFrame) -> String {
    let name = frame.function_name.as_deref().unwrap_or("??");
    let arguments = frame.arguments.as_deref().unwrap_or("");
    let file = frame.file.as_deref().map(base_name).unwrap_or("??");
    let line = frame.line.unwrap_or(0);
    let prefix = if frame.is_public { "public " } else { "" };
    format!("#{depth:<2} {prefix}{name}({arguments}) at {file}:{line}")
}

fn raw_frame_line(
    depth: usize,
    frames: &[StackFrame],
    position: usize,
    vm: &VmInstance,
    image_name: &str,
) -> String {
    let frame = &frames[position];
    let code_address = if position == 0 {
        vm.regs.cip
    } else {
        frames[position - 1].call_address
    };
    let offset = code_address.saturating_sub(frame.function_address);
    match (&frame.function_name, frame.is_public) {
        (Some(name), true) if name == "main" => {
            format!("#{depth:<2} main()+0x{offset:x} from {image_name}")
        }
        (Some(name), true) => {
            format!("#{depth:<2} public {name}()+0x{offset:x} from {image_name}")
        }
        (_, _) if frame.function_address != 0 => format!(
            "#{depth:<2} 0x{:08x}()+0x{offset:x} from {image_name}",
            frame.function_address
        ),
        _ => format!("#{depth:<2} ?? from {image_name}"),
    }
}

fn emit(lines: &[String]) {
    for line in lines {
        error!("{line}");
    }
}

/// Path stripped to its final component, for compact report lines.
fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
