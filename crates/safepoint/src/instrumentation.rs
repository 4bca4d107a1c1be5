//! Instrumentation: which code a method's call sites resolve to, which
//! activations have to leave compiled code, and who hears about it.
//!
//! Clients (a debugger, a tracer, method tracing) each request an
//! [`InstrumentationLevel`] under their own key; the effective level is the
//! highest request. Changing it, deoptimizing a method or registering a
//! listener requires a [`ScopedSuspendAll`], which is the proof that no other
//! thread runs managed code while entrypoints and stacks are rewritten.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

use crate::runtime::{
    methods::{CompiledCode, EntryPoint, Method, MethodId, MethodRegistry},
    stack::{DeoptimizeFlags, Frame},
    suspend::ScopedSuspendAll,
    threads::{ExceptionRef, ManagedThread},
};

pub mod listeners;
pub mod stack_rewriter;

use listeners::{FieldId, InstrumentationEvent, ListenerRef, Listeners, ObjectRef, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum InstrumentationLevel {
    Nothing = 0,
    /// Compiled code must call method entry and exit hooks.
    EntryExitHooks = 1,
    /// Everything runs in the interpreter.
    Interpreter = 2,
}

impl InstrumentationLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Nothing,
            1 => Self::EntryExitHooks,
            _ => Self::Interpreter,
        }
    }
}

impl fmt::Display for InstrumentationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nothing => "nothing",
            Self::EntryExitHooks => "entry/exit hooks",
            Self::Interpreter => "interpreter",
        })
    }
}

#[derive(Default)]
struct InstrumentationState {
    requested_levels: BTreeMap<String, InstrumentationLevel>,
    deoptimized: BTreeSet<MethodId>,
}

pub struct Instrumentation {
    methods: Arc<MethodRegistry>,
    level: AtomicU8,
    /// Set while any stack carries exit hooks; method exits then ask
    /// [`should_deoptimize_caller`](Self::should_deoptimize_caller).
    run_exit_hooks: AtomicBool,
    forced_interpret_only: AtomicBool,
    state: RwLock<InstrumentationState>,
    listeners: Listeners,
}

impl Instrumentation {
    pub fn new(methods: Arc<MethodRegistry>) -> Self {
        Self {
            methods,
            level: AtomicU8::new(InstrumentationLevel::Nothing as u8),
            run_exit_hooks: AtomicBool::new(false),
            forced_interpret_only: AtomicBool::new(false),
            state: RwLock::new(InstrumentationState::default()),
            listeners: Listeners::default(),
        }
    }

    pub fn current_level(&self) -> InstrumentationLevel {
        InstrumentationLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    /// Level requested under `key`, if any.
    pub fn requested_level(&self, key: &str) -> Option<InstrumentationLevel> {
        self.state.read().requested_levels.get(key).copied()
    }

    pub fn interpreter_stubs_installed(&self) -> bool {
        self.current_level() == InstrumentationLevel::Interpreter
    }

    pub fn entry_exit_stubs_installed(&self) -> bool {
        self.current_level() != InstrumentationLevel::Nothing
    }

    pub fn run_exit_hooks(&self) -> bool {
        self.run_exit_hooks.load(Ordering::Acquire)
    }

    /// Run everything in the interpreter for the lifetime of the runtime.
    /// Meant to be called before methods are loaded.
    pub fn force_interpret_only(&self) {
        self.forced_interpret_only.store(true, Ordering::Release);
    }

    pub fn is_forced_interpret_only(&self) -> bool {
        self.forced_interpret_only.load(Ordering::Acquire)
    }

    pub fn interpret_only(&self) -> bool {
        self.is_forced_interpret_only() || self.interpreter_stubs_installed()
    }

    /// Native methods never run in the interpreter.
    pub fn interpret_only_method(&self, method: &Method) -> bool {
        !method.is_native() && (self.interpret_only() || self.is_deoptimized(method))
    }

    pub fn is_deoptimized(&self, method: &Method) -> bool {
        self.state.read().deoptimized.contains(&method.id())
    }

    pub fn deoptimized_methods(&self) -> Vec<MethodId> {
        self.state.read().deoptimized.iter().copied().collect()
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    pub fn has_method_entry_listeners(&self) -> bool {
        self.listeners.method_entry.has_listeners()
    }

    pub fn has_method_exit_listeners(&self) -> bool {
        self.listeners.method_exit.has_listeners()
    }

    pub fn has_dex_pc_listeners(&self) -> bool {
        self.listeners.dex_pc.has_listeners()
    }

    /// Whether a frame of `method` on `thread` has to report every dex pc.
    pub fn needs_dex_pc_events(&self, method: &Method, thread: &ManagedThread) -> bool {
        (self.interpret_only_method(method) || thread.is_force_interpreter()) && self.has_dex_pc_listeners()
    }

    /// Entry and exit of already running methods are reported only when
    /// compiled code is still in use.
    pub fn should_notify_method_enter_exit_events(&self) -> bool {
        (self.has_method_entry_listeners() || self.has_method_exit_listeners())
            && !self.interpreter_stubs_installed()
    }

    pub fn needs_slow_interpreter_for_method(&self, thread: &ManagedThread, method: &Method) -> bool {
        self.interpreter_stubs_installed() || self.is_deoptimized(method) || thread.is_force_interpreter()
    }

    fn code_supports_entry_exit_hooks(entry_point: EntryPoint, method: &Method) -> bool {
        method.is_proxy_init() || entry_point.supports_entry_exit_hooks()
    }

    fn default_entry_point(method: &Method) -> EntryPoint {
        if method.is_native() {
            EntryPoint::GenericNativeStub
        } else {
            EntryPoint::InterpreterBridge
        }
    }

    fn update_entry_point(&self, method: &Method, entry_point: EntryPoint) {
        let old = method.entry_point();
        if old != entry_point {
            log::trace!(
                target: "instrumentation",
                "{}: {} -> {}",
                method,
                old,
                entry_point
            );
            method.set_entry_point(entry_point);
        }
    }

    fn optimized_code_for(&self, method: &Method) -> EntryPoint {
        debug_assert!(!self.interpret_only_method(method));
        assert!(method.is_invokable(), "{} is not invokable", method);
        if let Some(code) = method.jit_code().or(method.aot_code()) {
            return EntryPoint::Compiled(code);
        }
        Self::default_entry_point(method)
    }

    /// Give a freshly loaded method its first entrypoint.
    pub fn initialize_methods_code(&self, method: &Method) {
        if !method.is_invokable() {
            self.update_entry_point(method, EntryPoint::InterpreterBridge);
            return;
        }
        if self.is_forced_interpret_only() || self.is_deoptimized(method) {
            self.update_entry_point(method, Self::default_entry_point(method));
            return;
        }
        // The resolution stub calls entry/exit hooks, so it is kept at every
        // level until the class is initialized.
        if method.needs_clinit_check() {
            self.update_entry_point(method, EntryPoint::ResolutionStub);
            return;
        }
        if self.entry_exit_stubs_installed() {
            self.update_entry_point(method, Self::default_entry_point(method));
            return;
        }
        let entry_point = method
            .aot_code()
            .map_or_else(|| Self::default_entry_point(method), EntryPoint::Compiled);
        self.update_entry_point(method, entry_point);
    }

    /// The JIT published `code` for `method`. The code is remembered either
    /// way but only becomes the entrypoint if the current instrumentation
    /// permits it.
    pub fn update_methods_code(&self, method: &Method, code: CompiledCode) {
        method.set_jit_code(code);
        let entry_point = EntryPoint::Compiled(code);

        if method.needs_clinit_check() && method.entry_point() == EntryPoint::ResolutionStub {
            // Picked up by `class_initialized`.
            return;
        }
        if self.interpret_only_method(method) {
            debug_assert_eq!(method.entry_point(), EntryPoint::InterpreterBridge);
            return;
        }
        if self.entry_exit_stubs_installed() && !Self::code_supports_entry_exit_hooks(entry_point, method) {
            log::debug!(
                target: "instrumentation",
                "not installing {} for {}: entry/exit hooks are required",
                entry_point,
                method
            );
            return;
        }
        self.update_entry_point(method, entry_point);
    }

    /// Class initialization of `method`'s class finished; replace the
    /// resolution stub with the code the method should run.
    pub fn class_initialized(&self, method: &Method) {
        method.mark_class_initialized();
        if method.entry_point() != EntryPoint::ResolutionStub || !method.is_invokable() {
            return;
        }
        let entry_point = if self.interpret_only_method(method) {
            EntryPoint::InterpreterBridge
        } else {
            self.get_maybe_instrumented_code_for_invoke(method)
        };
        self.update_entry_point(method, entry_point);
    }

    /// Code an invoke of `method` should jump to, ignoring entry/exit hooks.
    pub fn get_code_for_invoke(&self, method: &Method) -> EntryPoint {
        debug_assert!(!method.is_proxy(), "{} is a proxy method", method);
        let current = method.entry_point();
        if !matches!(current, EntryPoint::ResolutionStub | EntryPoint::InterpreterBridge) {
            return current;
        }
        if self.interpret_only_method(method) {
            return EntryPoint::InterpreterBridge;
        }
        self.optimized_code_for(method)
    }

    /// Like [`get_code_for_invoke`](Self::get_code_for_invoke), but falls back
    /// to a bridge when hooks are required and the code cannot call them.
    pub fn get_maybe_instrumented_code_for_invoke(&self, method: &Method) -> EntryPoint {
        let code = self.get_code_for_invoke(method);
        if self.entry_exit_stubs_installed() && !Self::code_supports_entry_exit_hooks(code, method) {
            return Self::default_entry_point(method);
        }
        code
    }

    pub fn entry_point_string(entry_point: EntryPoint) -> String {
        entry_point.to_string()
    }

    fn install_stubs_for_method(&self, method: &Method) {
        if !method.is_invokable() || method.is_proxy() || method.is_proxy_init() {
            return;
        }
        if self.interpret_only_method(method) {
            self.update_entry_point(method, EntryPoint::InterpreterBridge);
            return;
        }
        if self.entry_exit_stubs_installed() {
            if !Self::code_supports_entry_exit_hooks(method.entry_point(), method) {
                self.update_entry_point(method, Self::default_entry_point(method));
            }
            return;
        }
        if method.needs_clinit_check() {
            self.update_entry_point(method, EntryPoint::ResolutionStub);
            return;
        }
        self.update_entry_point(method, self.optimized_code_for(method));
    }

    /// Record `level` for `key` (or forget the key for `Nothing`) and apply
    /// the resulting effective level.
    pub fn configure_stubs(&self, ssa: &ScopedSuspendAll<'_>, key: &str, level: InstrumentationLevel) {
        {
            let mut state = self.state.write();
            if level == InstrumentationLevel::Nothing {
                state.requested_levels.remove(key);
            } else {
                state.requested_levels.insert(key.to_owned(), level);
            }
        }
        self.update_stubs(ssa);
    }

    fn update_stubs(&self, ssa: &ScopedSuspendAll<'_>) {
        let requested = self
            .state
            .read()
            .requested_levels
            .values()
            .copied()
            .max()
            .unwrap_or(InstrumentationLevel::Nothing);
        if requested == self.current_level() {
            return;
        }

        log::info!(
            target: "instrumentation",
            "instrumentation level {} -> {} ({})",
            self.current_level(),
            requested,
            ssa.cause()
        );
        self.level.store(requested as u8, Ordering::Release);
        self.methods.for_each(|method| self.install_stubs_for_method(method));
        if requested > InstrumentationLevel::Nothing {
            self.instrument_all_thread_stacks(ssa, false);
        } else {
            self.maybe_restore_instrumentation_stack(ssa);
        }
    }

    pub fn enable_entry_exit_hooks(&self, ssa: &ScopedSuspendAll<'_>, key: &str) {
        self.configure_stubs(ssa, key, InstrumentationLevel::EntryExitHooks);
    }

    pub fn enable_method_tracing(&self, ssa: &ScopedSuspendAll<'_>, key: &str, needs_interpreter: bool) {
        let level = if needs_interpreter {
            InstrumentationLevel::Interpreter
        } else {
            InstrumentationLevel::EntryExitHooks
        };
        self.configure_stubs(ssa, key, level);
    }

    pub fn disable_method_tracing(&self, ssa: &ScopedSuspendAll<'_>, key: &str) {
        self.configure_stubs(ssa, key, InstrumentationLevel::Nothing);
    }

    pub fn deoptimize_everything(&self, ssa: &ScopedSuspendAll<'_>, key: &str) {
        self.configure_stubs(ssa, key, InstrumentationLevel::Interpreter);
    }

    pub fn undeoptimize_everything(&self, ssa: &ScopedSuspendAll<'_>, key: &str) {
        assert!(
            self.interpreter_stubs_installed(),
            "undeoptimize everything without interpreter stubs"
        );
        self.configure_stubs(ssa, key, InstrumentationLevel::Nothing);
    }

    /// Send `method` to the interpreter, including its running activations.
    pub fn deoptimize(&self, ssa: &ScopedSuspendAll<'_>, method: &Method) {
        assert!(!method.is_native(), "cannot deoptimize native method {}", method);
        assert!(!method.is_proxy(), "cannot deoptimize proxy method {}", method);
        assert!(method.is_invokable(), "cannot deoptimize {}", method);

        let inserted = self.state.write().deoptimized.insert(method.id());
        assert!(inserted, "method {} is already deoptimized", method);
        log::debug!(target: "instrumentation", "deoptimizing {}", method);

        if !self.interpreter_stubs_installed() {
            self.update_entry_point(method, EntryPoint::InterpreterBridge);
            // Activations of `method` already on a stack check on their
            // callee's exit whether they have to leave compiled code.
            self.instrument_all_thread_stacks(ssa, false);
        }
    }

    pub fn undeoptimize(&self, ssa: &ScopedSuspendAll<'_>, method: &Method) {
        assert!(!method.is_native(), "cannot undeoptimize native method {}", method);
        assert!(!method.is_proxy(), "cannot undeoptimize proxy method {}", method);
        assert!(method.is_invokable(), "cannot undeoptimize {}", method);

        let removed = self.state.write().deoptimized.remove(&method.id());
        assert!(removed, "method {} is not deoptimized", method);
        log::debug!(target: "instrumentation", "undeoptimizing {}", method);

        if self.interpreter_stubs_installed() {
            return;
        }

        let entry_point = if self.interpret_only_method(method) {
            EntryPoint::InterpreterBridge
        } else if method.needs_clinit_check() {
            EntryPoint::ResolutionStub
        } else {
            self.get_maybe_instrumented_code_for_invoke(method)
        };
        self.update_entry_point(method, entry_point);

        if !self.entry_exit_stubs_installed() {
            self.maybe_restore_instrumentation_stack(ssa);
        }
    }

    /// Drop `key`'s request and undeoptimize every individually deoptimized
    /// method.
    pub fn disable_deoptimization(&self, ssa: &ScopedSuspendAll<'_>, key: &str) {
        self.configure_stubs(ssa, key, InstrumentationLevel::Nothing);
        loop {
            let Some(id) = self.state.read().deoptimized.first().copied() else {
                break;
            };
            match self.methods.find(id) {
                Some(method) => self.undeoptimize(ssa, &method),
                None => {
                    self.state.write().deoptimized.remove(&id);
                }
            }
        }
    }

    /// Make `thread` interpret everything it runs from now on.
    pub fn deoptimize_thread(&self, ssa: &ScopedSuspendAll<'_>, thread: &ManagedThread) {
        let count = thread.increment_force_interpreter_count();
        log::debug!(
            target: "instrumentation",
            "thread {} forced into the interpreter (count {}, {})",
            thread.id(),
            count,
            ssa.cause()
        );
        self.instrument_thread_stack(thread, false);
    }

    pub fn undeoptimize_thread(&self, ssa: &ScopedSuspendAll<'_>, thread: &ManagedThread) {
        if thread.decrement_force_interpreter_count() != 0 {
            return;
        }
        stack_rewriter::update_needs_dex_pc_events_on_stack(self, thread);
        if !self.entry_exit_stubs_installed() {
            self.maybe_restore_instrumentation_stack(ssa);
        }
    }

    /// Mark every compiled frame on every stack for forced deoptimization.
    pub fn deoptimize_all_thread_frames(&self, ssa: &ScopedSuspendAll<'_>) {
        log::debug!(target: "instrumentation", "forcing deoptimization of all frames");
        self.instrument_all_thread_stacks(ssa, true);
    }

    fn instrument_thread_stack(&self, thread: &ManagedThread, force_deopt: bool) {
        self.run_exit_hooks.store(true, Ordering::Release);
        stack_rewriter::install_stack(self, thread, force_deopt);
    }

    fn instrument_all_thread_stacks(&self, ssa: &ScopedSuspendAll<'_>, force_deopt: bool) {
        self.run_exit_hooks.store(true, Ordering::Release);
        for thread in ssa.threads().snapshot() {
            stack_rewriter::install_stack(self, &thread, force_deopt);
        }
    }

    /// Clear the caller checks from every stack once nothing needs them:
    /// no method is deoptimized, no thread is forced into the interpreter
    /// and no frame still has to leave compiled code.
    pub fn maybe_restore_instrumentation_stack(&self, ssa: &ScopedSuspendAll<'_>) {
        if !self.state.read().deoptimized.is_empty() {
            return;
        }

        let threads = ssa.threads().snapshot();
        let mut no_remaining_deopts = true;
        for thread in &threads {
            let has_force_deopt_frames = stack_rewriter::has_frames_needing_force_deopt(thread);
            if !has_force_deopt_frames {
                thread.set_deopt_check_required(false);
            }
            no_remaining_deopts &= !thread.is_force_interpreter() && !has_force_deopt_frames;
        }

        if no_remaining_deopts {
            for thread in &threads {
                stack_rewriter::restore_stack(thread);
            }
            self.run_exit_hooks.store(false, Ordering::Release);
            log::debug!(target: "instrumentation", "instrumentation stacks restored");
        }
    }

    pub fn add_listener(&self, ssa: &ScopedSuspendAll<'_>, listener: ListenerRef, events: InstrumentationEvent) {
        self.listeners.add(&listener, events);
        if events.contains(InstrumentationEvent::DEX_PC_MOVED) {
            for thread in ssa.threads().snapshot() {
                stack_rewriter::update_needs_dex_pc_events_on_stack(self, &thread);
            }
        }
    }

    pub fn remove_listener(&self, ssa: &ScopedSuspendAll<'_>, listener: &ListenerRef, events: InstrumentationEvent) {
        self.listeners.remove(listener, events);
        if events.contains(InstrumentationEvent::DEX_PC_MOVED) {
            for thread in ssa.threads().snapshot() {
                stack_rewriter::update_needs_dex_pc_events_on_stack(self, &thread);
            }
        }
    }

    /// Asked on method exit: must the frame returned to leave compiled code?
    /// The innermost frame of `thread` is the one exiting.
    pub fn should_deoptimize_caller(&self, thread: &ManagedThread) -> bool {
        if !self.run_exit_hooks() {
            return false;
        }

        thread
            .stack()
            .with_frame(1, |caller| {
                let Some(method) = caller.method().cloned() else {
                    return false;
                };
                if method.is_native() || method.is_runtime_method() {
                    return false;
                }
                let Some(flags) = caller.compiled_code().map(|_| caller.should_deoptimize_flags()) else {
                    // Not running compiled code, nothing to leave.
                    return false;
                };

                let mut needs_deopt = self.needs_slow_interpreter_for_method(thread, &method);
                if !needs_deopt
                    && thread.is_deopt_check_required()
                    && flags.is_some_and(|flags| flags.contains(DeoptimizeFlags::FORCE_DEOPT_FOR_REDEFINITION))
                {
                    needs_deopt = true;
                }

                if needs_deopt && !caller.is_async_deoptimizable() {
                    log::warn!(
                        target: "instrumentation",
                        "got a deoptimization request on un-deoptimizable method {}",
                        method
                    );
                    return false;
                }
                needs_deopt
            })
            .unwrap_or(false)
    }

    pub fn method_enter_event(&self, thread: &ManagedThread, method: &Method) {
        debug_assert!(!method.is_runtime_method());
        if self.has_method_entry_listeners() {
            self.listeners
                .method_entry
                .for_each(|listener| listener.method_entered(thread, method));
        }
    }

    pub fn method_exit_event(&self, thread: &ManagedThread, method: &Method, return_value: &mut Value) {
        if self.has_method_exit_listeners() {
            self.listeners
                .method_exit
                .for_each(|listener| listener.method_exited(thread, method, return_value));
        }
    }

    pub fn method_unwind_event(&self, thread: &ManagedThread, method: &Method, dex_pc: u32) {
        if self.listeners.method_unwind.has_listeners() {
            self.listeners
                .method_unwind
                .for_each(|listener| listener.method_unwind(thread, method, dex_pc));
        }
    }

    pub fn dex_pc_moved_event(
        &self,
        thread: &ManagedThread,
        this_object: Option<ObjectRef>,
        method: &Method,
        dex_pc: u32,
    ) {
        if self.has_dex_pc_listeners() {
            self.listeners
                .dex_pc
                .for_each(|listener| listener.dex_pc_moved(thread, this_object, method, dex_pc));
        }
    }

    pub fn field_read_event(
        &self,
        thread: &ManagedThread,
        this_object: Option<ObjectRef>,
        method: &Method,
        dex_pc: u32,
        field: FieldId,
    ) {
        if self.listeners.field_read.has_listeners() {
            self.listeners
                .field_read
                .for_each(|listener| listener.field_read(thread, this_object, method, dex_pc, field));
        }
    }

    pub fn field_write_event(
        &self,
        thread: &ManagedThread,
        this_object: Option<ObjectRef>,
        method: &Method,
        dex_pc: u32,
        field: FieldId,
        value: Value,
    ) {
        if self.listeners.field_write.has_listeners() {
            self.listeners.field_write.for_each(|listener| {
                listener.field_written(thread, this_object, method, dex_pc, field, value)
            });
        }
    }

    /// Listeners run with the exception cleared; it is pending again
    /// afterwards.
    pub fn exception_thrown_event(&self, thread: &ManagedThread, exception: ExceptionRef) {
        if !self.listeners.exception_thrown.has_listeners() {
            return;
        }
        debug_assert_eq!(thread.exception(), Some(exception));
        thread.clear_exception();
        self.listeners
            .exception_thrown
            .for_each(|listener| listener.exception_thrown(thread, exception));
        debug_assert!(!thread.is_exception_pending());
        thread.set_exception(exception);
    }

    pub fn exception_handled_event(&self, thread: &ManagedThread, exception: ExceptionRef) {
        if self.listeners.exception_handled.has_listeners() {
            debug_assert!(!thread.is_exception_pending());
            self.listeners
                .exception_handled
                .for_each(|listener| listener.exception_handled(thread, exception));
        }
    }

    pub fn branch_event(&self, thread: &ManagedThread, method: &Method, dex_pc: u32, offset: i32) {
        if self.listeners.branch.has_listeners() {
            self.listeners
                .branch
                .for_each(|listener| listener.branch(thread, method, dex_pc, offset));
        }
    }

    pub fn watched_frame_pop_event(&self, thread: &ManagedThread, frame: &Frame) {
        if self.listeners.watched_frame_pop.has_listeners() {
            self.listeners
                .watched_frame_pop
                .for_each(|listener| listener.watched_frame_pop(thread, frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{aot_code, jit_code, MutatorHarness, RecordingListener},
        runtime::{
            methods::MethodFlags,
            stack::{Frame, FrameKind},
            threads::ThreadState,
            RuntimeBuilder, RuntimeContext,
        },
    };

    fn runtime() -> Arc<RuntimeContext> {
        RuntimeBuilder::new().for_tests().build()
    }

    fn deopt_flags(thread: &ManagedThread, depth: usize) -> Option<DeoptimizeFlags> {
        match thread.stack().frame(depth)?.kind() {
            FrameKind::Compiled {
                should_deoptimize, ..
            } => *should_deoptimize,
            _ => None,
        }
    }

    #[test]
    fn initial_entry_points() {
        let runtime = runtime();
        let aot = runtime.load_method("aot", MethodFlags::empty(), Some(aot_code(0x1000, false)), false);
        let clinit = runtime.load_method("clinit", MethodFlags::empty(), Some(aot_code(0x2000, false)), true);
        let bare = runtime.load_method("bare", MethodFlags::empty(), None, false);
        let native = runtime.load_method("native", MethodFlags::NATIVE, None, false);
        let abstract_method = runtime.load_method("abstract", MethodFlags::ABSTRACT, None, false);

        assert_eq!(aot.entry_point(), EntryPoint::Compiled(aot_code(0x1000, false)));
        assert_eq!(clinit.entry_point(), EntryPoint::ResolutionStub);
        assert_eq!(bare.entry_point(), EntryPoint::InterpreterBridge);
        assert_eq!(native.entry_point(), EntryPoint::GenericNativeStub);
        assert_eq!(abstract_method.entry_point(), EntryPoint::InterpreterBridge);

        runtime.instrumentation().class_initialized(&clinit);
        assert_eq!(clinit.entry_point(), EntryPoint::Compiled(aot_code(0x2000, false)));
    }

    #[test]
    fn levels_take_the_highest_request() {
        let runtime = runtime();
        let instrumentation = runtime.instrumentation();
        let method = runtime.load_method("m", MethodFlags::empty(), Some(aot_code(0x1000, false)), false);

        let ssa = runtime.threads().suspend_all("levels");
        instrumentation.configure_stubs(&ssa, "debugger", InstrumentationLevel::EntryExitHooks);
        instrumentation.configure_stubs(&ssa, "tracer", InstrumentationLevel::Interpreter);
        assert_eq!(instrumentation.current_level(), InstrumentationLevel::Interpreter);
        assert_eq!(method.entry_point(), EntryPoint::InterpreterBridge);

        instrumentation.configure_stubs(&ssa, "tracer", InstrumentationLevel::Nothing);
        assert_eq!(instrumentation.current_level(), InstrumentationLevel::EntryExitHooks);
        assert_eq!(instrumentation.requested_level("tracer"), None);
        // AOT code cannot call the hooks.
        assert_eq!(method.entry_point(), EntryPoint::InterpreterBridge);

        instrumentation.configure_stubs(&ssa, "debugger", InstrumentationLevel::Nothing);
        assert_eq!(instrumentation.current_level(), InstrumentationLevel::Nothing);
        assert_eq!(method.entry_point(), EntryPoint::Compiled(aot_code(0x1000, false)));
        assert!(!instrumentation.run_exit_hooks());
    }

    #[test]
    fn stub_decisions() {
        let runtime = runtime();
        let instrumentation = runtime.instrumentation();
        let debuggable = runtime.load_method("debuggable", MethodFlags::empty(), None, false);
        instrumentation.update_methods_code(&debuggable, jit_code(0x3000, true));
        let plain = runtime.load_method("plain", MethodFlags::empty(), None, false);
        instrumentation.update_methods_code(&plain, jit_code(0x4000, false));
        let native = runtime.load_method("native", MethodFlags::NATIVE, Some(aot_code(0x5000, false)), false);
        let clinit = runtime.load_method("clinit", MethodFlags::empty(), None, true);
        let proxy_init = runtime.load_method("<init>", MethodFlags::PROXY_INIT, Some(aot_code(0x6000, false)), false);

        assert_eq!(debuggable.entry_point(), EntryPoint::Compiled(jit_code(0x3000, true)));
        assert_eq!(plain.entry_point(), EntryPoint::Compiled(jit_code(0x4000, false)));

        let ssa = runtime.threads().suspend_all("stubs");
        instrumentation.enable_entry_exit_hooks(&ssa, "hooks");
        assert_eq!(debuggable.entry_point(), EntryPoint::Compiled(jit_code(0x3000, true)));
        assert_eq!(plain.entry_point(), EntryPoint::InterpreterBridge);
        assert_eq!(native.entry_point(), EntryPoint::GenericNativeStub);
        assert_eq!(clinit.entry_point(), EntryPoint::ResolutionStub);
        assert_eq!(proxy_init.entry_point(), EntryPoint::Compiled(aot_code(0x6000, false)));

        // New code without hook support is remembered but not installed.
        instrumentation.update_methods_code(&plain, jit_code(0x4100, false));
        assert_eq!(plain.entry_point(), EntryPoint::InterpreterBridge);

        instrumentation.enable_method_tracing(&ssa, "tracing", true);
        assert_eq!(debuggable.entry_point(), EntryPoint::InterpreterBridge);
        assert_eq!(native.entry_point(), EntryPoint::GenericNativeStub);

        instrumentation.disable_method_tracing(&ssa, "tracing");
        instrumentation.disable_method_tracing(&ssa, "hooks");
        assert_eq!(plain.entry_point(), EntryPoint::Compiled(jit_code(0x4100, false)));
        assert_eq!(native.entry_point(), EntryPoint::Compiled(aot_code(0x5000, false)));
        assert_eq!(clinit.entry_point(), EntryPoint::ResolutionStub);
        assert_eq!(
            Instrumentation::entry_point_string(plain.entry_point()),
            "jit code @ 0x4100"
        );
    }

    #[test]
    fn undeoptimize_restores_the_entry_point() {
        let runtime = runtime();
        let instrumentation = runtime.instrumentation();
        let aot = runtime.load_method("aot", MethodFlags::empty(), Some(aot_code(0x1000, true)), false);
        let jit = runtime.load_method("jit", MethodFlags::empty(), None, false);
        instrumentation.update_methods_code(&jit, jit_code(0x2000, true));
        let clinit = runtime.load_method("clinit", MethodFlags::empty(), None, true);
        let bare = runtime.load_method("bare", MethodFlags::empty(), None, false);
        let methods = [aot, jit, clinit, bare];

        let ssa = runtime.threads().suspend_all("deopt");
        for level in [
            InstrumentationLevel::Nothing,
            InstrumentationLevel::EntryExitHooks,
            InstrumentationLevel::Interpreter,
        ] {
            instrumentation.configure_stubs(&ssa, "level", level);
            for method in &methods {
                let before = method.entry_point();
                instrumentation.deoptimize(&ssa, method);
                assert!(instrumentation.is_deoptimized(method));
                assert_eq!(method.entry_point(), EntryPoint::InterpreterBridge);
                instrumentation.undeoptimize(&ssa, method);
                assert_eq!(method.entry_point(), before, "{} at level {}", method, level);
            }
        }
        instrumentation.configure_stubs(&ssa, "level", InstrumentationLevel::Nothing);
        assert!(!instrumentation.run_exit_hooks());
    }

    #[test]
    fn methods_loaded_under_hooks_undeoptimize_to_their_first_entry_point() {
        let runtime = runtime();
        let instrumentation = runtime.instrumentation();
        {
            let ssa = runtime.threads().suspend_all("hooks");
            instrumentation.configure_stubs(&ssa, "hooks", InstrumentationLevel::EntryExitHooks);
        }
        let clinit = runtime.load_method("clinit", MethodFlags::empty(), None, true);
        let clinit_aot = runtime.load_method("clinit_aot", MethodFlags::empty(), Some(aot_code(0x1000, true)), true);
        let aot = runtime.load_method("aot", MethodFlags::empty(), Some(aot_code(0x2000, true)), false);
        assert_eq!(clinit.entry_point(), EntryPoint::ResolutionStub);
        assert_eq!(clinit_aot.entry_point(), EntryPoint::ResolutionStub);
        assert_eq!(aot.entry_point(), EntryPoint::InterpreterBridge);

        let ssa = runtime.threads().suspend_all("deopt");
        for method in [&clinit, &clinit_aot, &aot] {
            let before = method.entry_point();
            instrumentation.deoptimize(&ssa, method);
            assert_eq!(method.entry_point(), EntryPoint::InterpreterBridge);
            instrumentation.undeoptimize(&ssa, method);
            assert_eq!(method.entry_point(), before, "{}", method);
        }

        instrumentation.configure_stubs(&ssa, "hooks", InstrumentationLevel::Nothing);
        assert_eq!(clinit_aot.entry_point(), EntryPoint::ResolutionStub);
        assert_eq!(aot.entry_point(), EntryPoint::Compiled(aot_code(0x2000, true)));
        drop(ssa);
        instrumentation.class_initialized(&clinit_aot);
        assert_eq!(clinit_aot.entry_point(), EntryPoint::Compiled(aot_code(0x1000, true)));
    }

    #[test]
    #[should_panic(expected = "already deoptimized")]
    fn double_deoptimize_is_a_bug() {
        let runtime = runtime();
        let method = runtime.load_method("m", MethodFlags::empty(), None, false);
        let ssa = runtime.threads().suspend_all("deopt");
        runtime.instrumentation().deoptimize(&ssa, &method);
        runtime.instrumentation().deoptimize(&ssa, &method);
    }

    #[test]
    #[should_panic(expected = "is not deoptimized")]
    fn undeoptimize_of_optimized_method_is_a_bug() {
        let runtime = runtime();
        let method = runtime.load_method("m", MethodFlags::empty(), None, false);
        let ssa = runtime.threads().suspend_all("deopt");
        runtime.instrumentation().undeoptimize(&ssa, &method);
    }

    #[test]
    fn deoptimize_flags_running_activations() {
        let runtime = runtime();
        let instrumentation = runtime.instrumentation();
        let target = runtime.load_method("target", MethodFlags::empty(), None, false);
        instrumentation.update_methods_code(&target, jit_code(0x2000, true));
        let callee = runtime.load_method("callee", MethodFlags::empty(), None, false);

        let mut harness = MutatorHarness::new(runtime.clone());
        let mutators: Vec<_> = (0..3).map(|i| harness.spawn(&format!("m{}", i))).collect();
        for thread in &mutators {
            let target = target.clone();
            let callee = callee.clone();
            harness
                .run(thread, move |thread| {
                    thread.stack().push(Frame::compiled(target, jit_code(0x2000, true)));
                    thread.stack().push(Frame::interpreter(callee, 0));
                })
                .recv()
                .unwrap();
        }

        {
            let ssa = runtime.threads().suspend_all("deoptimize target");
            instrumentation.deoptimize(&ssa, &target);
        }
        for thread in &mutators {
            assert_eq!(deopt_flags(thread, 1), Some(DeoptimizeFlags::CHECK_CALLER_FOR_DEOPT));
            // The interpreted callee returns into a deoptimized method.
            assert!(instrumentation.should_deoptimize_caller(thread));
        }

        {
            let ssa = runtime.threads().suspend_all("undeoptimize target");
            instrumentation.undeoptimize(&ssa, &target);
        }
        for thread in &mutators {
            assert_eq!(deopt_flags(thread, 1), Some(DeoptimizeFlags::empty()));
            assert!(!instrumentation.should_deoptimize_caller(thread));
        }
        assert!(!instrumentation.run_exit_hooks());
        harness.stop();
    }

    #[test]
    fn redefinition_forces_deopt_until_frames_are_gone() {
        let runtime = runtime();
        let instrumentation = runtime.instrumentation();
        let caller = runtime.load_method("caller", MethodFlags::empty(), None, false);
        let callee = runtime.load_method("callee", MethodFlags::empty(), None, false);

        let thread = runtime.threads().register("worker", false).unwrap();
        thread.stack().push(Frame::compiled(caller.clone(), jit_code(0x1000, true)));
        thread.stack().push(Frame::compiled(callee, jit_code(0x2000, true)));

        let ssa = runtime.threads().suspend_all("redefine");
        instrumentation.deoptimize_all_thread_frames(&ssa);
        assert!(thread.is_deopt_check_required());
        assert_eq!(
            deopt_flags(&thread, 1),
            Some(DeoptimizeFlags::FORCE_DEOPT_FOR_REDEFINITION | DeoptimizeFlags::CHECK_CALLER_FOR_DEOPT)
        );
        assert!(instrumentation.should_deoptimize_caller(&thread));

        // The forced frame keeps the stack instrumented.
        instrumentation.maybe_restore_instrumentation_stack(&ssa);
        assert!(instrumentation.run_exit_hooks());

        thread.stack().pop();
        thread.stack().pop();
        instrumentation.maybe_restore_instrumentation_stack(&ssa);
        assert!(!thread.is_deopt_check_required());
        assert!(!instrumentation.run_exit_hooks());
        drop(ssa);
        runtime.threads().unregister(&thread);
    }

    #[test]
    fn undeoptimizable_caller_is_refused() {
        let runtime = runtime();
        let instrumentation = runtime.instrumentation();
        let caller = runtime.load_method("caller", MethodFlags::empty(), Some(aot_code(0x1000, true)), false);
        let callee = runtime.load_method("callee", MethodFlags::empty(), None, false);

        let thread = runtime.threads().register("worker", false).unwrap();
        thread.stack().push(Frame::compiled(caller.clone(), aot_code(0x1000, true)));
        thread.stack().push(Frame::interpreter(callee, 4));

        let ssa = runtime.threads().suspend_all("deopt");
        instrumentation.deoptimize(&ssa, &caller);
        assert!(instrumentation.needs_slow_interpreter_for_method(&thread, &caller));
        assert!(!instrumentation.should_deoptimize_caller(&thread));
        instrumentation.undeoptimize(&ssa, &caller);
        drop(ssa);
        runtime.threads().unregister(&thread);
    }

    #[test]
    fn forced_threads_interpret_and_report_dex_pcs() {
        let runtime = runtime();
        let instrumentation = runtime.instrumentation();
        let method = runtime.load_method("loop", MethodFlags::empty(), None, false);
        let thread = runtime.threads().register("stepper", false).unwrap();
        thread.stack().push(Frame::interpreter(method.clone(), 2));

        let listener: ListenerRef = RecordingListener::new();
        let ssa = runtime.threads().suspend_all("single step");
        instrumentation.add_listener(&ssa, listener.clone(), InstrumentationEvent::DEX_PC_MOVED);
        assert!(!thread.stack().with_frame(0, |frame| frame.notify_dex_pc_moves()).unwrap());

        instrumentation.deoptimize_thread(&ssa, &thread);
        assert!(thread.is_force_interpreter());
        assert!(instrumentation.needs_slow_interpreter_for_method(&thread, &method));
        assert!(thread.stack().with_frame(0, |frame| frame.notify_dex_pc_moves()).unwrap());

        instrumentation.undeoptimize_thread(&ssa, &thread);
        assert!(!thread.is_force_interpreter());
        assert!(!thread.stack().with_frame(0, |frame| frame.notify_dex_pc_moves()).unwrap());
        assert!(!instrumentation.run_exit_hooks());

        instrumentation.remove_listener(&ssa, &listener, InstrumentationEvent::DEX_PC_MOVED);
        drop(ssa);
        runtime.threads().unregister(&thread);
    }

    #[test]
    fn listener_registration_round_trips_the_has_flags() {
        let runtime = runtime();
        let instrumentation = runtime.instrumentation();
        let first: ListenerRef = RecordingListener::new();
        let second: ListenerRef = RecordingListener::new();
        let events = InstrumentationEvent::METHOD_EXITED | InstrumentationEvent::BRANCH;

        let ssa = runtime.threads().suspend_all("listeners");
        instrumentation.add_listener(&ssa, first.clone(), InstrumentationEvent::BRANCH);
        let before = instrumentation.listeners().active();

        instrumentation.add_listener(&ssa, second.clone(), events);
        assert!(instrumentation.has_method_exit_listeners());
        instrumentation.remove_listener(&ssa, &second, events);
        assert_eq!(instrumentation.listeners().active(), before);
        assert!(!instrumentation.has_method_exit_listeners());

        instrumentation.remove_listener(&ssa, &first, InstrumentationEvent::BRANCH);
        assert!(instrumentation.listeners().active().is_empty());
    }

    #[test]
    fn new_entry_listeners_see_running_methods() {
        let runtime = runtime();
        let instrumentation = runtime.instrumentation();
        let outer = runtime.load_method("outer", MethodFlags::empty(), None, false);
        let middle = runtime.load_method("middle", MethodFlags::empty(), Some(aot_code(0x1000, false)), false);
        let inner = runtime.load_method("inner", MethodFlags::empty(), None, false);

        let thread = runtime.threads().register("worker", false).unwrap();
        thread.stack().push(Frame::interpreter(outer, 0));
        thread.stack().push(Frame::runtime());
        // Plain AOT code never reports its exit, so it gets no entry event.
        thread.stack().push(Frame::compiled(middle, aot_code(0x1000, false)));
        thread.stack().push(Frame::compiled(inner, jit_code(0x2000, true)));

        let recorder = RecordingListener::new();
        let listener: ListenerRef = recorder.clone();
        let ssa = runtime.threads().suspend_all("tracing");
        instrumentation.add_listener(
            &ssa,
            listener,
            InstrumentationEvent::METHOD_ENTERED | InstrumentationEvent::METHOD_EXITED,
        );
        instrumentation.enable_method_tracing(&ssa, "tracing", false);

        assert_eq!(
            recorder.methods(InstrumentationEvent::METHOD_ENTERED),
            vec!["outer".to_owned(), "inner".to_owned()]
        );
        assert_eq!(deopt_flags(&thread, 0), Some(DeoptimizeFlags::CHECK_CALLER_FOR_DEOPT));
        assert_eq!(deopt_flags(&thread, 1), None);

        instrumentation.disable_method_tracing(&ssa, "tracing");
        assert_eq!(deopt_flags(&thread, 0), Some(DeoptimizeFlags::empty()));
        drop(ssa);
        runtime.threads().unregister(&thread);
    }

    #[test]
    fn exception_is_cleared_around_listeners() {
        let runtime = runtime();
        let instrumentation = runtime.instrumentation();
        let recorder = RecordingListener::new();
        let listener: ListenerRef = recorder.clone();
        {
            let ssa = runtime.threads().suspend_all("listeners");
            instrumentation.add_listener(
                &ssa,
                listener,
                InstrumentationEvent::EXCEPTION_THROWN | InstrumentationEvent::EXCEPTION_HANDLED,
            );
        }

        let this = runtime.threads().attach_current_thread("thrower", false).unwrap();
        this.transition_from_suspended_to_runnable();
        let exception = ExceptionRef(0xdead);
        this.set_exception(exception);
        instrumentation.exception_thrown_event(&this, exception);
        assert_eq!(this.exception(), Some(exception));

        this.clear_exception();
        instrumentation.exception_handled_event(&this, exception);
        assert_eq!(recorder.count(InstrumentationEvent::EXCEPTION_THROWN), 1);
        assert_eq!(recorder.count(InstrumentationEvent::EXCEPTION_HANDLED), 1);
        this.transition_from_runnable_to_suspended(ThreadState::Native);
        runtime.threads().detach_current_thread();
    }

    #[test]
    fn forced_interpret_only_applies_to_new_methods() {
        let runtime = runtime();
        let instrumentation = runtime.instrumentation();
        instrumentation.force_interpret_only();
        let method = runtime.load_method("m", MethodFlags::empty(), Some(aot_code(0x1000, false)), false);
        let native = runtime.load_method("n", MethodFlags::NATIVE, Some(aot_code(0x2000, false)), false);
        assert_eq!(method.entry_point(), EntryPoint::InterpreterBridge);
        assert_eq!(native.entry_point(), EntryPoint::GenericNativeStub);
        assert_eq!(instrumentation.get_code_for_invoke(&method), EntryPoint::InterpreterBridge);
        instrumentation.update_methods_code(&method, jit_code(0x3000, true));
        assert_eq!(method.entry_point(), EntryPoint::InterpreterBridge);
    }
}
