//! Stack walks that bring already running activations in line with the
//! current instrumentation state. All of them run while the walked thread
//! cannot run managed code.

use std::{ops::ControlFlow, sync::Arc};

use crate::{
    instrumentation::Instrumentation,
    runtime::{
        methods::{CompiledCode, Method},
        stack::DeoptimizeFlags,
        threads::ManagedThread,
    },
};

/// Compiled code reports method exit only if it was compiled with
/// instrumentation support.
pub(crate) fn method_supports_exit_events(method: &Method, code: Option<CompiledCode>) -> bool {
    match code {
        None => method.is_native(),
        Some(code) => code.header.debuggable,
    }
}

/// Flag every frame of `thread` so that exits go through instrumentation.
///
/// Interpreter frames get their dex pc notification recomputed. Compiled
/// frames with a should-deoptimize slot get `CHECK_CALLER_FOR_DEOPT`, and
/// also `FORCE_DEOPT_FOR_REDEFINITION` when `force_deopt` is set. Frames
/// that will report their exit receive a synthetic method entered event,
/// outermost first.
pub(crate) fn install_stack(instrumentation: &Instrumentation, thread: &ManagedThread, force_deopt: bool) {
    log::trace!(target: "instrumentation", "installing exit hooks on thread {}", thread.id());
    let mut stack_methods: Vec<Arc<Method>> = Vec::new();
    let mut needs_deopt_check = false;

    thread.stack().walk(|frame| {
        if frame.is_runtime_frame() {
            return ControlFlow::Continue(());
        }
        let Some(method) = frame.method().cloned() else {
            return ControlFlow::Continue(());
        };

        if frame.is_interpreter_frame() {
            frame.set_notify_dex_pc_moves(instrumentation.needs_dex_pc_events(&method, thread));
            stack_methods.push(method);
            return ControlFlow::Continue(());
        }

        let code = frame.compiled_code();
        if method_supports_exit_events(&method, code) {
            stack_methods.push(method);
        }
        if code.is_some_and(|code| code.header.has_should_deoptimize_flag()) {
            if force_deopt {
                needs_deopt_check = true;
                frame.set_should_deoptimize_flag(DeoptimizeFlags::FORCE_DEOPT_FOR_REDEFINITION);
            }
            frame.set_should_deoptimize_flag(DeoptimizeFlags::CHECK_CALLER_FOR_DEOPT);
        }
        ControlFlow::Continue(())
    });

    if needs_deopt_check {
        thread.set_deopt_check_required(true);
    }

    if instrumentation.should_notify_method_enter_exit_events() {
        for method in stack_methods.iter().rev() {
            instrumentation.method_enter_event(thread, method);
        }
    }
}

/// Recompute whether each interpreter frame reports dex pc moves.
pub(crate) fn update_needs_dex_pc_events_on_stack(instrumentation: &Instrumentation, thread: &ManagedThread) {
    thread.stack().walk(|frame| {
        if frame.is_interpreter_frame() {
            if let Some(method) = frame.method().cloned() {
                frame.set_notify_dex_pc_moves(instrumentation.needs_dex_pc_events(&method, thread));
            }
        }
        ControlFlow::Continue(())
    });
}

/// Clear the caller checks set by [`install_stack`]. The thread must not
/// have frames that still need a forced deoptimization.
pub(crate) fn restore_stack(thread: &ManagedThread) {
    log::trace!(target: "instrumentation", "restoring stack of thread {}", thread.id());
    debug_assert!(!thread.is_deopt_check_required());
    thread.stack().walk(|frame| {
        if let Some(flags) = frame.should_deoptimize_flags() {
            debug_assert!(!flags.contains(DeoptimizeFlags::FORCE_DEOPT_FOR_REDEFINITION));
            frame.unset_should_deoptimize_flag(DeoptimizeFlags::CHECK_CALLER_FOR_DEOPT);
        }
        ControlFlow::Continue(())
    });
}

pub(crate) fn has_frames_needing_force_deopt(thread: &ManagedThread) -> bool {
    let mut found = false;
    thread.stack().walk(|frame| {
        if frame
            .should_deoptimize_flags()
            .is_some_and(|flags| flags.contains(DeoptimizeFlags::FORCE_DEOPT_FOR_REDEFINITION))
        {
            found = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    });
    debug_assert!(!found || thread.is_deopt_check_required());
    found
}
