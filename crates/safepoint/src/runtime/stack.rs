//! A thread's managed frames, as far as instrumentation cares about them.

use std::{ops::ControlFlow, sync::Arc};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::runtime::methods::{CompiledCode, Method};

bitflags! {
    /// Bits of the should-deoptimize slot of a compiled frame.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeoptimizeFlags: u8 {
        /// Class hierarchy analysis invalidated the code.
        const CHA = 0b001;
        /// Redefinition happened; the frame must never return to compiled code.
        const FORCE_DEOPT_FOR_REDEFINITION = 0b010;
        /// Callees check on exit whether this frame needs to deoptimize.
        const CHECK_CALLER_FOR_DEOPT = 0b100;
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    /// Runtime-internal frame without a managed method.
    Runtime,
    Interpreter {
        dex_pc: u32,
        /// Whether the interpreter reports every dex pc move of this frame.
        notify_dex_pc_moves: bool,
    },
    Compiled {
        code: CompiledCode,
        /// The frame's should-deoptimize slot, if its code has one.
        should_deoptimize: Option<DeoptimizeFlags>,
    },
}

#[derive(Clone, Debug)]
pub struct Frame {
    method: Option<Arc<Method>>,
    kind: FrameKind,
}

impl Frame {
    pub fn runtime() -> Self {
        Self {
            method: None,
            kind: FrameKind::Runtime,
        }
    }

    pub fn interpreter(method: Arc<Method>, dex_pc: u32) -> Self {
        Self {
            method: Some(method),
            kind: FrameKind::Interpreter {
                dex_pc,
                notify_dex_pc_moves: false,
            },
        }
    }

    pub fn compiled(method: Arc<Method>, code: CompiledCode) -> Self {
        let should_deoptimize = code
            .header
            .deopt_flag_offset
            .map(|_| DeoptimizeFlags::empty());
        Self {
            method: Some(method),
            kind: FrameKind::Compiled {
                code,
                should_deoptimize,
            },
        }
    }

    pub fn method(&self) -> Option<&Arc<Method>> {
        self.method.as_ref()
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }

    pub fn describe(&self) -> String {
        let method = self
            .method
            .as_ref()
            .map_or_else(|| "<runtime>".to_owned(), |method| method.to_string());
        match &self.kind {
            FrameKind::Runtime => method,
            FrameKind::Interpreter { dex_pc, .. } => format!("{} (interpreted, dex pc {})", method, dex_pc),
            FrameKind::Compiled {
                code,
                should_deoptimize,
            } => match should_deoptimize {
                Some(flags) if !flags.is_empty() => {
                    format!("{} (compiled @ {:#x}, deopt {:?})", method, code.address, flags)
                }
                _ => format!("{} (compiled @ {:#x})", method, code.address),
            },
        }
    }
}

/// A frame handed to a stack walk callback. It cannot escape the callback.
pub struct FrameCursor<'a> {
    frame: &'a mut Frame,
    depth: usize,
}

impl<'a> FrameCursor<'a> {
    /// Distance from the innermost frame, which has depth 0.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn method(&self) -> Option<&Arc<Method>> {
        self.frame.method.as_ref()
    }

    pub fn is_runtime_frame(&self) -> bool {
        self.frame.method.as_ref().map_or(true, |method| method.is_runtime_method())
    }

    pub fn is_interpreter_frame(&self) -> bool {
        matches!(self.frame.kind, FrameKind::Interpreter { .. })
    }

    pub fn compiled_code(&self) -> Option<CompiledCode> {
        match &self.frame.kind {
            FrameKind::Compiled { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn dex_pc(&self) -> Option<u32> {
        match &self.frame.kind {
            FrameKind::Interpreter { dex_pc, .. } => Some(*dex_pc),
            _ => None,
        }
    }

    pub fn notify_dex_pc_moves(&self) -> bool {
        matches!(
            self.frame.kind,
            FrameKind::Interpreter {
                notify_dex_pc_moves: true,
                ..
            }
        )
    }

    /// Returns false for frames that are not interpreted.
    pub fn set_notify_dex_pc_moves(&mut self, notify: bool) -> bool {
        match &mut self.frame.kind {
            FrameKind::Interpreter {
                notify_dex_pc_moves,
                ..
            } => {
                *notify_dex_pc_moves = notify;
                true
            }
            _ => false,
        }
    }

    pub fn should_deoptimize_flags(&self) -> Option<DeoptimizeFlags> {
        match &self.frame.kind {
            FrameKind::Compiled {
                should_deoptimize, ..
            } => *should_deoptimize,
            _ => None,
        }
    }

    /// Returns false if the frame has no should-deoptimize slot.
    pub fn set_should_deoptimize_flag(&mut self, flag: DeoptimizeFlags) -> bool {
        match &mut self.frame.kind {
            FrameKind::Compiled {
                should_deoptimize: Some(flags),
                ..
            } => {
                flags.insert(flag);
                true
            }
            _ => false,
        }
    }

    pub fn unset_should_deoptimize_flag(&mut self, flag: DeoptimizeFlags) {
        if let FrameKind::Compiled {
            should_deoptimize: Some(flags),
            ..
        } = &mut self.frame.kind
        {
            flags.remove(flag);
        }
    }

    /// Whether execution of this frame can be moved to the interpreter at an
    /// arbitrary call site.
    pub fn is_async_deoptimizable(&self) -> bool {
        match &self.frame.kind {
            FrameKind::Runtime => false,
            FrameKind::Interpreter { .. } => true,
            FrameKind::Compiled { code, .. } => code.header.debuggable,
        }
    }
}

/// Frames of one thread, outermost first.
pub struct ManagedStack {
    frames: Mutex<Vec<Frame>>,
}

impl ManagedStack {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, frame: Frame) {
        self.frames.lock().push(frame);
    }

    pub fn pop(&self) -> Option<Frame> {
        self.frames.lock().pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Copy of the frame at `depth`, counted from the innermost frame.
    pub fn frame(&self, depth: usize) -> Option<Frame> {
        let frames = self.frames.lock();
        let index = frames.len().checked_sub(depth + 1)?;
        Some(frames[index].clone())
    }

    /// Visit frames from the innermost outwards until `visit` breaks.
    pub fn walk(&self, mut visit: impl FnMut(&mut FrameCursor<'_>) -> ControlFlow<()>) {
        let mut frames = self.frames.lock();
        for (depth, frame) in frames.iter_mut().rev().enumerate() {
            let mut cursor = FrameCursor { frame, depth };
            if visit(&mut cursor).is_break() {
                break;
            }
        }
    }

    /// Visit the frame at `depth` only.
    pub fn with_frame<R>(&self, depth: usize, visit: impl FnOnce(&mut FrameCursor<'_>) -> R) -> Option<R> {
        let mut frames = self.frames.lock();
        let index = frames.len().checked_sub(depth + 1)?;
        let mut cursor = FrameCursor {
            frame: &mut frames[index],
            depth,
        };
        Some(visit(&mut cursor))
    }

    pub fn describe(&self) -> Vec<String> {
        self.frames.lock().iter().rev().map(Frame::describe).collect()
    }
}

impl Default for ManagedStack {
    fn default() -> Self {
        Self::new()
    }
}
