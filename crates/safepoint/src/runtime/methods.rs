//! Loaded methods and the code their call sites currently resolve to.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use bitflags::bitflags;
use parking_lot::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodId(u32);

impl MethodId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MethodFlags: u32 {
        const NATIVE = 1 << 0;
        const ABSTRACT = 1 << 1;
        const PROXY = 1 << 2;
        /// Constructor of a proxy class. Always runs the code it was
        /// created with.
        const PROXY_INIT = 1 << 3;
        /// Runtime-internal method (trampolines, save-all frames).
        const RUNTIME = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeKind {
    Aot,
    Jit,
}

/// What the compiler tells us about a piece of compiled code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodHeader {
    pub kind: CodeKind,
    /// Compiled with instrumentation support: it calls entry/exit hooks and
    /// can be deoptimized at any call site.
    pub debuggable: bool,
    /// Offset of the should-deoptimize slot in the frame, if the code has one.
    pub deopt_flag_offset: Option<u32>,
}

impl MethodHeader {
    pub fn has_should_deoptimize_flag(&self) -> bool {
        self.deopt_flag_offset.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompiledCode {
    pub address: usize,
    pub header: MethodHeader,
}

/// Where calls to a method currently go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryPoint {
    InterpreterBridge,
    /// Runs class initialization before dispatching.
    ResolutionStub,
    /// Generic bridge for native methods without compiled stubs.
    GenericNativeStub,
    Compiled(CompiledCode),
}

impl EntryPoint {
    /// Whether code entered through this entrypoint reports method entry and
    /// exit to instrumentation.
    pub fn supports_entry_exit_hooks(&self) -> bool {
        match self {
            EntryPoint::InterpreterBridge
            | EntryPoint::ResolutionStub
            | EntryPoint::GenericNativeStub => true,
            EntryPoint::Compiled(code) => code.header.kind == CodeKind::Jit && code.header.debuggable,
        }
    }

    pub fn compiled_code(&self) -> Option<CompiledCode> {
        match self {
            EntryPoint::Compiled(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::InterpreterBridge => f.write_str("interpreter bridge"),
            EntryPoint::ResolutionStub => f.write_str("resolution stub"),
            EntryPoint::GenericNativeStub => f.write_str("generic native stub"),
            EntryPoint::Compiled(code) => {
                let kind = match code.header.kind {
                    CodeKind::Aot => "aot",
                    CodeKind::Jit => "jit",
                };
                write!(f, "{} code @ {:#x}", kind, code.address)?;
                if code.header.debuggable {
                    f.write_str(" (debuggable)")?;
                }
                Ok(())
            }
        }
    }
}

pub struct Method {
    id: MethodId,
    name: String,
    flags: MethodFlags,
    needs_clinit_check: AtomicBool,
    entry_point: RwLock<EntryPoint>,
    aot_code: Option<CompiledCode>,
    jit_code: RwLock<Option<CompiledCode>>,
}

impl Method {
    pub fn new(
        id: MethodId,
        name: &str,
        flags: MethodFlags,
        aot_code: Option<CompiledCode>,
        needs_clinit_check: bool,
    ) -> Self {
        Self {
            id,
            name: name.to_owned(),
            flags,
            needs_clinit_check: AtomicBool::new(needs_clinit_check),
            entry_point: RwLock::new(EntryPoint::ResolutionStub),
            aot_code,
            jit_code: RwLock::new(None),
        }
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }

    pub fn is_proxy(&self) -> bool {
        self.flags.contains(MethodFlags::PROXY)
    }

    pub fn is_proxy_init(&self) -> bool {
        self.flags.contains(MethodFlags::PROXY_INIT)
    }

    pub fn is_runtime_method(&self) -> bool {
        self.flags.contains(MethodFlags::RUNTIME)
    }

    pub fn is_invokable(&self) -> bool {
        !self
            .flags
            .intersects(MethodFlags::ABSTRACT | MethodFlags::RUNTIME)
    }

    pub fn needs_clinit_check(&self) -> bool {
        self.needs_clinit_check.load(Ordering::Acquire)
    }

    pub(crate) fn mark_class_initialized(&self) {
        self.needs_clinit_check.store(false, Ordering::Release);
    }

    pub fn entry_point(&self) -> EntryPoint {
        *self.entry_point.read()
    }

    pub(crate) fn set_entry_point(&self, entry_point: EntryPoint) {
        *self.entry_point.write() = entry_point;
    }

    pub fn aot_code(&self) -> Option<CompiledCode> {
        self.aot_code
    }

    pub fn jit_code(&self) -> Option<CompiledCode> {
        *self.jit_code.read()
    }

    pub(crate) fn set_jit_code(&self, code: CompiledCode) {
        *self.jit_code.write() = Some(code);
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("entry_point", &self.entry_point())
            .finish()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.id)
    }
}

/// Every method loaded into the runtime.
pub struct MethodRegistry {
    methods: RwLock<Vec<Arc<Method>>>,
    next_id: AtomicU32,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn define(
        &self,
        name: &str,
        flags: MethodFlags,
        aot_code: Option<CompiledCode>,
        needs_clinit_check: bool,
    ) -> Arc<Method> {
        let id = MethodId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let method = Arc::new(Method::new(id, name, flags, aot_code, needs_clinit_check));
        self.methods.write().push(method.clone());
        method
    }

    pub fn find(&self, id: MethodId) -> Option<Arc<Method>> {
        self.methods
            .read()
            .iter()
            .find(|method| method.id == id)
            .cloned()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Method>)) {
        for method in self.methods.read().iter() {
            f(method);
        }
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(kind: CodeKind, debuggable: bool) -> CompiledCode {
        CompiledCode {
            address: 0x1000,
            header: MethodHeader {
                kind,
                debuggable,
                deopt_flag_offset: None,
            },
        }
    }

    #[test]
    fn hook_support() {
        assert!(EntryPoint::InterpreterBridge.supports_entry_exit_hooks());
        assert!(EntryPoint::ResolutionStub.supports_entry_exit_hooks());
        assert!(EntryPoint::GenericNativeStub.supports_entry_exit_hooks());
        assert!(EntryPoint::Compiled(code(CodeKind::Jit, true)).supports_entry_exit_hooks());
        assert!(!EntryPoint::Compiled(code(CodeKind::Jit, false)).supports_entry_exit_hooks());
        assert!(!EntryPoint::Compiled(code(CodeKind::Aot, true)).supports_entry_exit_hooks());
    }

    #[test]
    fn registry_assigns_ids() {
        let registry = MethodRegistry::new();
        let a = registry.define("a", MethodFlags::empty(), None, false);
        let b = registry.define("b", MethodFlags::ABSTRACT, None, false);
        assert_ne!(a.id(), b.id());
        assert!(a.is_invokable());
        assert!(!b.is_invokable());
        assert_eq!(registry.find(b.id()).unwrap().name(), "b");
        assert_eq!(registry.len(), 2);
        assert_eq!(
            EntryPoint::Compiled(code(CodeKind::Jit, true)).to_string(),
            "jit code @ 0x1000 (debuggable)"
        );
    }
}
