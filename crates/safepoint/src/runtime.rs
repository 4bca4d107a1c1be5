use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use options::SafepointOptions;
use threads::ThreadList;

use crate::{
    error::{Result, SafepointError},
    instrumentation::Instrumentation,
    runtime::methods::{CompiledCode, Method, MethodFlags, MethodRegistry},
};

pub mod checkpoint;
pub mod methods;
pub mod options;
pub mod stack;
pub mod suspend;
pub mod threads;

static NEXT_CONTEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// Everything one runtime instance owns: its threads, its loaded methods
/// and the instrumentation state deciding how those methods run.
pub struct RuntimeContext {
    id: usize,
    threads: ThreadList,
    methods: Arc<MethodRegistry>,
    instrumentation: Instrumentation,
}

impl RuntimeContext {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn threads(&self) -> &ThreadList {
        &self.threads
    }

    pub fn methods(&self) -> &Arc<MethodRegistry> {
        &self.methods
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    pub fn options(&self) -> &SafepointOptions {
        self.threads.options()
    }

    /// Define a method and give it its initial entrypoint.
    pub fn load_method(
        &self,
        name: &str,
        flags: MethodFlags,
        aot_code: Option<CompiledCode>,
        needs_clinit_check: bool,
    ) -> Arc<Method> {
        let method = self
            .methods
            .define(name, flags, aot_code, needs_clinit_check);
        self.instrumentation.initialize_methods_code(&method);
        method
    }

    /// Wait for every non-daemon thread to detach.
    pub fn shutdown(&self) {
        log::info!("shutting down runtime {}", self.id);
        self.threads.wait_for_other_non_daemon_threads_to_exit();
        let daemons = self.threads.size();
        if daemons != 0 {
            log::debug!("{} daemon threads still attached at shutdown", daemons);
        }
    }
}

pub struct RuntimeBuilder {
    options: SafepointOptions,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            options: SafepointOptions::default(),
        }
    }

    /// Take options from the parsed `SafepointFlags`.
    pub fn from_options(mut self) -> Result<Self> {
        self.options = SafepointOptions::from_flags()?;
        Ok(self)
    }

    pub fn with_options(mut self, options: SafepointOptions) -> Self {
        self.options = options;
        self
    }

    /// Short timeouts and panicking fatal errors, with test logging enabled.
    pub fn for_tests(self) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        self.with_options(SafepointOptions::for_tests())
    }

    pub fn build(self) -> Arc<RuntimeContext> {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let methods = Arc::new(MethodRegistry::new());
        Arc::new(RuntimeContext {
            id,
            threads: ThreadList::new(self.options, id),
            instrumentation: Instrumentation::new(methods.clone()),
            methods,
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Report an unrecoverable suspension failure and stop.
///
/// Aborts the process unless `abort_on_fatal` is off, in which case it panics
/// so tests can observe the failure.
pub fn fatal(err: &SafepointError, threads: &ThreadList) -> ! {
    log::error!("{}", err);
    log::error!("{}", threads.dump());
    if threads.options().abort_on_fatal {
        std::process::abort();
    }
    panic!("{}", err);
}
