//! Mutator threads and listeners used in tests and in the demo binary.

use std::{
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use flume::RecvTimeoutError;
use parking_lot::Mutex;

use crate::{
    error::Result,
    instrumentation::listeners::{FieldId, InstrumentationEvent, InstrumentationListener, ObjectRef, Value},
    runtime::{
        methods::{CodeKind, CompiledCode, Method, MethodHeader},
        stack::Frame,
        threads::{ExceptionRef, ManagedThread, ThreadId, ThreadRef, ThreadState},
        RuntimeContext,
    },
};

/// How long an idle mutator waits for a command before polling again.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

type Job = Box<dyn FnOnce(&ManagedThread) + Send>;

enum Command {
    Run(Job, flume::Sender<()>),
    Stop,
}

struct Mutator {
    thread: ThreadRef,
    commands: flume::Sender<Command>,
    handle: JoinHandle<()>,
}

/// Attached threads that stay Runnable and poll safepoints until stopped.
pub struct MutatorHarness {
    runtime: Arc<RuntimeContext>,
    mutators: Vec<Mutator>,
}

impl MutatorHarness {
    pub fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self {
            runtime,
            mutators: Vec::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.runtime
    }

    /// Start a mutator. It is registered and Runnable when this returns.
    pub fn try_spawn(&mut self, name: &str) -> Result<ThreadRef> {
        let (commands, inbox) = flume::unbounded::<Command>();
        let (ready_tx, ready_rx) = flume::bounded::<Result<ThreadRef>>(1);
        let runtime = self.runtime.clone();
        let thread_name = name.to_owned();

        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let thread = match runtime.threads().attach_current_thread(&thread_name, false) {
                    Ok(thread) => thread,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                thread.transition_from_suspended_to_runnable();
                let _ = ready_tx.send(Ok(thread.clone()));
                mutator_loop(&thread, &inbox);
                thread.transition_from_runnable_to_suspended(ThreadState::Native);
                runtime.threads().detach_current_thread();
            })
            .unwrap_or_else(|err| panic!("failed to spawn mutator {}: {}", name, err));

        let thread = ready_rx
            .recv()
            .unwrap_or_else(|_| panic!("mutator {} exited before attaching", name))?;
        self.mutators.push(Mutator {
            thread: thread.clone(),
            commands,
            handle,
        });
        Ok(thread)
    }

    pub fn spawn(&mut self, name: &str) -> ThreadRef {
        self.try_spawn(name)
            .unwrap_or_else(|err| panic!("failed to attach mutator {}: {}", name, err))
    }

    pub fn threads(&self) -> Vec<ThreadRef> {
        self.mutators.iter().map(|m| m.thread.clone()).collect()
    }

    /// Run `job` on `thread` while it is Runnable. The receiver fires once
    /// the job has returned.
    pub fn run(
        &self,
        thread: &ThreadRef,
        job: impl FnOnce(&ManagedThread) + Send + 'static,
    ) -> flume::Receiver<()> {
        let (done_tx, done_rx) = flume::bounded(1);
        let mutator = self
            .mutators
            .iter()
            .find(|m| Arc::ptr_eq(&m.thread, thread))
            .unwrap_or_else(|| panic!("thread {} is not a mutator of this harness", thread.id()));
        let _ = mutator.commands.send(Command::Run(Box::new(job), done_tx));
        done_rx
    }

    /// Stop every mutator and wait for it to detach.
    pub fn stop(mut self) {
        self.stop_all();
    }

    fn stop_all(&mut self) {
        for mutator in &self.mutators {
            let _ = mutator.commands.send(Command::Stop);
        }
        for mutator in self.mutators.drain(..) {
            if mutator.handle.join().is_err() {
                log::error!("mutator {} panicked", mutator.thread.id());
            }
        }
    }
}

impl Drop for MutatorHarness {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn mutator_loop(thread: &ManagedThread, inbox: &flume::Receiver<Command>) {
    loop {
        thread.safepoint();
        match inbox.recv_timeout(POLL_INTERVAL) {
            Ok(Command::Run(job, done)) => {
                job(thread);
                let _ = done.send(());
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub thread: ThreadId,
    pub event: InstrumentationEvent,
    pub method: Option<String>,
    pub dex_pc: Option<u32>,
}

/// A listener that remembers everything it was told.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: InstrumentationEvent) -> usize {
        self.events.lock().iter().filter(|e| e.event == event).count()
    }

    /// Names of the methods reported for `event`, in order.
    pub fn methods(&self, event: InstrumentationEvent) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event == event)
            .filter_map(|e| e.method.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(
        &self,
        thread: &ManagedThread,
        event: InstrumentationEvent,
        method: Option<&Method>,
        dex_pc: Option<u32>,
    ) {
        self.events.lock().push(RecordedEvent {
            thread: thread.id(),
            event,
            method: method.map(|m| m.name().to_owned()),
            dex_pc,
        });
    }
}

impl InstrumentationListener for RecordingListener {
    fn method_entered(&self, thread: &ManagedThread, method: &Method) {
        self.record(thread, InstrumentationEvent::METHOD_ENTERED, Some(method), None);
    }

    fn method_exited(&self, thread: &ManagedThread, method: &Method, _return_value: &mut Value) {
        self.record(thread, InstrumentationEvent::METHOD_EXITED, Some(method), None);
    }

    fn method_unwind(&self, thread: &ManagedThread, method: &Method, dex_pc: u32) {
        self.record(thread, InstrumentationEvent::METHOD_UNWIND, Some(method), Some(dex_pc));
    }

    fn dex_pc_moved(
        &self,
        thread: &ManagedThread,
        _this_object: Option<ObjectRef>,
        method: &Method,
        dex_pc: u32,
    ) {
        self.record(thread, InstrumentationEvent::DEX_PC_MOVED, Some(method), Some(dex_pc));
    }

    fn field_read(
        &self,
        thread: &ManagedThread,
        _this_object: Option<ObjectRef>,
        method: &Method,
        dex_pc: u32,
        _field: FieldId,
    ) {
        self.record(thread, InstrumentationEvent::FIELD_READ, Some(method), Some(dex_pc));
    }

    fn field_written(
        &self,
        thread: &ManagedThread,
        _this_object: Option<ObjectRef>,
        method: &Method,
        dex_pc: u32,
        _field: FieldId,
        _value: Value,
    ) {
        self.record(thread, InstrumentationEvent::FIELD_WRITTEN, Some(method), Some(dex_pc));
    }

    fn exception_thrown(&self, thread: &ManagedThread, _exception: ExceptionRef) {
        assert!(
            !thread.is_exception_pending(),
            "exception listeners run with the exception cleared"
        );
        self.record(thread, InstrumentationEvent::EXCEPTION_THROWN, None, None);
    }

    fn exception_handled(&self, thread: &ManagedThread, _exception: ExceptionRef) {
        self.record(thread, InstrumentationEvent::EXCEPTION_HANDLED, None, None);
    }

    fn branch(&self, thread: &ManagedThread, method: &Method, dex_pc: u32, _offset: i32) {
        self.record(thread, InstrumentationEvent::BRANCH, Some(method), Some(dex_pc));
    }

    fn watched_frame_pop(&self, thread: &ManagedThread, frame: &Frame) {
        self.record(
            thread,
            InstrumentationEvent::WATCHED_FRAME_POP,
            frame.method().map(|m| &**m),
            None,
        );
    }
}

/// Precompiled code without instrumentation support.
pub fn aot_code(address: usize, deopt_slot: bool) -> CompiledCode {
    CompiledCode {
        address,
        header: MethodHeader {
            kind: CodeKind::Aot,
            debuggable: false,
            deopt_flag_offset: deopt_slot.then_some(8),
        },
    }
}

/// JIT code. JIT frames always carry a should-deoptimize slot.
pub fn jit_code(address: usize, debuggable: bool) -> CompiledCode {
    CompiledCode {
        address,
        header: MethodHeader {
            kind: CodeKind::Jit,
            debuggable,
            deopt_flag_offset: Some(8),
        },
    }
}
