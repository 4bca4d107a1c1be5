use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use vmkit_safepoint::{
    define_flag,
    instrumentation::listeners::{InstrumentationEvent, ListenerRef},
    mock::{jit_code, MutatorHarness, RecordingListener},
    runtime::{
        methods::MethodFlags,
        options::SafepointFlags,
        stack::Frame,
        threads::{ManagedThread, SuspendReason},
    },
    utils::flags,
    RuntimeBuilder,
};

struct DemoFlags;

define_flag!(DemoFlags => usize, mutators, 4, "Number of mutator threads to start. (default: 4)");
define_flag!(DemoFlags => usize, rounds, 3, "Suspend-all rounds to run. (default: 3)");

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(err) = flags::parse_with_prefix::<SafepointFlags>("safepoint", args.iter().cloned(), std::env::vars()) {
        log::error!("{}", err);
        std::process::exit(2);
    }
    if let Err(err) = flags::parse_with_prefix::<DemoFlags>("demo", args.into_iter(), std::env::vars()) {
        log::error!("{}", err);
        std::process::exit(2);
    }

    let runtime = match RuntimeBuilder::new().from_options() {
        Ok(builder) => builder.build(),
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(2);
        }
    };

    let hot = runtime.load_method("Demo.hot", MethodFlags::empty(), None, false);
    runtime
        .instrumentation()
        .update_methods_code(&hot, jit_code(0x4000, true));
    let leaf = runtime.load_method("Demo.leaf", MethodFlags::empty(), None, false);

    let mut harness = MutatorHarness::new(runtime.clone());
    for i in 0..demoflags_mutators() {
        let thread = harness.spawn(&format!("mutator-{}", i));
        let (hot, leaf) = (hot.clone(), leaf.clone());
        let _ = harness
            .run(&thread, move |thread| {
                thread.stack().push(Frame::compiled(hot, jit_code(0x4000, true)));
                thread.stack().push(Frame::interpreter(leaf, 0));
            })
            .recv();
    }

    for round in 0..demoflags_rounds() {
        let start = Instant::now();
        let ssa = runtime.threads().suspend_all("demo");
        runtime.threads().assert_other_threads_are_suspended();
        drop(ssa);
        println!("suspend-all round {} took {:?}", round, start.elapsed());
    }

    let visits = Arc::new(AtomicUsize::new(0));
    let counter = visits.clone();
    let targeted = runtime
        .threads()
        .run_checkpoint_and_wait(Arc::new(move |_: &ManagedThread| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
    println!(
        "checkpoint targeted {} threads and ran {} times",
        targeted,
        visits.load(Ordering::Relaxed)
    );

    let flipped = runtime.threads().flip_thread_roots(
        Arc::new(|thread: &ManagedThread| log::debug!("flipping roots of thread {}", thread.id())),
        || log::debug!("flip callback"),
        None,
    );
    println!("flipped the roots of {} threads", flipped);

    if let Some(thread) = harness.threads().first() {
        if runtime.threads().suspend_thread(thread, SuspendReason::ForUserCode) {
            println!("suspended {} for user code", thread.name());
            runtime.threads().resume(thread, SuspendReason::ForUserCode);
        }
    }

    let recorder = RecordingListener::new();
    let listener: ListenerRef = recorder.clone();
    {
        let ssa = runtime.threads().suspend_all("deoptimize hot method");
        let instrumentation = runtime.instrumentation();
        instrumentation.add_listener(&ssa, listener.clone(), InstrumentationEvent::METHOD_ENTERED);
        instrumentation.enable_method_tracing(&ssa, "demo", false);
        instrumentation.deoptimize(&ssa, &hot);
    }
    for thread in harness.threads() {
        println!(
            "{}: caller of the leaf has to deoptimize: {}",
            thread.name(),
            runtime.instrumentation().should_deoptimize_caller(&thread)
        );
    }
    println!(
        "{} method entered events reported for running frames",
        recorder.count(InstrumentationEvent::METHOD_ENTERED)
    );
    {
        let ssa = runtime.threads().suspend_all("undeoptimize hot method");
        let instrumentation = runtime.instrumentation();
        instrumentation.undeoptimize(&ssa, &hot);
        instrumentation.disable_method_tracing(&ssa, "demo");
        instrumentation.remove_listener(&ssa, &listener, InstrumentationEvent::METHOD_ENTERED);
    }
    println!("{} is back on {}", hot, hot.entry_point());

    println!("{}", runtime.threads().dump_via_checkpoint());
    harness.stop();
    runtime.shutdown();
}
