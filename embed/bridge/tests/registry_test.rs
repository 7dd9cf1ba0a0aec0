use bridge::{
    BridgeConfig, BridgeContext, BridgeError, CallDescriptor, LoadState, NativeModule, PlatformLoader, Result,
    StaticLoader, StaticModule,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

/// Counts load attempts and can be told to reject them.
struct CountingLoader {
    inner: StaticLoader,
    loads: Arc<AtomicUsize>,
    rejects: Arc<AtomicUsize>,
}

impl PlatformLoader for CountingLoader {
    fn resolve_library(&self, name: &str) -> Result<PathBuf> {
        self.inner.resolve_library(name)
    }

    fn load(&self, path: &Path) -> Result<Box<dyn NativeModule>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        let rejected = self
            .rejects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BridgeError::LoadFailed {
                name: path.display().to_string(),
                reason: "image is corrupt".into(),
            });
        }
        self.inner.load(path)
    }
}

fn context(rejects: usize) -> (BridgeContext, Arc<AtomicUsize>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let loads = Arc::new(AtomicUsize::new(0));
    let loader = CountingLoader {
        inner: StaticLoader::new().register("managed", StaticModule::new().with_symbols(stub_runtime::exports())),
        loads: loads.clone(),
        rejects: Arc::new(AtomicUsize::new(rejects)),
    };
    let ctx = BridgeContext::new(BridgeConfig::default(), Box::new(loader)).expect("context");
    (ctx, loads)
}

#[test]
fn concurrent_resolution_loads_once() {
    let (ctx, loads) = context(0);
    let ctx = Arc::new(ctx);
    let barrier = Arc::new(Barrier::new(8));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let ctx = ctx.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                ctx.resolve("managed").unwrap()
            })
        })
        .collect();
    let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    for handle in &handles {
        assert!(Arc::ptr_eq(handle, &handles[0]));
    }
    assert_eq!(handles[0].state(), LoadState::Loaded);
    assert_eq!(ctx.registry().handles().len(), 1);
}

#[test]
fn recorded_failure_is_reported_until_evicted() {
    let (ctx, loads) = context(1);

    let first = ctx.resolve("managed").unwrap_err();
    let second = ctx.resolve("managed").unwrap_err();
    assert!(matches!(first, BridgeError::LoadFailed { .. }));
    assert_eq!(first.to_string(), second.to_string());
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(!ctx.channel().is_installed());

    ctx.registry().evict("managed");
    let handle = ctx.resolve("managed").unwrap();
    assert!(handle.is_loaded());
    assert_eq!(loads.load(Ordering::SeqCst), 2);
    assert!(ctx.channel().is_installed());
}

#[test]
fn unknown_library_reports_not_found() {
    let (ctx, loads) = context(0);
    match ctx.resolve("missing") {
        Err(BridgeError::LibraryNotFound { name, .. }) => assert_eq!(name, "missing"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(loads.load(Ordering::SeqCst), 0);
}

#[test]
fn initializer_runs_once_after_first_load() {
    let (ctx, _) = context(0);
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    ctx.registry().register_initializer("managed", move |handle| {
        anyhow::ensure!(handle.symbol("Tests_Answer").is_some(), "runtime exports nothing");
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    for _ in 0..3 {
        ctx.resolve("managed").unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn initializer_calls_report_runtime_faults() {
    let (ctx, _) = context(0);
    let marshaler = ctx.marshaler().clone();
    let seen = Arc::new(Mutex::new(None));
    let slot = seen.clone();
    ctx.registry().register_initializer("managed", move |handle| {
        let answer = CallDescriptor::new("Tests", "Answer").returns::<i32>();
        stub_runtime::fail_next_call();
        let result = marshaler.invoke(handle, &answer, &mut []);
        *slot.lock().unwrap() = Some(matches!(result, Err(BridgeError::ManagedExceptionThrown(_))));
        result?;
        Ok(())
    });

    let err = ctx.resolve("managed").unwrap_err();
    assert_eq!(seen.lock().unwrap().take(), Some(true));
    match err {
        BridgeError::LoadFailed { reason, .. } => assert!(reason.starts_with("initializer failed")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!ctx.channel().is_pending());
    assert!(!ctx.registry().lookup("managed").unwrap().is_loaded());
}
