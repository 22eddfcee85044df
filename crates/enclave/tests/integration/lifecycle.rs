use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use enclave::{
    Capability, DefaultEngine, Error, IsolateHandle, IsolateOptions, Lifecycle, ScriptOrigin,
    Transferable, Value,
};

use super::common::{Fixture, run};

#[test]
fn tasks_run_on_the_isolate_thread() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate_with(&IsolateOptions::default().name("worker"))?;

    let name = run(isolate.holder(), |_| {
        Ok(std::thread::current().name().map(str::to_string))
    })?;
    assert_eq!(name.as_deref(), Some("enclave-worker"));

    let env = isolate.environment()?;
    assert_eq!(env.lifecycle(), Lifecycle::Running);
    assert!(!env.is_current_thread());
    isolate.dispose();
    Ok(())
}

#[test]
fn dispose_is_idempotent_and_weak_holders_observe_it() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate()?;
    let weak = isolate.holder().weak();
    let env = weak.resolve().context("isolate should be live")?;

    isolate.dispose();
    isolate.dispose();

    assert!(isolate.is_disposed());
    assert!(matches!(weak.resolve(), Err(Error::Disposed)));
    assert!(matches!(isolate.create_context(), Err(Error::Disposed)));
    assert!(matches!(env.run_sync(|_| Ok(())), Err(Error::Disposed)));
    assert_eq!(env.lifecycle(), Lifecycle::Disposed);
    Ok(())
}

#[test]
fn dropping_the_last_holder_stops_the_isolate() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate()?;
    let weak = isolate.holder().weak();
    let env = isolate.environment()?;

    drop(isolate);
    assert!(matches!(weak.resolve(), Err(Error::Disposed)));
    assert!(env.lifecycle() >= Lifecycle::Releasing);
    Ok(())
}

#[test]
fn handles_stored_in_their_own_isolate_do_not_keep_it_alive() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate()?;
    let weak = isolate.holder().weak();
    let env = isolate.environment()?;
    let context = isolate.create_context()?;
    let script = isolate.compile_script("1", ScriptOrigin::default())?;
    let own = isolate.clone();

    let handed_out_is_strong = run(isolate.holder(), move |scope| {
        let global = scope.global();
        let ctor = Value::Object(scope.class_template(Capability::Reference)?.constructor());
        let target = Value::Object(scope.new_object()?);
        let reference = scope.construct(&ctor, &[target])?;
        scope.set(&global, "reference", reference)?;

        let packages = [
            ("context", Transferable::Context(context)),
            ("script", Transferable::Script(script)),
            ("isolate", Transferable::Isolate(own)),
        ];
        for (key, package) in packages {
            let value = package.transfer_in(scope)?;
            scope.set(&global, key, value)?;
        }
        let stored = scope.get(&Value::Object(global), "isolate")?;
        let handed_out = scope.native::<IsolateHandle>(&stored)?;
        Ok(!handed_out.holder().is_anchored())
    })?;
    assert!(handed_out_is_strong);

    drop(isolate);
    assert!(env.lifecycle() >= Lifecycle::Releasing);
    assert!(matches!(weak.resolve(), Err(Error::Disposed)));

    let deadline = Instant::now() + Duration::from_secs(5);
    while env.lifecycle() != Lifecycle::Disposed {
        assert!(Instant::now() < deadline, "isolate thread never exited");
        std::thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

#[test]
fn handles_to_other_isolates_keep_them_alive() -> Result<()> {
    let fixture = Fixture::new();
    let owner = fixture.isolate()?;
    let target = fixture.isolate()?;
    let weak = target.holder().weak();

    let package = Transferable::Isolate(target.clone());
    run(owner.holder(), move |scope| {
        let global = scope.global();
        let value = package.transfer_in(scope)?;
        scope.set(&global, "target", value)
    })?;
    drop(target);
    assert!(weak.resolve().is_ok());

    owner.dispose();
    assert!(matches!(weak.resolve(), Err(Error::Disposed)));
    Ok(())
}

#[test]
fn global_flags_reach_every_embedding() -> Result<()> {
    let first = Fixture::new();
    let a = first.isolate()?;

    let second = Fixture::new();
    let b = second.isolate_with(&IsolateOptions::default().memory_limit_mb(2048))?;
    assert_eq!(b.heap_statistics()?.heap_size_limit, 2048 << 20);

    let third = Fixture::new();
    let c = third.isolate_with(&IsolateOptions::default().memory_limit_mb(1536))?;
    assert_eq!(c.heap_statistics()?.heap_size_limit, 1536 << 20);

    a.dispose();
    b.dispose();
    c.dispose();
    Ok(())
}

#[test]
fn blocking_call_into_own_isolate_is_refused() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate()?;

    let refused = run(isolate.holder(), |scope| {
        let env = scope.holder()?.strong()?;
        Ok(matches!(env.run_sync(|_| Ok(())), Err(Error::Reentrant)))
    })?;
    assert!(refused);
    isolate.dispose();
    Ok(())
}

#[test]
fn panicking_task_is_contained() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate()?;
    let env = isolate.environment()?;

    let result = env.run_sync(|_| -> enclave::Result<()> { panic!("task failure") });
    assert!(matches!(result, Err(Error::TaskAborted)));
    assert!(result.is_err_and(|e| !e.is_recoverable()));

    assert_eq!(env.run_sync(|_| Ok(7))?, 7);
    isolate.dispose();
    Ok(())
}

#[test]
fn release_waits_for_in_flight_work() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate()?;
    let env = isolate.environment()?;
    let finished = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = mpsc::channel();

    let worker = std::thread::spawn({
        let finished = Arc::clone(&finished);
        move || {
            env.run_sync(move |_| {
                started_tx.send(()).ok();
                std::thread::sleep(Duration::from_millis(50));
                finished.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    });

    started_rx.recv()?;
    isolate.holder().release_and_join();
    assert!(finished.load(Ordering::SeqCst));
    assert!(worker.join().is_ok_and(|r| r.is_ok()));
    Ok(())
}

#[test]
fn allocation_failure_is_recoverable() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate_with(&IsolateOptions::default().memory_limit_mb(8))?;

    let result = run(isolate.holder(), |scope| scope.new_buffer(vec![0; 16 << 20]));
    let error = result.err().context("allocation should fail")?;
    assert!(matches!(
        error.downcast_ref::<Error>(),
        Some(Error::ResourceExhausted(_))
    ));

    let kept = run(isolate.holder(), |scope| {
        scope.new_buffer(vec![0; 1024]).map(Value::Object)
    })?;
    assert!(kept.as_object().is_some());

    let stats = isolate.heap_statistics()?;
    assert!(stats.limit_hit);
    assert_eq!(stats.heap_size_limit, 8 << 20);
    assert!(isolate.environment()?.memory_limit_hit());
    isolate.dispose();
    Ok(())
}

#[test]
fn explicit_zero_limit_is_raised_to_floor() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate_with(&IsolateOptions::default().memory_limit_mb(0))?;
    assert_eq!(isolate.heap_statistics()?.heap_size_limit, 8 << 20);
    isolate.dispose();
    Ok(())
}

#[test]
fn engine_budget_exhaustion_can_be_retried_smaller() -> Result<()> {
    let fixture =
        Fixture::with_embedding(|b| b.engine(DefaultEngine::new().with_memory_budget(40 << 20)));

    let first = fixture.isolate_with(&IsolateOptions::default().memory_limit_mb(32))?;
    let refused = fixture
        .embedding
        .create_isolate(&IsolateOptions::default().memory_limit_mb(32));
    assert!(matches!(refused, Err(Error::ResourceExhausted(_))));

    let smaller = fixture.isolate_with(&IsolateOptions::default().memory_limit_mb(8))?;
    smaller.dispose();
    first.dispose();
    Ok(())
}

#[test]
fn contexts_are_counted_and_released() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate()?;
    let a = isolate.create_context()?;
    let b = isolate.create_context()?;

    assert_eq!(run(isolate.holder(), |scope| Ok(scope.context_count()))?, 2);
    a.release()?;
    a.release()?;
    assert!(a.is_released());
    assert!(a.global().is_err());
    assert_eq!(run(isolate.holder(), |scope| Ok(scope.context_count()))?, 1);

    isolate.dispose();
    // Releasing after the isolate is gone has nothing left to do.
    b.release()?;
    Ok(())
}

#[tokio::test]
async fn async_surface_resolves_on_isolate_thread() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate()?;

    let context = isolate.create_context_async().await?;
    let env = isolate.environment()?;
    let value = env
        .run_async(|scope| scope.create_context().map(|_| scope.context_count()))
        .await?;
    assert_eq!(value, 2);

    let global = context.global()?;
    let copy = global.copy_async().await?;
    assert_eq!(copy.to_structured()?, enclave::StructuredValue::Object(vec![]));

    isolate.dispose();
    assert!(matches!(
        env.run_async(|_| Ok(())).await,
        Err(Error::Disposed)
    ));
    Ok(())
}
