use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use anyhow::{Context, Result};
use enclave::{
    Capability, Embedding, Error, IsolateHandle, LIBRARY_GLOBAL, LibHandle, ManualHost,
    ProcessRegistry, ShutdownState, Transferable, TypeOf, Value,
};

use super::common::{Fixture, next_native_id, run};

#[test]
fn library_bootstraps_nested_isolates() -> Result<()> {
    let fixture = Fixture::new();
    let (native_id, c0) = fixture.init()?;

    let (c1, library) = run(&c0, |scope| {
        let global = Value::Object(scope.global());
        let library = scope.get(&global, LIBRARY_GLOBAL)?;
        let ctor = scope.get(&library, "Isolate")?;
        let options = scope.new_object()?;
        scope.set(&options, "memoryLimit", Value::from(0))?;
        let instance = scope.construct(&ctor, &[Value::Object(options)])?;
        let c1 = scope.native::<IsolateHandle>(&instance)?;
        Ok((c1, scope.transfer_out(&library)?))
    })?;
    assert!(matches!(library, Transferable::Library));
    assert_eq!(c1.heap_statistics()?.heap_size_limit, 8 << 20);

    let (exposed, c2) = run(c1.holder(), move |scope| {
        let library = library.transfer_in(scope)?;
        let global = scope.global();
        scope.set(&global, LIBRARY_GLOBAL, library.clone())?;

        let mut exposed = Vec::new();
        for capability in Capability::SURFACE {
            let ctor = scope.get(&library, capability.class_name())?;
            if scope.type_of(&ctor)? == TypeOf::Function {
                exposed.push(capability);
            }
        }

        let ctor = scope.get(&library, "Isolate")?;
        let instance = scope.construct(&ctor, &[])?;
        let c2 = scope.native::<IsolateHandle>(&instance)?;
        c2.create_context()?;
        Ok((exposed, c2))
    })?;
    assert_eq!(exposed, Capability::SURFACE);
    assert_ne!(c2.id(), c1.id());
    assert!(!c2.is_disposed());

    c2.dispose();
    c1.dispose();
    assert_eq!(fixture.host.notify_finished(native_id), 1);
    assert!(c0.is_disposed());
    Ok(())
}

#[test]
fn constructors_are_cached_per_isolate() -> Result<()> {
    let fixture = Fixture::new();
    let (native_id, c0) = fixture.init()?;

    let (first, second, installed) = run(&c0, |scope| {
        let first = scope.class_template(Capability::Reference)?;
        let second = scope.class_template(Capability::Reference)?;
        let global = Value::Object(scope.global());
        let library = scope.get(&global, LIBRARY_GLOBAL)?;
        let installed = scope.get(&library, "Reference")?;
        Ok((first, second, installed))
    })?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(installed, Value::Object(first.constructor()));

    let child = fixture.isolate()?;
    let other = run(child.holder(), |scope| {
        scope.class_template(Capability::Reference)
    })?;
    assert!(!Arc::ptr_eq(&first, &other));
    assert_ne!(first.serial(), other.serial());
    assert_ne!(first.isolate(), other.isolate());

    // A second library object in the same isolate shares the constructors.
    let reinstalled = run(&c0, |scope| {
        let library = Transferable::Library.transfer_in(scope)?;
        scope.get(&library, "Reference")
    })?;
    assert_eq!(reinstalled, installed);

    child.dispose();
    fixture.host.notify_finished(native_id);
    Ok(())
}

#[test]
fn library_carries_a_lib_utility_object() -> Result<()> {
    let fixture = Fixture::new();
    let (native_id, c0) = fixture.init()?;
    let child = fixture.isolate()?;

    let (is_lib, elapsed, refused) = run(&c0, |scope| {
        let global = Value::Object(scope.global());
        let library = scope.get(&global, LIBRARY_GLOBAL)?;
        let lib = scope.get(&library, "lib")?;
        let is_lib = scope.instance_of(&lib, Capability::Lib);
        let start = scope.native::<LibHandle>(&lib)?.hrtime(None);
        let elapsed = scope.native::<LibHandle>(&lib)?.hrtime(Some(start));
        let refused = matches!(scope.transfer_out(&lib), Err(Error::NotTransferable(_)));
        Ok((is_lib, elapsed, refused))
    })?;
    assert!(is_lib);
    assert!(elapsed[0] < 60);
    assert!(refused);

    // Each transferred library gets a lib of its own isolate.
    let reinstalled = run(child.holder(), |scope| {
        let library = Transferable::Library.transfer_in(scope)?;
        let lib = scope.get(&library, "lib")?;
        Ok(scope.instance_of(&lib, Capability::Lib))
    })?;
    assert!(reinstalled);

    child.dispose();
    fixture.host.notify_finished(native_id);
    Ok(())
}

#[test]
fn private_constructors_refuse_script_construction() -> Result<()> {
    let fixture = Fixture::new();
    let (native_id, c0) = fixture.init()?;

    let refused = run(&c0, |scope| {
        let global = Value::Object(scope.global());
        let library = scope.get(&global, LIBRARY_GLOBAL)?;
        let mut refused = Vec::new();
        for name in ["Context", "Script"] {
            let ctor = scope.get(&library, name)?;
            refused.push(matches!(
                scope.construct(&ctor, &[]),
                Err(Error::TypeError(_))
            ));
        }
        refused.push(matches!(
            scope.construct(&library, &[]),
            Err(Error::TypeError(_))
        ));
        Ok(refused)
    })?;
    assert_eq!(refused, [true, true, true]);
    fixture.host.notify_finished(native_id);
    Ok(())
}

#[test]
fn finish_notification_releases_and_unregisters() -> Result<()> {
    let fixture = Fixture::new();
    let (native_id, c0) = fixture.init()?;
    let weak = c0.weak();
    let registry = ProcessRegistry::global();

    assert_eq!(registry.state(native_id), ShutdownState::Registered);
    assert!(registry.lookup(native_id).context("registered")?.ptr_eq(&c0));

    assert_eq!(fixture.host.notify_finished(native_id), 1);
    assert_eq!(registry.state(native_id), ShutdownState::Unregistered);
    assert!(registry.lookup(native_id).is_none());
    assert!(matches!(weak.resolve(), Err(Error::Disposed)));
    assert!(matches!(c0.strong(), Err(Error::Disposed)));

    assert_eq!(fixture.host.notify_finished(native_id), 0);
    assert!(!registry.finish(native_id));
    Ok(())
}

#[test]
fn duplicate_init_is_fatal() -> Result<()> {
    let fixture = Fixture::new();
    let (native_id, c0) = fixture.init()?;

    let again = catch_unwind(AssertUnwindSafe(|| {
        enclave::init(&fixture.embedding, native_id)
    }));
    assert!(again.is_err());

    let canonical = ProcessRegistry::global()
        .lookup(native_id)
        .context("first registration survives")?;
    assert!(canonical.ptr_eq(&c0));
    fixture.host.notify_finished(native_id);
    Ok(())
}

#[test]
fn init_without_platform_is_fatal() {
    let embedding = Embedding::builder()
        .host(Arc::new(ManualHost::with_platform(None)))
        .build();
    let native_id = next_native_id();

    let result = catch_unwind(AssertUnwindSafe(|| enclave::init(&embedding, native_id)));
    assert!(result.is_err());
    assert!(ProcessRegistry::global().lookup(native_id).is_none());
}
