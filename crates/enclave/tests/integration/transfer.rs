use anyhow::{Context, Result};
use enclave::{
    Capability, ClassHandle, Error, ExternalCopyHandle, IsolateHandle, IsolateOptions, Primitive,
    ReferenceHandle, ResultMode, ScriptOrigin, StructuredValue, Transferable, TypeOf, Value,
};

use super::common::{Fixture, run, sample, sample_tree};

#[test]
fn external_copy_round_trips_without_aliasing() -> Result<()> {
    let fixture = Fixture::new();
    let a = fixture.isolate()?;
    let b = fixture.isolate()?;

    let (original, package) = run(a.holder(), |scope| {
        let value = sample(scope)?;
        let original = *value.as_object().ok_or(Error::InvalidReference)?;
        let ctor = Value::Object(scope.class_template(Capability::ExternalCopy)?.constructor());
        let copy = scope.construct(&ctor, &[value])?;
        Ok((original, scope.transfer_out(&copy)?))
    })?;
    assert!(matches!(package, Transferable::ExternalCopy(_)));

    let copied = run(b.holder(), move |scope| {
        let instance = package.transfer_in(scope)?;
        assert!(scope.instance_of(&instance, Capability::ExternalCopy));
        let handle = scope.native::<ExternalCopyHandle>(&instance)?;
        let value = handle.copy().copy_into(scope)?;
        let snapshot = scope.snapshot(&value)?;

        // Mutate the copy on B's side.
        let object = *value.as_object().ok_or(Error::InvalidReference)?;
        scope.set(&object, "a", Value::from("changed"))?;
        Ok(snapshot)
    })?;
    assert_eq!(copied, sample_tree());

    let after = run(a.holder(), move |scope| scope.snapshot(&Value::Object(original)))?;
    assert_eq!(after, sample_tree());

    a.dispose();
    b.dispose();
    Ok(())
}

#[test]
fn copies_of_shared_children_are_bounded_by_the_heap_limit() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate_with(&IsolateOptions::default().memory_limit_mb(8))?;

    let (refused, unchanged, reference) = run(isolate.holder(), |scope| {
        let ctor = Value::Object(scope.class_template(Capability::ExternalCopy)?.constructor());
        let mut shared = Value::Object(scope.new_array(Vec::new())?);
        for _ in 0..30 {
            shared = Value::Object(scope.new_array(vec![shared.clone(), shared])?);
        }
        let before = scope.heap().statistics();
        let refused = matches!(
            scope.construct(&ctor, &[shared.clone()]),
            Err(Error::ResourceExhausted(_))
        );
        let unchanged = scope.heap().statistics() == before;
        Ok((refused, unchanged, ReferenceHandle::new(scope, shared)?))
    })?;
    assert!(refused);
    assert!(unchanged);

    let copied = reference.copy();
    assert!(matches!(copied, Err(Error::ResourceExhausted(_))));
    assert!(copied.is_err_and(|e| e.is_recoverable()));

    // A handful of levels still copies, duplicating the shared child.
    let small = run(isolate.holder(), |scope| {
        let mut shared = Value::Object(scope.new_array(Vec::new())?);
        for _ in 0..3 {
            shared = Value::Object(scope.new_array(vec![shared.clone(), shared])?);
        }
        scope.snapshot(&shared)
    })?;
    let StructuredValue::Array(top) = small else {
        anyhow::bail!("expected an array, got {small:?}");
    };
    assert_eq!(top.len(), 2);
    assert_eq!(top[0], top[1]);

    isolate.dispose();
    Ok(())
}

#[test]
fn plain_objects_are_not_transferable() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate()?;

    let (failed, before, after) = run(isolate.holder(), |scope| {
        let value = sample(scope)?;
        let before = scope.heap().statistics();
        let failed = matches!(scope.transfer_out(&value), Err(Error::NotTransferable(_)));
        let after = scope.heap().statistics();
        Ok((failed, before, after))
    })?;
    assert!(failed);
    assert_eq!(before, after);
    isolate.dispose();
    Ok(())
}

#[test]
fn primitives_transfer_by_value() -> Result<()> {
    let fixture = Fixture::new();
    let a = fixture.isolate()?;
    let b = fixture.isolate()?;

    let package = run(a.holder(), |scope| scope.transfer_out(&Value::from("text")))?;
    assert_eq!(package.as_primitive(), Some(&Primitive::String("text".into())));

    let value = run(b.holder(), move |scope| package.transfer_in(scope))?;
    assert_eq!(value, Value::from("text"));
    a.dispose();
    b.dispose();
    Ok(())
}

#[test]
fn references_stay_in_their_isolate() -> Result<()> {
    let fixture = Fixture::new();
    let a = fixture.isolate()?;
    let b = fixture.isolate()?;

    let reference = run(a.holder(), |scope| {
        let value = sample(scope)?;
        ReferenceHandle::new(scope, value)
    })?;
    assert_eq!(reference.type_of(), TypeOf::Object);
    assert_eq!(reference.isolate_id(), a.id());

    let package = reference.transfer_out()?;
    let deref_in_b = run(b.holder(), move |scope| {
        let instance = package.transfer_in(scope)?;
        let handle = scope.native::<ReferenceHandle>(&instance)?;
        Ok(matches!(handle.deref(scope), Err(Error::WrongIsolate)))
    })?;
    assert!(deref_in_b);

    let Transferable::Primitive(Primitive::Number(a_value)) = reference.get("a")? else {
        anyhow::bail!("expected a number");
    };
    assert!((a_value - 1.0).abs() < f64::EPSILON);

    let Transferable::Reference(list) = reference.get("list")? else {
        anyhow::bail!("expected a nested reference");
    };
    let expected = sample_tree().get("list").cloned().context("sample has a list")?;
    assert_eq!(list.copy()?.to_structured()?, expected);

    reference.set("extra", Transferable::Primitive(Primitive::Bool(true)))?;
    let snapshot = reference.copy()?.to_structured()?;
    assert_eq!(snapshot.get("extra"), Some(&StructuredValue::Bool(true)));

    reference.release();
    assert!(reference.copy().is_err());
    a.dispose();
    b.dispose();
    Ok(())
}

#[test]
fn isolate_handles_transfer_as_the_same_isolate() -> Result<()> {
    let fixture = Fixture::new();
    let a = fixture.isolate()?;
    let b = fixture.isolate()?;

    let a_id = a.id();
    let package = Transferable::Isolate(a.clone());
    let seen = run(b.holder(), move |scope| {
        let instance = package.transfer_in(scope)?;
        Ok(scope.native::<IsolateHandle>(&instance)?.id())
    })?;
    assert_eq!(seen, a_id);
    a.dispose();
    b.dispose();
    Ok(())
}

#[test]
fn script_results_leave_by_mode() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate()?;
    let context = isolate.create_context()?;

    let script = isolate.compile_script(r#"{"x": [1, 2]}"#, ScriptOrigin::new("data.json"))?;
    assert!(matches!(
        script.run(&context, ResultMode::Transfer),
        Err(Error::NotTransferable(_))
    ));

    let Transferable::Data(copy) = script.run(&context, ResultMode::Copy)? else {
        anyhow::bail!("expected a copy");
    };
    assert_eq!(
        copy.to_structured()?.get("x"),
        Some(&StructuredValue::Array(vec![
            StructuredValue::Number(1.0),
            StructuredValue::Number(2.0),
        ]))
    );

    let Transferable::Reference(reference) = script.run(&context, ResultMode::Reference)? else {
        anyhow::bail!("expected a reference");
    };
    assert_eq!(reference.type_of(), TypeOf::Object);

    let number = isolate.compile_script("42", ScriptOrigin::default())?;
    assert!(matches!(
        number.run(&context, ResultMode::Transfer)?,
        Transferable::Primitive(Primitive::Number(n)) if (n - 42.0).abs() < f64::EPSILON
    ));
    isolate.dispose();
    Ok(())
}

#[test]
fn scripts_read_globals_of_their_context() -> Result<()> {
    let fixture = Fixture::new();
    let isolate = fixture.isolate()?;
    let first = isolate.create_context()?;
    let second = isolate.create_context()?;

    first
        .global()?
        .set("limit", Transferable::Primitive(Primitive::Number(5.0)))?;
    let script = isolate.compile_script("limit", ScriptOrigin::default())?;

    assert!(matches!(
        script.run(&first, ResultMode::Transfer)?,
        Transferable::Primitive(Primitive::Number(n)) if (n - 5.0).abs() < f64::EPSILON
    ));
    assert!(matches!(
        script.run(&second, ResultMode::Transfer)?,
        Transferable::Primitive(Primitive::Undefined)
    ));

    let missing = isolate.compile_script("limit.max.value", ScriptOrigin::default())?;
    assert!(matches!(
        missing.run(&second, ResultMode::Transfer),
        Err(Error::Script(_))
    ));
    isolate.dispose();
    Ok(())
}

#[test]
fn scripts_refuse_foreign_contexts() -> Result<()> {
    let fixture = Fixture::new();
    let a = fixture.isolate()?;
    let b = fixture.isolate()?;

    let script = a.compile_script("1", ScriptOrigin::default())?;
    let foreign = b.create_context()?;
    assert!(matches!(
        script.run(&foreign, ResultMode::Copy),
        Err(Error::WrongIsolate)
    ));
    a.dispose();
    b.dispose();
    Ok(())
}
