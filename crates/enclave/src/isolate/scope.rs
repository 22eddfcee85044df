use std::sync::Arc;

use tracing::debug;

use super::{IsolateEnvironment, IsolateHolder, IsolateState};
use crate::{
    class::{Capability, ClassHandle, ClassTemplate},
    embedding::Embedding,
    error::{Error, Result},
    handles::{self, ExternalCopy},
    heap::{Heap, HeapObject, Properties},
    transfer::{self, Transferable},
    value::{IsolateId, ObjectRef, StructuredValue, TypeOf, Value},
};

/// Access to an isolate from its own thread.
///
/// A scope exists only for the duration of a task posted to the isolate.
pub struct Scope<'a> {
    env: &'a IsolateEnvironment,
    state: &'a mut IsolateState,
}

impl<'a> Scope<'a> {
    pub(crate) const fn new(env: &'a IsolateEnvironment, state: &'a mut IsolateState) -> Self {
        Self { env, state }
    }

    #[must_use]
    pub const fn isolate_id(&self) -> IsolateId {
        self.env.id()
    }

    #[must_use]
    pub const fn environment(&self) -> &IsolateEnvironment {
        self.env
    }

    /// A strong holder for the current isolate.
    ///
    /// # Errors
    /// Returns [`Error::Disposed`] if the isolate is being released.
    pub fn holder(&self) -> Result<IsolateHolder> {
        self.state.self_holder.upgrade().ok_or(Error::Disposed)
    }

    #[must_use]
    pub const fn embedding(&self) -> &Embedding {
        self.env.embedding()
    }

    /// Global object of the default context.
    #[must_use]
    pub const fn global(&self) -> ObjectRef {
        self.state.default_global
    }

    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.state.heap
    }

    pub const fn heap_mut(&mut self) -> &mut Heap {
        &mut self.state.heap
    }

    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the heap is full.
    pub fn new_object(&mut self) -> Result<ObjectRef> {
        self.state.heap.alloc(HeapObject::Object(Properties::default()))
    }

    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the heap is full.
    pub fn new_array(&mut self, items: Vec<Value>) -> Result<ObjectRef> {
        self.state.heap.alloc(HeapObject::Array(items))
    }

    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the heap is full.
    pub fn new_buffer(&mut self, bytes: Vec<u8>) -> Result<ObjectRef> {
        self.state.heap.alloc(HeapObject::Buffer(bytes))
    }

    /// Wrap a native handle in a script object of its class.
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the heap is full.
    pub fn new_native<T: ClassHandle>(&mut self, mut handle: T) -> Result<ObjectRef> {
        self.class_template(handle.capability())?;
        handle.anchor(self.isolate_id());
        self.state.heap.alloc(HeapObject::native(Arc::new(handle)))
    }

    /// Read `key` from `target`.
    ///
    /// # Errors
    /// Returns [`Error::TypeError`] for `undefined` and `null`.
    pub fn get(&self, target: &Value, key: &str) -> Result<Value> {
        match target {
            Value::Object(object) => self.state.heap.get_property(object, key),
            Value::String(s) if key == "length" => Ok(Value::Number(s.chars().count() as f64)),
            Value::Undefined | Value::Null => Err(Error::TypeError(format!(
                "cannot read property {key:?} of {}",
                self.state.heap.type_of(target)?.as_str()
            ))),
            _ => Ok(Value::Undefined),
        }
    }

    /// # Errors
    /// See [`Heap::set_property`].
    pub fn set(&mut self, target: &ObjectRef, key: &str, value: Value) -> Result<()> {
        self.state.heap.set_property(target, key, value)
    }

    /// # Errors
    /// See [`Heap::type_of`].
    pub fn type_of(&self, value: &Value) -> Result<TypeOf> {
        self.state.heap.type_of(value)
    }

    /// Cached constructor template of `capability` in this isolate.
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the constructor cannot be
    /// allocated.
    pub fn class_template(&mut self, capability: Capability) -> Result<Arc<ClassTemplate>> {
        let state = &mut *self.state;
        state.classes.get_or_create(&mut state.heap, capability)
    }

    /// Call a class constructor, as `new Class(...args)` would.
    ///
    /// # Errors
    /// Returns [`Error::TypeError`] if `constructor` is not a constructor or
    /// its class cannot be constructed from script.
    pub fn construct(&mut self, constructor: &Value, args: &[Value]) -> Result<Value> {
        let capability = match constructor {
            Value::Object(object) => match self.state.heap.get(object)? {
                HeapObject::Constructor(capability) => *capability,
                other => {
                    return Err(Error::TypeError(format!(
                        "{} is not a constructor",
                        other.kind()
                    )));
                }
            },
            _ => return Err(Error::TypeError("value is not a constructor".to_string())),
        };
        handles::construct(capability, self, args)
    }

    /// The native handle behind `value`, if it is an instance of `T`. The
    /// returned copy holds its isolate like any outside handle.
    ///
    /// # Errors
    /// Returns [`Error::TypeError`] if `value` is not a `T` instance.
    pub fn native<T: ClassHandle + Clone>(&self, value: &Value) -> Result<T> {
        let not_instance = || Error::TypeError("value is not an instance of the class".to_string());
        let object = value.as_object().ok_or_else(not_instance)?;
        match self.state.heap.get(object)? {
            HeapObject::Native(native) => native
                .handle()
                .as_any()
                .downcast_ref::<T>()
                .cloned()
                .map(|mut handle| {
                    handle.unanchor();
                    handle
                })
                .ok_or_else(not_instance),
            _ => Err(not_instance()),
        }
    }

    /// `value instanceof capability`.
    #[must_use]
    pub fn instance_of(&self, value: &Value, capability: Capability) -> bool {
        value.as_object().is_some_and(|object| {
            matches!(
                self.state.heap.get(object),
                Ok(HeapObject::Native(native)) if native.capability() == capability
            )
        })
    }

    /// Package `value` for another isolate. Leaves this isolate unchanged.
    ///
    /// # Errors
    /// Returns [`Error::NotTransferable`] for values without a transfer
    /// contract.
    pub fn transfer_out(&self, value: &Value) -> Result<Transferable> {
        transfer::transfer_out(&self.state.heap, value)
    }

    /// # Errors
    /// See [`Transferable::transfer_in`].
    pub fn transfer_in(&mut self, transferable: Transferable) -> Result<Value> {
        transferable.transfer_in(self)
    }

    /// # Errors
    /// See [`Heap::snapshot`].
    pub fn snapshot(&self, value: &Value) -> Result<StructuredValue> {
        self.state.heap.snapshot(value)
    }

    /// # Errors
    /// See [`Heap::materialize`].
    pub fn materialize(&mut self, tree: &StructuredValue) -> Result<Value> {
        self.state.heap.materialize(tree)
    }

    /// Structural copy of `value` held outside any heap.
    ///
    /// # Errors
    /// Returns [`Error::DataClone`] if `value` cannot be cloned.
    pub fn copy_out(&self, value: &Value) -> Result<ExternalCopy> {
        ExternalCopy::from_structured(&self.snapshot(value)?)
    }

    /// Create a context with a fresh global object.
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the global does not fit.
    pub fn create_context(&mut self) -> Result<ObjectRef> {
        let global = self.new_object()?;
        self.state.contexts.push(global);
        debug!(
            isolate = %self.isolate_id(),
            contexts = self.state.contexts.len(),
            "context created"
        );
        Ok(global)
    }

    /// Drop a context created by [`Scope::create_context`]. Releasing an
    /// unknown or already released context is a no-op.
    ///
    /// # Errors
    /// Returns [`Error::WrongIsolate`] if `global` belongs elsewhere.
    pub fn release_context(&mut self, global: &ObjectRef) -> Result<()> {
        if global.isolate() != self.isolate_id() {
            return Err(Error::WrongIsolate);
        }
        let Some(position) = self.state.contexts.iter().position(|c| c == global) else {
            return Ok(());
        };
        self.state.contexts.swap_remove(position);
        self.state.heap.free(global)?;
        debug!(
            isolate = %self.isolate_id(),
            contexts = self.state.contexts.len(),
            "context released"
        );
        Ok(())
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.state.contexts.len()
    }
}
