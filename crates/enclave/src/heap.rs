//! Per-isolate object arena with byte accounting.
//!
//! A heap belongs to exactly one isolate and is only ever touched from that
//! isolate's thread. Objects are addressed by generation-checked
//! [`ObjectRef`]s tagged with the owning isolate, so a reference smuggled
//! into another heap is rejected instead of aliasing foreign memory.

use std::sync::Arc;

use crate::{
    class::{Capability, ClassHandle},
    engine::Reservation,
    error::{Error, Result},
    internal::resource::MemoryLimiter,
    value::{IsolateId, ObjectRef, StructuredValue, TypeOf, Value},
};

const OBJECT_OVERHEAD: usize = 48;
const NATIVE_OVERHEAD: usize = 64;
const VALUE_SIZE: usize = 24;
const MAX_COPY_DEPTH: usize = 1000;

/// Ordered property bag.
#[derive(Clone, Debug, Default)]
pub struct Properties(Vec<(String, Value)>);

impl Properties {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert or replace. Returns the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        if let Some((_, slot)) = self.0.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(slot, value));
        }
        self.0.push((key, value));
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn footprint(&self) -> usize {
        self.iter().map(|(k, v)| entry_cost(k, v)).sum()
    }
}

/// Instance of a native class living in a heap.
pub struct NativeObject {
    handle: Arc<dyn ClassHandle>,
    pub properties: Properties,
}

impl NativeObject {
    #[must_use]
    pub fn handle(&self) -> &Arc<dyn ClassHandle> {
        &self.handle
    }

    #[must_use]
    pub fn capability(&self) -> Capability {
        self.handle.capability()
    }
}

pub enum HeapObject {
    Object(Properties),
    Array(Vec<Value>),
    Buffer(Vec<u8>),
    Native(NativeObject),
    /// Script-visible constructor of a native class.
    Constructor(Capability),
}

impl HeapObject {
    pub fn native(handle: Arc<dyn ClassHandle>) -> Self {
        Self::Native(NativeObject {
            handle,
            properties: Properties::default(),
        })
    }

    fn footprint(&self) -> usize {
        match self {
            Self::Object(props) => OBJECT_OVERHEAD + props.footprint(),
            Self::Array(items) => OBJECT_OVERHEAD + items.iter().map(value_cost).sum::<usize>(),
            Self::Buffer(bytes) => OBJECT_OVERHEAD + bytes.len(),
            Self::Native(native) => NATIVE_OVERHEAD + native.properties.footprint(),
            Self::Constructor(_) => NATIVE_OVERHEAD,
        }
    }

    pub(crate) const fn kind(&self) -> &'static str {
        match self {
            Self::Object(_) => "object",
            Self::Array(_) => "array",
            Self::Buffer(_) => "buffer",
            Self::Native(_) => "native object",
            Self::Constructor(_) => "constructor",
        }
    }
}

fn value_cost(value: &Value) -> usize {
    match value {
        Value::String(s) => VALUE_SIZE + s.len(),
        _ => VALUE_SIZE,
    }
}

fn entry_cost(key: &str, value: &Value) -> usize {
    key.len() + value_cost(value)
}

/// State of one [`Heap::snapshot`] walk.
struct CopyWalk {
    ancestors: Vec<u32>,
    /// Bytes the copy may still emit.
    remaining: usize,
}

impl CopyWalk {
    fn charge(&mut self, bytes: usize) -> Result<()> {
        self.remaining = self.remaining.checked_sub(bytes).ok_or_else(|| {
            Error::exhausted("structural copy would exceed the heap limit")
        })?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapStatistics {
    pub used_heap_size: usize,
    pub heap_size_limit: usize,
    pub object_count: usize,
    /// An allocation was refused at some point.
    pub limit_hit: bool,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    size: usize,
    object: Option<HeapObject>,
}

pub struct Heap {
    isolate: IsolateId,
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    limiter: MemoryLimiter,
    _reservation: Option<Reservation>,
}

impl Heap {
    #[must_use]
    pub fn new(isolate: IsolateId, memory_limit: usize) -> Self {
        Self {
            isolate,
            slots: Vec::new(),
            vacant: Vec::new(),
            limiter: MemoryLimiter::new(memory_limit),
            _reservation: None,
        }
    }

    /// Tie an engine-level memory reservation to this heap's lifetime.
    #[must_use]
    pub fn with_reservation(mut self, reservation: Reservation) -> Self {
        self._reservation = Some(reservation);
        self
    }

    #[must_use]
    pub const fn isolate(&self) -> IsolateId {
        self.isolate
    }

    #[must_use]
    pub const fn limit_hit(&self) -> bool {
        self.limiter.limit_hit()
    }

    #[must_use]
    pub fn statistics(&self) -> HeapStatistics {
        HeapStatistics {
            used_heap_size: self.limiter.current(),
            heap_size_limit: self.limiter.limit(),
            object_count: self.slots.len() - self.vacant.len(),
            limit_hit: self.limiter.limit_hit(),
        }
    }

    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the object does not fit, or
    /// an ownership error if it embeds a foreign or stale reference.
    pub fn alloc(&mut self, object: HeapObject) -> Result<ObjectRef> {
        self.check_contents(&object)?;
        let size = object.footprint();
        self.limiter.grow(size)?;

        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            slot.size = size;
            slot.object = Some(object);
            return Ok(ObjectRef {
                isolate: self.isolate,
                index,
                generation: slot.generation,
            });
        }

        let Ok(index) = u32::try_from(self.slots.len()) else {
            self.limiter.shrink(size);
            return Err(Error::exhausted("heap slot space"));
        };
        self.slots.push(Slot {
            generation: 0,
            size,
            object: Some(object),
        });
        Ok(ObjectRef {
            isolate: self.isolate,
            index,
            generation: 0,
        })
    }

    /// # Errors
    /// Returns [`Error::WrongIsolate`] for foreign references and
    /// [`Error::InvalidReference`] for stale ones.
    pub fn get(&self, object: &ObjectRef) -> Result<&HeapObject> {
        self.check_owner(object)?;
        self.slots
            .get(object.index as usize)
            .filter(|slot| slot.generation == object.generation)
            .and_then(|slot| slot.object.as_ref())
            .ok_or(Error::InvalidReference)
    }

    /// Release an object and return it to the caller.
    ///
    /// # Errors
    /// Same as [`Heap::get`].
    pub fn free(&mut self, object: &ObjectRef) -> Result<HeapObject> {
        self.check_owner(object)?;
        let slot = self
            .slots
            .get_mut(object.index as usize)
            .filter(|slot| slot.generation == object.generation)
            .ok_or(Error::InvalidReference)?;
        let taken = slot.object.take().ok_or(Error::InvalidReference)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.limiter.shrink(slot.size);
        slot.size = 0;
        self.vacant.push(object.index);
        Ok(taken)
    }

    /// Read `key` from an object. Missing properties read as `undefined`.
    ///
    /// # Errors
    /// Same as [`Heap::get`].
    pub fn get_property(&self, object: &ObjectRef, key: &str) -> Result<Value> {
        Ok(match self.get(object)? {
            HeapObject::Object(props) => props.get(key).cloned().unwrap_or_default(),
            HeapObject::Native(native) => native.properties.get(key).cloned().unwrap_or_default(),
            HeapObject::Array(items) => match key {
                "length" => Value::Number(items.len() as f64),
                _ => key
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or_default(),
            },
            HeapObject::Buffer(bytes) => match key {
                "byteLength" => Value::Number(bytes.len() as f64),
                _ => Value::Undefined,
            },
            HeapObject::Constructor(capability) => match key {
                "name" => Value::from(capability.class_name()),
                _ => Value::Undefined,
            },
        })
    }

    /// Write `key` on a plain or native object, or an index on an array.
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the write does not fit and
    /// [`Error::TypeError`] for targets that do not accept properties.
    pub fn set_property(&mut self, object: &ObjectRef, key: &str, value: Value) -> Result<()> {
        self.check_value(&value)?;
        self.check_owner(object)?;
        let slot = self
            .slots
            .get_mut(object.index as usize)
            .filter(|slot| slot.generation == object.generation)
            .ok_or(Error::InvalidReference)?;
        let target = slot.object.as_mut().ok_or(Error::InvalidReference)?;

        let props = match target {
            HeapObject::Object(props) => props,
            HeapObject::Native(native) => &mut native.properties,
            HeapObject::Array(items) => {
                let index = key
                    .parse::<usize>()
                    .ok()
                    .filter(|i| *i <= items.len())
                    .ok_or_else(|| Error::TypeError(format!("invalid array index {key:?}")))?;
                let cost = value_cost(&value);
                if index == items.len() {
                    self.limiter.grow(cost)?;
                    slot.size += cost;
                    items.push(value);
                } else {
                    let old = value_cost(&items[index]);
                    if cost > old {
                        self.limiter.grow(cost - old)?;
                    } else {
                        self.limiter.shrink(old - cost);
                    }
                    slot.size = slot.size + cost - old;
                    items[index] = value;
                }
                return Ok(());
            }
            other => {
                return Err(Error::TypeError(format!(
                    "cannot set property {key:?} on {}",
                    other.kind()
                )));
            }
        };

        let cost = entry_cost(key, &value);
        let old = props.get(key).map_or(0, |v| entry_cost(key, v));
        if cost > old {
            self.limiter.grow(cost - old)?;
        } else {
            self.limiter.shrink(old - cost);
        }
        slot.size = slot.size + cost - old;
        props.insert(key, value);
        Ok(())
    }

    /// # Errors
    /// Same as [`Heap::get`].
    pub fn type_of(&self, value: &Value) -> Result<TypeOf> {
        Ok(match value {
            Value::Undefined => TypeOf::Undefined,
            Value::Null => TypeOf::Null,
            Value::Bool(_) => TypeOf::Boolean,
            Value::Number(_) => TypeOf::Number,
            Value::String(_) => TypeOf::String,
            Value::Object(object) => match self.get(object)? {
                HeapObject::Constructor(_) => TypeOf::Function,
                _ => TypeOf::Object,
            },
        })
    }

    /// Structural copy of `value` into an engine-independent tree.
    ///
    /// Shared children are copied once per parent, so the tree can be far
    /// larger than the objects it came from. Every emitted node is charged
    /// against this heap's limit.
    ///
    /// # Errors
    /// Returns [`Error::DataClone`] for cycles and native objects, and
    /// [`Error::ResourceExhausted`] if the copy would outgrow the heap
    /// limit.
    pub fn snapshot(&self, value: &Value) -> Result<StructuredValue> {
        let mut walk = CopyWalk {
            ancestors: Vec::new(),
            remaining: self.limiter.limit(),
        };
        self.snapshot_inner(value, &mut walk)
    }

    fn snapshot_inner(&self, value: &Value, walk: &mut CopyWalk) -> Result<StructuredValue> {
        walk.charge(value_cost(value))?;
        let object = match value {
            Value::Undefined => return Ok(StructuredValue::Undefined),
            Value::Null => return Ok(StructuredValue::Null),
            Value::Bool(b) => return Ok(StructuredValue::Bool(*b)),
            Value::Number(n) => return Ok(StructuredValue::Number(*n)),
            Value::String(s) => return Ok(StructuredValue::String(s.to_string())),
            Value::Object(object) => object,
        };

        let target = self.get(object)?;
        if walk.ancestors.contains(&object.index) {
            return Err(Error::DataClone("cyclic structure".to_string()));
        }
        if walk.ancestors.len() >= MAX_COPY_DEPTH {
            return Err(Error::DataClone("structure nested too deeply".to_string()));
        }
        walk.charge(OBJECT_OVERHEAD)?;

        walk.ancestors.push(object.index);
        let tree = match target {
            HeapObject::Buffer(bytes) => walk
                .charge(bytes.len())
                .map(|()| StructuredValue::Buffer(bytes.clone())),
            HeapObject::Array(items) => items
                .iter()
                .map(|item| self.snapshot_inner(item, walk))
                .collect::<Result<Vec<_>>>()
                .map(StructuredValue::Array),
            HeapObject::Object(props) => props
                .iter()
                .map(|(k, v)| {
                    walk.charge(k.len())?;
                    Ok((k.to_string(), self.snapshot_inner(v, walk)?))
                })
                .collect::<Result<Vec<_>>>()
                .map(StructuredValue::Object),
            HeapObject::Native(native) => Err(Error::DataClone(format!(
                "{} object could not be cloned",
                native.capability().class_name()
            ))),
            HeapObject::Constructor(capability) => Err(Error::DataClone(format!(
                "function {} could not be cloned",
                capability.class_name()
            ))),
        };
        walk.ancestors.pop();
        tree
    }

    /// Rebuild a structural copy in this heap. Either the whole tree is
    /// allocated or nothing is.
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the tree does not fit.
    pub fn materialize(&mut self, tree: &StructuredValue) -> Result<Value> {
        let mut allocated = Vec::new();
        let result = self.materialize_inner(tree, &mut allocated);
        if result.is_err() {
            for object in allocated.iter().rev() {
                let _ = self.free(object);
            }
        }
        result
    }

    fn materialize_inner(
        &mut self,
        tree: &StructuredValue,
        allocated: &mut Vec<ObjectRef>,
    ) -> Result<Value> {
        let object = match tree {
            StructuredValue::Undefined => return Ok(Value::Undefined),
            StructuredValue::Null => return Ok(Value::Null),
            StructuredValue::Bool(b) => return Ok(Value::Bool(*b)),
            StructuredValue::Number(n) => return Ok(Value::Number(*n)),
            StructuredValue::String(s) => return Ok(Value::from(s.as_str())),
            StructuredValue::Buffer(bytes) => HeapObject::Buffer(bytes.clone()),
            StructuredValue::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.materialize_inner(item, allocated)?);
                }
                HeapObject::Array(values)
            }
            StructuredValue::Object(entries) => {
                let mut props = Properties::default();
                for (key, item) in entries {
                    let value = self.materialize_inner(item, allocated)?;
                    props.insert(key.clone(), value);
                }
                HeapObject::Object(props)
            }
        };
        let object = self.alloc(object)?;
        allocated.push(object);
        Ok(Value::Object(object))
    }

    const fn check_owner(&self, object: &ObjectRef) -> Result<()> {
        if object.isolate.as_u64() == self.isolate.as_u64() {
            Ok(())
        } else {
            Err(Error::WrongIsolate)
        }
    }

    fn check_value(&self, value: &Value) -> Result<()> {
        match value {
            Value::Object(object) => self.get(object).map(|_| ()),
            _ => Ok(()),
        }
    }

    fn check_contents(&self, object: &HeapObject) -> Result<()> {
        match object {
            HeapObject::Object(props) => props.iter().try_for_each(|(_, v)| self.check_value(v)),
            HeapObject::Native(native) => native
                .properties
                .iter()
                .try_for_each(|(_, v)| self.check_value(v)),
            HeapObject::Array(items) => items.iter().try_for_each(|v| self.check_value(v)),
            HeapObject::Buffer(_) | HeapObject::Constructor(_) => Ok(()),
        }
    }
}
