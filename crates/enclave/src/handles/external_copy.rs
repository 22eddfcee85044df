use std::any::Any;

use bytes::Bytes;

use crate::{
    class::{Capability, ClassHandle},
    error::Result,
    isolate::Scope,
    transfer::Transferable,
    value::{StructuredValue, Value},
};

/// A structural copy held outside every heap.
///
/// The encoded buffer is immutable and cheap to clone, so one copy can be
/// materialized into any number of isolates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalCopy {
    data: Bytes,
}

impl ExternalCopy {
    /// # Errors
    /// Returns [`crate::Error::Codec`] if the tree cannot be encoded.
    pub fn from_structured(tree: &StructuredValue) -> Result<Self> {
        Ok(Self {
            data: enclave_cbor::encode(tree)?,
        })
    }

    /// # Errors
    /// Returns [`crate::Error::Codec`] if the buffer is corrupt.
    pub fn to_structured(&self) -> Result<StructuredValue> {
        Ok(enclave_cbor::decode(&self.data)?)
    }

    /// Materialize a fresh value in `scope`'s isolate.
    ///
    /// # Errors
    /// Returns [`crate::Error::ResourceExhausted`] if it does not fit.
    pub fn copy_into(&self, scope: &mut Scope<'_>) -> Result<Value> {
        scope.materialize(&self.to_structured()?)
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Script-visible `ExternalCopy` instance.
#[derive(Clone, Debug)]
pub struct ExternalCopyHandle {
    copy: ExternalCopy,
}

impl ExternalCopyHandle {
    pub(crate) const fn new(copy: ExternalCopy) -> Self {
        Self { copy }
    }

    #[must_use]
    pub const fn copy(&self) -> &ExternalCopy {
        &self.copy
    }
}

impl ClassHandle for ExternalCopyHandle {
    fn capability(&self) -> Capability {
        Capability::ExternalCopy
    }

    fn transfer_out(&self) -> Result<Transferable> {
        Ok(Transferable::ExternalCopy(self.copy.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
