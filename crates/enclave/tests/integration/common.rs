use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, Result};
use enclave::{
    Embedding, IsolateHandle, IsolateHolder, IsolateOptions, ManualHost, NativeContextId, Scope,
    StructuredValue, Value,
};

/// Native context ids are process-wide, so every test takes its own.
pub fn next_native_id() -> NativeContextId {
    static NEXT: AtomicU64 = AtomicU64::new(0x1000);
    NativeContextId(NEXT.fetch_add(1, Ordering::Relaxed))
}

pub struct Fixture {
    pub host: Arc<ManualHost>,
    pub embedding: Embedding,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_embedding(|builder| builder)
    }

    pub fn with_embedding(
        configure: impl FnOnce(enclave::EmbeddingBuilder) -> enclave::EmbeddingBuilder,
    ) -> Self {
        let host = Arc::new(ManualHost::new());
        let embedding = configure(Embedding::builder().host(Arc::clone(&host))).build();
        Self { host, embedding }
    }

    pub fn isolate(&self) -> Result<IsolateHandle> {
        self.isolate_with(&IsolateOptions::default())
    }

    pub fn isolate_with(&self, options: &IsolateOptions) -> Result<IsolateHandle> {
        self.embedding
            .create_isolate(options)
            .context("failed to create isolate")
    }

    /// Default isolate for a fresh native context.
    pub fn init(&self) -> Result<(NativeContextId, IsolateHolder)> {
        let id = next_native_id();
        let holder = enclave::init(&self.embedding, id).context("init failed")?;
        Ok((id, holder))
    }
}

/// Run `f` on the isolate behind `holder`.
pub fn run<R, F>(holder: &IsolateHolder, f: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce(&mut Scope<'_>) -> enclave::Result<R> + Send + 'static,
{
    Ok(holder.strong()?.run_sync(f)?)
}

/// `{ "a": 1, "list": [1, "two"], "nested": { "flag": true } }`
pub fn sample(scope: &mut Scope<'_>) -> enclave::Result<Value> {
    let list = scope.new_array(vec![Value::from(1), Value::from("two")])?;
    let nested = scope.new_object()?;
    scope.set(&nested, "flag", Value::Bool(true))?;
    let root = scope.new_object()?;
    scope.set(&root, "a", Value::from(1))?;
    scope.set(&root, "list", Value::Object(list))?;
    scope.set(&root, "nested", Value::Object(nested))?;
    Ok(Value::Object(root))
}

pub fn sample_tree() -> StructuredValue {
    StructuredValue::Object(vec![
        ("a".to_string(), StructuredValue::Number(1.0)),
        (
            "list".to_string(),
            StructuredValue::Array(vec![
                StructuredValue::Number(1.0),
                StructuredValue::String("two".to_string()),
            ]),
        ),
        (
            "nested".to_string(),
            StructuredValue::Object(vec![("flag".to_string(), StructuredValue::Bool(true))]),
        ),
    ])
}
