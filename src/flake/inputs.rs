use std::{fmt, sync::Arc};

use anyhow::Result;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;

use super::{
    lock::{LockedInput, LockedInputs},
    metadata::{get_flake, get_non_flake, Flake},
};
use crate::{
    context::FlakeContext,
    error::FlakeError,
    eval::{Attrs, Value},
    fetch::SourceInfo,
};

/// Input name bound to the flake's own result
pub const SELF_INPUT: &str = "self";

struct LazyState {
    is_flake: bool,
    locked: LockedInput,
    value: OnceCell<Value>,
}

/// A locked input that is fetched, verified and evaluated on first use.
///
/// Clones share the memoized value. A failed force is not remembered.
#[derive(Clone)]
pub struct LazyInput {
    state: Arc<LazyState>,
}

impl LazyInput {
    pub fn new(is_flake: bool, locked: LockedInput) -> Self {
        LazyInput {
            state: Arc::new(LazyState {
                is_flake,
                locked,
                value: OnceCell::new(),
            }),
        }
    }

    pub fn is_flake(&self) -> bool {
        self.state.is_flake
    }

    pub fn locked(&self) -> &LockedInput {
        &self.state.locked
    }

    pub fn is_forced(&self) -> bool {
        self.state.value.get().is_some()
    }

    /// The input's value: its call result for flakes, its source info
    /// otherwise.
    pub fn force(&self, ctx: &FlakeContext) -> Result<&Value> {
        self.state.value.get_or_try_init(|| self.compute(ctx))
    }

    fn compute(&self, ctx: &FlakeContext) -> Result<Value> {
        let locked = &self.state.locked;
        tracing::debug!("forcing input {}", locked.reference);

        if self.state.is_flake {
            let flake = get_flake(ctx, &locked.reference)?;
            verify(locked, &flake.source_info)?;
            call_flake(ctx, &flake, &locked.inputs)
        } else {
            let source_info = get_non_flake(ctx, &locked.reference)?;
            verify(locked, &source_info)?;
            Ok(Value::Attrs(source_info_attrs(&source_info)))
        }
    }
}

fn verify(locked: &LockedInput, fetched: &SourceInfo) -> Result<()> {
    if fetched.nar_hash != locked.nar_hash {
        return Err(FlakeError::ContentDriftError {
            reference: locked.reference.clone(),
            expected: locked.nar_hash.clone(),
            actual: fetched.nar_hash.clone(),
        }
        .into());
    }
    Ok(())
}

impl fmt::Debug for LazyInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyInput")
            .field("is_flake", &self.state.is_flake)
            .field("reference", &self.state.locked.reference)
            .field("forced", &self.is_forced())
            .finish()
    }
}

impl PartialEq for LazyInput {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// Bind every declared input of `flake` to a lazy value for its entry in
/// `locked`, and `self` to the flake's own result.
pub fn build_input_graph(flake: &Flake, locked: &LockedInputs) -> Result<Attrs> {
    let mut graph = Attrs::new();
    graph.insert(SELF_INPUT.to_string(), Value::SelfRef);

    for (name, input) in &flake.inputs {
        let entry = locked
            .get(name)
            .ok_or_else(|| FlakeError::MissingLockEntry(name.clone()))?;
        graph.insert(
            name.clone(),
            Value::Lazy(LazyInput::new(input.is_flake, entry.clone())),
        );
    }

    Ok(graph)
}

/// Call the outputs function of `flake`.
///
/// The result is the outputs merged with the source info, plus `inputs`,
/// `outputs` and `sourceInfo` attributes.
pub fn call_flake(ctx: &FlakeContext, flake: &Flake, locked: &LockedInputs) -> Result<Value> {
    call_with_inputs(ctx, flake, build_input_graph(flake, locked)?)
}

/// Call the outputs function of `flake` with an already built input graph.
pub(crate) fn call_with_inputs(ctx: &FlakeContext, flake: &Flake, inputs: Attrs) -> Result<Value> {
    let inputs = Value::Attrs(inputs);
    let source_info = Value::Attrs(source_info_attrs(&flake.source_info));

    let outputs = ctx
        .evaluator()
        .invoke_outputs(&flake.outputs, &inputs, &source_info)?;
    let Value::Attrs(mut result) = outputs.clone() else {
        return Err(FlakeError::TypeMismatch {
            flake: flake.original_ref.clone(),
            attr: "outputs".to_string(),
            expected: "a function returning a set",
            found: outputs.type_name(),
        }
        .into());
    };

    if let Value::Attrs(fields) = &source_info {
        result.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    result.insert("inputs".to_string(), inputs);
    result.insert("outputs".to_string(), outputs);
    result.insert("sourceInfo".to_string(), source_info);

    Ok(Value::Attrs(result))
}

pub fn source_info_attrs(source_info: &SourceInfo) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert(
        "outPath".to_string(),
        source_info.store_path.to_string_lossy().into_owned().into(),
    );
    if let Some(rev) = &source_info.resolved_ref.rev {
        attrs.insert("rev".to_string(), rev.as_str().into());
        attrs.insert("shortRev".to_string(), rev.short().into());
    }
    if let Some(count) = source_info.rev_count {
        attrs.insert("revCount".to_string(), Value::Int(count as i64));
    }
    if let Some(time) = source_info
        .last_modified
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
    {
        attrs.insert(
            "lastModified".to_string(),
            time.format("%Y%m%d%H%M%S").to_string().into(),
        );
    }
    attrs
}
