use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result};

use super::inputs::SELF_INPUT;
use crate::{
    context::FlakeContext,
    error::FlakeError,
    eval::{Attrs, Lambda, Value},
    fetch::{fetch_source, SourceInfo},
    flakeref::FlakeRef,
};

/// The only manifest edition this resolver understands
pub const SUPPORTED_EDITION: i64 = 201909;

const TOP_LEVEL_ATTRS: [&str; 5] = ["edition", "epoch", "description", "inputs", "outputs"];

/// A declared dependency of a flake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlakeInput {
    pub reference: FlakeRef,
    /// Whether the input is itself a flake or just a source tree
    pub is_flake: bool,
}

impl FlakeInput {
    pub fn new(reference: FlakeRef) -> Self {
        FlakeInput {
            reference,
            is_flake: true,
        }
    }
}

/// A fetched flake and its manifest metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Flake {
    /// The reference the flake was requested by
    pub original_ref: FlakeRef,
    pub source_info: SourceInfo,
    pub edition: i64,
    pub description: Option<String>,
    pub inputs: BTreeMap<String, FlakeInput>,
    pub outputs: Lambda,
}

/// Fetch a direct reference and load its manifest.
pub fn get_flake(ctx: &FlakeContext, flake_ref: &FlakeRef) -> Result<Flake> {
    let source_info = fetch_source(ctx, flake_ref)?;
    load_flake(ctx, flake_ref, source_info)
}

/// Fetch a direct reference that is a plain source tree.
pub fn get_non_flake(ctx: &FlakeContext, flake_ref: &FlakeRef) -> Result<SourceInfo> {
    let source_info = fetch_source(ctx, flake_ref)?;
    tracing::debug!(
        "got non-flake source {:?} with flakeref {}",
        source_info.store_path,
        source_info.resolved_ref
    );
    Ok(source_info)
}

/// Evaluate the manifest of a fetched tree and extract the flake metadata.
pub fn load_flake(ctx: &FlakeContext, original_ref: &FlakeRef, source_info: SourceInfo) -> Result<Flake> {
    let evaluator = ctx.evaluator();
    let file_name = evaluator.manifest_file_name();

    let manifest = locate_in_tree(ctx, original_ref, &source_info, file_name)?.ok_or_else(|| {
        FlakeError::MissingManifest {
            flake: source_info.resolved_ref.clone(),
            file: Path::new(&source_info.resolved_ref.subdir).join(file_name),
        }
    })?;

    let value = evaluator
        .evaluate_manifest(&manifest)
        .with_context(|| format!("Failed to evaluate the manifest of flake '{}'", original_ref))?;

    extract(original_ref, source_info, &value)
}

/// Find `file_name` in the flake's directory inside its fetched tree.
///
/// Returns `None` if the file does not exist. Anything that resolves outside
/// the tree, through `..` or symbolic links, is a `PathEscape`.
pub(crate) fn locate_in_tree(
    ctx: &FlakeContext,
    flake_ref: &FlakeRef,
    source_info: &SourceInfo,
    file_name: &str,
) -> Result<Option<PathBuf>> {
    let root_path = ctx.store().real_path_of(&source_info.store_path);
    let root = fs::canonicalize(&root_path)
        .with_context(|| format!("Failed to resolve source tree {:?}", root_path))?;
    let candidate = root.join(&source_info.resolved_ref.subdir).join(file_name);

    let escape = || FlakeError::PathEscape {
        flake: flake_ref.clone(),
        file: candidate.clone(),
        root: root.clone(),
    };

    if !normalize(&candidate).starts_with(&root) {
        return Err(escape().into());
    }

    match fs::canonicalize(&candidate) {
        Ok(real) if real.starts_with(&root) => Ok(Some(real)),
        Ok(_) => Err(escape().into()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to resolve {:?}", candidate)),
    }
}

/// Resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn mismatch(flake: &FlakeRef, attr: impl Into<String>, expected: &'static str, found: &Value) -> FlakeError {
    FlakeError::TypeMismatch {
        flake: flake.clone(),
        attr: attr.into(),
        expected,
        found: found.type_name(),
    }
}

fn extract(original_ref: &FlakeRef, source_info: SourceInfo, value: &Value) -> Result<Flake> {
    let attrs = value
        .as_attrs()
        .ok_or_else(|| mismatch(original_ref, "<manifest>", "a set", value))?;

    let edition = match attrs.get("edition").or_else(|| attrs.get("epoch")) {
        Some(Value::Int(edition)) => *edition,
        Some(other) => return Err(mismatch(original_ref, "edition", "an integer", other).into()),
        None => {
            return Err(FlakeError::MissingAttribute {
                flake: original_ref.clone(),
                attr: "edition",
            }
            .into())
        }
    };
    if edition > SUPPORTED_EDITION {
        return Err(FlakeError::UnsupportedManifestVersion {
            flake: original_ref.clone(),
            edition,
        }
        .into());
    }
    if edition < SUPPORTED_EDITION {
        return Err(FlakeError::LegacyManifest {
            flake: original_ref.clone(),
            edition,
        }
        .into());
    }

    let description = match attrs.get("description") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => return Err(mismatch(original_ref, "description", "a string", other).into()),
    };

    let mut inputs = match attrs.get("inputs") {
        None => BTreeMap::new(),
        Some(Value::Attrs(decls)) => parse_inputs(original_ref, decls)?,
        Some(other) => return Err(mismatch(original_ref, "inputs", "a set", other).into()),
    };

    let outputs = match attrs.get("outputs") {
        Some(Value::Lambda(lambda)) => lambda.clone(),
        Some(other) => return Err(mismatch(original_ref, "outputs", "a function", other).into()),
        None => {
            return Err(FlakeError::MissingAttribute {
                flake: original_ref.clone(),
                attr: "outputs",
            }
            .into())
        }
    };

    // Explicit declarations take precedence over parameters of `outputs`
    for formal in outputs.formals().unwrap_or_default() {
        if formal != SELF_INPUT && !inputs.contains_key(formal) {
            inputs.insert(formal.clone(), FlakeInput::new(FlakeRef::parse(formal)?));
        }
    }

    if let Some(unknown) = attrs
        .keys()
        .find(|name| !TOP_LEVEL_ATTRS.contains(&name.as_str()))
    {
        return Err(FlakeError::UnknownManifestAttribute {
            flake: original_ref.clone(),
            attr: unknown.clone(),
        }
        .into());
    }

    Ok(Flake {
        original_ref: original_ref.clone(),
        source_info,
        edition,
        description,
        inputs,
        outputs,
    })
}

fn parse_inputs(flake_ref: &FlakeRef, decls: &Attrs) -> Result<BTreeMap<String, FlakeInput>> {
    let mut inputs = BTreeMap::new();

    for (name, decl) in decls {
        let decl = decl
            .as_attrs()
            .ok_or_else(|| mismatch(flake_ref, format!("inputs.{}", name), "a set", decl))?;

        let mut reference = None;
        let mut is_flake = true;
        for (attr, value) in decl {
            match (attr.as_str(), value) {
                ("uri" | "ref", Value::String(_)) if reference.is_some() => {
                    return Err(FlakeError::ConflictingInputReference(name.clone()).into())
                }
                ("uri" | "ref", Value::String(s)) => reference = Some(FlakeRef::parse(s)?),
                ("flake", Value::Bool(b)) => is_flake = *b,
                ("uri" | "ref", other) => {
                    return Err(mismatch(flake_ref, format!("inputs.{}.{}", name, attr), "a string", other).into())
                }
                ("flake", other) => {
                    return Err(mismatch(flake_ref, format!("inputs.{}.flake", name), "a Boolean", other).into())
                }
                _ => {
                    return Err(FlakeError::UnknownInputAttribute {
                        input: name.clone(),
                        attr: attr.clone(),
                    }
                    .into())
                }
            }
        }

        let reference = match reference {
            Some(reference) => reference,
            None => FlakeRef::parse(name)?,
        };
        inputs.insert(name.clone(), FlakeInput { reference, is_flake });
    }

    Ok(inputs)
}
