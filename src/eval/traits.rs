use std::path::Path;

use anyhow::Result;

use super::{Lambda, Value};

/// Conventional manifest file name at the root of a flake
pub const MANIFEST_FILE: &str = "flake.nix";

/// The expression evaluator that reads manifests and runs `outputs`
pub trait Evaluator: Send + Sync {
    /// File name of the manifest this evaluator understands
    fn manifest_file_name(&self) -> &str {
        MANIFEST_FILE
    }

    /// Evaluate a manifest file to its top-level value.
    fn evaluate_manifest(&self, path: &Path) -> Result<Value>;

    /// Call a flake's `outputs` function with its input namespace and
    /// source-info record.
    ///
    /// Inputs arrive as `Value::Lazy` and are forced only when used; the
    /// `self` input is `Value::SelfRef` and stands for the value being built.
    fn invoke_outputs(&self, outputs: &Lambda, inputs: &Value, source_info: &Value) -> Result<Value>;
}
