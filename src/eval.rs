mod json;
mod traits;
mod value;

pub use json::JsonEvaluator;
pub use traits::{Evaluator, MANIFEST_FILE};
pub use value::{Attrs, Lambda, Value};
