mod clone;
mod inputs;
mod lock;
mod metadata;
mod policy;
mod reconcile;
mod resolved;

pub use clone::clone_flake;
pub use inputs::{build_input_graph, call_flake, source_info_attrs, LazyInput, SELF_INPUT};
pub use lock::{LockFile, LockedInput, LockedInputs, LOCK_FILE_NAME, LOCK_FILE_VERSION};
pub use metadata::{get_flake, get_non_flake, load_flake, Flake, FlakeInput, SUPPORTED_EDITION};
pub use policy::LockPolicy;
pub use reconcile::{reconcile, resolve_flake, update_lock_file};
pub use resolved::{Fingerprint, ResolvedFlake};
