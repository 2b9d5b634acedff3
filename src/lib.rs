#![deny(clippy::mod_module_files)]
//! Resolution of flake references into locked, fetched and evaluated flakes.

pub mod config;
pub mod context;
pub mod error;
pub mod eval;
pub mod fetch;
pub mod flake;
pub mod flakeref;
pub mod git;
pub mod registry;
pub mod resolver;
pub mod storage;

pub use config::Settings;
pub use context::FlakeContext;
pub use error::FlakeError;
pub use flake::{
    clone_flake, resolve_flake, update_lock_file, Flake, LockFile, LockPolicy, LockedInput,
    ResolvedFlake,
};
pub use flakeref::{FlakeRef, RefKind, Rev};
pub use registry::{GlobalRegistry, Registry};
