mod command;
mod source;
mod traits;

pub use command::CommandFetcher;
pub use source::{fetch_source, github_archive_url, SourceInfo};
pub use traits::{ArchiveRequest, ArchiveResult, CacheTtl, ExportedTree, Fetcher, VersionControl};
