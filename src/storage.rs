mod cache_index;
mod filesystem;
mod traits;

pub use cache_index::{CachedDownload, DownloadCache};
pub use filesystem::FilesystemStore;
pub use traits::Store;
