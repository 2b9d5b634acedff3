mod cli;

pub use cli::GitCli;
