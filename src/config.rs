use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::codec::DEFAULT_CHUNK_SIZE;
use crate::store::RetryPolicy;
use crate::tree::path::{CaseSensitivity, PathPolicy};

#[derive(Parser, Debug)]
#[command(
    name = "chunkfs",
    about = "FUSE filesystem backed by content-addressed chunk storage"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount a chunkfs filesystem
    Mount {
        /// Directory holding the chunk store and metadata snapshot
        store: PathBuf,

        /// Path to the mount point
        mountpoint: PathBuf,

        /// Session identifier for logging
        #[arg(long)]
        session_id: Option<String>,

        /// Log file path
        #[arg(long, default_value = "/tmp/chunkfs.log")]
        log_file: PathBuf,

        /// Chunk cache memory budget in MiB
        #[arg(long, default_value_t = 64)]
        cache_mb: u64,

        /// Chunk size in KiB for newly written data
        #[arg(long, default_value_t = 1024)]
        chunk_kb: u64,

        /// Compare names case-insensitively
        #[arg(long)]
        case_insensitive: bool,

        /// Accept `\` as a path separator
        #[arg(long)]
        backslash_separators: bool,

        /// Seconds unmount waits for uncommitted data before reporting busy
        #[arg(long, default_value_t = 30)]
        flush_timeout_secs: u64,

        /// Attempts per chunk transfer, including the first
        #[arg(long, default_value_t = 3)]
        retry_attempts: u32,

        /// Initial backoff between attempts, doubled each retry
        #[arg(long, default_value_t = 50)]
        retry_backoff_ms: u64,

        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },
    /// Unmount a chunkfs filesystem
    Unmount {
        /// Path to the mount point
        mountpoint: PathBuf,
    },
}

/// Settings fixed for the lifetime of one mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    pub session_id: String,
    pub case_sensitivity: CaseSensitivity,
    pub accept_backslash: bool,
    pub cache_budget_bytes: u64,
    /// How long unmount waits for in-flight calls and pending commits.
    pub flush_timeout: Duration,
    pub retry: RetryPolicy,
    pub chunk_size: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            session_id: format!("chunkfs-{}", std::process::id()),
            case_sensitivity: CaseSensitivity::Sensitive,
            accept_backslash: false,
            cache_budget_bytes: 64 * 1024 * 1024,
            flush_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl MountConfig {
    pub fn path_policy(&self) -> PathPolicy {
        PathPolicy {
            case: self.case_sensitivity,
            accept_backslash: self.accept_backslash,
        }
    }
}
