//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::path::PathBuf;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const CHUNKS_DIR: &str = "chunks";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const STAGING_DIR: &str = "staging";
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_CHUNKS: u32 = 8192;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CHUNK_TTL_SECS: u64 = 24 * 60 * 60;
pub const CHUNK_SWEEP_INTERVAL_SECS: u64 = 900;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "stitchd", version = VERSION_INFO, about = "Chunked upload assembly server")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        env = "STITCHD_DATA_DIR",
        default_value = "uploads",
        help = "Root directory for chunks, staging files and artifacts"
    )]
    pub data_dir: PathBuf,
    #[arg(
        short = 'b',
        long,
        env = "STITCHD_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "STITCHD_PORT",
        default_value_t = 3000,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "STITCHD_CORS_ORIGINS",
        default_value = "*",
        help = "Comma separated CORS origins (`*` allows any)"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "STITCHD_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        help = "Max bytes per chunk (0 to disable)"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "STITCHD_MAX_CHUNKS",
        default_value_t = DEFAULT_MAX_CHUNKS,
        help = "Max chunks per upload (0 to disable)"
    )]
    pub max_chunks: u32,
    #[arg(
        long,
        env = "STITCHD_LOCK_WAIT_SECS",
        default_value_t = DEFAULT_LOCK_WAIT_TIMEOUT_SECS,
        help = "How long a request waits for a busy upload before giving up"
    )]
    pub lock_wait_secs: u64,
    #[arg(
        long,
        env = "STITCHD_CHUNK_TTL_SECS",
        default_value_t = DEFAULT_CHUNK_TTL_SECS,
        help = "Unfinished uploads older than this are swept, in seconds (0 to disable)"
    )]
    pub chunk_ttl_secs: u64,
}

impl Args {
    pub fn chunk_root(&self) -> PathBuf {
        self.data_dir.join(CHUNKS_DIR)
    }

    pub fn artifact_root(&self) -> PathBuf {
        self.data_dir.join(ARTIFACTS_DIR)
    }

    pub fn staging_root(&self) -> PathBuf {
        self.data_dir.join(STAGING_DIR)
    }
}
