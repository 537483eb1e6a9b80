use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "hfscat", about = "Inspect and edit an HFS+ catalog volume image")]
pub struct Cli {
    /// Path to the volume image
    #[arg(short, long, default_value = "volume.json")]
    pub image: PathBuf,

    /// Optional log file (logs always go to stderr as well)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new empty volume image
    Format {
        /// Volume name
        #[arg(long, default_value = "Untitled")]
        name: String,

        /// Use binary (case-sensitive) name ordering
        #[arg(long)]
        case_sensitive: bool,

        /// Load catalog settings from a JSON file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Total allocation blocks on the volume
        #[arg(long, default_value_t = 65536)]
        blocks: u32,
    },
    /// Create a directory
    Mkdir {
        path: String,
        #[arg(long, default_value_t = 0o755)]
        mode: u16,
    },
    /// Create an empty file
    Touch {
        path: String,
        #[arg(long, default_value_t = 0o644)]
        mode: u16,
    },
    /// Create a hard link to an existing file or directory
    Ln { target: String, link: String },
    /// Remove a file or hard link
    Rm { path: String },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Rename or move an entry
    Mv { from: String, to: String },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,

        /// Size of the enumeration buffer in bytes
        #[arg(long, default_value_t = 4096)]
        buf_size: usize,
    },
    /// Show catalog attributes of an entry
    Stat { path: String },
    /// Report volume consistency state
    Check,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// HFSX binary name ordering instead of case-folding compare.
    pub case_sensitive: bool,
    /// Volume mounted with ownership ignored.
    pub unknown_perms: bool,
    pub unknown_uid: u32,
    pub unknown_gid: u32,
    pub block_size: u32,
    pub max_dir_hints: usize,
    pub dir_hint_ttl_secs: u64,
    /// Cap on hard-link resolutions collected by one enumeration call.
    pub max_link_infos: usize,
    pub lookup_retries: u32,
    pub reaper_interval_secs: u64,
    /// Catalog node ids wrap back to the first user id on reaching this.
    pub max_cnid: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            unknown_perms: false,
            unknown_uid: 99,
            unknown_gid: 99,
            block_size: 4096,
            max_dir_hints: 32,
            dir_hint_ttl_secs: 45,
            max_link_infos: 64,
            lookup_retries: 3,
            reaper_interval_secs: 60,
            max_cnid: u32::MAX,
        }
    }
}

impl CatalogConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
