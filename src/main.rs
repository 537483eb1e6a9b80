use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use hfscat::catalog::readdir::parse_entries;
use hfscat::catalog::records::ROOT_FOLDER_ID;
use hfscat::config::{CatalogConfig, Cli, Command};
use hfscat::error::{CatalogError, Result};
use hfscat::vnops::Mount;
use hfscat::volume::VolumeImage;

/// Install the stderr layer and, when asked, a non-blocking file layer.
/// The returned guard flushes the file writer when dropped.
fn init_logging(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let log_dir = path.parent().unwrap_or_else(|| Path::new("."));
            let log_name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("hfscat.log"));
            let file_appender = tracing_appender::rolling::never(log_dir, log_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        );
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("hfscat: failed to set tracing subscriber: {}", e);
    }
    guard
}

fn main() {
    let cli = Cli::parse();
    let guard = init_logging(cli.log_file.as_deref());

    if let Err(e) = run(&cli) {
        error!("{:?} failed: {}", cli.command, e);
        eprintln!("hfscat: {} (errno {})", e, e.errno());
        // exit skips destructors
        drop(guard);
        std::process::exit(1);
    }
}

fn current_ids() -> (u32, u32) {
    unsafe { (libc::getuid(), libc::getgid()) }
}

fn run(cli: &Cli) -> Result<()> {
    if let Command::Format {
        name,
        case_sensitive,
        config,
        blocks,
    } = &cli.command
    {
        let mut settings = match config {
            Some(path) => CatalogConfig::load(path)?,
            None => CatalogConfig::default(),
        };
        settings.case_sensitive |= *case_sensitive;
        let mount = Mount::format(name, settings, *blocks)?;
        mount.to_image()?.save(&cli.image)?;
        println!("formatted {} ({} blocks)", cli.image.display(), blocks);
        return Ok(());
    }

    let mount = Mount::open(VolumeImage::load(&cli.image)?)?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let reaper = mount.start_reaper(shutdown.clone())?;

    let result = execute(&mount, &cli.command);

    shutdown.store(true, Ordering::Relaxed);
    if reaper.join().is_err() {
        warn!("reaper thread panicked");
    }
    let changed = result?;
    if changed {
        mount.reclaim_orphans()?;
        mount.to_image()?.save(&cli.image)?;
        info!("saved {}", cli.image.display());
    }
    Ok(())
}

/// Run one subcommand. Returns whether the image needs saving.
fn execute(mount: &Mount, command: &Command) -> Result<bool> {
    let (uid, gid) = current_ids();
    match command {
        Command::Format { .. } => Ok(false),
        Command::Mkdir { path, mode } => {
            let (dir, name) = mount.lookup_parent(path)?;
            let cp = mount.mkdir(&dir, &name, *mode, uid, gid)?;
            println!("{}", cp.fileid());
            Ok(true)
        }
        Command::Touch { path, mode } => {
            let (dir, name) = mount.lookup_parent(path)?;
            let cp = mount.create(&dir, &name, *mode, uid, gid)?;
            println!("{}", cp.fileid());
            Ok(true)
        }
        Command::Ln { target, link } => {
            let target = mount.lookup_path(target)?;
            let (dir, name) = mount.lookup_parent(link)?;
            mount.link(&target, &dir, &name)?;
            Ok(true)
        }
        Command::Rm { path } => {
            let (dir, name) = mount.lookup_parent(path)?;
            mount.remove(&dir, &name)?;
            Ok(true)
        }
        Command::Rmdir { path } => {
            let (dir, name) = mount.lookup_parent(path)?;
            mount.rmdir(&dir, &name)?;
            Ok(true)
        }
        Command::Mv { from, to } => {
            let (fdir, fname) = mount.lookup_parent(from)?;
            let (tdir, tname) = mount.lookup_parent(to)?;
            mount.rename(&fdir, &fname, &tdir, &tname)?;
            Ok(true)
        }
        Command::Ls { path, buf_size } => {
            let dir = mount.lookup_path(path)?;
            let mut buf = vec![0u8; *buf_size];
            let mut cookie = 0;
            loop {
                let out = mount.readdir(&dir, cookie, &mut buf)?;
                for entry in parse_entries(&buf[..out.used]) {
                    let kind = if entry.kind == libc::DT_DIR { 'd' } else { '-' };
                    println!("{}\t{}\t{}", kind, entry.fileid, entry.name);
                    cookie = entry.next_cookie;
                }
                if out.eof || out.count == 0 {
                    break;
                }
            }
            Ok(false)
        }
        Command::Stat { path } => {
            let cp = mount.lookup_path(path)?;
            let report = serde_json::json!({
                "desc": cp.desc(),
                "attr": cp.attr(),
                "hardlink": cp.attr().linkref != 0,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(false)
        }
        Command::Check => {
            let header = mount.catalog().vcb().header();
            let root = mount.get_by_id(ROOT_FOLDER_ID)?;
            println!("volume: {}", header.name);
            println!("files: {}", header.file_count);
            println!("folders: {}", header.folder_count);
            println!("root entries: {}", root.attr().entries);
            println!("records: {}", mount.catalog().tree().record_count());
            if mount.catalog().vcb().is_inconsistent() {
                println!("state: inconsistent");
                return Err(CatalogError::VolumeInconsistent(
                    "volume needs repair".into(),
                ));
            }
            println!("state: clean");
            Ok(false)
        }
    }
}
