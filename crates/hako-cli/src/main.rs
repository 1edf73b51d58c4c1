//! hako: look into archives and other VFS paths from the shell.
//!
//! Usage:
//!   hako ls -l ~/src/project.tar#utar/lib
//!   hako cat ~/src/project.tar#utar/README
//!   hako cp ~/src/project.tar#utar/README /tmp/README
//!   hako stat --no-follow ~/src/project.tar#utar/current
//!
//! Logging goes to stderr and is controlled by RUST_LOG.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hako_vfs::{FileType, OpenFlags, Stat, VfsConfig, VfsContext};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt};

/// Browse archives, scratch space and local files through one path syntax.
#[derive(Parser, Debug)]
#[command(name = "hako")]
#[command(about = "Command line access to hako VFS paths")]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/hako/vfs.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        #[arg(default_value = ".")]
        path: String,

        /// One line per entry with mode, size and mtime
        #[arg(short, long)]
        long: bool,
    },

    /// Print files to stdout
    Cat {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Show metadata
    Stat {
        path: String,

        /// Describe a final symlink instead of its target
        #[arg(short, long)]
        no_follow: bool,
    },

    /// Print a symlink's target
    Readlink { path: String },

    /// Copy a file, possibly between classes
    Cp { from: String, to: String },

    /// Create a directory
    Mkdir {
        path: String,

        /// Permission bits, in octal
        #[arg(long, default_value = "755", value_parser = parse_octal)]
        mode: u32,
    },

    /// Remove a file
    Rm { path: String },
}

fn parse_octal(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8).map_err(|e| format!("not an octal mode: {e}"))
}

fn load_config(explicit: Option<&Path>) -> Result<VfsConfig> {
    if let Some(path) = explicit {
        return VfsConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    match dirs::config_dir().map(|dir| dir.join("hako").join("vfs.toml")) {
        Some(path) if path.exists() => {
            tracing::debug!("using config {}", path.display());
            VfsConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        _ => Ok(VfsConfig::default()),
    }
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let ctx = VfsContext::with_builtin(config);

    let result = run(&ctx, args.command);
    ctx.shutdown();
    result
}

fn run(ctx: &VfsContext, command: Command) -> Result<()> {
    let mut out = std::io::stdout().lock();
    match command {
        Command::Ls { path, long } => {
            let mut entries = ctx.read_dir(&path).with_context(|| format!("listing {path}"))?;
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            for entry in entries {
                if !long {
                    writeln!(out, "{}", entry.name)?;
                    continue;
                }
                let full = hako_vfs::path::join(&ctx.canon(&path), &entry.name);
                match ctx.lstat(&full) {
                    Ok(st) => {
                        let link = if st.is_symlink() {
                            ctx.readlink(&full).map(|t| format!(" -> {t}")).unwrap_or_default()
                        } else {
                            String::new()
                        };
                        writeln!(out, "{} {}{}", describe(&st), entry.name, link)?;
                    }
                    Err(e) => {
                        tracing::warn!("stat {} failed: {}", full, e);
                        writeln!(out, "?????????? {}", entry.name)?;
                    }
                }
            }
        }
        Command::Cat { paths } => {
            for path in paths {
                copy(ctx, &path, |data| Ok(out.write_all(data)?))
                    .with_context(|| format!("reading {path}"))?;
            }
        }
        Command::Stat { path, no_follow } => {
            let st = (if no_follow { ctx.lstat(&path) } else { ctx.stat(&path) })
                .with_context(|| format!("stat {path}"))?;
            writeln!(out, "  File: {}", ctx.canon(&path))?;
            writeln!(out, "  Type: {:?}", st.kind())?;
            writeln!(out, "  Size: {}  Blocks: {}  Links: {}", st.size, st.blocks, st.nlink)?;
            writeln!(out, "  Mode: {:04o}  Uid: {}  Gid: {}", st.perm(), st.uid, st.gid)?;
            writeln!(out, " Inode: {}  Device: {:#x}", st.ino, st.dev)?;
            writeln!(out, "Modify: {}", timestamp(&st))?;
            writeln!(out, " Local: {}", ctx.file_is_local(&path))?;
        }
        Command::Readlink { path } => {
            let target = ctx.readlink(&path).with_context(|| format!("readlink {path}"))?;
            writeln!(out, "{target}")?;
        }
        Command::Cp { from, to } => {
            let mode = ctx.stat(&from).with_context(|| format!("stat {from}"))?.perm();
            let fd = ctx
                .open(&to, OpenFlags::create_truncate(), mode)
                .with_context(|| format!("creating {to}"))?;
            let copied = copy(ctx, &from, |mut data| {
                while !data.is_empty() {
                    let n = ctx.write(fd, data)?;
                    anyhow::ensure!(n > 0, "short write");
                    data = &data[n..];
                }
                Ok(())
            });
            let closed = ctx.close(fd);
            copied.with_context(|| format!("copying {from} to {to}"))?;
            closed.with_context(|| format!("closing {to}"))?;
        }
        Command::Mkdir { path, mode } => {
            ctx.mkdir(&path, mode).with_context(|| format!("mkdir {path}"))?;
        }
        Command::Rm { path } => {
            ctx.unlink(&path).with_context(|| format!("removing {path}"))?;
        }
    }
    Ok(())
}

/// Stream a file into `sink`, chunk by chunk.
fn copy(ctx: &VfsContext, path: &str, mut sink: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
    let fd = ctx.open(path, OpenFlags::read_linear(), 0)?;
    let mut buf = vec![0u8; 64 * 1024];
    let result = loop {
        match ctx.read(fd, &mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = sink(&buf[..n]) {
                    break Err(e);
                }
            }
            Err(e) => break Err(e.into()),
        }
    };
    ctx.close(fd)?;
    result
}

fn describe(st: &Stat) -> String {
    let kind = match st.kind() {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::CharDevice => 'c',
        FileType::BlockDevice => 'b',
        FileType::Fifo => 'p',
        FileType::Socket => 's',
        FileType::File => '-',
    };
    let mut perm = String::with_capacity(9);
    for shift in [6, 3, 0] {
        let bits = (st.perm() >> shift) & 0o7;
        perm.push(if bits & 4 != 0 { 'r' } else { '-' });
        perm.push(if bits & 2 != 0 { 'w' } else { '-' });
        perm.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    format!("{kind}{perm} {:>3} {:>5} {:>5} {:>10} {}", st.nlink, st.uid, st.gid, st.size, timestamp(st))
}

fn timestamp(st: &Stat) -> String {
    chrono::DateTime::<chrono::Local>::from(st.mtime)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}
