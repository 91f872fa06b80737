use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use wimcore::backend::posix::{PosixSource, PosixTarget};
use wimcore::{
    ApplyOptions, CaptureConfig, CodecKind, OpenOptions, WimFile, WimError,
};

#[derive(Parser)]
#[command(name = "wimtool", version, about = "WIM (Windows Imaging) archive tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a directory tree into a new archive
    Capture {
        source: PathBuf,
        wim: PathBuf,
        /// Image name
        name: String,
        /// Codec: lzx (default), xpress, none
        #[arg(short, long, default_value = "lzx")]
        compress: String,
        /// Exclusion glob, relative to the source root (repeatable)
        #[arg(short = 'x', long = "exclude")]
        exclude: Vec<String>,
        /// Keep going past unreadable files
        #[arg(long)]
        continue_on_error: bool,
        /// Append an integrity table
        #[arg(long)]
        check: bool,
    },
    /// Capture a directory tree as a new image in an existing archive
    Append {
        source: PathBuf,
        wim: PathBuf,
        name: String,
        #[arg(short = 'x', long = "exclude")]
        exclude: Vec<String>,
        #[arg(long)]
        continue_on_error: bool,
    },
    /// Apply an image onto a directory
    Apply {
        wim: PathBuf,
        /// Image index (1-based) or name
        image: String,
        target: PathBuf,
        /// Fail instead of dropping unsupported features
        #[arg(long)]
        strict: bool,
    },
    /// Extract single files from an image
    Extract {
        wim: PathBuf,
        image: String,
        /// Paths inside the image (slash-separated)
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(short = 'C', long, default_value = ".")]
        dest: PathBuf,
    },
    /// Delete an image (content is pruned on the next write)
    Delete { wim: PathBuf, image: String },
    /// Export an image into another archive, deduplicating shared content
    Export {
        src_wim: PathBuf,
        image: String,
        dest_wim: PathBuf,
        /// Codec for a newly created destination archive
        #[arg(short, long, default_value = "lzx")]
        compress: String,
    },
    /// Show archive and image information
    Info { wim: PathBuf },
    /// Rebuild the archive, dropping orphaned content
    Optimize { wim: PathBuf },
    /// Split into spanned .swm parts
    Split {
        wim: PathBuf,
        /// Maximum content bytes per part, in MiB
        #[arg(short, long)]
        size: u64,
    },
    /// Verify the integrity table and every blob hash
    Verify { wim: PathBuf },
}

fn parse_codec(s: &str) -> Result<CodecKind, WimError> {
    CodecKind::from_name(s).ok_or_else(|| WimError::Unsupported {
        detail: format!("unknown codec \"{s}\" (expected lzx, xpress, or none)"),
    })
}

fn build_config(exclude: &[String], continue_on_error: bool) -> Result<CaptureConfig, WimError> {
    let mut config = CaptureConfig::new();
    config.continue_on_error = continue_on_error;
    for pattern in exclude {
        config.exclude(pattern)?;
    }
    Ok(config)
}

fn run() -> Result<(), WimError> {
    match Cli::parse().command {
        // ── Capture / Append ─────────────────────────────────────────────────
        Commands::Capture {
            source,
            wim,
            name,
            compress,
            exclude,
            continue_on_error,
            check,
        } => {
            let codec = parse_codec(&compress)?;
            let config = build_config(&exclude, continue_on_error)?;
            let mut archive = WimFile::create(&wim, codec)?;
            if check {
                archive.set_integrity(true);
            }
            let mut src = PosixSource::new();
            let index = archive.add_image(&mut src, &source, &name, &config)?;
            archive.write()?;
            let image = archive.image(index)?;
            println!(
                "captured {}: image {index} \"{name}\" ({} files, {} dirs, {} bytes)",
                wim.display(),
                image.info.file_count,
                image.info.dir_count,
                image.info.total_bytes,
            );
        }

        Commands::Append {
            source,
            wim,
            name,
            exclude,
            continue_on_error,
        } => {
            let config = build_config(&exclude, continue_on_error)?;
            let mut archive = WimFile::open(&wim)?;
            let mut src = PosixSource::new();
            let index = archive.add_image(&mut src, &source, &name, &config)?;
            archive.write()?;
            println!("appended image {index} \"{name}\" to {}", wim.display());
        }

        // ── Apply / Extract ──────────────────────────────────────────────────
        Commands::Apply {
            wim,
            image,
            target,
            strict,
        } => {
            let mut archive = WimFile::open(&wim)?;
            let index = archive.resolve_image(&image)?;
            let mut tgt = PosixTarget::new(&target);
            let opts = ApplyOptions {
                strict,
                cancel: None,
            };
            let stats = archive.apply_image(index, &mut tgt, &opts)?;
            println!(
                "applied image {index}: {} dirs, {} files, {} links, {} blobs, {} bytes",
                stats.dir_count,
                stats.file_count,
                stats.link_count,
                stats.blob_count,
                stats.bytes_restored,
            );
        }

        Commands::Extract {
            wim,
            image,
            paths,
            dest,
        } => {
            let mut archive = WimFile::open(&wim)?;
            let index = archive.resolve_image(&image)?;
            std::fs::create_dir_all(&dest).map_err(|e| WimError::Open {
                path: dest.clone(),
                source: e,
            })?;
            for path in &paths {
                let (name, hash) = {
                    let tree = &archive.image(index)?.tree;
                    let dentry = tree.lookup_path(path).ok_or_else(|| WimError::Open {
                        path: path.into(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "no such path in the image",
                        ),
                    })?;
                    let inode = &tree.inodes[tree.dentries[dentry].inode];
                    (
                        tree.dentries[dentry].name.clone(),
                        inode.unnamed_stream().and_then(|s| s.hash),
                    )
                };
                let data = match hash {
                    Some(h) => archive.read_blob(&h)?,
                    None => Vec::new(),
                };
                let out = dest.join(&name);
                std::fs::write(&out, &data).map_err(|e| WimError::Write {
                    path: out.clone(),
                    offset: 0,
                    source: e,
                })?;
                println!("  extracted {path} ({} bytes)", data.len());
            }
        }

        // ── Image management ─────────────────────────────────────────────────
        Commands::Delete { wim, image } => {
            let mut archive = WimFile::open(&wim)?;
            let index = archive.resolve_image(&image)?;
            archive.delete_image(index)?;
            archive.write()?;
            println!("deleted image {index} from {}", wim.display());
        }

        Commands::Export {
            src_wim,
            image,
            dest_wim,
            compress,
        } => {
            let mut src = WimFile::open(&src_wim)?;
            let index = src.resolve_image(&image)?;
            let mut dest = if dest_wim.exists() {
                WimFile::open(&dest_wim)?
            } else {
                WimFile::create(&dest_wim, parse_codec(&compress)?)?
            };
            let new_index = src.export_image(index, &mut dest)?;
            dest.write()?;
            println!(
                "exported image {index} of {} as image {new_index} of {}",
                src_wim.display(),
                dest_wim.display()
            );
        }

        // ── Inspection ───────────────────────────────────────────────────────
        Commands::Info { wim } => {
            let archive = WimFile::open(&wim)?;
            println!("{}:", wim.display());
            println!("  guid:        {}", archive.guid());
            println!("  codec:       {}", archive.codec().name());
            println!("  images:      {}", archive.image_count());
            println!("  boot index:  {}", archive.boot_index());
            println!("  blobs:       {}", archive.blob_table().len());
            for i in 1..=archive.image_count() {
                let info = &archive.image(i)?.info;
                let created = chrono::DateTime::<chrono::Utc>::from(
                    wimcore::tree::filetime_to_system(info.creation_time),
                );
                println!(
                    "  [{i}] \"{}\" — {} files, {} dirs, {} bytes, captured {}",
                    info.name,
                    info.file_count,
                    info.dir_count,
                    info.total_bytes,
                    created.format("%Y-%m-%d %H:%M:%S UTC"),
                );
                if let Some(desc) = &info.description {
                    println!("      {desc}");
                }
            }
        }

        // ── Maintenance ──────────────────────────────────────────────────────
        Commands::Optimize { wim } => {
            let mut archive = WimFile::open(&wim)?;
            let saved = archive.optimize()?;
            println!("optimized {}: reclaimed {saved} bytes", wim.display());
        }

        Commands::Split { wim, size } => {
            let mut archive = WimFile::open(&wim)?;
            let parts = archive.split(size * 1024 * 1024)?;
            println!("split {} into {} part(s):", wim.display(), parts.len());
            for p in parts {
                println!("  {}", p.display());
            }
        }

        Commands::Verify { wim } => {
            let mut archive = WimFile::open_with(&wim, OpenOptions::strict())?;
            let stats = archive.verify()?;
            println!(
                "{}: OK ({} blobs, {} metadata resources verified)",
                wim.display(),
                stats.blobs_verified,
                stats.metadata_verified,
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wimtool: {e}");
            // Exit codes are the stable ErrorKind values.
            ExitCode::from(e.kind().code() as u8)
        }
    }
}
