use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use fat2fs_core::{FileBlockDevice, MountFlags};
use fat2fs_filesystems::{format_volume, FatVolume, FormatOptions, OpenOptions};
use log::info;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "fat2fs")]
#[command(about = "Inspect and modify FAT16/FAT32 disk images", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum FatKind {
    Fat16,
    Fat32,
}

#[derive(Subcommand)]
enum Commands {
    /// Format an image file, creating it when --size-mb is given
    Format {
        image: PathBuf,
        #[arg(short, long, value_enum, default_value = "fat32")]
        fat: FatKind,
        #[arg(short, long)]
        label: Option<String>,
        #[arg(long)]
        size_mb: Option<u64>,
        /// Sectors per cluster (chosen from the volume size when omitted)
        #[arg(long)]
        cluster_sectors: Option<u8>,
    },
    /// Show volume geometry and usage
    Info {
        image: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List a directory
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file to stdout
    Cat { image: PathBuf, path: String },
    /// Copy a host file (or literal text) into the image
    Write {
        image: PathBuf,
        path: String,
        /// Host file to copy
        #[arg(short, long, conflicts_with = "text")]
        source: Option<PathBuf>,
        #[arg(short, long)]
        text: Option<String>,
    },
    /// Create a directory
    Mkdir { image: PathBuf, path: String },
    /// Delete a file or empty directory
    Rm { image: PathBuf, path: String },
    /// Write hello.txt and read it back
    Demo { image: PathBuf },
}

fn mount(image: &Path, flags: MountFlags) -> anyhow::Result<FatVolume<FileBlockDevice>> {
    FatVolume::mount("/image", FileBlockDevice::new(image), flags.into())
        .with_context(|| format!("Failed to mount {}", image.display()))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Format { image, fat, label, size_mb, cluster_sectors } => {
            let mut device = match size_mb {
                Some(mb) => FileBlockDevice::create(&image, mb * 1024 * 1024)?,
                None => FileBlockDevice::new(&image),
            };
            let base = match fat {
                FatKind::Fat16 => FormatOptions::fat16(),
                FatKind::Fat32 => FormatOptions::fat32(),
            };
            let options = FormatOptions {
                volume_label: label,
                sectors_per_cluster: cluster_sectors,
                ..base
            };
            let boot = format_volume(&mut device, &options)
                .with_context(|| format!("Failed to format {}", image.display()))?;
            println!(
                "Formatted {} as {} ({} sectors, {} sectors per cluster)",
                image.display(),
                options.fat_type,
                boot.total_sectors(),
                boot.sectors_per_cluster
            );
        }
        Commands::Info { image, json } => {
            let mut vol = mount(&image, MountFlags::ReadOnly)?;
            let stats = vol.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                let geometry = vol.geometry();
                println!("Volume: {}", image.display());
                println!("  Type: {}", stats.fat_type);
                println!("  Label: {}", stats.label);
                println!("  Bytes per sector: {}", stats.bytes_per_sector);
                println!("  Bytes per cluster: {}", stats.bytes_per_cluster);
                println!("  FAT starts at sector {} ({} sectors)", geometry.fat_start, geometry.table_size);
                println!("  Data starts at sector {}", geometry.data_start);
                println!("  Clusters: {} ({} free)", stats.total_clusters, stats.free_clusters);
                println!("  Capacity: {:.2} MB", stats.total_bytes() as f64 / 1_048_576.0);
                println!("  Free: {:.2} MB", stats.free_bytes() as f64 / 1_048_576.0);
            }
            vol.unmount()?;
        }
        Commands::Ls { image, path } => {
            let mut vol = mount(&image, MountFlags::ReadOnly)?;
            for record in vol.list_dir(&path)? {
                let modified = record
                    .modified()
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                let kind = if record.is_directory() { "<DIR>" } else { "" };
                println!(
                    "{:<16} {:>5} {:>10}  {:<12} {}",
                    modified,
                    kind,
                    record.size(),
                    record.short_name.to_string(),
                    record.name
                );
            }
            vol.unmount()?;
        }
        Commands::Cat { image, path } => {
            let mut vol = mount(&image, MountFlags::ReadOnly)?;
            let data = vol.read_file(&path)?;
            print!("{}", String::from_utf8_lossy(&data));
            vol.unmount()?;
        }
        Commands::Write { image, path, source, text } => {
            let data = match (source, text) {
                (Some(source), _) => std::fs::read(&source)
                    .with_context(|| format!("Failed to read {}", source.display()))?,
                (None, Some(text)) => text.into_bytes(),
                (None, None) => anyhow::bail!("either --source or --text is required"),
            };
            let mut vol = mount(&image, MountFlags::ReadWrite)?;
            vol.write_file(&path, &data)?;
            vol.unmount()?;
            info!("Wrote {} bytes to {}", data.len(), path);
        }
        Commands::Mkdir { image, path } => {
            let mut vol = mount(&image, MountFlags::ReadWrite)?;
            vol.create_dir(&path)?;
            vol.unmount()?;
        }
        Commands::Rm { image, path } => {
            let mut vol = mount(&image, MountFlags::ReadWrite)?;
            vol.remove(&path)?;
            vol.unmount()?;
        }
        Commands::Demo { image } => {
            let mut vol = mount(&image, MountFlags::ReadWrite)?;

            let mut file = vol.open("/hello.txt", OpenOptions::new().write(true).create(true).truncate(true))?;
            let written = vol.write(&mut file, b"Hello World!!!")?;
            vol.close(file)?;
            println!("Wrote {} bytes to hello.txt", written);

            let mut file = vol.open("/hello.txt", OpenOptions::new().read(true))?;
            let mut buf = [0u8; 64];
            let read = vol.read(&mut file, &mut buf)?;
            vol.close(file)?;
            println!("Read back: {}", String::from_utf8_lossy(&buf[..read]));

            vol.unmount()?;
        }
    }

    Ok(())
}
