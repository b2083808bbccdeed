use std::fs;
use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use wpflash_core::ffu::FfuImage;
use wpflash_core::gpt::manifest::parse_manifest;
use wpflash_core::gpt::merge::ZipPartitionArchive;
use wpflash_core::gpt::Gpt;
use wpflash_core::patchdefs::{PatchEngine, PatchOutcome};
use wpflash_core::patcher;
use wpflash_core::protocol::lumia::LumiaClient;
use wpflash_core::protocol::sahara::{SaharaClient, SaharaMode};
use wpflash_core::protocol::usb::UsbTransport;
use wpflash_core::uefi::UefiImage;
use wpflash_core::TracingObserver;

#[derive(Parser, Debug)]
#[command(author, version, about = "Windows Phone / Qualcomm firmware servicing tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// FFU image inspection and extraction
    #[command(subcommand)]
    Ffu(FfuCommand),
    /// Partition table inspection and merging
    #[command(subcommand)]
    Gpt(GptCommand),
    /// UEFI firmware volume patching
    #[command(subcommand)]
    Uefi(UefiCommand),
    /// Secondary bootloader patching
    #[command(subcommand)]
    Sbl(SblCommand),
    /// Declarative file patching
    #[command(subcommand)]
    Patchdefs(PatchdefsCommand),
    /// Sahara (emergency download) operations
    #[command(subcommand)]
    Sahara(SaharaCommand),
    /// Flash images to a connected device
    #[command(subcommand)]
    Flash(FlashCommand),
}

#[derive(Subcommand, Debug)]
enum FfuCommand {
    /// Show image headers and partition layout
    Info {
        /// Path to the FFU file
        image: PathBuf,
    },
    /// Extract a partition to a file
    Extract {
        /// Path to the FFU file
        image: PathBuf,
        /// Partition name, e.g. EFIESP
        partition: String,
        /// Output path
        output: PathBuf,
        /// Compress the output with gzip
        #[arg(long)]
        gzip: bool,
    },
}

#[derive(Subcommand, Debug)]
enum GptCommand {
    /// List the partitions of a dumped partition table
    Show {
        /// Raw GPT dump (protective MBR + headers + table)
        table: PathBuf,
    },
    /// Merge a partition manifest into a dumped partition table
    Merge {
        /// Raw GPT dump to modify
        table: PathBuf,
        /// Partition manifest XML
        manifest: PathBuf,
        /// ZIP archive holding partition contents
        #[arg(long)]
        archive: Option<PathBuf>,
        /// Output path (defaults to rewriting the input)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum UefiCommand {
    /// Disable the security checks in a UEFI firmware image
    Patch {
        /// UEFI image (MBN) to patch
        image: PathBuf,
        /// Output path (defaults to rewriting the input)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum SblCommand {
    /// Disable the security checks in an SBL2 or SBL3 binary
    Patch {
        /// Bootloader binary to patch
        image: PathBuf,
        /// Which bootloader stage the binary is
        #[arg(long, value_parser = ["sbl2", "sbl3"])]
        stage: String,
        /// Output path (defaults to rewriting the input)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum PatchdefsCommand {
    /// Apply a named patch definition
    Apply {
        /// Patch definitions XML
        definitions: PathBuf,
        /// Definition name
        name: String,
        /// Path redirection, definition-path=actual-path (repeatable)
        #[arg(long = "redirect", value_name = "FROM=TO")]
        redirections: Vec<String>,
    },
    /// Revert a named patch definition
    Restore {
        /// Patch definitions XML
        definitions: PathBuf,
        /// Definition name
        name: String,
        /// Path redirection, definition-path=actual-path (repeatable)
        #[arg(long = "redirect", value_name = "FROM=TO")]
        redirections: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SaharaCommand {
    /// Read the root key hashes from a device in emergency mode
    Rkh,
}

#[derive(Subcommand, Debug)]
enum FlashCommand {
    /// Flash a full FFU image onto a Lumia in flash mode
    Ffu {
        /// Path to the FFU file
        image: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args.command) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ffu(cmd) => run_ffu(cmd),
        Command::Gpt(cmd) => run_gpt(cmd),
        Command::Uefi(cmd) => run_uefi(cmd),
        Command::Sbl(cmd) => run_sbl(cmd),
        Command::Patchdefs(cmd) => run_patchdefs(cmd),
        Command::Sahara(cmd) => run_sahara(cmd),
        Command::Flash(cmd) => run_flash(cmd),
    }
}

fn run_ffu(command: FfuCommand) -> anyhow::Result<()> {
    match command {
        FfuCommand::Info { image } => {
            let ffu = FfuImage::open(&image).context("opening FFU")?;
            println!("Platform ID:  {}", ffu.platform_id());
            println!("Chunk size:   0x{:X}", ffu.chunk_size());
            println!("Header size:  0x{:X}", ffu.header_size());
            println!("Payload size: 0x{:X}", ffu.payload_size());
            println!("Chunks:       {}", ffu.total_chunk_count());

            let gpt = ffu.gpt().context("parsing image GPT")?;
            println!("Partitions:");
            for p in &gpt.partitions {
                let present = ffu.is_partition_present(&p.name)?;
                println!(
                    "  {:<16} sectors 0x{:X}..0x{:X}{}",
                    p.name,
                    p.first_sector(),
                    p.last_sector(),
                    if present { "" } else { "  (no data)" }
                );
            }
            Ok(())
        }
        FfuCommand::Extract {
            image,
            partition,
            output,
            gzip,
        } => {
            let ffu = FfuImage::open(&image).context("opening FFU")?;
            let mut sink = File::create(&output)
                .with_context(|| format!("creating {}", output.display()))?;
            ffu.write_partition(&partition, &mut sink, &TracingObserver, gzip)?;
            info!(partition = %partition, output = %output.display(), "Partition extracted");
            Ok(())
        }
    }
}

fn run_gpt(command: GptCommand) -> anyhow::Result<()> {
    match command {
        GptCommand::Show { table } => {
            let bytes = fs::read(&table)?;
            let gpt = Gpt::parse(&bytes).context("parsing partition table")?;
            println!(
                "Usable sectors: 0x{:X}..0x{:X}",
                gpt.first_usable_sector, gpt.last_usable_sector
            );
            for p in &gpt.partitions {
                println!(
                    "  {:<16} sectors 0x{:X}..0x{:X}  attributes 0x{:016X}",
                    p.name,
                    p.first_sector(),
                    p.last_sector(),
                    p.attributes
                );
            }
            Ok(())
        }
        GptCommand::Merge {
            table,
            manifest,
            archive,
            output,
        } => {
            let bytes = fs::read(&table)?;
            let mut gpt = Gpt::parse(&bytes).context("parsing partition table")?;
            let wanted =
                parse_manifest(&fs::read_to_string(&manifest)?).context("parsing manifest")?;

            match archive {
                Some(path) => {
                    let file = File::open(&path)
                        .with_context(|| format!("opening {}", path.display()))?;
                    let mut zip = ZipPartitionArchive::new(file).context("opening archive")?;
                    gpt.merge(&wanted, true, Some(&mut zip))?;
                }
                None => gpt.merge(&wanted, true, None)?,
            }

            let rebuilt = gpt.rebuild();
            let destination = output.unwrap_or(table);
            fs::write(&destination, rebuilt)?;
            info!(output = %destination.display(), "Partition table written");
            Ok(())
        }
    }
}

fn run_uefi(command: UefiCommand) -> anyhow::Result<()> {
    match command {
        UefiCommand::Patch { image, output } => {
            let binary = fs::read(&image)?;
            let mut uefi = UefiImage::parse(binary).context("parsing UEFI image")?;
            let patched = uefi.patch().context("patching UEFI image")?;
            let destination = output.unwrap_or(image);
            fs::write(&destination, patched)?;
            info!(output = %destination.display(), "UEFI image patched");
            Ok(())
        }
    }
}

fn run_sbl(command: SblCommand) -> anyhow::Result<()> {
    match command {
        SblCommand::Patch {
            image,
            stage,
            output,
        } => {
            let mut binary = fs::read(&image)?;
            match stage.as_str() {
                "sbl2" => patcher::patch_sbl2(&mut binary)?,
                "sbl3" => patcher::patch_sbl3(&mut binary)?,
                other => bail!("unknown bootloader stage {other:?}"),
            }
            let destination = output.unwrap_or(image);
            fs::write(&destination, binary)?;
            info!(stage = %stage, output = %destination.display(), "Bootloader patched");
            Ok(())
        }
    }
}

fn engine_with_redirections(
    definitions: &PathBuf,
    redirections: &[String],
) -> anyhow::Result<PatchEngine> {
    let xml = fs::read_to_string(definitions)
        .with_context(|| format!("reading {}", definitions.display()))?;
    let mut engine = PatchEngine::parse(&xml).context("parsing patch definitions")?;
    for redirection in redirections {
        let Some((from, to)) = redirection.split_once('=') else {
            bail!("redirection {redirection:?} is not FROM=TO");
        };
        engine.add_redirection(from, to);
    }
    Ok(engine)
}

fn run_patchdefs(command: PatchdefsCommand) -> anyhow::Result<()> {
    match command {
        PatchdefsCommand::Apply {
            definitions,
            name,
            redirections,
        } => {
            let engine = engine_with_redirections(&definitions, &redirections)?;
            match engine.apply(&name)? {
                PatchOutcome::Applied => info!(name = %name, "Patch applied"),
                PatchOutcome::AlreadyApplied => info!(name = %name, "Patch was already applied"),
                PatchOutcome::NotApplicable => {
                    bail!("patch {name:?} does not apply to any known file version")
                }
            }
            Ok(())
        }
        PatchdefsCommand::Restore {
            definitions,
            name,
            redirections,
        } => {
            let engine = engine_with_redirections(&definitions, &redirections)?;
            engine.restore(&name)?;
            Ok(())
        }
    }
}

fn run_sahara(command: SaharaCommand) -> anyhow::Result<()> {
    match command {
        SaharaCommand::Rkh => {
            let transport = UsbTransport::open().context("opening device")?;
            let mut client = SaharaClient::new(transport);
            client.handshake(SaharaMode::Command)?;
            for (i, rkh) in client.read_rkh()?.iter().enumerate() {
                println!("RKH[{i}]: {}", hex::encode(rkh));
            }
            Ok(())
        }
    }
}

fn run_flash(command: FlashCommand) -> anyhow::Result<()> {
    match command {
        FlashCommand::Ffu { image } => {
            let ffu = FfuImage::open(&image).context("opening FFU")?;
            info!(platform = ffu.platform_id(), "Image opened");

            let transport = UsbTransport::open().context("opening device")?;
            let mut client = LumiaClient::new(transport);
            client.flash_ffu(&ffu, &TracingObserver)?;
            info!("Flash complete, rebooting device");
            client.reboot()?;
            Ok(())
        }
    }
}
