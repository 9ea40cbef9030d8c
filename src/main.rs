use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use time::{OffsetDateTime, PrimitiveDateTime};

use brutzel::device::{Cartridge, RtcTime, SimulatedCartridge};
use brutzel::dfs::{Dfs, EntryKind};
use brutzel::flasher::{Flasher, Stage};
use brutzel::layout::CONFIG_PATH;
use brutzel::logger::Logger;
use brutzel::transport::{StreamTransport, Transport};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    #[arg(short = 'n', long)]
    allow_notification: bool,
    /// More output, repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build and inspect DragonFS images
    #[command(subcommand)]
    Image(ImageCommand),
    /// Talk to the cartridge
    #[command(subcommand)]
    Device(DeviceCommand),
}

#[derive(Subcommand, Debug)]
enum ImageCommand {
    /// Build an image from local files, given as <image path>=<local file>
    Build {
        output: String,
        files: Vec<String>,
        /// Local file stored as the cartridge configuration
        #[arg(long)]
        config: Option<String>,
    },
    /// List every entry of an image
    List { image: String },
    /// Print a file of an image to stdout
    Cat { image: String, path: String },
    /// Check footer checksum and reachability of all sectors
    Verify { image: String },
}

#[derive(Args, Debug)]
struct Port {
    /// Serial device of the cartridge; without it a simulated cartridge answers
    #[arg(short, long)]
    port: Option<String>,
}

#[derive(Subcommand, Debug)]
enum DeviceCommand {
    /// Print firmware version and identity
    Version(Port),
    /// Set the cartridge clock to the local time
    Rtc(Port),
    /// Write an image to the boot flash
    FlashImage {
        image: String,
        #[command(flatten)]
        port: Port,
    },
}

fn connect(port: &Port) -> Result<Cartridge<Box<dyn Transport>>> {
    let transport: Box<dyn Transport> = match &port.port {
        Some(path) => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .with_context(|| format!("open {path}"))?;
            Box::new(StreamTransport::new(file))
        }
        None => {
            log::warn!("no port given, using a simulated cartridge");
            Box::new(SimulatedCartridge::new())
        }
    };
    Ok(Cartridge::new(transport))
}

fn build_image(output: &str, files: &[String], config: Option<&str>) -> Result<()> {
    let mut dfs = Dfs::new();
    if let Some(config) = config {
        let data = fs::read(config).with_context(|| format!("read {config}"))?;
        dfs.write_file(CONFIG_PATH, &data)?;
    }
    for spec in files {
        let Some((path, local)) = spec.split_once('=') else {
            bail!("expected <image path>=<local file>, got {spec}");
        };
        let data = fs::read(local).with_context(|| format!("read {local}"))?;
        dfs.write_file(path, &data)
            .with_context(|| format!("add {path}"))?;
    }
    dfs.write_image(File::create(output).with_context(|| format!("create {output}"))?)?;
    Ok(())
}

fn list(dfs: &Dfs, dir: &str, out: &mut impl Write) -> Result<()> {
    for entry in dfs.list_directory(dir)? {
        let path = format!("{}/{}", dir.trim_end_matches('/'), entry.name);
        match entry.kind {
            EntryKind::Directory => {
                writeln!(out, "{path}/")?;
                list(dfs, &path, out)?;
            }
            _ => writeln!(out, "{path} {}", entry.size)?,
        }
    }
    Ok(())
}

fn load(image: &str) -> Result<Dfs> {
    let file = File::open(image).with_context(|| format!("open {image}"))?;
    Dfs::read_image(file).with_context(|| format!("load {image}"))
}

fn run_image(command: ImageCommand) -> Result<()> {
    match command {
        ImageCommand::Build {
            output,
            files,
            config,
        } => build_image(&output, &files, config.as_deref()),
        ImageCommand::List { image } => list(&load(&image)?, "/", &mut io::stdout().lock()),
        ImageCommand::Cat { image, path } => {
            let data = load(&image)?.read_file(&path)?;
            io::stdout().lock().write_all(&data)?;
            Ok(())
        }
        ImageCommand::Verify { image } => {
            let dfs = load(&image)?;
            dfs.audit().context("audit")?;
            println!("{image}: {} sectors, ok", dfs.sector_count());
            Ok(())
        }
    }
}

fn run_device(command: DeviceCommand) -> Result<()> {
    match command {
        DeviceCommand::Version(port) => {
            let mut cart = connect(&port)?;
            let version = cart.read_version().context("read version")?;
            let identity = cart.read_identity().context("read identity")?;
            println!("{identity} firmware {version:#010x}");
        }
        DeviceCommand::Rtc(port) => {
            let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
            let time = RtcTime::from(PrimitiveDateTime::new(now.date(), now.time()));
            connect(&port)?.set_rtc(&time).context("set RTC")?;
            println!("RTC set to {now}");
        }
        DeviceCommand::FlashImage { image, port } => {
            let data = fs::read(&image).with_context(|| format!("read {image}"))?;
            Dfs::from_bytes(&data)
                .and_then(|dfs| dfs.audit())
                .with_context(|| format!("{image} is not a valid image"))?;
            let mut cart = connect(&port)?;
            Flasher::new(&mut cart)
                .on_progress(|p| {
                    let stage = match p.stage {
                        Stage::Erase => "erase",
                        Stage::Write => "write",
                        Stage::Read => "read",
                    };
                    eprint!("\r{stage} {:3}%", p.percent());
                })
                .write_image(&data)
                .context("flash image")?;
            eprintln!();
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let appname = "brutzel";
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    Logger::new(appname.to_string(), cli.allow_notification, level)
        .init()
        .context("install logger")?;
    match cli.command {
        Command::Image(command) => run_image(command),
        Command::Device(command) => run_device(command),
    }
}
