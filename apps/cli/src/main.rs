use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodebus_core::{
    DaemonConfig, FileNodeCache, FirmwareEngine, FirmwareImage, FirmwareOperation, Node, NodeCache,
    NodeRegistry, SimulatedBus, TracingSink, Udid,
};
use nodebus_core::protocol::FLASH_APP_ORIGIN;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Node bus daemon control tool", long_about = None)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(long, default_value = "nodebus.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the configured nodes online and print the address table
    Nodes,
    /// Write a raw binary to a node's application region
    Upload {
        /// Hardware id of the target node
        #[arg(long)]
        udid: Udid,
        /// Path to the firmware binary
        #[arg(long)]
        image: PathBuf,
        /// Flash address of the first byte
        #[arg(long, value_parser = parse_address, default_value = "0x2000")]
        offset: u32,
    },
    /// Read a node's application region into a file
    Download {
        /// Hardware id of the source node
        #[arg(long)]
        udid: Udid,
        /// Path of the file to write
        #[arg(long)]
        output: PathBuf,
        /// Maximum number of bytes to read
        #[arg(long, value_parser = parse_address)]
        limit: Option<u32>,
    },
}

fn parse_address(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
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

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = DaemonConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match &config.cache_path {
        Some(path) => {
            let cache = FileNodeCache::open(path)
                .with_context(|| format!("opening node cache {}", path.display()))?;
            Daemon::new(&config, NodeRegistry::with_cache(cache)).dispatch(args.command)
        }
        None => Daemon::new(&config, NodeRegistry::new())
            .dispatch(args.command),
    }
}

/// Registry and engine over a simulated bus.
struct Daemon<'a, C: NodeCache> {
    config: &'a DaemonConfig,
    registry: NodeRegistry<C>,
    engine: FirmwareEngine<SimulatedBus>,
}

impl<'a, C: NodeCache> Daemon<'a, C> {
    fn new(config: &'a DaemonConfig, registry: NodeRegistry<C>) -> Self {
        Self {
            config,
            registry,
            engine: FirmwareEngine::new(SimulatedBus::with_timeout(config.request_timeout())),
        }
    }

    fn dispatch(&self, command: Command) -> Result<()> {
        match command {
            Command::Nodes => self.nodes(),
            Command::Upload {
                udid,
                image,
                offset,
            } => self.upload(udid, &image, offset),
            Command::Download {
                udid,
                output,
                limit,
            } => self.download(udid, &output, limit),
        }
    }

    /// Register `udid` and put it on the bus.
    fn connect(&self, udid: Udid) -> Result<Arc<Node>> {
        let node = self
            .registry
            .register(udid)
            .with_context(|| format!("registering {udid}"))?;
        self.engine.transport().attach(node.id(), node.udid());
        Ok(node)
    }

    fn nodes(&self) -> Result<()> {
        for udid in &self.config.nodes {
            self.connect(*udid)?;
        }
        info!(count = self.registry.len(), "Nodes online");

        self.registry.each(|node| {
            println!("{:>4}  {}  {}", node.id().get(), node.udid(), node.state());
        });
        Ok(())
    }

    fn upload(&self, udid: Udid, path: &Path, offset: u32) -> Result<()> {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        info!(path = %path.display(), bytes = data.len(), "Loaded firmware image");

        let node = self.connect(udid)?;
        let mut op = FirmwareOperation::upload(FirmwareImage::from_binary(offset, data), &TracingSink);
        self.engine.execute(&node, &mut op)?;
        Ok(())
    }

    fn download(&self, udid: Udid, path: &Path, limit: Option<u32>) -> Result<()> {
        let node = self.connect(udid)?;

        let mut image = FirmwareImage::new();
        image.set_limit(limit);
        let mut op = FirmwareOperation::download(image, &TracingSink);
        self.engine.execute(&node, &mut op)?;

        let bytes = op.image.contiguous_bytes();
        let base = op.image.base_address();
        std::fs::write(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
        info!(
            path = %path.display(),
            bytes = bytes.len(),
            base = %format!("0x{:x}", base),
            "Saved firmware image"
        );
        if base != FLASH_APP_ORIGIN {
            warn!(base, "Image does not start at the application origin");
        }
        Ok(())
    }
}
