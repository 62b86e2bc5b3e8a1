//! snapsync - incremental btrfs snapshot shipping

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{ArgAction, Parser, Subcommand};
use snapsync::btrfs::{snapshot_name, BtrfsTool};
use snapsync::config::Config;
use snapsync::producer::EncapSend;
use snapsync::protocol::ProtocolSession;
use snapsync::send_stream::{CommandKind, CommandReader, StreamOrigin};
use snapsync::server::{run_server, Repository};
use snapsync::transport::PeerConnection;
use snapsync::ParentSelector;
use tokio::fs::File;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "snapsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.config/snapsync/config.toml)
    #[arg(short, long, env = "SNAPSYNC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Snapshot a subvolume and ship it to the peer
    Backup {
        /// Mounted top level of the btrfs filesystem
        root: PathBuf,

        /// Subvolume path relative to the top level
        subvolume: String,

        /// Run this command as the peer instead of ssh
        #[arg(last = true)]
        local: Vec<String>,
    },

    /// Show which parent a backup would use, without sending anything
    Probe {
        root: PathBuf,
        subvolume: String,

        #[arg(last = true)]
        local: Vec<String>,
    },

    /// Serve a repository over stdin/stdout (run by the peer's ssh)
    Server {
        /// Repository directory
        repository: PathBuf,
    },

    /// Check a repository for nodes whose parent is missing
    Fsck {
        repository: PathBuf,

        /// Also read every stored stream and check its command checksums
        #[arg(short, long)]
        deep: bool,
    },

    /// Store btrfs send streams in a repository
    Import {
        repository: PathBuf,

        #[arg(required = true)]
        streams: Vec<PathBuf>,
    },

    /// Print the commands of one or more btrfs send streams
    Dump {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "snapsync=info",
        1 => "snapsync=debug",
        _ => "snapsync=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // stdout belongs to the protocol in server mode.
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn connect(config: &Config, local: &[String]) -> Result<PeerConnection> {
    let conn = if local.is_empty() {
        PeerConnection::connect_ssh(&config.remote)
    } else {
        PeerConnection::connect_local(local)
    };
    conn.context("Failed to start peer")
}

async fn backup(config: &Config, root: &Path, subvolume: &str, local: &[String]) -> Result<()> {
    let btrfs = BtrfsTool::new(&config.btrfs);
    let catalog = btrfs
        .load_catalog(root)
        .await
        .with_context(|| format!("Failed to list subvolumes under {}", root.display()))?;

    let (process, stdout, stdin) = connect(config, local)?.split();
    let mut session = ProtocolSession::new(stdout, stdin);

    let name = snapshot_name(subvolume, &Local::now());
    let producer = EncapSend::new(&config.encap, &config.btrfs);
    let outcome = ParentSelector::new(&catalog)
        .ship(&mut session, root, subvolume, &name, &btrfs, &producer)
        .await;
    drop(session);
    let report = process
        .finish(outcome)
        .await
        .with_context(|| format!("Backup of {} failed", subvolume))?;

    match &report.parent {
        Some(parent) => println!(
            "{}: {} bytes, incremental from {}",
            report.snapshot.display(),
            report.bytes_sent,
            parent.path
        ),
        None => println!(
            "{}: {} bytes, full",
            report.snapshot.display(),
            report.bytes_sent
        ),
    }
    Ok(())
}

async fn probe(config: &Config, root: &Path, subvolume: &str, local: &[String]) -> Result<()> {
    let catalog = BtrfsTool::new(&config.btrfs)
        .load_catalog(root)
        .await
        .with_context(|| format!("Failed to list subvolumes under {}", root.display()))?;

    let selector = ParentSelector::new(&catalog);
    let candidates = selector.candidates(subvolume)?;
    println!("{} local snapshots of {}", candidates.len(), subvolume);

    let (process, stdout, stdin) = connect(config, local)?.split();
    let mut session = ProtocolSession::new(stdout, stdin);

    let outcome = async {
        session.handshake().await?;
        let held = session.list_nodes().await?;
        println!("peer holds {} nodes", held.len());
        for node in &held {
            println!("  {}", node);
        }

        match selector.select(&mut session, subvolume).await? {
            Some(p) => println!("parent\t{}\t{}\t{}", p.uuid, p.generation, p.path),
            None => println!("parent\t-"),
        }

        let graph = session.get_graph().await?;
        println!("{}", String::from_utf8_lossy(&graph));
        session.exit().await
    }
    .await;
    drop(session);
    process
        .finish(outcome)
        .await
        .context("Probe of the peer failed")?;
    Ok(())
}

async fn fsck(repository: &Path, deep: bool, verbose: bool) -> Result<()> {
    let repo = Repository::load_from(repository)
        .await
        .with_context(|| format!("Failed to load repository {}", repository.display()))?;
    let report = repo.fsck(deep).await?;

    if verbose {
        for node in repo.nodes() {
            match repo.parent_of(&node) {
                Some(parent) => println!("{} <- {}", node, parent),
                None => println!("{}", node),
            }
        }
        for node in &report.skipped {
            println!("skipped: {}", repository.join(node.to_string()).display());
        }
    }
    for node in &report.orphans {
        println!("orphan: {}", repository.join(node.to_string()).display());
    }
    for (node, problem) in &report.problems {
        println!(
            "damaged: {}: {}",
            repository.join(node.to_string()).display(),
            problem
        );
    }

    info!(
        "{} nodes, {} orphans, {} streams verified",
        report.nodes,
        report.orphans.len(),
        report.verified
    );
    if !report.is_clean() {
        anyhow::bail!(
            "repository {} has {} orphans and {} damaged nodes",
            repository.display(),
            report.orphans.len(),
            report.problems.len()
        );
    }
    Ok(())
}

async fn import(repository: &Path, streams: &[PathBuf]) -> Result<()> {
    let mut repo = Repository::load_from(repository)
        .await
        .with_context(|| format!("Failed to load repository {}", repository.display()))?;

    for path in streams {
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let origin = repo
            .import_stream(BufReader::new(file))
            .await
            .with_context(|| format!("Failed to import {}", path.display()))?;
        match origin.parent() {
            Some(parent) => println!("{}: {} from {}", path.display(), origin.uuid(), parent),
            None => println!("{}: {} full", path.display(), origin.uuid()),
        }
    }
    Ok(())
}

async fn dump(files: &[PathBuf]) -> Result<()> {
    for path in files {
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut commands = CommandReader::open(BufReader::new(file))
            .await
            .with_context(|| format!("{} is not a send stream", path.display()))?;

        println!("{}", path.display());
        let mut index = 0usize;
        while let Some(command) = commands
            .next_verified()
            .await
            .with_context(|| format!("{}: command {}", path.display(), index))?
        {
            match command.kind() {
                CommandKind::Subvol | CommandKind::Snapshot => {
                    match StreamOrigin::from_command(&command)? {
                        StreamOrigin::Full(info) => println!(
                            "  {:?} {} uuid={} ctransid={}",
                            command.kind(),
                            String::from_utf8_lossy(&info.name),
                            info.uuid,
                            info.ctransid
                        ),
                        StreamOrigin::Incremental(info) => println!(
                            "  {:?} {} uuid={} ctransid={} clone_uuid={} clone_ctransid={}",
                            command.kind(),
                            String::from_utf8_lossy(&info.name),
                            info.uuid,
                            info.ctransid,
                            info.clone_uuid,
                            info.clone_ctransid
                        ),
                    }
                }
                _ => println!("  {:?}", command),
            }
            index += 1;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Backup {
            root,
            subvolume,
            local,
        } => backup(&config, &root, &subvolume, &local).await,
        Commands::Probe {
            root,
            subvolume,
            local,
        } => probe(&config, &root, &subvolume, &local).await,
        Commands::Server { repository } => {
            info!("server mode on {}", repository.display());
            run_server(&repository, &config.server.serve_options())
                .await
                .with_context(|| format!("Server on {} failed", repository.display()))
        }
        Commands::Fsck { repository, deep } => fsck(&repository, deep, cli.verbose > 0).await,
        Commands::Import {
            repository,
            streams,
        } => import(&repository, &streams).await,
        Commands::Dump { files } => dump(&files).await,
    }
}
