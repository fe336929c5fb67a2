use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use search_node::manager::{Config, Manager};

const EX_OK: i32 = 0;
const EX_USAGE: i32 = 64;
const EX_SOFTWARE: i32 = 70;
const EX_CANTCREAT: i32 = 73;

#[derive(Parser, Debug)]
#[command(name = "search-node", about = "Distributed search and indexing node")]
struct Args {
    /// Data directory for index storage.
    #[arg(long, default_value = "./data")]
    database: PathBuf,

    /// Write the process id here after boot.
    #[arg(long)]
    pidfile: Option<PathBuf>,

    /// Log to this file instead of stderr.
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Fork into the background.
    #[arg(long)]
    detach: bool,

    /// Drop privileges to this user id after binding.
    #[arg(long)]
    uid: Option<u32>,

    /// Drop privileges to this group id after binding.
    #[arg(long)]
    gid: Option<u32>,

    /// Address to bind every listener on.
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(long, default_value_t = 8880)]
    http_port: u16,

    #[arg(long, default_value_t = 8890)]
    binary_port: u16,

    #[arg(long, default_value_t = 8860)]
    discovery_port: u16,

    /// Seed node discovery addresses for joining an existing cluster.
    #[arg(long)]
    seed: Vec<SocketAddr>,

    /// Cluster-unique node name. Generated when omitted.
    #[arg(long)]
    name: Option<String>,

    #[arg(long, default_value_t = 0)]
    region: i32,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(EX_USAGE);
        }
    };

    if args.detach {
        detach();
    }

    if let Some(pidfile) = &args.pidfile {
        if let Err(e) = std::fs::write(pidfile, format!("{}\n", std::process::id())) {
            eprintln!("Cannot write pidfile {}: {}", pidfile.display(), e);
            std::process::exit(EX_CANTCREAT);
        }
    }

    init_logging(&args);

    if let Err(e) = drop_privileges(args.gid, args.uid) {
        eprintln!("Cannot drop privileges: {}", e);
        std::process::exit(EX_SOFTWARE);
    }

    if let Err(e) = std::fs::create_dir_all(&args.database) {
        eprintln!(
            "Cannot create data directory {}: {}",
            args.database.display(),
            e
        );
        std::process::exit(EX_CANTCREAT);
    }

    let config = Config {
        node_name: args.name.clone(),
        database: args.database.clone(),
        bind: args.bind,
        http_port: args.http_port,
        binary_port: args.binary_port,
        discovery_port: args.discovery_port,
        seeds: args.seed.clone(),
        region: args.region,
        ..Default::default()
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Cannot start runtime: {}", e);
            std::process::exit(EX_SOFTWARE);
        }
    };

    let outcome = runtime.block_on(async {
        tracing::info!("Starting node on {}", config.bind);
        if config.seeds.is_empty() {
            tracing::info!("Starting as seed node (founder)");
        } else {
            tracing::info!("Seed nodes: {:?}", config.seeds);
        }
        let manager = Manager::new(config).await?;
        tracing::info!("Node name: {}", manager.ctx.discovery.local_node.name.0);
        manager.run().await
    });

    match outcome {
        Ok(()) => std::process::exit(EX_OK),
        Err(e) => {
            tracing::error!("Fatal: {:#}", e);
            std::process::exit(EX_SOFTWARE);
        }
    }
}

fn init_logging(args: &Args) {
    let level = match args.verbosity {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    match &args.logfile {
        Some(path) => {
            let file = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("Cannot open logfile {}: {}", path.display(), e);
                    std::process::exit(EX_CANTCREAT);
                }
            };
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_max_level(level).init();
        }
    }
}

#[cfg(unix)]
fn detach() {
    unsafe {
        match libc::fork() {
            -1 => {
                eprintln!("Cannot fork");
                std::process::exit(EX_SOFTWARE);
            }
            0 => {
                libc::setsid();
            }
            _ => std::process::exit(EX_OK),
        }
    }
}

#[cfg(not(unix))]
fn detach() {
    eprintln!("--detach is not supported on this platform");
    std::process::exit(EX_USAGE);
}

#[cfg(unix)]
fn drop_privileges(gid: Option<u32>, uid: Option<u32>) -> Result<(), String> {
    // Group first: dropping uid first would lose the right to setgid.
    if let Some(gid) = gid {
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(format!("setgid({}) failed", gid));
        }
    }
    if let Some(uid) = uid {
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(format!("setuid({}) failed", uid));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(gid: Option<u32>, uid: Option<u32>) -> Result<(), String> {
    if gid.is_some() || uid.is_some() {
        return Err("--uid/--gid are not supported on this platform".to_string());
    }
    Ok(())
}
