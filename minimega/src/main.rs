//! The minimega daemon
//!
//! One per cluster node. Brings up the mesh, the file layer, the agent
//! server, and the command socket, then serves commands until told to
//! quit.

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use minimega::handlers::{self, Context};
use minimega::{iomeshage, meshage, minicli, plumber, ron};

#[derive(Parser, Debug)]
#[command(name = "minimega", version, about = "distributed control plane for experiment fabrics")]
struct Args {
    /// Base directory for state and the command socket
    #[arg(long, default_value = "/tmp/minimega")]
    base: PathBuf,

    /// Mesh listen port
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// Mesh name; defaults to the hostname
    #[arg(long)]
    name: Option<String>,

    /// Minimum peer count to maintain
    #[arg(long, default_value_t = 0)]
    degree: usize,

    /// Experiment namespace; scopes the scratch directory
    #[arg(long, default_value = "minimega")]
    namespace: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log destination; stderr when unset
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Run one command against this daemon's handlers and exit
    #[arg(short = 'e', long = "exec")]
    exec: Option<String>,

    /// Serve without reading commands from stdin
    #[arg(long)]
    headless: bool,

    /// Agent channel TCP port; the Unix socket is always served
    #[arg(long)]
    cc_port: Option<u16>,
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, reload_handle) = reload::Layer::new(filter);

    match args.log_file.as_ref().map(std::fs::File::create) {
        Some(Ok(file)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        Some(Err(err)) => {
            eprintln!("minimega: cannot open log file: {err}");
            std::process::exit(1);
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("minimega: runtime startup failed: {err}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(args, reload_handle));
    std::process::exit(code);
}

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

async fn run(args: Args, reload_handle: ReloadHandle) -> i32 {
    let scratch = args.base.join(&args.namespace);
    for dir in [&args.base, &scratch] {
        if let Err(err) = std::fs::create_dir_all(dir) {
            error!(path = %dir.display(), %err, "cannot create base directory");
            return 1;
        }
    }

    let name = args.name.clone().unwrap_or_else(default_name);

    let config = meshage::Config::new(&name)
        .with_port(args.port)
        .with_degree(args.degree);
    let node = meshage::Node::new(config);

    if let Err(err) = node.listen(("0.0.0.0", args.port)).await {
        error!(port = args.port, %err, "mesh bind failed");
        return 1;
    }
    info!(name = %name, port = args.port, "mesh listening");

    let iom = match iomeshage::Iom::new(node.clone(), args.base.join("files")) {
        Ok(iom) => iom,
        Err(err) => {
            error!(%err, "file layer startup failed");
            return 1;
        }
    };

    let agents = match ron::Server::new(&args.base) {
        Ok(agents) => agents,
        Err(err) => {
            error!(%err, "agent server startup failed");
            return 1;
        }
    };
    // guest file staging is backed by the mesh file layer
    agents.set_files_root(iom.base());
    if let Err(err) = agents.listen_unix(args.base.join("cc")).await {
        error!(%err, "agent socket bind failed");
        return 1;
    }
    if let Some(port) = args.cc_port {
        if let Err(err) = agents.listen_tcp(("0.0.0.0", port)).await {
            error!(port, %err, "agent TCP bind failed");
            return 1;
        }
    }

    let pipes = plumber::Plumber::new();
    agents.set_plumber(pipes.clone());

    let mut ctx = Context::new(node, iom, agents, pipes);
    ctx.log_reconfig = std::sync::Arc::new(move |level| {
        let filter = EnvFilter::try_new(level).map_err(|err| err.to_string())?;
        reload_handle.reload(filter).map_err(|err| err.to_string())
    });

    let registry = match handlers::build(ctx.clone()) {
        Ok(registry) => registry,
        Err(err) => {
            error!(%err, "handler registration failed");
            return 1;
        }
    };

    // one-shot mode: run the command, print, exit
    if let Some(command) = &args.exec {
        return match registry.exec_string(command) {
            Ok(Some(mut rx)) => {
                while let Some(bundle) = rx.recv().await {
                    print!("{}", minicli::render_text(&bundle));
                }
                0
            }
            Ok(None) => 0,
            Err(err) => {
                eprintln!("minimega: {err}");
                2
            }
        };
    }

    if let Err(err) = serve_socket(&args.base, registry.clone()).await {
        error!(%err, "command socket bind failed");
        return 1;
    }

    if !args.headless {
        serve_stdin(registry.clone());
    }

    // run until a quit command or a signal
    let mut shutdown = ctx.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    0
}

/// The UDS command socket: one command per line in, one JSON bundle per
/// line out, and an empty record when the command completes
async fn serve_socket(
    base: &std::path::Path,
    registry: std::sync::Arc<minicli::Registry>,
) -> Result<(), std::io::Error> {
    let path = base.join("minimega");
    let _ = std::fs::remove_file(&path);
    let listener = tokio::net::UnixListener::bind(&path)?;
    info!(path = %path.display(), "command socket listening");

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };

            let registry = registry.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();

                while let Ok(Some(line)) = lines.next_line().await {
                    match registry.exec_string(&line) {
                        Ok(Some(mut rx)) => {
                            while let Some(bundle) = rx.recv().await {
                                let json = minicli::render_json(&bundle);
                                if write.write_all(json.as_bytes()).await.is_err() {
                                    return;
                                }
                                if write.write_all(b"\n").await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            let bundle =
                                vec![minicli::Response::error("local", err.to_string())];
                            let json = minicli::render_json(&bundle);
                            if write.write_all(json.as_bytes()).await.is_err() {
                                return;
                            }
                            if write.write_all(b"\n").await.is_err() {
                                return;
                            }
                        }
                    }

                    if write.write_all(b"\n").await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    Ok(())
}

/// The interactive loop: commands from stdin, tables to stdout
fn serve_stdin(registry: std::sync::Arc<minicli::Registry>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            match registry.exec_string(&line) {
                Ok(Some(mut rx)) => {
                    while let Some(bundle) = rx.recv().await {
                        print!("{}", minicli::render_text(&bundle));
                    }
                }
                Ok(None) => {}
                Err(err) => eprintln!("{err}"),
            }
        }
    });
}

fn default_name() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "minimega".to_string())
}
