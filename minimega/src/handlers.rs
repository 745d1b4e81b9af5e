//! Built-in command handlers
//!
//! Everything the daemon can be asked to do is a registered pattern:
//! mesh control, file distribution, the agent channel, pipes, logging,
//! and the fan-out form that runs an inner command across the mesh.

use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::watch;
use tracing::warn;

use minimega_iomeshage::Iom;
use minimega_meshage::Node;
use minimega_minicli::{Bundle, BundleSender, Command, Handler, Registry, Response};
use minimega_plumber::Plumber;
use minimega_ron as ron;

use crate::fanout::Fanout;

/// Everything handlers need, injected at registration; no globals
#[derive(Clone)]
pub struct Context {
    pub node: Node,
    pub iom: Iom,
    pub agents: ron::Server,
    pub plumber: Plumber,
    pub fanout: Arc<OnceLock<Fanout>>,
    pub registry: Arc<OnceLock<Arc<Registry>>>,
    pub cc_filters: Arc<Mutex<Vec<ron::Filter>>>,
    pub log_reconfig: Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>,
    pub shutdown: Arc<watch::Sender<bool>>,
}

impl Context {
    pub fn new(node: Node, iom: Iom, agents: ron::Server, plumber: Plumber) -> Self {
        Context {
            node,
            iom,
            agents,
            plumber,
            fanout: Arc::new(OnceLock::new()),
            registry: Arc::new(OnceLock::new()),
            cc_filters: Arc::new(Mutex::new(Vec::new())),
            log_reconfig: Arc::new(|_| Ok(())),
            shutdown: Arc::new(watch::channel(false).0),
        }
    }

    fn host(&self) -> String {
        self.node.name().to_string()
    }
}

async fn emit(out: &BundleSender, bundle: Bundle) {
    if out.send(bundle).await.is_err() {
        warn!("response stream closed early");
    }
}

/// Register the complete daemon command set and start the fan-out
/// service bound to it
pub fn build(ctx: Context) -> Result<Arc<Registry>, minimega_minicli::Error> {
    let mut registry = Registry::new();

    register_misc(&mut registry, &ctx)?;
    register_mesh(&mut registry, &ctx)?;
    register_file(&mut registry, &ctx)?;
    register_cc(&mut registry, &ctx)?;
    register_pipe(&mut registry, &ctx)?;

    let registry = Arc::new(registry);

    let fanout = Fanout::new(ctx.node.clone(), registry.clone());
    let _ = ctx.fanout.set(fanout);
    let _ = ctx.registry.set(registry.clone());

    Ok(registry)
}

fn register_misc(registry: &mut Registry, ctx: &Context) -> Result<(), minimega_minicli::Error> {
    let c = ctx.clone();
    registry.register(Handler::new(
        &["version"],
        "print the daemon version",
        move |_cmd, out| {
            let ctx = c.clone();
            async move {
                let resp = Response::text(ctx.host(), env!("CARGO_PKG_VERSION"));
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["host"],
        "describe this host",
        move |_cmd, out| {
            let ctx = c.clone();
            async move {
                let resp = Response::table(
                    ctx.host(),
                    vec!["name".into(), "arch".into(), "os".into()],
                    vec![vec![
                        ctx.host(),
                        std::env::consts::ARCH.to_string(),
                        std::env::consts::OS.to_string(),
                    ]],
                );
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["shell <command>..."],
        "run a command on this host and capture its output",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let argv = cmd.list_args["command"].clone();
                let host = ctx.host();

                let resp = match run_shell(&argv).await {
                    Ok((stdout, stderr, code)) if code == 0 => Response {
                        host,
                        response: stdout,
                        error: stderr_to_error(stderr, code),
                        ..Default::default()
                    },
                    Ok((stdout, stderr, code)) => Response {
                        host,
                        response: stdout,
                        error: format!("exit {code}: {stderr}"),
                        ..Default::default()
                    },
                    Err(err) => Response::error(host, err),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["log level <error,warn,info,debug,trace>"],
        "adjust the daemon log level",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let level = ["error", "warn", "info", "debug", "trace"]
                    .iter()
                    .find(|l| cmd.bool_args.contains_key(**l))
                    .copied()
                    .unwrap_or("info");

                let resp = match (ctx.log_reconfig)(level) {
                    Ok(()) => Response::text(ctx.host(), format!("log level {level}")),
                    Err(err) => Response::error(ctx.host(), err),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["help"],
        "list registered commands",
        move |_cmd, out| {
            let ctx = c.clone();
            async move {
                let rows: Vec<Vec<String>> = ctx
                    .registry
                    .get()
                    .map(|r| {
                        r.help()
                            .into_iter()
                            .map(|(pattern, help)| vec![pattern, help])
                            .collect()
                    })
                    .unwrap_or_default();

                let resp = Response::table(
                    ctx.host(),
                    vec!["pattern".into(), "help".into()],
                    rows,
                );
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["quit"],
        "shut the daemon down",
        move |_cmd, out| {
            let ctx = c.clone();
            async move {
                emit(&out, vec![Response::text(ctx.host(), "shutting down")]).await;
                let _ = ctx.shutdown.send(true);
            }
        },
    ))?;

    Ok(())
}

fn register_mesh(registry: &mut Registry, ctx: &Context) -> Result<(), minimega_minicli::Error> {
    let c = ctx.clone();
    registry.register(Handler::new(
        &["mesh status"],
        "mesh summary for this node",
        move |_cmd, out| {
            let ctx = c.clone();
            async move {
                let peers = ctx.node.peers();
                let members = ctx.node.members();

                let resp = Response::table(
                    ctx.host(),
                    vec![
                        "name".into(),
                        "degree".into(),
                        "peers".into(),
                        "members".into(),
                    ],
                    vec![vec![
                        ctx.host(),
                        ctx.node.degree().to_string(),
                        peers.join(","),
                        minimega_ranges::unsplit_list(&members),
                    ]],
                );
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["mesh list"],
        "the adjacency view",
        move |_cmd, out| {
            let ctx = c.clone();
            async move {
                let view = ctx.node.mesh();
                let mut text = String::new();
                for (name, peers) in &view {
                    let peers: Vec<String> = peers.iter().cloned().collect();
                    text.push_str(&format!("{name}: {}\n", peers.join(",")));
                }

                emit(&out, vec![Response::text(ctx.host(), text)]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["mesh degree [degree]"],
        "view or set the minimum peer count",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let resp = match cmd.string_args.get("degree") {
                    Some(raw) => match raw.parse::<usize>() {
                        Ok(degree) => {
                            ctx.node.set_degree(degree);
                            Response::text(ctx.host(), degree.to_string())
                        }
                        Err(_) => Response::error(ctx.host(), format!("bad degree: {raw}")),
                    },
                    None => Response::text(ctx.host(), ctx.node.degree().to_string()),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["mesh dial <address>"],
        "open a peering",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let addr = cmd.string_args["address"].clone();
                let resp = match ctx.node.dial(addr.as_str()).await {
                    Ok(peer) => Response::text(ctx.host(), format!("peered with {peer}")),
                    Err(err) => Response::error(ctx.host(), err.to_string()),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["mesh hangup <name>"],
        "close a peering",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let name = cmd.string_args["name"].clone();
                let resp = match ctx.node.hangup(&name).await {
                    Ok(()) => Response::text(ctx.host(), format!("hung up on {name}")),
                    Err(err) => Response::error(ctx.host(), err.to_string()),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["mesh send <recipients> (command)"],
        "run a command on a set of mesh members",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let expr = cmd.string_args["recipients"].clone();

                let hosts = if expr == "all" {
                    Ok(ctx.node.members())
                } else {
                    minimega_ranges::split_list(&expr).map_err(|e| e.to_string())
                };

                let Some(sub) = cmd.subcommand.as_deref() else {
                    emit(&out, vec![Response::error(ctx.host(), "missing command")]).await;
                    return;
                };

                let bundle = match hosts {
                    Ok(hosts) => {
                        let mut sub = sub.clone();
                        sub.scope = if expr == "all" {
                            minimega_minicli::Scope::All
                        } else {
                            minimega_minicli::Scope::Hosts(hosts.clone())
                        };

                        match ctx.fanout.get() {
                            Some(fanout) => fanout.run(hosts, &sub.canonical()).await,
                            None => vec![Response::error(ctx.host(), "fan-out unavailable")],
                        }
                    }
                    Err(err) => vec![Response::error(ctx.host(), err)],
                };

                emit(&out, bundle).await;
            }
        },
    ))?;

    Ok(())
}

fn register_file(registry: &mut Registry, ctx: &Context) -> Result<(), minimega_minicli::Error> {
    let c = ctx.clone();
    registry.register(Handler::new(
        &["file get <file>"],
        "fetch a file from the mesh into the file base",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let file = cmd.string_args["file"].clone();
                let resp = match ctx.iom.get(&file).await {
                    Ok(()) => Response::text(ctx.host(), format!("fetched {file}")),
                    Err(err) => Response::error(ctx.host(), err.to_string()),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["file list [path]"],
        "list files under the file base",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let path = cmd.string_args.get("path").cloned().unwrap_or_default();
                let resp = match ctx.iom.list(&path).await {
                    Ok(entries) => Response::table(
                        ctx.host(),
                        vec!["name".into(), "size".into(), "dir".into()],
                        entries
                            .into_iter()
                            .map(|(name, size, dir)| {
                                vec![name, size.to_string(), dir.to_string()]
                            })
                            .collect(),
                    ),
                    Err(err) => Response::error(ctx.host(), err.to_string()),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["file delete <path>"],
        "delete a file under the file base",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let path = cmd.string_args["path"].clone();
                let resp = match ctx.iom.delete(&path).await {
                    Ok(()) => Response::text(ctx.host(), format!("deleted {path}")),
                    Err(err) => Response::error(ctx.host(), err.to_string()),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["file status"],
        "in-flight transfers",
        move |_cmd, out| {
            let ctx = c.clone();
            async move {
                let rows: Vec<Vec<String>> = ctx
                    .iom
                    .status()
                    .into_iter()
                    .map(|t| {
                        vec![
                            t.name,
                            t.parts.to_string(),
                            t.received.to_string(),
                            t.queued.to_string(),
                        ]
                    })
                    .collect();

                let resp = Response::table(
                    ctx.host(),
                    vec![
                        "name".into(),
                        "parts".into(),
                        "received".into(),
                        "queued".into(),
                    ],
                    rows,
                );
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    Ok(())
}

fn register_cc(registry: &mut Registry, ctx: &Context) -> Result<(), minimega_minicli::Error> {
    let c = ctx.clone();
    registry.register(Handler::new(
        &["cc clients"],
        "connected agents",
        move |_cmd, out| {
            let ctx = c.clone();
            async move {
                let rows: Vec<Vec<String>> = ctx
                    .agents
                    .sessions()
                    .into_iter()
                    .map(|s| {
                        vec![
                            s.uuid,
                            s.hostname,
                            s.arch,
                            s.os,
                            s.ips.join(","),
                            s.macs.join(","),
                            format!("{}s", s.last_checkin.as_secs()),
                            s.active.to_string(),
                        ]
                    })
                    .collect();

                let resp = Response::table(
                    ctx.host(),
                    vec![
                        "uuid".into(),
                        "hostname".into(),
                        "arch".into(),
                        "os".into(),
                        "ip".into(),
                        "mac".into(),
                        "checkin".into(),
                        "active".into(),
                    ],
                    rows,
                );
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["cc exec <command>...", "cc background <command>..."],
        "run a command inside matching guests",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let argv = cmd.list_args["command"].clone();
                let background = cmd.tokens.get(1).map(String::as_str) == Some("background");
                let filters = ctx.cc_filters.lock().unwrap().clone();

                let kind = ron::CommandKind::Exec {
                    argv,
                    env: vec![],
                    dir: String::new(),
                    stdin: String::new(),
                    background,
                };

                let resp = match ctx.agents.exec(filters, kind).await {
                    Ok(id) => Response::text(ctx.host(), format!("command {id} submitted")),
                    Err(err) => Response::error(ctx.host(), err.to_string()),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["cc filter [filter]..."],
        "view or set the agent filter (key=value attributes, ANDed)",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let specs = cmd.list_args["filter"].clone();

                let resp = if specs.is_empty() {
                    let filters = ctx.cc_filters.lock().unwrap().clone();
                    Response::text(ctx.host(), format!("{filters:?}"))
                } else if specs == ["clear"] {
                    ctx.cc_filters.lock().unwrap().clear();
                    Response::text(ctx.host(), "filter cleared")
                } else {
                    match parse_filter(&specs) {
                        Ok(filter) => match ron::filter::validate(&[filter.clone()]) {
                            Ok(()) => {
                                ctx.cc_filters.lock().unwrap().push(filter);
                                Response::text(ctx.host(), "filter added")
                            }
                            Err(err) => Response::error(ctx.host(), err.to_string()),
                        },
                        Err(err) => Response::error(ctx.host(), err),
                    }
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["cc send <file>..."],
        "stage files into matching guests",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let files = cmd.list_args["file"].clone();
                let filters = ctx.cc_filters.lock().unwrap().clone();

                // pull each file onto this node first so the staging
                // root can serve it
                for file in &files {
                    if let Err(err) = ctx.iom.get(file).await {
                        emit(&out, vec![Response::error(ctx.host(), err.to_string())]).await;
                        return;
                    }
                }

                let resp = match ctx
                    .agents
                    .exec(filters, ron::CommandKind::FilesSend(files))
                    .await
                {
                    Ok(id) => Response::text(ctx.host(), format!("command {id} submitted")),
                    Err(err) => Response::error(ctx.host(), err.to_string()),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["cc recv <file>..."],
        "pull files out of matching guests",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let files = cmd.list_args["file"].clone();
                let filters = ctx.cc_filters.lock().unwrap().clone();

                let resp = match ctx
                    .agents
                    .exec(filters, ron::CommandKind::FilesRecv(files))
                    .await
                {
                    Ok(id) => Response::text(ctx.host(), format!("command {id} submitted")),
                    Err(err) => Response::error(ctx.host(), err.to_string()),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["cc log <level> [path]"],
        "reconfigure logging inside matching guests",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let level = cmd.string_args["level"].clone();
                let path = cmd.string_args.get("path").cloned().unwrap_or_default();
                let filters = ctx.cc_filters.lock().unwrap().clone();

                let resp = match ctx
                    .agents
                    .exec(filters, ron::CommandKind::Log { level, path })
                    .await
                {
                    Ok(id) => Response::text(ctx.host(), format!("command {id} submitted")),
                    Err(err) => Response::error(ctx.host(), err.to_string()),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["cc commands"],
        "issued agent commands",
        move |_cmd, out| {
            let ctx = c.clone();
            async move {
                let rows: Vec<Vec<String>> = ctx
                    .agents
                    .commands()
                    .into_iter()
                    .map(|c| vec![c.id.to_string(), c.kind, c.responses.to_string()])
                    .collect();

                let resp = Response::table(
                    ctx.host(),
                    vec!["id".into(), "command".into(), "responses".into()],
                    rows,
                );
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["cc responses <id>"],
        "collected responses for one agent command",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let raw = cmd.string_args["id"].clone();
                let resp = match raw.parse::<u64>() {
                    Ok(id) => {
                        let rows: Vec<Vec<String>> = ctx
                            .agents
                            .responses(id)
                            .into_iter()
                            .map(|(uuid, r)| {
                                vec![uuid, r.exit.to_string(), r.stdout, r.stderr]
                            })
                            .collect();
                        Response::table(
                            ctx.host(),
                            vec![
                                "uuid".into(),
                                "exit".into(),
                                "stdout".into(),
                                "stderr".into(),
                            ],
                            rows,
                        )
                    }
                    Err(_) => Response::error(ctx.host(), format!("bad command id: {raw}")),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["cc tunnel <uuid> <src> <host> <dst>"],
        "forward a local port through a guest's channel",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let uuid = cmd.string_args["uuid"].clone();
                let resp = match tunnel_args(&cmd) {
                    Ok((src, host, dst)) => {
                        match ctx.agents.forward(&uuid, src, &host, dst).await {
                            Ok(port) => {
                                Response::text(ctx.host(), format!("listening on {port}"))
                            }
                            Err(err) => Response::error(ctx.host(), err.to_string()),
                        }
                    }
                    Err(err) => Response::error(ctx.host(), err),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["cc rtunnel <uuid> <src> <host> <dst>"],
        "ask a guest to listen and proxy back to this side",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let uuid = cmd.string_args["uuid"].clone();
                let resp = match tunnel_args(&cmd) {
                    Ok((src, host, dst)) => {
                        match ctx.agents.reverse(&uuid, src, &host, dst).await {
                            Ok(()) => Response::text(ctx.host(), "reverse tunnel requested"),
                            Err(err) => Response::error(ctx.host(), err.to_string()),
                        }
                    }
                    Err(err) => Response::error(ctx.host(), err),
                };
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    Ok(())
}

fn register_pipe(registry: &mut Registry, ctx: &Context) -> Result<(), minimega_minicli::Error> {
    let c = ctx.clone();
    registry.register(Handler::new(
        &["pipe"],
        "named pipe status",
        move |_cmd, out| {
            let ctx = c.clone();
            async move {
                let rows: Vec<Vec<String>> = ctx
                    .plumber
                    .pipes()
                    .into_iter()
                    .map(|p| {
                        vec![
                            p.name,
                            p.mode.to_string(),
                            p.readers.to_string(),
                            p.writes.to_string(),
                            p.last.unwrap_or_default(),
                        ]
                    })
                    .collect();

                let resp = Response::table(
                    ctx.host(),
                    vec![
                        "name".into(),
                        "mode".into(),
                        "readers".into(),
                        "writes".into(),
                        "last".into(),
                    ],
                    rows,
                );
                emit(&out, vec![resp]).await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["pipe <pipe> mode <all,round-robin,random>"],
        "set a pipe's delivery mode",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let name = cmd.string_args["pipe"].clone();
                let mode = ["all", "round-robin", "random"]
                    .iter()
                    .find(|m| cmd.bool_args.contains_key(**m))
                    .copied()
                    .unwrap_or("all");

                match mode.parse() {
                    Ok(mode) => ctx.plumber.set_mode(&name, mode),
                    Err(_) => {}
                }
                emit(
                    &out,
                    vec![Response::text(ctx.host(), format!("{name} mode {mode}"))],
                )
                .await;
            }
        },
    ))?;

    let c = ctx.clone();
    registry.register(Handler::new(
        &["pipe <pipe> <data>..."],
        "write into a named pipe",
        move |cmd, out| {
            let ctx = c.clone();
            async move {
                let name = cmd.string_args["pipe"].clone();
                let data = cmd.list_args["data"].join(" ");
                ctx.plumber.write(&name, data);

                emit(&out, vec![Response::text(ctx.host(), "")]).await;
            }
        },
    ))?;

    Ok(())
}

fn stderr_to_error(stderr: String, code: i32) -> String {
    if stderr.is_empty() || code == 0 {
        String::new()
    } else {
        stderr
    }
}

async fn run_shell(argv: &[String]) -> Result<(String, String, i32), String> {
    let Some(program) = argv.first() else {
        return Err("empty command".to_string());
    };

    let output = tokio::process::Command::new(program)
        .args(&argv[1..])
        .output()
        .await
        .map_err(|err| err.to_string())?;

    Ok((
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code().unwrap_or(-1),
    ))
}

fn parse_filter(specs: &[String]) -> Result<ron::Filter, String> {
    let mut filter = ron::Filter::default();

    for spec in specs {
        let (key, value) = spec
            .split_once('=')
            .ok_or_else(|| format!("filter must be key=value: {spec}"))?;

        match key {
            "uuid" => filter.uuid = value.to_string(),
            "hostname" => filter.hostname = value.to_string(),
            "arch" => filter.arch = value.to_string(),
            "os" => filter.os = value.to_string(),
            "ip" => filter.ip = value.to_string(),
            "mac" => filter.mac = value.to_string(),
            other => return Err(format!("unknown filter attribute: {other}")),
        }
    }

    Ok(filter)
}

fn tunnel_args(cmd: &Command) -> Result<(u16, String, u16), String> {
    let src = cmd.string_args["src"]
        .parse::<u16>()
        .map_err(|_| format!("bad source port: {}", cmd.string_args["src"]))?;
    let dst = cmd.string_args["dst"]
        .parse::<u16>()
        .map_err(|_| format!("bad destination port: {}", cmd.string_args["dst"]))?;

    Ok((src, cmd.string_args["host"].clone(), dst))
}
