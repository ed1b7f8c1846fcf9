//! consrv - connection and session server for a text-console subsystem
//!
//! consrv receives console I/O requests from client processes, manages the
//! session objects and process records behind them, and can hand a new
//! session off to a registered terminal instead of hosting it.
//!
//! # Quick Start
//!
//! ```text
//! consrv --self-check            # Run a scripted session on the loopback transport
//! consrv --headless --self-check # Same, as a pseudo-console host
//! ```
//!
//! # Launch flags
//!
//! | Flag | Effect |
//! |------|--------|
//! | --headless | No window; foreground rights granted to every client |
//! | --server | Host locally, never hand off |
//! | --force-no-handoff | Handoff disabled |
//! | --embedding | Started as a handoff target |
//! | --handoff-target | Terminal CLSID to delegate new sessions to |

mod config;
mod core;
mod history;
mod platform;
mod server;
mod telemetry;
#[cfg(test)]
mod testing;

use std::env;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{Config, LaunchArgs};
use crate::core::object::{AccessMask, ShareMode};
use crate::history::HistoryPool;
use crate::server::handoff::{HandoffActivator, HandoffTargetId};
use crate::server::message::{
    function, ApiMessage, ApiPayload, Completion, ConnectMessage, CreateObjectInfo, Descriptor,
    ObjectType, Reply, Request, CONNECT_MESSAGE_SIZE,
};
use crate::server::transport::LoopbackTransport;
use crate::server::{ConsoleServer, ServerOptions};
use crate::telemetry::ApiCall;

/// Parsed command line
#[derive(Debug, Default)]
struct Cli {
    launch: LaunchArgs,
    handoff_target: Option<HandoffTargetId>,
    self_check: bool,
    verbose: bool,
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("consrv {}", VERSION);
}

fn print_help() {
    eprintln!("consrv {} - Console connection and session server", VERSION);
    eprintln!();
    eprintln!("Usage: consrv [OPTIONS]");
    eprintln!();
    eprintln!("Session options:");
    eprintln!("  --headless               Run behind a pseudo-console, no window");
    eprintln!("  --server                 Host the session here, never hand off");
    eprintln!("  --force-no-handoff       Disable handoff");
    eprintln!("  --embedding              Started by another console as a handoff target");
    eprintln!("  --handoff-target <CLSID> Terminal to delegate new sessions to");
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  --self-check             Run a scripted session against the loopback transport");
    eprintln!("  -v, --verbose            Debug logging");
    eprintln!("  --version                Show version");
    eprintln!("  -h, --help               Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.consrv/config.toml");
    eprintln!("Log file:      ~/.consrv/consrv.log");
}

fn parse_args() -> Result<Cli, String> {
    let args: Vec<String> = env::args().collect();
    let mut cli = Cli::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-v" | "--verbose" => {
                cli.verbose = true;
            }
            // Session
            "--headless" => {
                cli.launch.headless = true;
            }
            "--server" => {
                cli.launch.create_server_handle = true;
            }
            "--force-no-handoff" => {
                cli.launch.force_no_handoff = true;
            }
            "--embedding" => {
                cli.launch.handoff_target = true;
            }
            "--handoff-target" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing CLSID argument".to_string());
                }
                let target = args[i]
                    .parse()
                    .map_err(|e| format!("Invalid CLSID {}: {}", args[i], e))?;
                cli.handoff_target = Some(target);
            }
            "--self-check" => {
                cli.self_check = true;
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(cli)
}

/// Install the file logger. Without a writable log file, logging is off.
fn init_logging(level: &str) {
    let log_path = config::config_dir()
        .map(|dir| dir.join("consrv.log"))
        .unwrap_or_else(|| std::path::PathBuf::from("consrv.log"));

    // Open log file (append mode)
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn activator() -> Arc<dyn HandoffActivator> {
    #[cfg(windows)]
    {
        Arc::new(platform::windows::ComHandoffActivator)
    }
    #[cfg(not(windows))]
    {
        Arc::new(server::handoff::NoActivator)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = match parse_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let config = Config::load();
    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    init_logging(level);

    info!("consrv {} starting...", VERSION);

    // Command line overrides the file
    let handoff_target = cli.handoff_target.or(config.handoff.target);
    let options = ServerOptions {
        launch: cli.launch,
        handoff_target,
        defaults: config.session.defaults(),
    };
    info!(?options, "launch options");

    if !cli.self_check {
        eprintln!("consrv: no driver transport is linked into this build.");
        eprintln!("Use --self-check to exercise the server against the loopback transport.");
        std::process::exit(1);
    }

    run_self_check(options, &config)
}

/// Drive one client through connect, object lifetime and disconnect
fn run_self_check(mut options: ServerOptions, config: &Config) -> anyhow::Result<()> {
    // The loopback transport cannot be handed to another terminal
    if !options.launch.force_no_handoff {
        warn!("self-check forces local hosting");
        options.launch.force_no_handoff = true;
    }

    let transport = Arc::new(LoopbackTransport::new());
    let server = ConsoleServer::builder(transport.clone(), platform::native())
        .options(options)
        .histories(HistoryPool::new(config.session.history_buffers))
        .activator(activator())
        .build()?;

    let pid = std::process::id();
    let mut next_id = 0u64;
    let mut descriptor = |function: u32, process: u64, object: u64| {
        next_id += 1;
        Descriptor {
            identifier: next_id,
            process,
            object,
            function,
            input_size: 0,
            output_size: 0,
        }
    };

    println!("=== consrv self-check ===\n");

    // Connect carries the pid; later requests carry the process token from the reply
    let mut connect = descriptor(function::CONNECT, u64::from(pid), 1);
    connect.input_size = CONNECT_MESSAGE_SIZE;
    let completion = server.dispatch(&ApiMessage::new(
        connect,
        Request::Connect(ConnectMessage {
            console_app: true,
            window_visible: true,
            process_group_id: pid,
            app_name: "consrv.exe".to_string(),
            ..Default::default()
        }),
    ));
    let process = report("connect", completion, &transport)
        .and_then(|reply| reply.payload.get(0..8).and_then(|b| b.try_into().ok()))
        .map(u64::from_le_bytes)
        .ok_or_else(|| anyhow::anyhow!("connect did not return a process token"))?;

    let mut opened = Vec::new();
    for (name, object_type, access) in [
        ("create input", ObjectType::Generic, AccessMask::GENERIC_READ),
        ("create output", ObjectType::Generic, AccessMask::GENERIC_WRITE),
        ("create new output", ObjectType::NewOutput, AccessMask::READ_WRITE),
    ] {
        let completion = server.dispatch(&ApiMessage::new(
            descriptor(function::CREATE_OBJECT, process, 0),
            Request::CreateObject(CreateObjectInfo::new(object_type, access, ShareMode::ALL)),
        ));
        if let Some(reply) = report(name, completion, &transport) {
            opened.push(reply.information);
        }
    }

    let completion = server.dispatch(&ApiMessage::new(
        descriptor(function::CREATE_OBJECT, process, 0),
        Request::CreateObject(CreateObjectInfo::new(
            ObjectType::Generic,
            AccessMask::READ_WRITE,
            ShareMode::ALL,
        )),
    ));
    report("create read/write generic (expected to fail)", completion, &transport);

    let completion = server.dispatch(&ApiMessage::new(
        descriptor(function::USER_DEFINED, process, 0),
        Request::Api(ApiPayload {
            api_number: 0x0100_0001,
            input: Vec::new(),
        }),
    ));
    report("api call (expected to be unsupported)", completion, &transport);

    for token in opened {
        let completion = server.dispatch(&ApiMessage::new(
            descriptor(function::CLOSE_OBJECT, process, token),
            Request::CloseObject,
        ));
        report("close", completion, &transport);
    }

    let completion = server.dispatch(&ApiMessage::new(
        descriptor(function::DISCONNECT, process, 0),
        Request::Disconnect,
    ));
    report("disconnect", completion, &transport);

    println!();
    println!("Lifecycle: {:?}", server.lifecycle());
    println!(
        "Telemetry: attach={} free={}",
        server.telemetry().count(ApiCall::AttachConsole),
        server.telemetry().count(ApiCall::FreeConsole)
    );
    server.shutdown();
    Ok(())
}

/// Print one step's outcome; returns the reply if it went through the transport
fn report(step: &str, completion: Completion, transport: &LoopbackTransport) -> Option<Reply> {
    let (reply, delivered) = match completion {
        Completion::Completed => (transport.take_completed().pop()?, true),
        Completion::Reply(reply) => (reply, false),
        other => {
            println!("{:<48} {:?}", step, other);
            return None;
        }
    };
    let outcome = if reply.status.is_success() { "ok" } else { "failed" };
    println!("{:<48} {:<6} {} info={}", step, outcome, reply.status, reply.information);
    delivered.then_some(reply)
}
