//! `xdpctl`: the control-tool surface, layered directly over
//! [`afxdp_core::command`]. Each subcommand resolves an interface, opens the
//! [`afxdp_core::command::Handle`] it needs, and dispatches one command —
//! there is no daemon behind this binary, so `program`/`rss` state lives
//! only for the process's own lifetime (an `xdpctl` invocation is a
//! one-shot tool, same as the `ip`/`ethtool` CLIs it imitates).
use std::ffi::CString;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use afxdp_core::command::{Handle, InterfaceCommand, ProgramCommand};
use afxdp_core::offload::{rss_hash_type, OffloadRegistry, RssConfiguration};
use afxdp_core::program::{CreateFlags, MatchPattern, MatchType, ProgramRegistry, Rule};
use afxdp_core::socket::HookId;
use afxdp_core::xsk::IfInfo;

#[derive(Parser)]
#[command(name = "xdpctl", about = "Control surface for afxdp-core interfaces and programs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Set an interface's security descriptor. A no-op on Linux: there is
    /// no SDDL concept in this kernel's ACL model, so this only logs a
    /// warning and succeeds.
    SetDeviceSddl {
        interface: String,
        sddl: String,
    },
    /// Manage RX steering programs attached to an interface queue.
    Program {
        #[command(subcommand)]
        action: ProgramAction,
    },
    /// Inspect or change an interface's RSS configuration.
    Rss {
        #[command(subcommand)]
        action: RssAction,
    },
}

#[derive(Subcommand)]
enum ProgramAction {
    /// Create an (initially empty) program at `(interface, queue)`. Use
    /// `--all-queues` to attach at the `ALL_QUEUES` wildcard instead.
    Create {
        interface: String,
        queue: u32,
        #[arg(long)]
        all_queues: bool,
    },
    Delete {
        interface: String,
        queue: u32,
        #[arg(long)]
        all_queues: bool,
    },
}

#[derive(Subcommand)]
enum RssAction {
    Get { interface: String },
    Set {
        interface: String,
        /// Hex-encoded hash secret key, e.g. `a1b2c3`.
        #[arg(long)]
        hash_key: String,
        /// Comma-separated queue indirection table, e.g. `0,1,2,3`.
        #[arg(long)]
        indirection_table: String,
    },
    Clear { interface: String },
}

fn resolve_interface(name: &str) -> Result<IfInfo, String> {
    let cname = CString::new(name).map_err(|_| "interface name contains a NUL byte".to_string())?;
    let mut info = IfInfo::invalid();
    info.from_name(&cname)
        .map_err(|err| format!("resolving interface {name:?}: {err}"))?;
    Ok(info)
}

fn parse_hex(input: &str) -> Result<Vec<u8>, String> {
    if input.len() % 2 != 0 {
        return Err("hex string must have an even number of digits".to_string());
    }
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).map_err(|_| format!("invalid hex byte at offset {i}")))
        .collect()
}

fn parse_indirection_table(input: &str) -> Result<Vec<u16>, String> {
    input
        .split(',')
        .map(|part| part.trim().parse::<u16>().map_err(|_| format!("invalid queue index {part:?}")))
        .collect()
}

fn run(cli: Cli) -> Result<(), String> {
    // Fresh per-process registries: see this binary's module doc comment.
    let offload = OffloadRegistry::new();
    let programs: Arc<ProgramRegistry> = Arc::new(ProgramRegistry::new());

    match cli.command {
        Command::SetDeviceSddl { interface, sddl } => {
            let _ = resolve_interface(&interface)?;
            log::warn!("set-device-sddl is a no-op on Linux (ignored sddl={sddl:?} for {interface})");
            Ok(())
        }
        Command::Program { action } => match action {
            ProgramAction::Create { interface, queue, all_queues } => {
                let info = resolve_interface(&interface)?;
                let flags = CreateFlags {
                    all_queues,
                    ..CreateFlags::default()
                };
                // No rules yet: this only stakes out the attachment point.
                // A real deployment would feed rules in via a config file
                // or a richer subcommand; neither is part of this surface.
                let rule = Rule::new(MatchType::All, MatchPattern::None, afxdp_core::program::Action::Pass)
                    .map_err(|err| err.to_string())?;
                let outcome = programs.create(info.ifindex(), HookId::RX_INSPECT, queue, flags, vec![rule]);
                let handle = Handle::open_program(programs.clone(), outcome.key);
                handle.dispatch_program(ProgramCommand::Get).map_err(|err| err.to_string())?;
                if outcome.superseded.is_some() {
                    log::info!("replaced existing program at {interface} queue {queue}");
                }
                println!("created program on {interface} queue {queue} (all_queues={all_queues})");
                Ok(())
            }
            ProgramAction::Delete { interface, queue, all_queues } => {
                let info = resolve_interface(&interface)?;
                let hook = HookId::RX_INSPECT;
                let key = afxdp_core::program::ProgramKey::new(info.ifindex(), hook, queue, all_queues);
                let handle = Handle::open_program(programs.clone(), key);
                handle
                    .dispatch_program(ProgramCommand::Delete)
                    .map_err(|err| err.to_string())?;
                println!("deleted program on {interface} queue {queue}");
                Ok(())
            }
        },
        Command::Rss { action } => match action {
            RssAction::Get { interface } => {
                let info = resolve_interface(&interface)?;
                let handle = Handle::open_interface(info, offload);
                match handle.dispatch_interface(InterfaceCommand::RssGet).map_err(|err| err.to_string())? {
                    afxdp_core::command::Response::RssConfiguration(Some(config)) => {
                        println!("hash_type=0x{:x} key={} table={:?}", config.hash_type, hex(&config.hash_secret_key), config.indirection_table);
                    }
                    afxdp_core::command::Response::RssConfiguration(None) => {
                        println!("no RSS configuration installed on {interface}");
                    }
                    _ => unreachable!("RssGet always answers with RssConfiguration"),
                }
                Ok(())
            }
            RssAction::Set { interface, hash_key, indirection_table } => {
                let info = resolve_interface(&interface)?;
                let config = RssConfiguration {
                    hash_type: rss_hash_type::IPV4_UDP | rss_hash_type::IPV6_UDP,
                    hash_secret_key: parse_hex(&hash_key)?,
                    indirection_table: parse_indirection_table(&indirection_table)?,
                };
                let handle = Handle::open_interface(info, offload);
                handle
                    .dispatch_interface(InterfaceCommand::RssSet(config))
                    .map_err(|err| err.to_string())?;
                println!("installed RSS configuration on {interface}");
                Ok(())
            }
            RssAction::Clear { interface } => {
                let info = resolve_interface(&interface)?;
                let handle = Handle::open_interface(info, offload);
                handle
                    .dispatch_interface(InterfaceCommand::RssClear)
                    .map_err(|err| err.to_string())?;
                println!("cleared RSS configuration on {interface}");
                Ok(())
            }
        },
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("xdpctl: {message}");
            ExitCode::FAILURE
        }
    }
}
