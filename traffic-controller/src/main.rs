use std::{path::PathBuf, process::exit};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use traffic_controller_common::Generation;

mod backend;
mod bandwidth;
mod commands;
mod config;
mod ebpf_loader;
mod error;
mod map_store;
mod net_stats;
mod offload;
mod rules;
mod tether_stats;
mod traffic_controller;

use backend::IptablesBackend;
use bandwidth::BandwidthController;
use commands::Dispatcher;
use config::ControllerConfig;
use offload::{OffloadReconciler, SharedReconciler};
use tether_stats::TetherFilter;
use traffic_controller::{OwnerRule, TrafficController};

#[derive(Parser)]
#[command(name = "traffic-controller")]
#[command(about = "Per-UID traffic accounting and bandwidth rule controller", long_about = None)]
struct Cli {
    /// JSON configuration file; built-in defaults are used when absent
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach the accounting programs, install the rule hooks and serve
    /// bandwidth commands read line by line from stdin
    Daemon,
    /// Run a single stateless bandwidth command, e.g. `bandwidth gts wlan0`;
    /// quota and alert commands go through the daemon
    Bandwidth {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
    /// Attribute a socket cookie to a (uid, tag)
    TagSocket { cookie: u64, tag: u32, uid: u32 },
    /// Drop the attribution of a socket cookie
    UntagSocket { cookie: u64 },
    /// Select the counter set charged for a uid
    SetCounterSet { counter_set: u32, uid: u32 },
    /// Remove tagged data for a uid; tag 0 removes everything it owns
    DeleteTagData { tag: u32, uid: u32 },
    /// Record the name of an interface index
    AddInterface { name: String, ifindex: u32 },
    /// Allow or deny one uid under an owner rule
    OwnerRule(OwnerRuleCommand),
    /// Replace the full uid list of an owner rule
    ReplaceOwnerRules {
        #[arg(value_enum)]
        rule: OwnerRule,
        uids: Vec<u32>,
    },
    /// Restrict a uid to one ingress interface; 0 lifts the restriction
    SetAllowedIif { uid: u32, ifindex: u32 },
    /// Turn an owner rule on or off for the whole system
    ToggleOwnerRule {
        #[arg(value_enum)]
        rule: OwnerRule,
        #[arg(long, action = ArgAction::SetTrue)]
        enable: bool,
    },
    /// Flip the active stats generation and print the one now readable
    SwapStatsMap,
    /// Remove tagged stats whose owner no longer has a tagged socket
    CleanStatsMap,
    /// Print every accounting table
    Dump,
    /// Print the aggregate of one uid
    UidStats { uid: u32 },
    /// Print the aggregate of one interface, or of all named interfaces
    IfaceStats { iface: Option<String> },
    /// Print detailed buckets from one stats generation
    StatsDetail(StatsDetailCommand),
    /// Print forwarding counters per tethering pair
    TetherStats {
        int_iface: Option<String>,
        ext_iface: Option<String>,
    },
}

#[derive(Args)]
struct OwnerRuleCommand {
    #[arg(value_enum)]
    rule: OwnerRule,
    uid: u32,
    /// Put the uid on the rule's list instead of taking it off
    #[arg(long, action = ArgAction::SetTrue)]
    allow: bool,
}

#[derive(Args)]
struct StatsDetailCommand {
    /// Repeat to select several interfaces
    #[arg(long = "iface", value_name = "IFACE")]
    ifaces: Vec<String>,
    #[arg(long)]
    tag: Option<u32>,
    #[arg(long)]
    uid: Option<u32>,
    #[arg(long, value_enum, default_value_t = GenerationArg::A)]
    generation: GenerationArg,
}

#[derive(Clone, Copy, ValueEnum)]
enum GenerationArg {
    A,
    B,
}

impl From<GenerationArg> for Generation {
    fn from(value: GenerationArg) -> Self {
        match value {
            GenerationArg::A => Generation::A,
            GenerationArg::B => Generation::B,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run().await {
        eprintln!("traffic-controller error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = ControllerConfig::load(cli.config.as_deref())?;

    let Some(command) = cli.command else {
        Cli::command().print_help().ok();
        println!();
        return Ok(());
    };

    match command {
        Commands::Daemon => run_daemon(config).await?,
        Commands::Bandwidth { args } => {
            let bandwidth =
                BandwidthController::new(IptablesBackend::new(&config), &config.quota_proc_dir);
            let mut dispatcher = Dispatcher::new(bandwidth, &config.tether_counters_chain);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            if let Some(value) = dispatcher.dispatch_one_shot(&args)? {
                println!("{value}");
            }
        }
        Commands::TetherStats {
            int_iface,
            ext_iface,
        } => {
            let mut bandwidth =
                BandwidthController::new(IptablesBackend::new(&config), &config.quota_proc_dir);
            let filter = TetherFilter {
                int_iface,
                ext_iface,
            };
            let stats = bandwidth.get_tether_stats(&config.tether_counters_chain, &filter)?;
            print_json(&stats)?;
        }
        Commands::TagSocket { cookie, tag, uid } => open(&config)?.tag_socket(cookie, tag, uid)?,
        Commands::UntagSocket { cookie } => open(&config)?.untag_socket(cookie)?,
        Commands::SetCounterSet { counter_set, uid } => {
            open(&config)?.set_counter_set(counter_set, uid)?
        }
        Commands::DeleteTagData { tag, uid } => open(&config)?.delete_tag_data(tag, uid)?,
        Commands::AddInterface { name, ifindex } => open(&config)?.add_interface(&name, ifindex)?,
        Commands::OwnerRule(cmd) => {
            open(&config)?.change_uid_owner_rule(cmd.rule, cmd.uid, cmd.allow)?
        }
        Commands::ReplaceOwnerRules { rule, uids } => {
            open(&config)?.replace_uid_owner_rules(rule, &uids)?
        }
        Commands::SetAllowedIif { uid, ifindex } => open(&config)?.set_allowed_iif(uid, ifindex)?,
        Commands::ToggleOwnerRule { rule, enable } => {
            open(&config)?.toggle_uid_owner_rule(rule, enable)?
        }
        Commands::SwapStatsMap => {
            let previous = open(&config)?.swap_active_stats_map()?;
            println!("{previous:?}");
        }
        Commands::CleanStatsMap => {
            let removed = open(&config)?.clean_stats_map()?;
            println!("{removed}");
        }
        Commands::Dump => print!("{}", open(&config)?.dump()?),
        Commands::UidStats { uid } => print_json(&net_stats::uid_stats(&open(&config)?, uid)?)?,
        Commands::IfaceStats { iface } => {
            print_json(&net_stats::iface_stats(&open(&config)?, iface.as_deref())?)?
        }
        Commands::StatsDetail(cmd) => {
            let filter = net_stats::DetailFilter {
                ifaces: cmd.ifaces,
                tag: cmd.tag,
                uid: cmd.uid,
            };
            let tc = open(&config)?;
            print_json(&net_stats::stats_detail(&tc, &filter, cmd.generation.into())?)?
        }
    }
    Ok(())
}

/// One-shot commands work on the maps pinned by a running daemon.
fn open(config: &ControllerConfig) -> Result<TrafficController> {
    Ok(TrafficController::attach_existing(&config.bpf_fs_root)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_daemon(config: ControllerConfig) -> Result<()> {
    let tc = TrafficController::start(&config.bpf_fs_root)?;
    // Dropping the handle detaches the programs.
    let _ebpf = if tc.is_enabled() {
        Some(ebpf_loader::load_and_attach(&config)?)
    } else {
        None
    };

    let backend = IptablesBackend::new(&config);
    let mut bandwidth = BandwidthController::new(backend.clone(), &config.quota_proc_dir);
    bandwidth
        .setup_iptables_hooks()
        .context("failed to install iptables hooks")?;

    let reconciler = SharedReconciler::new(OffloadReconciler::new(&config.hw_tether_counters_chain));
    let watcher_reconciler = reconciler.clone();
    let stats_dir = config.offload_stats_dir.clone();
    let stats_file = config.offload_stats_file.clone();
    // A plain thread so shutdown does not wait on the blocking inotify read.
    std::thread::Builder::new()
        .name("offload-watcher".to_string())
        .spawn(move || {
            if let Err(err) =
                offload::watch_offload_stats(backend, watcher_reconciler, &stats_dir, &stats_file)
            {
                warn!("offload stats watcher stopped: {err}");
            }
        })
        .context("failed to spawn offload watcher")?;

    let mut dispatcher =
        Dispatcher::new(bandwidth, &config.tether_counters_chain).with_offload(reconciler);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("traffic controller ready, reading bandwidth commands from stdin");
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    // iptables runs as a blocking child process.
                    let (returned, reply) = tokio::task::spawn_blocking(move || {
                        let reply = dispatcher.dispatch_line(&line);
                        (dispatcher, reply)
                    })
                    .await
                    .context("bandwidth command task failed")?;
                    dispatcher = returned;
                    if !reply.is_empty() {
                        println!("{reply}");
                    }
                }
                Ok(None) => {
                    info!("stdin closed, shutting down");
                    break;
                }
                Err(err) => {
                    error!("failed to read command: {err}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                break;
            }
        }
    }
    Ok(())
}
