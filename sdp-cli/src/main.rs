//! `sdpcfg` — command line utility for the SDP configuration database.
//!
//! ```doc
//! ❯ sdpcfg create /master '{"state": "standby"}'
//! OK
//!
//! ❯ sdpcfg get /master
//! /master = {
//!   "state": "standby"
//! }
//!
//! ❯ sdpcfg list /
//! Keys with / prefix:
//! /master
//! ```
//!
//! The backend connection is picked up from the `SDP_CONFIG_*` environment
//! variables, as documented on [`sdp_config::ConfigOptions::from_env`].

mod trace;

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use sdp_config::{Config, ConfigOptions, DeleteOptions, Deployment, ProcessingBlock, WorkflowRef};
use serde_json::Value;

/// Levels searched below a path for `list -R`.
const LIST_RECURSE_DEPTH: usize = 8;

/// Generator name baked into processing block IDs created from the CLI.
const PB_GENERATOR: &str = "sdp-cli";

#[derive(Debug, Parser)]
#[command(name = "sdpcfg", version, about = "Access the SDP configuration database")]
pub struct Args {
    /// Path prefix for the high-level API
    #[clap(long = "prefix")]
    prefix: Option<String>,

    /// Cut back on unnecessary output
    #[clap(short, long)]
    quiet: bool,

    #[clap(short = 'l', long, default_value = "warn")]
    log_level: String,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the value of a key
    Get {
        path: String,

        /// Keep watching the key, printing the value after every change
        #[clap(short, long)]
        watch: bool,
    },

    /// List keys under a path prefix
    #[clap(alias = "ls")]
    List {
        /// Descend into lower levels as well
        #[clap(short = 'R', long)]
        recursive: bool,

        /// Print values alongside the keys
        #[clap(long)]
        values: bool,

        path: String,
    },

    /// Create a key, failing if it already exists ('-' reads stdin)
    Create { path: String, value: String },

    /// Overwrite an existing key ('-' reads stdin)
    Update { path: String, value: String },

    /// Delete a key, or a whole subtree
    Delete {
        /// Also delete keys at lower levels
        #[clap(short = 'R', long)]
        recursive: bool,

        path: String,
    },

    /// Create a processing block to run a workflow (given as type:id:version)
    Process { workflow: String, parameters: Option<String> },

    /// Request a deployment
    Deploy { kind: String, name: String, parameters: String },
}

fn main() -> Result<()> {
    let args = Args::parse();
    trace::init_logging(&args.log_level)?;
    info!("sdpcfg start args: {args:?}");

    let mut options = ConfigOptions::from_env()?;
    if let Some(prefix) = &args.prefix {
        options.global_prefix = prefix.clone();
    }
    let config = Config::new(options)?;
    run(&config, &args)
}

fn run(config: &Config, args: &Args) -> Result<()> {
    match &args.cmd {
        Command::Get { path, watch: false } => {
            let value = config.txn(|txn| txn.raw().get(path))?;
            print_value(path, value.as_deref(), args.quiet);
        }
        Command::Get { path, watch: true } => watch_value(config, path, args.quiet)?,
        Command::List { recursive, values, path } => {
            let depth = if *recursive { LIST_RECURSE_DEPTH } else { 0 };
            let listed = config.txn(|txn| {
                let mut listed = Vec::new();
                for key in txn.raw().list_keys(path, depth)? {
                    let value = if *values { txn.raw().get(&key)? } else { None };
                    listed.push((key, value));
                }
                Ok(listed)
            })?;
            print_listing(path, &listed, *values, args.quiet);
        }
        Command::Create { path, value } => {
            let value = read_value(value)?;
            config.txn(|txn| txn.raw().create(path, &value, None))?;
            ok(args.quiet);
        }
        Command::Update { path, value } => {
            let value = read_value(value)?;
            config.txn(|txn| txn.raw().update(path, &value))?;
            ok(args.quiet);
        }
        Command::Delete { recursive: true, path } => {
            let options = DeleteOptions {
                must_exist: false,
                recursive: true,
                prefix: path.ends_with('/'),
                ..DeleteOptions::default()
            };
            config.backend().delete(path, &options)?;
            ok(args.quiet);
        }
        Command::Delete { recursive: false, path } => {
            config.txn(|txn| txn.raw().delete(path, true))?;
            ok(args.quiet);
        }
        Command::Process { workflow, parameters } => {
            let workflow = WorkflowRef::parse(workflow)?;
            let parameters: Value = match parameters {
                Some(parameters) => serde_json::from_str(&read_value(parameters)?)
                    .context("parsing workflow parameters")?,
                None => Value::Object(Default::default()),
            };
            let pb_id = config.txn(|txn| {
                let pb_id = txn.new_processing_block_id(PB_GENERATOR)?;
                let pb = ProcessingBlock::new(&pb_id, None, workflow.clone())?
                    .with_parameters(parameters.clone());
                txn.create_processing_block(&pb)?;
                Ok(pb_id)
            })?;
            if args.quiet {
                println!("{pb_id}");
            } else {
                println!("OK, pb_id = {pb_id}");
            }
        }
        Command::Deploy { kind, name, parameters } => {
            let arguments: Value = serde_json::from_str(&read_value(parameters)?)
                .context("parsing deployment parameters")?;
            let deployment = Deployment::new(name, kind, arguments)?;
            config.txn(|txn| txn.create_deployment(&deployment))?;
            ok(args.quiet);
        }
    }
    Ok(())
}

/// Print the value every time it changes, until interrupted.
fn watch_value(config: &Config, path: &str, quiet: bool) -> Result<()> {
    let mut watcher = config.watcher(None);
    let trigger = watcher.trigger();
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
            trigger.trigger();
        })?;
    }
    while running.load(Ordering::SeqCst) {
        let value = watcher.txn(|txn| txn.raw().get(path))?;
        print_value(path, value.as_deref(), quiet);
        watcher.wait()?;
    }
    Ok(())
}

/// Take the literal value, or read it from stdin when given as '-'.
fn read_value(value: &str) -> Result<String> {
    if value != "-" {
        return Ok(value.to_owned());
    }
    let mut buffer = String::new();
    std::io::stdin().read_to_string(&mut buffer).context("reading value from stdin")?;
    Ok(buffer)
}

fn print_value(path: &str, value: Option<&str>, quiet: bool) {
    match (value, quiet) {
        (Some(value), true) => println!("{value}"),
        (Some(value), false) => println!("{path} = {value}"),
        (None, true) => {}
        (None, false) => println!("{path} does not exist"),
    }
}

fn print_listing(path: &str, listed: &[(String, Option<String>)], values: bool, quiet: bool) {
    if quiet {
        let columns: Vec<&str> = listed
            .iter()
            .map(|(key, value)| {
                if values {
                    value.as_deref().unwrap_or_default()
                } else {
                    key.as_str()
                }
            })
            .collect();
        println!("{}", columns.join(" "));
        return;
    }
    println!("Keys with {path} prefix:");
    for (key, value) in listed {
        match value {
            Some(value) => println!("{key} = {value}"),
            None => println!("{key}"),
        }
    }
}

fn ok(quiet: bool) {
    if !quiet {
        println!("OK");
    }
}
