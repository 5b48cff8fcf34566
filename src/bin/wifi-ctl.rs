//! Host command-line client for the WiFi agent.
//!
//! # Usage
//!
//! ```bash
//! # Find the agent by multicast discovery and list its methods
//! cargo run --bin wifi-ctl -- methods
//!
//! # Talk to a known address
//! cargo run --bin wifi-ctl -- --server 192.168.4.1:8080 wifi-add HomeNetwork secret123
//! cargo run --bin wifi-ctl -- --server 192.168.4.1:8080 load-file main.py
//!
//! # Any method, arguments as key=value (bare key = true, no/false = false)
//! cargo run --bin wifi-ctl -- call wifi_add ssid=Hidden password= hidden
//! ```

use clap::{Args, Parser, Subcommand};
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use wifi_agent_esp32::client::{parse_cli_args, Client, ClientError};

#[derive(Debug, Parser)]
#[command(name = "wifi-ctl")]
#[command(about = "Configure a WiFi agent over its control channel")]
struct Cli {
    /// Agent address; discovered by multicast when omitted.
    #[arg(long)]
    server: Option<SocketAddr>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the methods the agent offers.
    Methods,
    /// Register a network the agent should join.
    WifiAdd(WifiAddArgs),
    /// Make the agent redo its network selection.
    WifiReset,
    /// Upload a file.
    LoadFile(LoadFileArgs),
    /// Stop the agent and reboot the device.
    Reset,
    /// Invoke any method with key=value arguments.
    Call(CallArgs),
}

#[derive(Debug, Args)]
struct WifiAddArgs {
    ssid: String,
    #[arg(default_value = "")]
    password: String,
    #[arg(long)]
    hidden: bool,
}

#[derive(Debug, Args)]
struct LoadFileArgs {
    path: PathBuf,
}

#[derive(Debug, Args)]
struct CallArgs {
    action: String,
    args: Vec<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), ClientError> {
    let mut client = Client::connect(cli.server)?;
    info!("Connected to {}", client.server());

    match cli.command {
        Commands::Methods => {
            for signature in client.describe_methods() {
                println!("{signature}");
            }
        }
        Commands::WifiAdd(args) => {
            client.wifi_add(&args.ssid, &args.password, args.hidden)?;
            println!("Added {}", args.ssid);
        }
        Commands::WifiReset => {
            client.wifi_reset()?;
            println!("WiFi reset requested");
        }
        Commands::LoadFile(args) => {
            client.load_file(&args.path)?;
            println!("Uploaded {}", args.path.display());
        }
        Commands::Reset => {
            client.reset()?;
            println!("Reset requested");
        }
        Commands::Call(args) => {
            let reply = client.call(&args.action, parse_cli_args(&args.args))?;
            println!("{reply}");
        }
    }

    client.disconnect();
    Ok(())
}
