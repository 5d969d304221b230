//! StageKV CLI Client
//!
//! Command-line interface for interacting with a StageKV server.

use std::time::Duration;

use clap::{Parser, Subcommand};
use stagekv::StagingClient;

/// StageKV CLI
#[derive(Parser, Debug)]
#[command(name = "stagekv-cli")]
#[command(about = "CLI for the StageKV staging server")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9876")]
    server: String,

    /// Reply timeout in milliseconds (0 = wait forever)
    #[arg(short, long, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Stage a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Stage a new value for an existing key
    Update {
        /// The key to update
        key: String,

        /// The new value
        value: String,
    },

    /// Delete a key from the backing store
    Del {
        /// The key to delete
        key: String,
    },
}

fn main() {
    let args = Args::parse();
    let timeout = (args.timeout_ms > 0).then(|| Duration::from_millis(args.timeout_ms));

    if let Err(e) = execute(&args.server, timeout, args.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn execute(server: &str, timeout: Option<Duration>, command: Commands) -> stagekv::Result<()> {
    let mut client = StagingClient::connect(server, timeout)?;

    match command {
        Commands::Get { key } => match client.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Commands::Put { key, value } => {
            client.put(key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Commands::Update { key, value } => {
            client.update(key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Commands::Del { key } => {
            if client.delete(key.as_bytes())? {
                println!("(integer) 1");
            } else {
                println!("(integer) 0");
            }
        }
    }

    // CLOSE flushes anything this invocation staged.
    client.close()
}
