//! zkcli - command line access to a coordination cluster
//!
//! ```text
//! zkcli --servers zk1:2181,zk2:2181 ls /
//! zkcli create /jobs/job- payload --sequential
//! zkcli set /config/flag on --version 3
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use zkclient::config::parse_host_port_spec;
use zkclient::session::spawn_logging_listener;
use zkclient::{AuthConfig, ClientConfig, CreateFlags, ZkClient, ANY_VERSION};

#[derive(Parser, Debug)]
#[command(name = "zkcli")]
#[command(about = "Command line client for ZooKeeper-style coordination clusters")]
struct Args {
    /// Comma separated host:port list (overrides the config file)
    #[arg(long, env = "ZK_SERVERS")]
    servers: Option<String>,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Requested session timeout
    #[arg(long)]
    session_timeout_ms: Option<u64>,

    /// Credentials as scheme:credentials
    #[arg(long, env = "ZK_AUTH")]
    auth: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the children of a node
    Ls { path: String },

    /// Print the value and version of a node
    Get { path: String },

    /// Replace the value of a node
    Set {
        path: String,
        data: String,

        /// Only write if the node is at this version
        #[arg(long, default_value_t = ANY_VERSION, allow_hyphen_values = true)]
        version: i32,
    },

    /// Create a node and print the path that was created
    Create {
        path: String,
        #[arg(default_value = "")]
        data: String,

        #[arg(long)]
        ephemeral: bool,

        #[arg(long)]
        sequential: bool,
    },
}

fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = if let Some(path) = &args.config {
        ClientConfig::load(path).with_context(|| format!("loading {}", path.display()))?
    } else {
        ClientConfig::default()
    };

    // Apply CLI overrides
    if let Some(servers) = &args.servers {
        config.servers = parse_host_port_spec(servers)?;
    }
    if let Some(timeout) = args.session_timeout_ms {
        config.session_timeout_ms = timeout;
    }
    if let Some(auth) = &args.auth {
        config.auth = Some(auth.parse::<AuthConfig>()?);
    }

    config.validate()?;
    Ok(config)
}

async fn run(client: &ZkClient, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ls { path } => {
            for child in client.list(&path).await? {
                println!("{}", child);
            }
        }
        Command::Get { path } => {
            let (data, stat) = client.read_with_stat(&path).await?;
            println!("{}", String::from_utf8_lossy(&data));
            println!("version = {}", stat.version);
            println!("dataLength = {}", stat.data_length);
            println!("numChildren = {}", stat.num_children);
        }
        Command::Set {
            path,
            data,
            version,
        } => {
            client.write(&path, data.as_bytes(), version).await?;
        }
        Command::Create {
            path,
            data,
            ephemeral,
            sequential,
        } => {
            let mut flags = CreateFlags::PERSISTENT;
            if ephemeral {
                flags = flags | CreateFlags::EPHEMERAL;
            }
            if sequential {
                flags = flags | CreateFlags::SEQUENTIAL;
            }
            println!("{}", client.create(&path, data.as_bytes(), flags).await?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("zkclient=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!(
        servers = %config
            .servers
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(","),
        timeout_ms = config.session_timeout_ms,
        "Connecting"
    );

    let connect_budget = config.session_timeout() + Duration::from_secs(1);
    let client = ZkClient::with_config(config)?;
    spawn_logging_listener(client.session().events());

    client
        .wait_until_connected(connect_budget)
        .await
        .context("could not connect to any server")?;
    debug!(session_id = ?client.session_id(), "Connected");

    let result = run(&client, args.command).await;
    client.close().await?;
    result
}
