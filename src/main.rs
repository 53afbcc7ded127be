/*!
 * VRPC CLI - discover agents and call remote functions from the shell
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use vrpc::{logging, Arg, CreateOptions, RemoteConfig, StaticCall, Value, VrpcRemote};

#[derive(Parser, Debug)]
#[command(name = "vrpc")]
#[command(version, about = "Call functions and drive instances of remote VRPC agents", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Broker URL, e.g. mqtts://vrpc.io:8883
    #[arg(short, long, global = true, env = "VRPC_BROKER")]
    broker: Option<String>,

    /// Discovery domain
    #[arg(short, long, global = true)]
    domain: Option<String>,

    /// Target agent
    #[arg(short, long, global = true)]
    agent: Option<String>,

    /// Broker token
    #[arg(long, global = true, env = "VRPC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Per-call timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write JSON logs to this file instead of the terminal
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List agents and classes visible in the domain
    Info {
        /// How long to collect announcements
        #[arg(long, default_value = "2000")]
        wait_ms: u64,
    },

    /// Call a static function
    Call {
        class: String,
        function: String,
        /// Arguments: JSON values, plain strings, or $name back-references
        args: Vec<String>,
    },

    /// Create an instance, call one member function, delete the instance
    Session {
        class: String,
        instance: String,
        function: String,
        args: Vec<String>,
    },
}

impl Cli {
    fn into_parts(self) -> Result<(RemoteConfig, Command)> {
        let mut config = match &self.config {
            Some(path) => RemoteConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => RemoteConfig::default(),
        };

        if let Some(broker) = self.broker {
            config.broker = broker;
        }
        if let Some(domain) = self.domain {
            config.domain = domain;
        }
        if let Some(agent) = self.agent {
            config.agent = agent;
        }
        if let Some(token) = self.token {
            config.token = Some(token);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if self.verbose {
            config.log.verbose = true;
        }
        if self.log_file.is_some() {
            config.log.file = self.log_file;
        }

        config.validate()?;
        Ok((config, self.command))
    }
}

/// Parse one command-line argument: JSON if it parses, else a plain string
fn parse_arg(raw: &str) -> Arg {
    if raw.starts_with(vrpc::value::REFERENCE_MARKER) {
        return Arg::from_marker(raw);
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => Arg::Literal(value),
        Err(_) => Arg::Literal(Value::String(raw.to_string())),
    }
}

fn print_value(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_info(remote: &VrpcRemote, wait: Duration) -> Result<()> {
    tokio::time::sleep(wait).await;

    let agents = remote.agents().await;
    if agents.is_empty() {
        warn!("No agents announced in domain {}", remote.config().domain);
    }
    for agent in agents {
        println!(
            "{} [{}] host={} version={}",
            agent.agent,
            agent.status.as_str(),
            agent.hostname,
            agent.version
        );
        for class in &agent.classes {
            println!("  {}", class.class_name);
            println!("    static:    {}", class.static_functions.join(", "));
            println!("    member:    {}", class.member_functions.join(", "));
            if !class.instances.is_empty() {
                println!("    instances: {}", class.instances.join(", "));
            }
        }
    }
    Ok(())
}

async fn run(remote: &VrpcRemote, command: Command) -> Result<()> {
    match command {
        Command::Info { wait_ms } => run_info(remote, Duration::from_millis(wait_ms)).await,
        Command::Call {
            class,
            function,
            args,
        } => {
            let call = StaticCall::new(class, function).args(args.iter().map(|a| parse_arg(a)));
            let value = remote.call_static(call).await?;
            print_value(&value)
        }
        Command::Session {
            class,
            instance,
            function,
            args,
        } => {
            let proxy = remote
                .create(CreateOptions::new(class).instance(instance))
                .await?;
            let outcome = proxy
                .call(&function, args.iter().map(|a| parse_arg(a)).collect())
                .await;

            // Clean up the instance even if the call failed
            if let Err(e) = remote.delete(proxy.instance()).await {
                warn!("Failed to delete {}: {}", proxy.instance(), e);
            }
            print_value(&outcome?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, command) = Cli::parse().into_parts()?;

    logging::init_logging(&config.log).context("Failed to initialize logging")?;
    info!("vrpc v{}", vrpc::VERSION);

    let remote = VrpcRemote::mqtt(config)?;
    remote
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", remote.config().broker))?;

    let result = run(&remote, command).await;
    remote.disconnect().await?;
    result
}
