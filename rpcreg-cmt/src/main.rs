use anyhow::bail;
use clap::{Parser, Subcommand};
use rpcreg_client::conf::{RegistryConfig, RegistryConfigBuilder};
use rpcreg_client::registry::{HttpRegistry, Registry, ServiceInstance, ServiceInstanceBuilder};
use rpcreg_client::{DiscoveryResult, DiscoveryWatcher};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Address of the coordination store
    #[arg(short, long, default_value = "127.0.0.1:8500")]
    server: String,

    /// ACL token sent with every request
    #[arg(short, long)]
    token: Option<String>,

    /// Command
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a service instance with a TTL check
    Register {
        /// Instance ID
        #[arg(long)]
        id: String,
        /// Service name
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "127.0.0.1")]
        address: String,
        #[arg(long)]
        port: u16,
        /// Check TTL (seconds)
        #[arg(long, default_value_t = 10)]
        ttl: u64,
        /// Tag, may be repeated
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Remove a service instance
    Deregister {
        #[arg(required = true)]
        id: String,
    },
    /// Report the check of an instance as passing
    Pass {
        #[arg(required = true)]
        id: String,
    },
    /// Report the check of an instance as failing
    Fail {
        #[arg(required = true)]
        id: String,
    },
    /// Healthy instances of a service, one long-poll round
    Lookup {
        #[arg(required = true)]
        name: String,
        /// Block until the store index moves past this one
        #[arg(short, long, default_value_t = 0)]
        index: u64,
        /// Wait window (seconds)
        #[arg(short, long, default_value_t = 30)]
        wait: u64,
    },
    /// Follow the healthy instances of a service until interrupted
    Watch {
        #[arg(required = true)]
        name: String,
        /// Wait window (seconds)
        #[arg(short, long, default_value_t = 30)]
        wait: u64,
    },
    /// Show the command of a group
    Command {
        #[arg(required = true)]
        group: String,
    },
    /// Store a command for a group
    PushCommand {
        #[arg(required = true)]
        group: String,
        /// Command payload, usually JSON
        #[arg(required = true)]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run(Args::parse()).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    match &args.command {
        Commands::Register {
            id,
            name,
            address,
            port,
            ttl,
            tags,
        } => {
            let instance = ServiceInstanceBuilder::default()
                .id(id.as_str())
                .name(name.as_str())
                .address(address.as_str())
                .port(*port)
                .tags(tags.iter().cloned().collect::<BTreeSet<_>>())
                .ttl_seconds(*ttl)
                .build()?;
            register(&args, &instance).await?;
        }
        Commands::Deregister { id } => {
            let registry = connect(&args, 30)?;
            match registry.deregister_service(id).await {
                Ok(_) => println!(" ✅ Instance {} deregistered", id),
                Err(e) => bail!(" ❌ Failed to deregister instance {}: {}", id, e),
            }
        }
        Commands::Pass { id } => {
            let registry = connect(&args, 30)?;
            match registry.check_pass(id).await {
                Ok(_) => println!(" ✅ Check of instance {} is passing", id),
                Err(e) => bail!(" ❌ Failed to report pass for {}: {}", id, e),
            }
        }
        Commands::Fail { id } => {
            let registry = connect(&args, 30)?;
            match registry.check_fail(id).await {
                Ok(_) => println!(" ✅ Check of instance {} is critical", id),
                Err(e) => bail!(" ❌ Failed to report fail for {}: {}", id, e),
            }
        }
        Commands::Lookup { name, index, wait } => {
            let watcher = DiscoveryWatcher::new(connect(&args, *wait)?, Duration::from_secs(*wait));
            let result = watcher.lookup(name, *index).await?;
            print_result(name, &result);
        }
        Commands::Watch { name, wait } => {
            let watcher = DiscoveryWatcher::new(connect(&args, *wait)?, Duration::from_secs(*wait));
            tokio::select! {
                _ = tokio::signal::ctrl_c() => println!("stopped"),
                res = watch(&watcher, name) => res?,
            }
        }
        Commands::Command { group } => {
            let registry = connect(&args, 30)?;
            let payload = registry.lookup_command(group).await?;
            if payload.is_empty() {
                println!(" ⚠️  No command stored for group {}", group);
            } else {
                match serde_json::from_str::<Value>(&payload) {
                    Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                    Err(_) => println!("{}", payload),
                }
            }
        }
        Commands::PushCommand { group, payload } => {
            let registry = http_registry(&args, 30)?;
            match registry.put_command(group, payload).await {
                Ok(_) => println!(" ✅ Command of group {} stored", group),
                Err(e) => bail!(" ❌ Failed to store command of group {}: {}", group, e),
            }
        }
    }

    Ok(())
}

fn registry_config(args: &Args, wait: u64) -> anyhow::Result<RegistryConfig> {
    let mut builder = RegistryConfigBuilder::default();
    builder.server_addr(args.server.as_str()).wait_seconds(wait);
    if let Some(token) = &args.token {
        builder.token(token.as_str());
    }
    Ok(builder.build()?)
}

fn http_registry(args: &Args, wait: u64) -> anyhow::Result<HttpRegistry> {
    HttpRegistry::new(&registry_config(args, wait)?)
}

fn connect(args: &Args, wait: u64) -> anyhow::Result<Arc<dyn Registry>> {
    Ok(Arc::new(http_registry(args, wait)?))
}

async fn register(args: &Args, instance: &ServiceInstance) -> anyhow::Result<()> {
    println!(
        "Registering instance {} of {} at {}:{}",
        instance.id, instance.name, instance.address, instance.port
    );
    let registry = connect(args, 30)?;
    match registry.register_service(instance).await {
        Ok(_) => {
            println!(
                " ✅ Registered, report pass within {}s to make it discoverable",
                instance.ttl_seconds
            );
        }
        Err(e) => {
            bail!(" ❌ Failed to register instance {}: {}", instance.id, e);
        }
    }
    Ok(())
}

async fn watch(watcher: &DiscoveryWatcher, name: &str) -> anyhow::Result<()> {
    let mut index = 0;
    let mut last: Option<Vec<ServiceInstance>> = None;
    loop {
        match watcher.lookup(name, index).await {
            Ok(result) => {
                index = result.store_index;
                if last.as_ref() != Some(&result.instances) {
                    print_result(name, &result);
                    last = Some(result.instances);
                }
            }
            Err(e) => {
                println!(" ❌ Lookup failed: {}, retry in 1s", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[rustfmt::skip]
fn print_result(name: &str, result: &DiscoveryResult) {
    println!("┌────────────────────────────────────────────────────────────────┐");
    println!("│ Service                       : {:<30} │", name);
    println!("│ Store Index                   : {:<30} │", result.store_index);
    println!("│ Last Contact                  : {:<30} │", format!("{} ms", result.last_contact_millis));
    println!("│ Known Leader                  : {:<30} │", result.known_leader);
    println!("│                                                                │");
    println!("│ Instances:                                                     │");
    if result.instances.is_empty() {
        println!("│   (none)                                                       │");
    }
    for instance in &result.instances {
        println!("│   - {:<25} : {:<30} │", instance.id, format!("{}:{}", instance.address, instance.port));
    }
    println!("└────────────────────────────────────────────────────────────────┘");
}
