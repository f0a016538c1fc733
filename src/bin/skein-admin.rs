use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;

use skein::api::paths;
use skein::api::{ApiMessage, ManagerList, NodeList};

#[derive(Parser)]
#[command(name = "skein-admin")]
#[command(about = "Skein cluster administration tool")]
struct Cli {
    /// Base URL of a node's admin API
    #[arg(long, env = "SKEIN_ADMIN_URL", default_value = "http://127.0.0.1:9651")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the cluster managers a node runs
    Managers,
    /// Show every configured peer of a manager
    Nodes {
        /// Name of the manager (the node name)
        #[arg(long)]
        manager: String,
    },
    /// Drop a connection so it is dialed again
    Reconnect {
        #[arg(long)]
        manager: String,
        /// Peer whose connection is dropped
        #[arg(long)]
        node: String,
        /// Shared secret of the cluster
        #[arg(long, env = "SKEIN_SECRET", hide_env_values = true)]
        secret: String,
    },
    /// Ask a peer to shut its side down
    Down {
        #[arg(long)]
        manager: String,
        #[arg(long)]
        node: String,
        #[arg(long, env = "SKEIN_SECRET", hide_env_values = true)]
        secret: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let base = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Managers => list_managers(&client, &base).await?,
        Commands::Nodes { manager } => list_nodes(&client, &base, &manager).await?,
        Commands::Reconnect {
            manager,
            node,
            secret,
        } => admin(&client, &base, &manager, "reconnect", &node, &secret).await?,
        Commands::Down {
            manager,
            node,
            secret,
        } => admin(&client, &base, &manager, "down", &node, &secret).await?,
    }

    Ok(())
}

async fn list_managers(client: &Client, base: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}{}", base, paths::cluster::MANAGERS);
    let response = client.get(&url).send().await?.error_for_status()?;
    let message: ApiMessage<ManagerList> = response.json().await?;
    for manager in message.data.managers {
        println!("{}", manager);
    }
    Ok(())
}

async fn list_nodes(
    client: &Client,
    base: &str,
    manager: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}{}", base, paths::nodes_path(manager));
    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(describe_failure(response).await.into());
    }
    let message: ApiMessage<NodeList> = response.json().await?;
    let list = message.data;

    println!("{} (quorum: {})", list.manager, list.quorum);
    for node in list.nodes {
        let joined = node
            .join_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<16} {:<24} {:<15} joined {} lag {} ms packets {}{}",
            node.name,
            node.addr,
            node.status,
            joined,
            node.lag_ms,
            node.packets,
            node.error.map(|e| format!(" error: {}", e)).unwrap_or_default()
        );
    }
    Ok(())
}

async fn admin(
    client: &Client,
    base: &str,
    manager: &str,
    action: &str,
    node: &str,
    secret: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}{}", base, paths::admin_path(manager, action, node));
    let response = client.post(&url).bearer_auth(secret).send().await?;
    if !response.status().is_success() {
        return Err(describe_failure(response).await.into());
    }
    println!("{} requested for {} on {}", action, node, manager);
    Ok(())
}

async fn describe_failure(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<Value>().await {
        Ok(body) => format!(
            "HTTP {}: {}",
            status,
            body["error"]["message"].as_str().unwrap_or("unknown error")
        ),
        Err(_) => format!("HTTP {}", status),
    }
}
