#![forbid(unsafe_code)]
//! ForgeChain command line: wallets, chain inspection and the node itself.

use clap::{Parser, Subcommand};
use forgechain::blockchain::{Blockchain, UtxoSet};
use forgechain::config::{load_config_from, Config};
use forgechain::crypto;
use forgechain::error::ChainError;
use forgechain::network::{deliver, Message};
use forgechain::node::{Node, NodeContext};
use forgechain::persistence::{KvStore, SqliteStore};
use forgechain::transaction::Transaction;
use forgechain::wallet::Wallets;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; defaults to ./config.toml when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Creates a new wallet and prints its address
    Createwallet {
        #[arg(long)]
        name: Option<String>,
    },
    /// Lists the addresses in the wallet file
    Listaddresses,
    /// Creates a blockchain whose genesis reward goes to ADDRESS
    Createblockchain {
        #[arg(long)]
        address: String,
    },
    /// Prints the balance of ADDRESS
    Getbalance {
        #[arg(long)]
        address: String,
    },
    /// Prints every block from the tip back to genesis
    Printchain,
    /// Rebuilds the UTXO index
    Reindexutxo,
    /// Sends AMOUNT from one wallet address to another
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        /// Submit as a stake proposal for the next forging round
        #[arg(long)]
        stake: bool,
        /// Peer to submit to instead of the seed node
        #[arg(long)]
        node: Option<String>,
    },
    /// Starts a node
    Startnode {
        /// Run the forging loop on this node
        #[arg(long)]
        forger: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), ChainError> {
    let config = load_config_from(cli.config.as_deref())?;

    match cli.command {
        Commands::Createwallet { name } => create_wallet(&config, name),
        Commands::Listaddresses => list_addresses(&config),
        Commands::Createblockchain { address } => create_blockchain(&config, &address),
        Commands::Getbalance { address } => get_balance(config, &address),
        Commands::Printchain => print_chain(config),
        Commands::Reindexutxo => reindex_utxo(config),
        Commands::Send {
            from,
            to,
            amount,
            stake,
            node,
        } => send(config, &from, &to, amount, stake, node).await,
        Commands::Startnode { forger } => {
            let ctx = NodeContext::open(config)?;
            Node::new(Arc::new(ctx)).start(forger).await
        }
    }
}

fn require_address(address: &str) -> Result<(), ChainError> {
    if crypto::validate_address(address) {
        Ok(())
    } else {
        Err(ChainError::InvalidAddress(address.to_string()))
    }
}

fn create_wallet(config: &Config, name: Option<String>) -> Result<(), ChainError> {
    let path = config.wallet_path();
    let mut wallets = Wallets::load(&path)?;
    let address = wallets.add_new_wallet(name)?;
    wallets.save(&path)?;
    println!("New address is: {}", address);
    Ok(())
}

fn list_addresses(config: &Config) -> Result<(), ChainError> {
    let wallets = Wallets::load(config.wallet_path())?;
    for address in wallets.addresses() {
        println!("{}", address);
    }
    Ok(())
}

fn create_blockchain(config: &Config, address: &str) -> Result<(), ChainError> {
    require_address(address)?;
    let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(config.database_path())?);
    let chain = Arc::new(Blockchain::init(store, address)?);
    UtxoSet::new(chain).reindex()?;
    println!("Finished!");
    Ok(())
}

fn get_balance(config: Config, address: &str) -> Result<(), ChainError> {
    require_address(address)?;
    let ctx = NodeContext::open(config)?;
    let balance = ctx.utxo.balance(&crypto::pub_key_hash_from_address(address)?)?;
    println!("Balance of {}: {}", address, balance);
    Ok(())
}

fn print_chain(config: Config) -> Result<(), ChainError> {
    let ctx = NodeContext::open(config)?;
    for block in ctx.chain.iter() {
        let block = block?;
        println!("{}", block);
    }
    Ok(())
}

fn reindex_utxo(config: Config) -> Result<(), ChainError> {
    let ctx = NodeContext::open(config)?;
    ctx.utxo.reindex()?;
    println!(
        "Done! There are {} transactions in the UTXO set.",
        ctx.utxo.count_transactions()?
    );
    Ok(())
}

async fn send(
    config: Config,
    from: &str,
    to: &str,
    amount: u64,
    stake: bool,
    node: Option<String>,
) -> Result<(), ChainError> {
    require_address(from)?;
    require_address(to)?;

    let wallets = Wallets::load(config.wallet_path())?;
    let keypair = wallets.get(from)?.get_keypair()?;

    let target = match node {
        Some(node) => node,
        None => config
            .network
            .seed()
            .map(str::to_string)
            .ok_or_else(|| ChainError::ConfigError("No seed peer configured".to_string()))?,
    };
    let addr_from = config.network.node_address();
    let known_peers = config.network.known_peers.clone();

    let ctx = NodeContext::open(config)?;
    let transaction = Transaction::new_transfer(&keypair, from, to, amount, &ctx.utxo)?;
    let id = transaction.id_hex();

    let message = if stake {
        Message::StakeTx {
            addr_from,
            transaction,
        }
    } else {
        Message::Tx {
            addr_from,
            transaction,
        }
    };
    deliver(&known_peers, &target, &message).await?;

    println!("Sent {} to {}", id, target);
    Ok(())
}
