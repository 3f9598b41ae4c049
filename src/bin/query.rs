use anyhow::Result;
use clap::{Parser, Subcommand};
use purchase_tracker::config::Config;
use purchase_tracker::query::commands::{
    PurchaseQuery, cmd_balance, cmd_purchases, cmd_stats, cmd_top_buyers,
};
use purchase_tracker::query::formatters::OutputFormat;
use purchase_tracker::repository::{BalanceRepository, Database, PurchaseRepository};

#[derive(Parser)]
#[command(name = "query")]
#[command(about = "Query indexed token sale purchases", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "table")]
    format: String,

    /// Display precision of token amounts.
    #[arg(long, env = "TOKEN_DECIMALS", default_value = "18")]
    decimals: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Balance {
        address: String,
    },
    Purchases {
        #[arg(long)]
        buyer: Option<String>,

        #[arg(long, conflicts_with = "block_range")]
        block: Option<u64>,

        #[arg(long, num_args = 2, value_names = ["START", "END"])]
        block_range: Option<Vec<u64>>,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },
    TopBuyers {
        #[arg(default_value = "10")]
        count: usize,
    },
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let database_url = Config::database_url_from_env();
    let cli = Cli::parse();
    let format = OutputFormat::from(cli.format.as_str());

    let db = Database::new(&database_url)?;
    let purchase_repo = PurchaseRepository::new(&db.conn);
    let balance_repo = BalanceRepository::new(&db.conn);

    let output = match cli.command {
        Commands::Balance { address } => {
            cmd_balance(&balance_repo, &address, cli.decimals, &format)?
        }
        Commands::Purchases {
            buyer,
            block,
            block_range,
            limit,
            offset,
        } => {
            let range = block_range.and_then(|v| match v.as_slice() {
                [start, end] => Some((*start, *end)),
                _ => None,
            });
            let query = PurchaseQuery {
                buyer,
                block,
                block_range: range,
                limit,
                offset,
            };
            cmd_purchases(&purchase_repo, query, cli.decimals, &format)?
        }
        Commands::TopBuyers { count } => {
            cmd_top_buyers(&balance_repo, count, cli.decimals, &format)?
        }
        Commands::Stats => cmd_stats(&purchase_repo, cli.decimals, &format)?,
    };
    println!("{output}");

    Ok(())
}
