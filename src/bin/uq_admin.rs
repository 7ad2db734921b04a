use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uqueue::{ConfirmRequest, CreateRequest, FileStore, Queue, QueueConfig};

#[derive(Parser)]
#[command(name = "uq-admin")]
#[command(about = "Run one administrative command against a queue data directory")]
struct Cli {
    /// Directory holding the queue's key/value files
    #[arg(long)]
    data_dir: PathBuf,

    /// Optional JSON file with backup/clean intervals
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a topic, or a line when a line name is given
    Create {
        topic: String,
        line: Option<String>,
        /// Redeliver unconfirmed messages after this many milliseconds (0 disables)
        #[arg(long, default_value_t = 0)]
        recycle_ms: u64,
    },
    /// Append a message to a topic
    Push { topic: String, data: String },
    /// Pop the next message of a line ("topic/line")
    Pop { key: String },
    /// Confirm a popped message
    Confirm {
        topic: String,
        line: String,
        offset: u64,
    },
    /// Print counters for "topic" or "topic/line" as JSON
    Stat { key: String },
    /// Remove "topic" or "topic/line"
    Remove { key: String },
    /// List topics
    Topics,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => QueueConfig::load(path)?,
        None => QueueConfig::default(),
    };
    let store = FileStore::open(&cli.data_dir)
        .with_context(|| format!("open data dir {}", cli.data_dir.display()))?;
    let queue = Queue::open(Arc::new(store), config).context("load queue")?;

    let outcome = run(&queue, cli.command);
    queue.close().context("close queue")?;
    outcome
}

fn run(queue: &Queue, command: Command) -> Result<()> {
    match command {
        Command::Create {
            topic,
            line,
            recycle_ms,
        } => {
            let request = match line {
                Some(line) => CreateRequest::line(topic, line, Duration::from_millis(recycle_ms)),
                None => CreateRequest::topic(topic),
            };
            queue.create(&request)?;
            println!("created");
        }
        Command::Push { topic, data } => {
            let offset = queue.push(&topic, data.as_bytes())?;
            println!("{offset}");
        }
        Command::Pop { key } => {
            let message = queue.pop(&key)?;
            println!(
                "{}\t{}",
                message.offset,
                String::from_utf8_lossy(&message.payload)
            );
        }
        Command::Confirm {
            topic,
            line,
            offset,
        } => {
            queue.confirm(&ConfirmRequest::new(topic, line, offset))?;
            println!("confirmed");
        }
        Command::Stat { key } => {
            let stat = queue.stat(&key)?;
            println!("{}", serde_json::to_string_pretty(&stat)?);
        }
        Command::Remove { key } => {
            queue.remove(&key)?;
            println!("removed");
        }
        Command::Topics => {
            for name in queue.topics()? {
                println!("{name}");
            }
        }
    }
    Ok(())
}
