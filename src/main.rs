use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mq_publisher::config::{self, CONFIG_FILE_NAME};
use mq_publisher::{env, Batch, Publisher};

const USAGE: &str = "usage:
  mq-publish init [path]
  mq-publish <alias> [--connection <name>] [--direct] [--single]

Reads messages from stdin, one per line, and publishes them as one batch.
--single publishes all of stdin as a single message.
--direct skips the exchange and addresses the queue by name.";

struct Args {
    alias: String,
    connection: Option<String>,
    direct: bool,
    single: bool,
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<Args> {
    let alias = raw.next().ok_or_else(|| anyhow!("missing queue alias\n\n{}", USAGE))?;
    let mut args = Args {
        alias,
        connection: None,
        direct: false,
        single: false,
    };

    while let Some(flag) = raw.next() {
        match flag.as_str() {
            "--connection" => {
                args.connection = Some(raw.next().ok_or_else(|| anyhow!("--connection needs a name"))?);
            }
            "--direct" => args.direct = true,
            "--single" => args.single = true,
            other => return Err(anyhow!("unknown argument {}\n\n{}", other, USAGE)),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut raw = std::env::args().skip(1).peekable();
    if raw.peek().map(String::as_str) == Some("init") {
        raw.next();
        let path = raw.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        config::create_default_config_file(&path)?;
        println!("Configuration file created at: {}", path.display());
        return Ok(());
    }
    let args = parse_args(raw)?;

    let mut settings = config::load_config()?;
    env::apply_env_overrides(&mut settings)?;
    let mut publisher = Publisher::with_lapin(settings)?;

    if let Some(name) = &args.connection {
        publisher.connection(name).await?;
    }

    if args.single {
        let mut body = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut body)
            .await
            .context("Failed to read message from stdin")?;
        publisher.publish_with(body, &args.alias, args.direct).await?;
        info!(alias = %args.alias, "Published 1 message");
    } else {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut messages = Vec::new();
        while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
            if !line.is_empty() {
                messages.push(line.into_bytes());
            }
        }
        let sent = publisher
            .batch_publish_with(Batch::Materialized(messages), &args.alias, args.direct)
            .await?;
        info!(alias = %args.alias, messages = sent, "Published batch");
    }

    publisher.close(args.connection.as_deref()).await?;
    Ok(())
}
