use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use rsky_labeler::config::{env_str, ConfigOverrides};
use rsky_labeler::label::format_label;
use rsky_labeler::{
    FindOptions, LabelData, LabelFilter, LabelStore, LabelerConfig, LabelerServer,
    MemoryLabelStore, PostgresLabelStore, Secp256k1Signer, SignedLabel, SortOrder, APP_USER_AGENT,
};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rsky-labeler", version, about = "Issue and manage signed AT Protocol labels")]
struct Cli {
    /// Service DID used as the default label source [env: LABELER_DID]
    #[arg(long, global = true)]
    did: Option<String>,

    /// Hex-encoded secp256k1 signing key [env: LABELER_SIGNING_KEY]
    #[arg(long, global = true)]
    signing_key: Option<String>,

    /// Postgres URL [env: DATABASE_URL]
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// [env: DB_POOL_MAX_SIZE, default: 20]
    #[arg(long, global = true)]
    db_pool_max_size: Option<usize>,

    /// Page size for `after` [env: LABELER_SUBSCRIBE_LIMIT, default: 100]
    #[arg(long, global = true)]
    subscribe_limit: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create and sign a new label
    Create {
        #[arg(long)]
        uri: String,
        #[arg(long)]
        val: String,
        #[arg(long)]
        cid: Option<String>,
        #[arg(long)]
        src: Option<String>,
        #[arg(long)]
        exp: Option<String>,
        #[arg(long)]
        neg: bool,
        #[arg(long)]
        allow_expired: bool,
    },
    /// List labels matching a filter
    Query {
        /// Subject pattern; a trailing `*` matches by prefix
        #[arg(long = "uri")]
        uri_patterns: Vec<String>,
        #[arg(long = "source")]
        sources: Vec<String>,
        #[arg(long)]
        val: Option<String>,
        #[arg(long)]
        neg: Option<bool>,
        #[arg(long)]
        allow_expired: bool,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        desc: bool,
    },
    /// Fetch one label by id
    Get { id: i64 },
    /// Negate a label by appending a signed negation
    Negate { id: i64 },
    /// Flip a label's negation; only previews unless --save is given
    Reverse {
        id: i64,
        #[arg(long)]
        save: bool,
    },
    /// Labels after a cursor, in id order
    After {
        #[arg(long, default_value_t = 0)]
        cursor: i64,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the did:key for the signing key
    DidKey,
}

impl Command {
    /// Whether the command reads labels written by an earlier run. Those need
    /// Postgres, since a memory store starts empty on every invocation.
    fn reads_existing_labels(&self) -> bool {
        !matches!(self, Command::Create { .. } | Command::DidKey)
    }
}

impl Cli {
    fn config(&self) -> Result<LabelerConfig> {
        LabelerConfig::load(ConfigOverrides {
            did: self.did.clone(),
            signing_key: self.signing_key.clone(),
            database_url: self.database_url.clone(),
            db_pool_max_size: self.db_pool_max_size,
            subscribe_limit: self.subscribe_limit,
        })
    }
}

fn label_json(label: &SignedLabel) -> Result<JsonValue> {
    Ok(serde_json::to_value(format_label(label))?)
}

fn print(value: &JsonValue) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_optional(label: Option<SignedLabel>) -> Result<()> {
    match label {
        Some(label) => print(&label_json(&label)?),
        None => print(&JsonValue::Null),
    }
}

fn build_store(config: &LabelerConfig, command: &Command) -> Result<Arc<dyn LabelStore>> {
    match &config.database_url {
        Some(url) => Ok(Arc::new(PostgresLabelStore::new(
            url,
            config.db_pool_max_size,
        )?)),
        None if command.reads_existing_labels() => {
            bail!("DATABASE_URL must be set to read or modify stored labels")
        }
        None => {
            warn!("DATABASE_URL not set, the label will not be persisted");
            Ok(Arc::new(MemoryLabelStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rsky_labeler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!("Starting {APP_USER_AGENT}");

    if let Command::DidKey = cli.command {
        let key = cli
            .signing_key
            .clone()
            .or_else(|| env_str("LABELER_SIGNING_KEY"))
            .context("LABELER_SIGNING_KEY must be set")?;
        let signer = Secp256k1Signer::import(&key).await?;
        println!("{}", signer.did_key());
        return Ok(());
    }

    let config = cli.config()?;
    info!("Configuration: {:?}", config);
    let store = build_store(&config, &cli.command)?;
    let server = LabelerServer::new(config.did.clone(), config.signing_key.clone(), store);
    server.ready().await?;

    match cli.command {
        Command::Create {
            uri,
            val,
            cid,
            src,
            exp,
            neg,
            allow_expired,
        } => {
            let data = LabelData {
                val,
                uri,
                cid,
                src,
                exp,
                neg: Some(neg),
                ..Default::default()
            };
            let created = server.create_label_with_warnings(data, allow_expired).await?;
            print(&json!({
                "id": created.id,
                "label": label_json(&created.label)?,
                "warnings": created.warnings.iter().map(|w| w.message()).collect::<Vec<_>>(),
            }))?;
        }
        Command::Query {
            uri_patterns,
            sources,
            val,
            neg,
            allow_expired,
            skip,
            limit,
            desc,
        } => {
            let filter = LabelFilter {
                uri_patterns,
                sources,
                val,
                neg,
                allow_expired,
                ..Default::default()
            };
            let options = FindOptions {
                sort: if desc {
                    SortOrder::Descending
                } else {
                    SortOrder::Ascending
                },
                skip,
                limit,
            };
            let mut out = Vec::new();
            for stored in server.query_labels_with(filter, options).await? {
                out.push(json!({ "id": stored.id, "label": label_json(&stored.label)? }));
            }
            print(&JsonValue::Array(out))?;
        }
        Command::Get { id } => print_optional(server.query_label(id).await?)?,
        Command::Negate { id } => print_optional(server.delete_label(id).await?)?,
        Command::Reverse { id, save } => {
            print_optional(server.reverse_label_negation(id, save).await?)?
        }
        Command::After { cursor, limit } => {
            let limit = limit.unwrap_or(config.subscribe_limit);
            let mut out = Vec::new();
            for stored in server.get_labels_after_cursor(cursor, limit).await? {
                out.push(json!({ "seq": stored.id, "label": label_json(&stored.label)? }));
            }
            print(&JsonValue::Array(out))?;
        }
        Command::DidKey => {}
    }

    server.close().await?;
    Ok(())
}
