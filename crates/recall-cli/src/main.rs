// ============================================================================
// recall-db — CLI for the conversation memory store
// ============================================================================
// Usage:
//   recall-db stats                                   Show store statistics
//   recall-db new-conversation --user USER            Start a conversation
//   recall-db list-conversations [--user USER]        List conversations
//   recall-db append --conversation ID --role R --text T
//   recall-db recent --conversation ID [--limit N]    Show newest messages
//   recall-db context --conversation ID --message T [--budget N]
//   recall-db reindex [--limit N]                     Retry failed indexing
//   recall-db export --format json                    Export store as JSON
// ============================================================================

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use recall_core::memory::{InMemoryIndex, OpenAiEmbeddings, VectorIndex};
use recall_core::{
    ConversationDb, EngineConfig, IndexingMode, MemoryManager, Message, Role,
};

/// Conversation memory inspection tool
#[derive(Parser)]
#[command(name = "recall-db", version, about = "Inspect and drive the conversation memory store")]
struct Cli {
    /// Path to the database file (default: ~/.recall/conversations.redb)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Use a throwaway in-process vector index instead of Qdrant
    #[arg(long, global = true)]
    in_memory_index: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store statistics (conversations, messages by embedding status)
    Stats,

    /// Start a conversation for a user
    NewConversation {
        #[arg(long)]
        user: String,
    },

    /// List conversations, optionally for one user
    ListConversations {
        #[arg(long)]
        user: Option<String>,
    },

    /// Record a message and index it
    Append {
        #[arg(long)]
        conversation: Uuid,

        /// user or assistant
        #[arg(long, default_value = "user")]
        role: String,

        #[arg(long)]
        text: String,
    },

    /// Show the newest messages of a conversation, oldest first
    Recent {
        #[arg(long)]
        conversation: Uuid,

        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Assemble the context window for an incoming message
    Context {
        #[arg(long)]
        conversation: Uuid,

        /// Incoming message text
        #[arg(long)]
        message: String,

        /// Budget in estimated tokens (default: CONTEXT_TOKEN_BUDGET)
        #[arg(long)]
        budget: Option<usize>,

        /// Print the window as JSON instead of a prompt block
        #[arg(long)]
        json: bool,
    },

    /// Retry indexing for pending and failed messages
    Reindex {
        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Export full store contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn format_timestamp(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts_ms))
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("recall_core=info".parse()?)
                .add_directive("recall_db=info".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Could not load .env file: {}", e);
        }
    }
    init_logging()?;

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env()?;
    if let Some(path) = cli.db_path {
        config.db_path = Some(path);
    }
    // The process exits right after each command
    config.indexing_mode = IndexingMode::Inline;

    match cli.command {
        Commands::Stats => cmd_stats(&open_db(&config)?),
        Commands::NewConversation { user } => cmd_new_conversation(&open_db(&config)?, &user),
        Commands::ListConversations { user } => {
            cmd_list_conversations(&open_db(&config)?, user.as_deref())
        }
        Commands::Recent {
            conversation,
            limit,
        } => cmd_recent(&open_db(&config)?, &conversation, limit),
        Commands::Export { format } => cmd_export(&open_db(&config)?, &format),
        Commands::Append {
            conversation,
            role,
            text,
        } => {
            let manager = build_manager(config, cli.in_memory_index).await?;
            cmd_append(&manager, &conversation, &role, &text).await
        }
        Commands::Context {
            conversation,
            message,
            budget,
            json,
        } => {
            let manager = build_manager(config, cli.in_memory_index).await?;
            cmd_context(&manager, &conversation, &message, budget, json).await
        }
        Commands::Reindex { limit } => {
            let manager = build_manager(config, cli.in_memory_index).await?;
            cmd_reindex(&manager, limit).await
        }
    }
}

fn open_db(config: &EngineConfig) -> Result<ConversationDb> {
    Ok(ConversationDb::open(config.db_path.as_deref())?)
}

async fn build_manager(config: EngineConfig, in_memory_index: bool) -> Result<MemoryManager> {
    if !in_memory_index {
        return Ok(MemoryManager::from_config(config).await?);
    }

    warn!("Using an in-process vector index; vectors are discarded on exit");
    let provider = Arc::new(OpenAiEmbeddings::from_config(&config)?);
    let index: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
    let db = Arc::new(ConversationDb::open(config.db_path.as_deref())?);
    Ok(MemoryManager::new(config, provider, index, db)?)
}

fn print_message(message: &Message) {
    println!(
        "{:>5}  {:<22}  {:<9}  {:<7}  {}",
        message.seq,
        format_timestamp(message.created_at),
        message.role.as_str(),
        message.embedding_status.as_str(),
        message.content.chars().take(60).collect::<String>()
    );
}

fn cmd_stats(db: &ConversationDb) -> Result<()> {
    let stats = db.stats()?;

    println!("=== Conversation Memory Stats ===");
    match db.path() {
        Some(path) => println!("Database: {}", path.display()),
        None => println!("Database: (in memory)"),
    }
    println!();
    println!("Conversations: {}", stats.total_conversations);
    println!("Messages:      {} total", stats.total_messages);
    let mut counts: Vec<_> = stats.status_counts.iter().collect();
    counts.sort();
    for (status, count) in counts {
        println!("  {:12} {}", status, count);
    }

    Ok(())
}

fn cmd_new_conversation(db: &ConversationDb, user: &str) -> Result<()> {
    let conversation = db.create_conversation(user)?;
    println!("{}", conversation.id);
    Ok(())
}

fn cmd_list_conversations(db: &ConversationDb, user: Option<&str>) -> Result<()> {
    let conversations = db.list_conversations(user)?;

    if conversations.is_empty() {
        println!("No conversations found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<22}  {}",
        "CONVERSATION ID", "USER", "LAST ACTIVITY", "MESSAGES"
    );
    println!("{}", "-".repeat(92));

    for conversation in &conversations {
        println!(
            "{:<36}  {:<20}  {:<22}  {}",
            conversation.id,
            conversation.user_id.chars().take(20).collect::<String>(),
            format_timestamp(conversation.last_activity_at),
            conversation.message_count
        );
    }

    println!("\nTotal: {} conversations", conversations.len());
    Ok(())
}

fn cmd_recent(db: &ConversationDb, conversation: &Uuid, limit: usize) -> Result<()> {
    let messages = db.get_recent(conversation, limit)?;

    if messages.is_empty() {
        println!("No messages yet.");
        return Ok(());
    }

    println!(
        "{:>5}  {:<22}  {:<9}  {:<7}  {}",
        "SEQ", "CREATED AT", "ROLE", "INDEX", "TEXT"
    );
    println!("{}", "-".repeat(90));
    for message in &messages {
        print_message(message);
    }
    Ok(())
}

async fn cmd_append(
    manager: &MemoryManager,
    conversation: &Uuid,
    role: &str,
    text: &str,
) -> Result<()> {
    let role: Role = role.parse().map_err(anyhow::Error::msg)?;
    let message = manager.append_message(conversation, role, text).await?;

    println!("{}", message.id);
    println!("seq {} | embedding {}", message.seq, message.embedding_status);
    Ok(())
}

async fn cmd_context(
    manager: &MemoryManager,
    conversation: &Uuid,
    message: &str,
    budget: Option<usize>,
    json: bool,
) -> Result<()> {
    let window = manager
        .assemble_context(conversation, message, budget)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&window)?);
        return Ok(());
    }

    if window.retrieval_degraded {
        eprintln!("Semantic recall unavailable; showing recent messages only");
    }
    print!("{}", window.format_for_prompt());
    eprintln!(
        "{} items, {}/{} tokens",
        window.len(),
        window.total_tokens,
        window.budget
    );
    Ok(())
}

async fn cmd_reindex(manager: &MemoryManager, limit: usize) -> Result<()> {
    let report = manager.reindex_failed(limit).await?;

    println!("Scanned: {}", report.scanned);
    println!("Indexed: {}", report.indexed);
    println!("Failed:  {}", report.failed);
    println!("Skipped: {}", report.skipped);
    Ok(())
}

fn cmd_export(db: &ConversationDb, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let stats = db.stats()?;
    let mut conversations = Vec::new();
    for conversation in db.list_conversations(None)? {
        let messages = db.list_messages(&conversation.id)?;
        conversations.push(serde_json::json!({
            "conversation": conversation,
            "messages": messages,
        }));
    }

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": stats,
        "conversations": conversations,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}
