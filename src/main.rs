//! ragchat CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use ragchat::{
    commands::{
        cmd_delete_conversation, cmd_delete_document, cmd_history, cmd_ingest, cmd_init,
        cmd_link, cmd_list_conversations, cmd_list_documents, cmd_new_chat, cmd_query, cmd_send,
        cmd_status, cmd_unlink, print_conversation, print_conversations, print_documents,
        print_history, print_ingest_report, print_linked, print_query_results, print_status,
        print_turn, NewChatOptions,
    },
    config::Config,
    engine::Engine,
    error::Result,
    ingest::DEFAULT_CONCURRENCY,
    progress::LogWriterFactory,
};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ragchat")]
#[command(version, about = "Chat with an LLM, optionally grounded in your documents", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize ragchat configuration and database
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Ingest documents (PDF, text, markdown) or directories of them
    Ingest {
        /// Files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Documents processed at once
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,
    },

    /// Manage ingested documents
    Documents {
        #[command(subcommand)]
        action: DocumentsAction,
    },

    /// Start and drive conversations
    Chat {
        #[command(subcommand)]
        action: ChatAction,
    },

    /// Manage conversations
    Conversations {
        #[command(subcommand)]
        action: ConversationsAction,
    },

    /// Search ingested documents without generating a reply
    Query {
        /// The search query
        query: String,

        /// Only search these document IDs
        #[arg(long = "doc")]
        documents: Vec<String>,

        /// Maximum number of results
        #[arg(short = 'k', long)]
        limit: Option<usize>,
    },

    /// Show system status
    Status,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum DocumentsAction {
    /// List ingested documents
    List,

    /// Delete a document, its chunks and vectors
    Delete {
        /// Document ID (use 'ragchat documents list')
        id: String,
    },
}

#[derive(Subcommand)]
enum ChatAction {
    /// Start a new conversation
    New {
        /// Ground replies in linked documents
        #[arg(long)]
        rag: bool,

        /// Document to link (implies --rag); repeatable
        #[arg(long = "doc")]
        documents: Vec<String>,

        /// Conversation title (defaults to the first message)
        #[arg(long)]
        title: Option<String>,
    },

    /// Send a message and print the reply
    Send {
        /// Conversation ID
        conversation: String,

        /// Message text
        text: String,

        /// Print the reply as it is generated
        #[arg(long)]
        stream: bool,
    },

    /// Link documents to a RAG conversation
    Link {
        /// Conversation ID
        conversation: String,

        /// Document IDs
        #[arg(required = true)]
        documents: Vec<String>,
    },

    /// Remove a document link from a conversation
    Unlink {
        /// Conversation ID
        conversation: String,

        /// Document ID
        document: String,
    },

    /// Show recent messages
    History {
        /// Conversation ID
        conversation: String,

        /// Number of most recent messages
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ConversationsAction {
    /// List conversations, most recent first
    List,

    /// Delete a conversation and its messages (documents are kept)
    Delete {
        /// Conversation ID
        id: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        if e.is_retryable() {
            eprintln!("The request may succeed if retried.");
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory::default()))
        .with(filter)
        .init();

    // Handle init command specially (doesn't need existing config)
    if let Commands::Init { force } = cli.command {
        return handle_init(cli.config, force).await;
    }

    // Handle completions command (doesn't need config/db)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "ragchat", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let engine = Engine::open(config).await?;
    let json = cli.json;

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Ingest { paths, concurrency } => {
            let show_progress = !json;
            let engine = Engine {
                ingestor: engine.ingestor.with_progress(show_progress),
                ..engine
            };
            let report = cmd_ingest(&engine, &paths, concurrency).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_ingest_report(&report);
            }
        }

        Commands::Documents { action } => match action {
            DocumentsAction::List => {
                let documents = cmd_list_documents(&engine).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&documents)?);
                } else {
                    print_documents(&documents);
                }
            }
            DocumentsAction::Delete { id } => {
                cmd_delete_document(&engine, &id).await?;
                if json {
                    println!(r#"{{"status": "ok", "deleted": "{}"}}"#, id);
                } else {
                    println!("✓ Document '{}' deleted", id);
                }
            }
        },

        Commands::Chat { action } => handle_chat(&engine, action, json).await?,

        Commands::Conversations { action } => match action {
            ConversationsAction::List => {
                let conversations = cmd_list_conversations(&engine).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&conversations)?);
                } else {
                    print_conversations(&conversations);
                }
            }
            ConversationsAction::Delete { id } => {
                cmd_delete_conversation(&engine, &id).await?;
                if json {
                    println!(r#"{{"status": "ok", "deleted": "{}"}}"#, id);
                } else {
                    println!("✓ Conversation '{}' deleted", id);
                }
            }
        },

        Commands::Query {
            query,
            documents,
            limit,
        } => {
            let results = cmd_query(&engine, &query, &documents, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_query_results(&results);
            }
        }

        Commands::Status => {
            let status = cmd_status(&engine).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
    }

    Ok(())
}

async fn handle_chat(engine: &Engine, action: ChatAction, json: bool) -> Result<()> {
    match action {
        ChatAction::New {
            rag,
            documents,
            title,
        } => {
            let options = NewChatOptions {
                rag,
                title,
                document_ids: documents,
            };
            let conversation = cmd_new_chat(engine, options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&conversation)?);
            } else {
                print_conversation(&conversation);
            }
        }

        ChatAction::Send {
            conversation,
            text,
            stream,
        } => {
            // Streaming writes straight to stdout, which would corrupt JSON output
            let stream = stream && !json;
            let turn = cmd_send(engine, &conversation, &text, stream).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&turn)?);
            } else {
                print_turn(&turn, stream);
            }
        }

        ChatAction::Link {
            conversation,
            documents,
        } => {
            let linked = cmd_link(engine, &conversation, &documents).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&linked)?);
            } else {
                print_linked(&linked);
            }
        }

        ChatAction::Unlink {
            conversation,
            document,
        } => {
            cmd_unlink(engine, &conversation, &document).await?;
            if json {
                println!(r#"{{"status": "ok", "unlinked": "{}"}}"#, document);
            } else {
                println!("✓ Unlinked '{}'", document);
            }
        }

        ChatAction::History {
            conversation,
            limit,
        } => {
            let messages = cmd_history(engine, &conversation, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
            } else {
                print_history(&messages);
            }
        }
    }

    Ok(())
}

async fn handle_init(config: Option<PathBuf>, force: bool) -> Result<()> {
    // A .toml path names the config file; anything else is the base directory
    let base_dir = match config {
        Some(path) if path.extension().map_or(false, |e| e == "toml") => Some(
            path.parent()
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_base_dir),
        ),
        Some(path) => Some(path),
        None => None,
    };

    let config = cmd_init(base_dir, force).await?;

    println!("✓ ragchat initialized successfully");
    println!("  Config: {}", config.paths.config_file.display());
    println!("  Database: {}", config.paths.db_file.display());
    println!("\nNext steps:");
    println!("  1. Edit the config file to point at your embedding and chat endpoints");
    println!("  2. Ingest docs: ragchat ingest /path/to/report.pdf");
    println!("  3. Start a chat: ragchat chat new --doc <document-id>");

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        eprintln!(
            "Config file not found: {}\nRun 'ragchat init' first.",
            config_path.display()
        );
        std::process::exit(1);
    }

    Config::load(&config_path)
}
