//! # Support Harness CLI (`shx`)
//!
//! The `shx` binary builds the knowledge-base index, answers one-off
//! questions from the terminal, and starts the chat server.
//!
//! ## Usage
//!
//! ```bash
//! shx --config ./config/support.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `shx index` | Scan the knowledge base, chunk, embed, and store the index |
//! | `shx ask "<question>"` | Run one question through the agent and print the answer |
//! | `shx serve` | Start the HTTP chat server |
//!
//! ## Examples
//!
//! ```bash
//! shx index --config ./config/support.toml
//! shx ask "How do I reset my password?"
//! RUST_LOG=info shx serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use support_harness::app::{build_app, run_index};
use support_harness::config;
use support_harness::graph::ChatRequest;
use support_harness::server;

/// Support Harness CLI: a retrieval-augmented customer-support agent.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/support.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "shx",
    about = "Support Harness: a retrieval-augmented customer-support agent",
    version,
    long_about = "Support Harness answers customer questions from a markdown knowledge base \
    using hybrid dense + BM25 retrieval, a semantic response cache, and tiered answer \
    generation, escalating to a human ticket queue when it cannot answer confidently."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/support.toml`. Missing sections fall back
    /// to built-in defaults.
    #[arg(long, global = true, default_value = "./config/support.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Rebuild the retrieval index from the knowledge base.
    ///
    /// Scans `[knowledge_base].root`, chunks every document, embeds the
    /// chunks with the configured provider, and replaces the stored index.
    Index,

    /// Answer a single question and print the result.
    Ask {
        /// The customer question.
        question: String,

        /// User id recorded on the ticket.
        #[arg(long)]
        user: Option<String>,

        /// Print the full outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP chat server.
    ///
    /// Binds to the address configured in `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Index => {
            let report = run_index(&cfg).await?;
            println!(
                "Indexed {} documents into {} chunks (model: {}, dims: {}).",
                report.documents, report.chunks, report.model, report.dims
            );
        }
        Commands::Ask {
            question,
            user,
            json,
        } => {
            let app = build_app(&cfg).await?;
            let mut request = ChatRequest::new(question);
            request.user_id = user;
            let outcome = app.graph.run(request).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                return Ok(());
            }

            println!("{}", outcome.response);
            println!();
            if !outcome.sources.is_empty() {
                println!("Sources: {}", outcome.sources.join(", "));
            }
            println!(
                "Intent: {} | Confidence: {:.2} | Cache hit: {} | Ticket: {}",
                outcome.intent.as_str(),
                outcome.confidence,
                outcome.cache_hit,
                outcome.ticket_id
            );
            if let Some(reason) = outcome.escalation_reason {
                println!("Escalated: {}", reason.as_str());
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
