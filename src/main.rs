//! codebox-interpreter CLI
//!
//! Usage:
//!   codebox-interpreter chat                      Interactive conversation
//!   codebox-interpreter run "<prompt>" -f data.csv One-shot request
//!   codebox-interpreter sessions list             List saved transcripts
//!   codebox-interpreter sessions show <id>        Print a saved transcript
//!   codebox-interpreter sessions delete <id>      Delete a saved transcript
//!   codebox-interpreter metrics                   Print the metric catalogue

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use codebox_interpreter::agent::{Transcript, TranscriptStore, TurnEvent};
use codebox_interpreter::config::{CodeBoxConfig, InterpreterConfig};
use codebox_interpreter::metrics::{encode_metrics, register_all};
use codebox_interpreter::tracing::{init_tracing, shutdown_tracing, DEFAULT_FILTER};
use codebox_interpreter::types::{Artifact, Turn, TurnStatus};
use codebox_interpreter::{Interpreter, MemoryPolicy};

#[derive(Parser)]
#[command(name = "codebox-interpreter")]
#[command(author, version, about = "Chat with a language model that writes and runs code")]
struct Cli {
    /// Ollama model name
    #[arg(long, global = true)]
    model: Option<String>,

    /// Ollama server URL
    #[arg(long, global = true)]
    ollama_url: Option<String>,

    /// Automatic retries allowed per turn
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Execution timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Remote code box service URL
    #[arg(long, global = true, conflicts_with = "local")]
    codebox_url: Option<String>,

    /// Run code with the host python3 even if CODEBOX_API_URL is set
    #[arg(long, global = true)]
    local: bool,

    /// History sent to the model: all, last:N, tokens:N or summarize:N
    #[arg(long, global = true)]
    memory: Option<String>,

    /// Offer the model a python tool
    #[arg(long, global = true)]
    tools: bool,

    /// Show underlying errors in failed answers
    #[arg(long, global = true)]
    detailed_errors: bool,

    /// Echo executed code and its output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// OTLP endpoint for trace export
    #[arg(long, global = true)]
    otlp: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive conversation
    Chat {
        /// Continue a saved transcript
        #[arg(long, value_name = "ID")]
        resume: Option<String>,

        /// Save the transcript when the conversation ends
        #[arg(long)]
        save: bool,

        /// Directory to write produced artifacts to
        #[arg(short, long, value_name = "DIR")]
        out: Option<PathBuf>,
    },

    /// Answer a single request
    Run {
        /// The request
        prompt: String,

        /// Files to upload before running
        #[arg(short, long = "file", value_name = "FILE")]
        files: Vec<PathBuf>,

        /// Directory to write produced artifacts to
        #[arg(short, long, value_name = "DIR")]
        out: Option<PathBuf>,

        /// Save the transcript
        #[arg(long)]
        save: bool,

        /// Print Prometheus metrics after the turn
        #[arg(long)]
        print_metrics: bool,
    },

    /// Saved transcript management
    Sessions {
        #[command(subcommand)]
        action: SessionCommands,
    },

    /// Print the Prometheus metric catalogue
    Metrics,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List saved transcripts
    List,
    /// Print a saved transcript
    Show { id: String },
    /// Delete a saved transcript
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    init_tracing("codebox-interpreter", config.otlp_endpoint.as_deref(), DEFAULT_FILTER)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))?;

    let outcome = match cli.command {
        Commands::Chat { resume, save, out } => chat(config, resume, save, out).await,
        Commands::Run {
            prompt,
            files,
            out,
            save,
            print_metrics,
        } => run(config, &prompt, &files, out, save, print_metrics).await,
        Commands::Sessions { action } => sessions(action),
        Commands::Metrics => {
            register_all();
            print!("{}", encode_metrics());
            Ok(true)
        }
    };

    shutdown_tracing();
    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Environment first, then flags
fn build_config(cli: &Cli) -> Result<InterpreterConfig> {
    let mut config = InterpreterConfig::from_env().context("invalid configuration")?;

    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    if let Some(url) = &cli.ollama_url {
        config.ollama_url = url.clone();
    }
    if let Some(retries) = cli.max_retries {
        config.max_retries = retries;
    }
    if let Some(secs) = cli.timeout {
        config.execution_timeout = std::time::Duration::from_secs(secs);
    }
    if let Some(memory) = &cli.memory {
        config.memory_policy = MemoryPolicy::parse(memory)
            .with_context(|| format!("invalid --memory value {:?}", memory))?;
    }
    if let Some(url) = &cli.codebox_url {
        let api_key = match &config.codebox {
            CodeBoxConfig::Remote { api_key, .. } => api_key.clone(),
            CodeBoxConfig::Local { .. } => None,
        };
        config.codebox = CodeBoxConfig::Remote {
            url: url.clone(),
            api_key,
            open_retries: 3,
            retry_delay_ms: 500,
        };
    }
    if cli.local {
        config.codebox = CodeBoxConfig::default();
    }
    if cli.otlp.is_some() {
        config.otlp_endpoint = cli.otlp.clone();
    }
    config.use_tools |= cli.tools;
    config.detailed_errors |= cli.detailed_errors;
    config.verbose |= cli.verbose;
    Ok(config)
}

async fn chat(
    config: InterpreterConfig,
    resume: Option<String>,
    save: bool,
    out: Option<PathBuf>,
) -> Result<bool> {
    let store = TranscriptStore::default_store().context("cannot open transcript store")?;
    let mut transcript = match &resume {
        Some(id) => store
            .load(id)
            .with_context(|| format!("cannot load transcript {}", id))?,
        None => Transcript::new(config.model.clone()),
    };

    let policy = config.memory_policy;
    let mut interpreter = Interpreter::from_config(config);
    if resume.is_some() {
        interpreter = interpreter.with_memory(transcript.to_memory(policy));
        println!("Resumed {} ({} turns)", transcript.id, transcript.turns.len());
    }
    spawn_event_printer(&mut interpreter);

    println!("Model: {}. Type /reset to start over, /exit to quit.", interpreter.model_name());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" | "exit" | "quit" => break,
            "/reset" => {
                interpreter.reset().await?;
                println!("Conversation reset.");
                continue;
            }
            _ => {}
        }

        let turn = submit_with_ctrl_c(&mut interpreter, line, vec![]).await;
        print_turn(&turn);
        save_artifacts(&turn, out.as_deref()).await?;
    }

    interpreter.close().await?;
    if save && !interpreter.memory().is_empty() {
        transcript.update(interpreter.memory());
        let path = store.save(&transcript)?;
        println!("Saved transcript {} to {}", transcript.id, path.display());
    }
    Ok(true)
}

async fn run(
    config: InterpreterConfig,
    prompt: &str,
    files: &[PathBuf],
    out: Option<PathBuf>,
    save: bool,
    print_metrics: bool,
) -> Result<bool> {
    let mut inputs = Vec::with_capacity(files.len());
    for path in files {
        inputs.push(
            Artifact::from_path(path)
                .await
                .with_context(|| format!("cannot read {}", path.display()))?,
        );
    }

    let model = config.model.clone();
    let mut interpreter = Interpreter::from_config(config);
    spawn_event_printer(&mut interpreter);

    let turn = submit_with_ctrl_c(&mut interpreter, prompt, inputs).await;
    print_turn(&turn);
    save_artifacts(&turn, out.as_deref()).await?;
    interpreter.close().await?;

    if save {
        let store = TranscriptStore::default_store().context("cannot open transcript store")?;
        let transcript = Transcript::from_memory(model, interpreter.memory());
        let path = store.save(&transcript)?;
        println!("Saved transcript {} to {}", transcript.id, path.display());
    }
    if print_metrics {
        print!("{}", encode_metrics());
    }
    Ok(turn.status == TurnStatus::Success)
}

fn sessions(action: SessionCommands) -> Result<bool> {
    let store = TranscriptStore::default_store().context("cannot open transcript store")?;
    match action {
        SessionCommands::List => {
            let summaries = store.list()?;
            if summaries.is_empty() {
                println!("No saved transcripts in {}", store.base_dir().display());
            }
            for s in summaries {
                println!(
                    "{}  {}  {:>3} turns ({} ok)  {}  {}",
                    s.id,
                    s.created_at.format("%Y-%m-%d %H:%M"),
                    s.turns,
                    s.succeeded,
                    s.model,
                    s.title
                );
            }
        }
        SessionCommands::Show { id } => {
            let transcript = store
                .load(&id)
                .with_context(|| format!("cannot load transcript {}", id))?;
            for turn in &transcript.turns {
                if let Some(request) = &turn.request {
                    println!("user> {}\n", request);
                }
                print_turn(turn);
            }
        }
        SessionCommands::Delete { id } => {
            store
                .delete(&id)
                .with_context(|| format!("cannot delete transcript {}", id))?;
            println!("Deleted {}", id);
        }
    }
    Ok(true)
}

/// Submit a request; Ctrl-C cancels the turn instead of killing the process
async fn submit_with_ctrl_c(
    interpreter: &mut Interpreter,
    text: &str,
    files: Vec<Artifact>,
) -> Turn {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let turn = interpreter.submit_cancellable(text, files, &cancel).await;
    watcher.abort();
    turn
}

/// Progress lines on stderr while a turn runs
fn spawn_event_printer(interpreter: &mut Interpreter) {
    let mut events = interpreter.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                TurnEvent::CodeBlockExecuting { index, .. } => {
                    eprintln!("[running code block {}]", index + 1)
                }
                TurnEvent::RetryTriggered { retry, .. } => {
                    eprintln!("[execution failed, retry {}]", retry)
                }
                TurnEvent::ToolCalled {
                    name, succeeded, ..
                } => {
                    let outcome = if succeeded { "done" } else { "failed" };
                    eprintln!("[tool {} {}]", name, outcome)
                }
                TurnEvent::ArtifactProduced { name, size, .. } => {
                    eprintln!("[produced {} ({} bytes)]", name, size)
                }
                _ => {}
            }
        }
    });
}

fn print_turn(turn: &Turn) {
    println!("{}", turn.render());
    for artifact in &turn.artifacts {
        println!(
            "  [artifact] {} ({}, {} bytes)",
            artifact.name,
            artifact.content_type,
            artifact.size()
        );
    }
    if turn.status != TurnStatus::Success {
        println!("  [status] {} after {} retries", turn.status.as_str(), turn.retries);
    }
    println!();
}

async fn save_artifacts(turn: &Turn, out: Option<&Path>) -> Result<()> {
    let Some(dir) = out else {
        return Ok(());
    };
    for artifact in &turn.artifacts {
        let path = artifact
            .save_to(dir)
            .await
            .with_context(|| format!("cannot save {} to {}", artifact.name, dir.display()))?;
        println!("  [saved] {}", path.display());
    }
    Ok(())
}
