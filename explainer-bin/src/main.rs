use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use explainer_core::{
    accumulator::{Completion, CompletionStatus},
    config::{Config, ProviderKind},
    credentials::env_lookup,
    error::CoreResult,
    explainer::Explainer,
    prompt::Page,
    provider_factory::build_provider,
    render::{Renderer, WriterRenderer},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about = "Explain code or summarize pages with an LLM", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the configured model
    #[arg(long, global = true)]
    model: Option<String>,
    /// Override the configured provider
    #[arg(long, global = true, value_enum)]
    provider: Option<ProviderArg>,
    /// Wait for the whole answer instead of streaming it
    #[arg(long, global = true)]
    no_stream: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderArg {
    Openai,
    Ollama,
    Null,
}

impl From<ProviderArg> for ProviderKind {
    fn from(p: ProviderArg) -> Self {
        match p {
            ProviderArg::Openai => ProviderKind::OpenAI,
            ProviderArg::Ollama => ProviderKind::Ollama,
            ProviderArg::Null => ProviderKind::Null,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Explain a code snippet
    Explain {
        #[arg(short, long, conflicts_with = "code", help = "Read the snippet from a file")]
        file: Option<PathBuf>,
        #[arg(short, long, help = "Snippet given inline")]
        code: Option<String>,
    },
    /// Summarize an already scraped page
    Summarize {
        #[arg(long)]
        title: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(short, long, help = "File holding the page text")]
        file: PathBuf,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("explainer=info,explainer_core=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(model) = &cli.model {
        cfg.llm.model = model.clone();
    }
    if let Some(p) = cli.provider {
        cfg.llm.provider = p.into();
    }
    if cli.no_stream {
        cfg.stream.enabled = false;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging();

    let cfg = load_config(&cli)?;
    let provider = build_provider(&cfg, env_lookup)?;
    let explainer = Explainer::from_config(&cfg, provider);
    tracing::info!(model = explainer.model(), streaming = explainer.streaming(), "explainer ready");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let mut renderer = WriterRenderer::new(io::stdout().lock());
    let mut render_err: Option<io::Error> = None;
    let progress = |text: &str| {
        if render_err.is_none()
            && let Err(e) = renderer.update(text)
        {
            render_err = Some(e);
        }
    };

    let result = match &cli.command {
        Commands::Explain { file, code } => {
            let snippet = match (file, code) {
                (Some(path), _) => std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, Some(code)) => code.clone(),
                (None, None) => anyhow::bail!("pass --file or --code"),
            };
            explainer.explain_code(&snippet, Some(cancel), progress).await
        }
        Commands::Summarize { title, url, file } => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let page = Page {
                url: url.clone(),
                title: title.clone(),
                text,
            };
            explainer.summarize_page(&page, Some(cancel), progress).await
        }
    };
    if let Some(e) = render_err {
        return Err(e).context("writing output");
    }

    let ok = report(result, &mut renderer)?;
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Print the outcome of a run. Returns false when the run failed.
fn report(result: CoreResult<Completion>, renderer: &mut impl Renderer) -> io::Result<bool> {
    match result {
        Ok(done) => {
            let cancelled = done.status == CompletionStatus::Cancelled;
            if !(cancelled && done.text.is_empty()) {
                renderer.finish(&done.text)?;
            }
            if cancelled {
                eprintln!("[cancelled after {} bytes]", done.text.len());
            }
            Ok(true)
        }
        Err(e) => {
            let partial = e.partial_text().unwrap_or_default();
            if !partial.is_empty() {
                renderer.finish(partial)?;
            }
            eprintln!("[{}] {e} (partial: {} bytes)", e.kind(), partial.len());
            Ok(false)
        }
    }
}
