use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use regionqa::chat::ChatService;
use regionqa::config::AppConfig;
use regionqa::embedder::OllamaEmbedder;
use regionqa::geometry::Rect;
use regionqa::index::BuildOutcome;
use regionqa::ollama::OllamaClient;
use regionqa::providers::{AnswerClient, AnswerProvider};
use regionqa::render::PopplerRenderer;
use regionqa::retrieval::Retriever;
use regionqa::session::DocumentSession;

#[derive(Parser, Debug)]
#[command(name = "ask")]
#[command(about = "Ask a question about a region of a PDF page")]
struct Cli {
    #[arg(long)]
    pdf: String,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 1.0)]
    scale: f32,
    /// Selection in canvas pixels at `--scale`, as `x,y,width,height`.
    #[arg(long, value_parser = parse_rect)]
    rect: Option<Rect>,
    #[arg(long)]
    question: String,
    /// Skip the semantic index and answer from the selection alone.
    #[arg(long, default_value_t = false)]
    no_index: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let renderer = PopplerRenderer::open(&cli.pdf).await?;
    let mut session = DocumentSession::new(config.selection.clone());
    session.load_document(renderer);

    let embedder = OllamaEmbedder::new(
        OllamaClient::new(config.ollama_base_url.clone()),
        config.embedding_model.clone(),
    );
    let build = session.spawn_index_build(
        (!cli.no_index).then(|| embedder.clone()),
        config.retrieval.chunk_target_chars,
    );

    session
        .show_page(cli.page, cli.scale)
        .with_context(|| format!("cannot render page {} of {}", cli.page, cli.pdf))?;
    let frame = session.rendered().await.context("page render failed")?;
    println!(
        "Rendered page {}/{} at {:.2}x ({} bytes, {} text runs)",
        frame.page,
        session.page_count(),
        frame.scale,
        frame.bitmap.len(),
        frame.text.runs.len()
    );

    if let Some(rect) = cli.rect {
        session.pointer_down(rect.x, rect.y);
        session.pointer_move(rect.right(), rect.bottom());
        session.pointer_up(rect.right(), rect.bottom());
    }
    let excerpt = session.excerpt().to_string();

    if let Some(build) = build {
        match build.await.context("index build task failed")? {
            BuildOutcome::Built { chunks } => println!("Indexed {chunks} chunks"),
            BuildOutcome::Unavailable => println!("Semantic index unavailable"),
            BuildOutcome::Superseded => println!("Semantic index superseded"),
        }
    }

    let chat = ChatService::new(
        Retriever::new(Some(embedder), config.retrieval.clone()),
        AnswerClient::new()?,
        AnswerProvider::from_config(&config),
        &config.answer,
    );
    let reply = chat.ask(&excerpt, &cli.question, session.index()).await?;

    if excerpt.is_empty() {
        println!("\nNo excerpt selected.");
    } else {
        println!("\nExcerpt:\n{excerpt}");
    }
    for (n, chunk) in reply.answer.supplementary.iter().enumerate() {
        println!("\n[{}] score={:.3}\n{}", n + 1, chunk.score, chunk.text);
    }
    if let Some(notice) = &reply.notice {
        println!("\nNotice: {notice}");
    }
    println!("\nAnswer ({}):\n{}", reply.answer.source, reply.answer.answer);

    Ok(())
}

fn parse_rect(value: &str) -> Result<Rect, String> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("invalid rectangle `{value}`: {err}"))?;

    match parts.as_slice() {
        [x, y, width, height] => Ok(Rect::new(*x, *y, *width, *height)),
        _ => Err(format!("expected x,y,width,height, got `{value}`")),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
