use anyhow::Context;
use avatar_concierge::{
    avatar::{
        headless::{LoggingSink, LoopbackPeerFactory, RestSpeechSynthesizer},
        AvatarMedia, AvatarSession, AzureRelayTokenSource, TrackKind,
    },
    config::{load_config, AgentConfig},
    llm::{AnswerPipeline, AzureOpenAI, PipelineError, QueryOutcome},
    session::AgentSession,
    speech::{AzureShortAudioRecognizer, SpeechRecognizer, WavFileSource},
    store::ConversationStore,
    Result as AgentResult,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// How long to wait for the avatar to pick up an answer before exiting.
const SPEECH_PICKUP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "concierge", version, about = "Ask questions, hear the avatar answer")]
struct Cli {
    /// TOML agent file with data sources, system prompt and avatar settings
    #[arg(long, global = true)]
    agent_file: Option<PathBuf>,

    /// Run text-only, without an avatar session
    #[arg(long, global = true)]
    no_avatar: bool,

    /// Where synthesized speech is written
    #[arg(long, global = true, default_value = "concierge-audio")]
    output_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a single question and exit
    Ask { query: Vec<String> },
    /// Interactive session (/listen <wav>, /stop, /history, /clear, /quit)
    Chat,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    log::info!("🚀 Starting concierge");

    let cli = Cli::parse();
    let config = load_config(cli.agent_file.as_deref()).context("failed to load configuration")?;
    let config = Arc::new(config);
    let session = Arc::new(
        build_session(&config, !cli.no_avatar, &cli.output_dir).context("failed to set up session")?,
    );
    session.connect_avatar().await;

    let result = match cli.command {
        Command::Ask { query } => ask(&session, &query.join(" ")).await,
        Command::Chat => chat(Arc::clone(&session), config).await,
    };

    session.shutdown().await;
    result
}

fn build_session(config: &AgentConfig, with_avatar: bool, output_dir: &Path) -> AgentResult<AgentSession> {
    let store = Arc::new(ConversationStore::new(config.history_limit));

    let chat = Arc::new(AzureOpenAI::chat(&config.api)?);
    let router = Arc::new(AzureOpenAI::router(&config.api)?);
    log::info!("🤖 Chat deployment {}, router deployment {}", chat.deployment(), router.deployment());

    let pipeline = Arc::new(AnswerPipeline::new(
        Arc::clone(&store),
        chat,
        router,
        Arc::new(config.sources.clone()),
        config.system_prompt.clone(),
    ));

    let avatar = if with_avatar {
        let media = AvatarMedia {
            audio: Arc::new(LoggingSink::new(TrackKind::Audio)),
            video: Arc::new(LoggingSink::new(TrackKind::Video)),
        };
        Some(Arc::new(AvatarSession::new(
            Arc::clone(&store),
            config.avatar.clone(),
            Arc::new(AzureRelayTokenSource::new(&config.api)),
            Arc::new(LoopbackPeerFactory),
            Arc::new(RestSpeechSynthesizer::new(&config.api, output_dir)),
            media,
        )))
    } else {
        None
    };

    let session = AgentSession::new(store, pipeline, avatar);
    Ok(session)
}

async fn ask(session: &AgentSession, query: &str) -> anyhow::Result<()> {
    match session.submit_text(query).await? {
        QueryOutcome::Ignored => {
            eprintln!("❌ Nothing to ask");
            return Ok(());
        }
        outcome => log::debug!("Query finished: {:?}", outcome),
    }
    println!("{}", session.store().snapshot_state().display_text);
    wait_for_speech(session).await;
    Ok(())
}

/// Let the avatar finish speaking the current answer.
async fn wait_for_speech(session: &AgentSession) {
    if !session.store().snapshot_state().is_avatar_connected {
        return;
    }
    let mut state = session.store().subscribe_state();
    let started = tokio::time::timeout(SPEECH_PICKUP_TIMEOUT, state.wait_for(|s| s.is_avatar_speaking))
        .await
        .is_ok();
    if started {
        let _ = state.wait_for(|s| !s.is_avatar_speaking).await;
    }
}

async fn chat(session: Arc<AgentSession>, config: Arc<AgentConfig>) -> anyhow::Result<()> {
    println!("🎧 Type a question, or /listen <wav>, /stop, /history, /clear, /quit");

    let mut display = session.store().subscribe_state();
    let printer = tokio::spawn(async move {
        let mut revision = display.borrow_and_update().display_revision;
        while display.changed().await.is_ok() {
            let state = display.borrow_and_update().clone();
            if state.display_revision != revision {
                revision = state.display_revision;
                if !state.display_text.is_empty() {
                    println!("🗣️  {}", state.display_text);
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line.split_once(' ').map_or((line, ""), |(cmd, rest)| (cmd, rest.trim())) {
            ("", _) => {}
            ("/quit", _) | ("/exit", _) => break,
            ("/stop", _) => session.stop().await,
            ("/history", _) => print_history(&session),
            ("/clear", _) => {
                session.store().clear_history();
                println!("🧹 History cleared");
            }
            ("/listen", path) => listen(&session, &config, path).await,
            _ => {
                let session = Arc::clone(&session);
                let query = line.to_string();
                tokio::spawn(async move {
                    match session.submit_text(&query).await {
                        Ok(outcome) => log::debug!("Query finished: {:?}", outcome),
                        Err(PipelineError::Busy) => println!("⏳ Still working on the previous question"),
                        Err(PipelineError::Cancelled) => println!("🛑 Cancelled"),
                    }
                });
            }
        }
    }

    printer.abort();
    Ok(())
}

async fn listen(session: &AgentSession, config: &AgentConfig, path: &str) {
    if path.is_empty() {
        println!("Usage: /listen <file.wav>");
        return;
    }

    let provisioned = session
        .speech()
        .provision_with(|| {
            let source = Arc::new(WavFileSource::open(path)?);
            let recognizer =
                AzureShortAudioRecognizer::new(&config.api, &config.recognition.languages, source)?;
            Ok(Arc::new(recognizer) as Arc<dyn SpeechRecognizer>)
        })
        .await;
    if !provisioned {
        println!("❌ Could not open {}", path);
        return;
    }

    match session.start_listening().await {
        Ok(()) => println!("🎤 Listening to {}", path),
        Err(e) => println!("❌ {}", e),
    }
}

fn print_history(session: &AgentSession) {
    let history = session.store().history_snapshot();
    if history.is_empty() {
        println!("(no history)");
        return;
    }
    for turn in history.iter() {
        println!("{}: {}", turn.role, turn.content);
    }
    println!("({} of {} turns kept)", history.len(), session.store().history_limit());
}
