use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::info;

use support_chat::config::ChatConfig;
use support_chat::models::{ConversationId, MessageId};
use support_chat::realtime::{DisabledChannel, PushChannel, WsPushChannel};
use support_chat::responder::Responder;
use support_chat::service::chat_service::ChatService;
use support_chat::session::{AdminConsole, ChatBackend, ChatSession, SessionEvent, ViewHandle};
use support_chat::store::{HttpMessageStore, InMemoryStore};

type Input = Lines<BufReader<Stdin>>;

#[derive(Debug, Parser)]
#[command(name = "support_chat", version, about = "Bank support chat client")]
struct Cli {
    /// Use an in-process store instead of the chat API.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Chat as a customer with the automated responder.
    Widget {
        #[arg(long)]
        user: String,
        /// Defaults to the user's own conversation.
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Join a customer's conversation as a human agent.
    Admin {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        conversation: String,
        /// Owner of the conversation; defaults to the conversation id.
        #[arg(long)]
        owner: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "support_chat=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ChatConfig::from_env()?;

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let backend = build_backend(&config, cli.offline)?;
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    match cli.command {
        Command::Widget { user, conversation } => {
            run_widget(&backend, &config, &user, conversation.map(ConversationId), &mut input).await
        }
        Command::Admin { agent, conversation, owner } => {
            let owner = owner.unwrap_or_else(|| conversation.clone());
            run_admin(backend, &config, agent, ConversationId(conversation), &owner, &mut input).await
        }
    }
}

fn build_backend(config: &ChatConfig, offline: bool) -> anyhow::Result<ChatBackend> {
    let responder = Responder::new(config.responder_id.clone());
    if offline {
        info!("running against the in-memory store");
        let store = Arc::new(InMemoryStore::new());
        return Ok(ChatBackend::new(ChatService::new(store.clone(), responder), store));
    }

    let store = HttpMessageStore::new(&config.api_base_url, config.request_timeout)?;
    let channel: Arc<dyn PushChannel> = match &config.realtime_url {
        Some(url) => Arc::new(WsPushChannel::new(url, config.realtime_api_key.clone())),
        None => Arc::new(DisabledChannel),
    };
    info!(api = %store.base_url(), realtime = config.realtime_url.is_some(), "chat backend configured");
    Ok(ChatBackend::new(ChatService::new(Arc::new(store), responder), channel))
}

async fn run_widget(
    backend: &ChatBackend,
    config: &ChatConfig,
    user: &str,
    conversation: Option<ConversationId>,
    input: &mut Input,
) -> anyhow::Result<()> {
    let (session, events) = loop {
        match ChatSession::open_widget(backend, user, conversation.clone(), config.session()).await {
            Ok(opened) => break opened,
            Err(e) if e.is_unavailable() => {
                eprintln!("{e}\nPress Enter to retry or type /quit.");
                match next_line(input).await? {
                    Some(line) if line != "/quit" => continue,
                    _ => return Ok(()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    };
    let printer = spawn_printer(session.view(), events);

    while let Some(line) = next_line(input).await? {
        match line.as_str() {
            "" => continue,
            "/quit" => break,
            "/refresh" => {
                if let Err(e) = session.refresh().await {
                    eprintln!("! {e}");
                }
            }
            text => {
                // Write failures arrive as notices; only validation is reported here.
                if let Err(e) = session.send_message(text).await {
                    if e.is_validation() {
                        eprintln!("! {e}");
                    }
                }
            }
        }
    }

    session.close().await;
    printer.abort();
    Ok(())
}

async fn run_admin(
    backend: ChatBackend,
    config: &ChatConfig,
    agent: String,
    conversation: ConversationId,
    owner: &str,
    input: &mut Input,
) -> anyhow::Result<()> {
    let mut console = AdminConsole::new(backend, agent, config.session());
    let mut printer = open_in_console(&mut console, conversation, owner).await;

    while let Some(line) = next_line(input).await? {
        let (command, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let result = match command {
            "" => continue,
            "/quit" => break,
            "/refresh" => console.refresh().await,
            "/switch" => {
                let mut args = rest.split_whitespace();
                match (args.next(), args.next()) {
                    (Some(cid), owner) => {
                        let owner = owner.unwrap_or(cid).to_string();
                        if let Some(old) = printer.take() {
                            old.abort();
                        }
                        printer = open_in_console(&mut console, ConversationId(cid.to_string()), &owner)
                            .await;
                        Ok(())
                    }
                    _ => {
                        eprintln!("usage: /switch <conversation> [owner]");
                        Ok(())
                    }
                }
            }
            "/edit" => match rest.split_once(' ') {
                Some((id, text)) => console.edit_message(&MessageId(id.to_string()), text).await.map(drop),
                None => {
                    eprintln!("usage: /edit <message-id> <text>");
                    Ok(())
                }
            },
            _ => console.send(&line).await.map(drop),
        };
        if let Err(e) = result {
            if !e.is_write_failure() {
                eprintln!("! {e}");
            }
        }
    }

    console.close().await;
    if let Some(printer) = printer {
        printer.abort();
    }
    Ok(())
}

async fn open_in_console(
    console: &mut AdminConsole,
    conversation: ConversationId,
    owner: &str,
) -> Option<JoinHandle<()>> {
    match console.select_conversation(conversation, owner).await {
        Ok(events) => console.view().map(|view| spawn_printer(view, events)),
        Err(e) => {
            eprintln!("! {e}");
            None
        }
    }
}

async fn next_line(input: &mut Input) -> anyhow::Result<Option<String>> {
    tokio::select! {
        line = input.next_line() => Ok(line?.map(|l| l.trim().to_string())),
        _ = tokio::signal::ctrl_c() => Ok(None),
    }
}

fn spawn_printer(view: ViewHandle, mut events: UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::ViewChanged => render(&view),
                SessionEvent::Notice(e) => eprintln!("! {e}"),
                SessionEvent::Degraded(e) => {
                    eprintln!("! live updates unavailable, refreshing periodically ({e})")
                }
            }
        }
    })
}

fn render(view: &ViewHandle) {
    println!("── {} ──", view.conversation_id());
    for entry in view.snapshot() {
        let id = match entry.message_id() {
            Some(id) => id.to_string(),
            None => "sending".to_string(),
        };
        println!(
            "[{}] {:<19} {} ({id})",
            entry.created_at.format("%H:%M:%S"),
            entry.participant,
            entry.body
        );
    }
}
