use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;

use chatfuse::app::AppContext;
use chatfuse::catalog;
use chatfuse::local::ModelState;
use chatfuse::pipeline::{PipelineEvent, SendOutcome};

#[derive(Parser)]
#[command(name = "chatfuse")]
#[command(about = "chatfuse CLI", long_about = None)]
struct Cli {
    /// Config file path (default: CHATFUSE_CONFIG_PATH or ~/.chatfuse/config.json)
    #[arg(long, short, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Treat the network as unavailable (remote sends are refused).
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory, a default config and the data directory.
    Init,

    /// List providers and their models.
    Providers,

    /// List chats, newest first. The active chat is marked with `*`.
    Chats,

    /// Create a chat bound to a provider and model, and make it active.
    New {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model: String,
    },

    /// Print a chat's messages.
    Show { id: String },

    /// Rename a chat.
    Rename { id: String, title: String },

    /// Delete a chat.
    Delete { id: String },

    /// Manage provider API keys.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Manage on-device models.
    Local {
        #[command(subcommand)]
        action: LocalAction,
    },

    /// Show or change the theme preference.
    Theme {
        /// "dark", "light" or "toggle". Omit to print the current theme.
        mode: Option<String>,
    },

    /// Chat interactively (uses the active chat unless --chat is given).
    Chat {
        #[arg(long, value_name = "ID")]
        chat: Option<String>,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Store a key. An empty key removes it.
    Set { provider: String, key: String },
    /// Remove a key.
    Delete { provider: String },
    /// List providers with a stored key.
    List,
}

#[derive(Subcommand)]
enum LocalAction {
    /// Show every local model and whether it is downloaded.
    Status,
    /// Download a model into the local engine.
    Download { model: String },
    /// Remove a downloaded model.
    Delete { model: String },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let Some(command) = cli.command else {
        println!("Run with --help for usage");
        return;
    };
    let result = match command {
        Commands::Version => {
            println!("chatfuse {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Init => run_init(cli.config),
        command => run_command(cli.config, cli.offline, command).await,
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(chatfuse::config::default_config_path);
    let data_dir = chatfuse::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", path.display());
    println!("data directory: {}", data_dir.display());
    Ok(())
}

async fn open_app(config_path: Option<PathBuf>, offline: bool) -> anyhow::Result<AppContext> {
    let (config, path) = chatfuse::config::load_config(config_path)?;
    let app = AppContext::open(&config, &path).await;
    if offline {
        app.connectivity.set_online(false);
    }
    Ok(app)
}

async fn run_command(
    config_path: Option<PathBuf>,
    offline: bool,
    command: Commands,
) -> anyhow::Result<()> {
    let app = open_app(config_path, offline).await?;
    match command {
        Commands::Providers => {
            for provider in catalog::providers() {
                let key = if provider.is_local {
                    "on-device"
                } else if app.credentials.has_key(provider.id).await {
                    "key set"
                } else {
                    "no key"
                };
                println!("{} ({}) [{}]", provider.name, provider.id, key);
                for model in provider.models {
                    println!("    {:<28} {}", model.id, model.description);
                }
            }
        }
        Commands::Chats => {
            let active = app.registry.active().await;
            for chat in app.registry.chats().await {
                let marker = if active.as_deref() == Some(chat.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{} {}  {}  ({}, {} messages)",
                    marker,
                    chat.id,
                    chat.title,
                    catalog::display_label(&chat.provider_id, &chat.model_id),
                    chat.messages.len()
                );
            }
        }
        Commands::New { provider, model } => {
            if catalog::model(&provider, &model).is_none() {
                log::warn!("{}/{} is not in the catalog", provider, model);
            }
            let id = app.registry.create_chat(provider, model).await;
            println!("{}", id);
        }
        Commands::Show { id } => {
            let chat = app
                .registry
                .get_chat(&id)
                .await
                .ok_or_else(|| anyhow::anyhow!("chat {} not found", id))?;
            println!(
                "{}  ({})",
                chat.title,
                catalog::display_label(&chat.provider_id, &chat.model_id)
            );
            for message in &chat.messages {
                println!(
                    "[{}] {}: {}",
                    message.timestamp.format("%Y-%m-%d %H:%M"),
                    message.role,
                    message.content
                );
            }
        }
        Commands::Rename { id, title } => {
            if !app.registry.update_title(&id, title).await {
                anyhow::bail!("chat {} not found", id);
            }
        }
        Commands::Delete { id } => {
            if !app.registry.delete_chat(&id).await {
                anyhow::bail!("chat {} not found", id);
            }
        }
        Commands::Key { action } => match action {
            KeyAction::Set { provider, key } => app.credentials.set(&provider, &key).await,
            KeyAction::Delete { provider } => {
                if !app.credentials.delete(&provider).await {
                    println!("no key stored for {}", provider);
                }
            }
            KeyAction::List => {
                for provider in app.credentials.providers_with_keys().await {
                    println!("{}", provider);
                }
            }
        },
        Commands::Local { action } => run_local(&app, action).await?,
        Commands::Theme { mode } => {
            let dark = match mode.as_deref() {
                None => app.preferences.dark_mode().await,
                Some("dark") => {
                    app.preferences.set_dark_mode(true).await;
                    true
                }
                Some("light") => {
                    app.preferences.set_dark_mode(false).await;
                    false
                }
                Some("toggle") => app.preferences.toggle_dark_mode().await,
                Some(other) => anyhow::bail!("unknown theme {:?}", other),
            };
            println!("{}", if dark { "dark" } else { "light" });
        }
        Commands::Chat { chat } => run_chat(&app, chat).await?,
        Commands::Version | Commands::Init => {}
    }
    Ok(())
}

async fn run_local(app: &AppContext, action: LocalAction) -> anyhow::Result<()> {
    if !app.local.is_supported().await {
        anyhow::bail!("local inference engine is not reachable");
    }
    app.local.refresh().await?;
    match action {
        LocalAction::Status => {
            for status in app.local.statuses() {
                let state = match status.state {
                    ModelState::NotDownloaded => "not downloaded".to_string(),
                    ModelState::Downloading(p) => format!("downloading {}%", p),
                    ModelState::Downloaded => "downloaded".to_string(),
                    ModelState::Loaded => "loaded".to_string(),
                };
                println!(
                    "{:<16} {:<14} {:>8}  {}",
                    status.info.id,
                    status.info.name,
                    status.info.size.unwrap_or(""),
                    state
                );
            }
        }
        LocalAction::Download { model } => {
            app.local
                .download(&model, |p| {
                    print!("\rdownloading {}: {:>3}%", model, p);
                    let _ = io::stdout().flush();
                })
                .await?;
            println!();
        }
        LocalAction::Delete { model } => app.local.delete(&model).await?,
    }
    Ok(())
}

async fn run_chat(app: &AppContext, chat: Option<String>) -> anyhow::Result<()> {
    let chat_id = match chat.or(app.registry.active().await) {
        Some(id) => id,
        None => anyhow::bail!("no active chat; create one with `chatfuse new`"),
    };
    let chat = app
        .registry
        .get_chat(&chat_id)
        .await
        .ok_or_else(|| anyhow::anyhow!("chat {} not found", chat_id))?;
    app.registry.set_active(Some(chat_id.clone())).await;
    println!(
        "{} ({}). /exit to quit.",
        chat.title,
        catalog::display_label(&chat.provider_id, &chat.model_id)
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut events = app.pipeline.subscribe();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }

        let handle = app.pipeline.spawn_send(chat_id.clone(), input);
        tokio::pin!(handle);
        let mut printed = false;
        let result = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                event = events.recv() => {
                    if let Ok(PipelineEvent::Delta { chat_id: c, delta }) = event {
                        if c == chat_id {
                            if !printed {
                                write!(stdout, "< ")?;
                                printed = true;
                            }
                            write!(stdout, "{}", delta)?;
                            stdout.flush()?;
                        }
                    }
                }
            }
        };
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::Delta { chat_id: c, delta } = event {
                if c == chat_id {
                    write!(stdout, "{}", delta)?;
                }
            }
        }
        match result {
            Ok(Ok(SendOutcome::Completed(_))) => writeln!(stdout)?,
            Ok(Ok(SendOutcome::MissingCredential(notice))) => {
                writeln!(stdout, "< {}", notice.content)?
            }
            Ok(Err(e)) => {
                if printed {
                    writeln!(stdout)?;
                }
                eprintln!("chat error: {}", e);
            }
            Err(e) => eprintln!("chat error: {}", e),
        }
    }

    Ok(())
}
