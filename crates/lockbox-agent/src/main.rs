use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use lockbox_core::autolock::{spawn_auto_lock, ActivitySignal, DEFAULT_TICK};
use lockbox_core::session::SessionKeyCache;
use lockbox_core::store::FileStore;
use lockbox_core::sync::SyncEngine;
use lockbox_core::wallet::KeyDraft;
use lockbox_core::{WalletCommand, WalletResponse, WalletService};
use tokio::signal;
use tracing::{info, warn};
use uuid::Uuid;

const REMOTE_CHECK_PERIOD: Duration = Duration::from_secs(5 * 60);

#[derive(Parser, Debug)]
#[command(name = "lockbox-agent")]
#[command(author, version, about = "Lockbox encrypted API-key vault", long_about = None)]
struct Cli {
    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new wallet and print its recovery phrase once
    Init,

    /// Run the agent: auto-lock and periodic remote checks until ctrl-c
    Run,

    /// Print wallet and sync status
    Status,

    /// List keys (previews only, never values)
    List,

    /// List vaults
    Vaults,

    /// Add a key; the value is prompted, never passed as an argument
    Add {
        /// Service identifier, e.g. "openai"
        service: String,
        /// Key name, e.g. "API_KEY"
        name: String,
        /// Target vault; defaults to the first vault
        #[arg(long)]
        vault: Option<Uuid>,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Reveal one key's value
    Reveal {
        key_id: Uuid,
    },

    /// Import keys from a .env style file
    ImportEnv {
        file: PathBuf,
        /// Target vault; defaults to the first vault
        #[arg(long)]
        vault: Option<Uuid>,
    },

    /// Link a dashboard account; the token is prompted
    Link {
        #[arg(long)]
        email: Option<String>,
    },

    /// Push the encrypted wallet to the dashboard now
    Sync,

    /// Pull the dashboard copy and merge it
    Pull,

    /// Change the wallet password
    ChangePassword,

    /// Regain access with the 12-word recovery phrase and set a new password
    Recover,

    /// Delete the wallet locally and remotely
    Delete {
        /// Required; deletion is unrecoverable
        #[arg(long)]
        yes: bool,
    },
}

struct Agent {
    store: Arc<FileStore>,
    cache: SessionKeyCache,
    engine: Arc<SyncEngine>,
    signal: Arc<ActivitySignal>,
    service: WalletService,
}

fn build_agent(data_dir_override: Option<PathBuf>) -> Result<Agent> {
    let root = match data_dir_override {
        Some(path) => path,
        None => default_data_dir()?,
    };
    let store = Arc::new(FileStore::open(&root)?);
    let cache = SessionKeyCache::new(store.clone());
    let engine = Arc::new(SyncEngine::new(store.clone()));
    let signal = Arc::new(ActivitySignal::new());
    let service = WalletService::new(
        store.clone(),
        cache.clone(),
        engine.clone(),
        signal.clone(),
    );
    Ok(Agent {
        store,
        cache,
        engine,
        signal,
        service,
    })
}

fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("dev", "Lockbox", "lockbox")
        .ok_or_else(|| anyhow!("cannot determine a data directory; pass --data-dir"))?;
    Ok(dirs.data_local_dir().to_path_buf())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let agent = build_agent(cli.data_dir)?;
    agent.service.restore_transport().await?;

    match cli.command {
        Commands::Init => init_command(&agent).await,
        Commands::Run => run_command(&agent).await,
        Commands::Status => print_response(&agent.service.handle(WalletCommand::GetStatus).await?),
        Commands::List => {
            unlock_interactive(&agent.service).await?;
            print_response(&agent.service.handle(WalletCommand::ListKeys).await?)
        }
        Commands::Vaults => {
            unlock_interactive(&agent.service).await?;
            print_response(&agent.service.handle(WalletCommand::ListVaults).await?)
        }
        Commands::Add {
            service,
            name,
            vault,
            notes,
        } => add_command(&agent, service, name, vault, notes).await,
        Commands::Reveal { key_id } => {
            unlock_interactive(&agent.service).await?;
            print_response(&agent.service.handle(WalletCommand::RevealKey { key_id }).await?)
        }
        Commands::ImportEnv { file, vault } => import_env_command(&agent, file, vault).await,
        Commands::Link { email } => link_command(&agent, email).await,
        Commands::Sync => print_response(&agent.service.handle(WalletCommand::SyncNow).await?),
        Commands::Pull => print_response(&agent.service.handle(WalletCommand::PullRemote).await?),
        Commands::ChangePassword => change_password_command(&agent).await,
        Commands::Recover => recover_command(&agent).await,
        Commands::Delete { yes } => delete_command(&agent, yes).await,
    }
}

async fn init_command(agent: &Agent) -> Result<()> {
    let password = prompt_new_password("Create wallet password")?;
    match agent
        .service
        .handle(WalletCommand::Create { password })
        .await?
    {
        WalletResponse::Created { recovery_phrase } => {
            println!("Wallet created.");
            println!();
            println!("Recovery phrase (shown once, store it offline):");
            println!("  {recovery_phrase}");
            Ok(())
        }
        other => Err(anyhow!("unexpected response: {other:?}")),
    }
}

async fn run_command(agent: &Agent) -> Result<()> {
    unlock_interactive(&agent.service).await?;
    let (lock_task, lock_handle) = spawn_auto_lock(
        agent.store.clone(),
        agent.cache.clone(),
        agent.signal.clone(),
        DEFAULT_TICK,
    );

    info!("agent running; ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(REMOTE_CHECK_PERIOD) => {
                if agent.engine.check_remote().await {
                    match agent.service.handle(WalletCommand::PullRemote).await {
                        Ok(WalletResponse::Pulled { updated: true }) => {
                            info!("merged remote changes")
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "periodic pull failed"),
                    }
                }
            }
            _ = signal::ctrl_c() => break,
        }
    }

    info!("agent stopping");
    let _ = lock_handle.shutdown_tx.send(true);
    let _ = lock_task.await;
    agent.service.handle(WalletCommand::Lock).await?;
    Ok(())
}

async fn add_command(
    agent: &Agent,
    service: String,
    name: String,
    vault: Option<Uuid>,
    notes: Option<String>,
) -> Result<()> {
    unlock_interactive(&agent.service).await?;
    let value = rpassword::prompt_password("Key value")
        .map_err(|e| anyhow!("value prompt: {e}"))?;
    let vault_id = match vault {
        Some(id) => id,
        None => first_vault_id(&agent.service).await?,
    };
    let response = agent
        .service
        .handle(WalletCommand::AddKey {
            vault_id,
            draft: KeyDraft {
                service,
                name,
                value: value.into(),
                notes: notes.unwrap_or_default(),
                expires_at: None,
                favourite: false,
            },
        })
        .await?;
    print_response(&response)
}

async fn import_env_command(agent: &Agent, file: PathBuf, vault: Option<Uuid>) -> Result<()> {
    let env = std::fs::read_to_string(&file)
        .map_err(|e| anyhow!("cannot read {}: {e}", file.display()))?;
    unlock_interactive(&agent.service).await?;
    let vault_id = match vault {
        Some(id) => id,
        None => first_vault_id(&agent.service).await?,
    };
    let response = agent
        .service
        .handle(WalletCommand::ImportEnv { vault_id, env })
        .await?;
    print_response(&response)
}

async fn link_command(agent: &Agent, email: Option<String>) -> Result<()> {
    let token = rpassword::prompt_password("Dashboard token")
        .map_err(|e| anyhow!("token prompt: {e}"))?;
    if token.is_empty() {
        return Err(anyhow!("a token is required to link"));
    }
    let response = agent
        .service
        .handle(WalletCommand::LinkAccount { email, token })
        .await?;
    print_response(&response)
}

async fn change_password_command(agent: &Agent) -> Result<()> {
    let current = prompt_password_once("Current password")?;
    let new = prompt_new_password("New password")?;
    let response = agent
        .service
        .handle(WalletCommand::ChangePassword { current, new })
        .await?;
    print_response(&response)
}

async fn recover_command(agent: &Agent) -> Result<()> {
    let phrase = rpassword::prompt_password("Recovery phrase (12 words)")
        .map_err(|e| anyhow!("phrase prompt: {e}"))?;
    agent
        .service
        .handle(WalletCommand::UnlockWithPhrase { phrase })
        .await?;
    println!("Phrase accepted. The wallet is read-only until a new password is set.");
    let new = prompt_new_password("New password")?;
    let response = agent
        .service
        .handle(WalletCommand::ChangePassword {
            current: String::new(),
            new,
        })
        .await?;
    print_response(&response)
}

async fn delete_command(agent: &Agent, yes: bool) -> Result<()> {
    if !yes {
        return Err(anyhow!(
            "refusing to delete without --yes; this removes the wallet locally and remotely"
        ));
    }
    unlock_interactive(&agent.service).await?;
    let response = agent.service.handle(WalletCommand::DeleteWallet).await?;
    print_response(&response)
}

async fn unlock_interactive(service: &WalletService) -> Result<()> {
    let password = prompt_password_once("Enter wallet password")?;
    service.handle(WalletCommand::Unlock { password }).await?;
    Ok(())
}

async fn first_vault_id(service: &WalletService) -> Result<Uuid> {
    match service.handle(WalletCommand::ListVaults).await? {
        WalletResponse::Vaults { vaults } => vaults
            .first()
            .map(|vault| vault.id)
            .ok_or_else(|| anyhow!("wallet has no vaults")),
        other => Err(anyhow!("unexpected response: {other:?}")),
    }
}

fn print_response(response: &WalletResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}

fn prompt_password_once(prompt: &str) -> Result<String> {
    if let Ok(pw) = std::env::var("LOCKBOX_PASSWORD") {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))
}

fn prompt_new_password(prompt: &str) -> Result<String> {
    if let Ok(pw) = std::env::var("LOCKBOX_PASSWORD") {
        if !pw.is_empty() {
            if let Ok(confirm) = std::env::var("LOCKBOX_PASSWORD_CONFIRM") {
                if confirm != pw {
                    return Err(anyhow!("password confirmation mismatch"));
                }
            }
            return Ok(pw);
        }
    }
    let first =
        rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    if first.chars().count() < 8 {
        return Err(anyhow!("password too short; minimum 8 characters"));
    }
    let second = rpassword::prompt_password("Confirm password")
        .map_err(|e| anyhow!("password prompt: {e}"))?;
    if first != second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}
