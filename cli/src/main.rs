use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use gatepass::config::StoreConfig;
use gatepass::credential::CredentialHolder;
use gatepass::gatepass::{self as desk, DEFAULT_PER_PAGE};
use gatepass::persist::{COOKIE_NAME, CookieStore, FileCookieStore, FileDurableStore, PersistError};
use gatepass::records::{RecordAccess, ServiceIdentity};
use gatepass::session::{SessionConfig, SessionError, SessionManager};
use gatepass::store::http::HttpRecordStore;
use gatepass::store::{FeedEvent, RecordStore, StoreError};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("not logged in; run `gatepass-cli login <identity> --remember` first")]
    NotLoggedIn,
    #[error("missing password; pass --password or set GATEPASS_PASSWORD")]
    MissingPassword,
    #[error("cannot locate a session directory; pass --session-dir or set SESSION_DIR")]
    NoSessionDir,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "gatepass-cli", about = "Gatepass session and record CLI")]
struct Cli {
    #[arg(long, env = "STORE_URL", default_value = gatepass::config::DEFAULT_STORE_URL)]
    store_url: String,

    #[arg(long, env = "SESSION_DIR", help = "Where the remembered session lives [default: $HOME/.gatepass]")]
    session_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in. Only `--remember` sessions survive past this process.
    Login {
        identity: String,
        #[arg(long, env = "GATEPASS_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long, default_value_t = false)]
        remember: bool,
    },
    Logout,
    Whoami,
    /// Print the `Cookie` header for the current session.
    Cookie,
    Drivers(DriversCommand),
    Vehicles(VehiclesCommand),
    /// Stream change events until Ctrl-C.
    Watch(WatchCommand),
}

#[derive(Args, Debug)]
struct DriversCommand {
    #[command(subcommand)]
    command: DriversSubcommand,
}

#[derive(Subcommand, Debug)]
enum DriversSubcommand {
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = DEFAULT_PER_PAGE)]
        per_page: u32,
    },
    Search {
        query: String,
    },
    Get {
        id: String,
    },
    Create {
        #[arg(long)]
        data: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Args, Debug)]
struct VehiclesCommand {
    #[command(subcommand)]
    command: VehiclesSubcommand,
}

#[derive(Subcommand, Debug)]
enum VehiclesSubcommand {
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = DEFAULT_PER_PAGE)]
        per_page: u32,
    },
    Get {
        id: String,
    },
}

#[derive(Args, Debug)]
struct WatchCommand {
    #[command(subcommand)]
    command: WatchSubcommand,
}

#[derive(Subcommand, Debug)]
enum WatchSubcommand {
    Drivers,
    Driver { id: String },
}

struct CliContext {
    session: SessionManager,
    access: RecordAccess,
    cookies: Arc<FileCookieStore>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let ctx = connect(&cli)?;
    ctx.session.restore().await;

    match cli.command {
        Command::Login { identity, password, remember } => run_login(&ctx, &identity, password, remember).await,
        Command::Logout => run_logout(&ctx).await,
        Command::Whoami => run_whoami(&ctx),
        Command::Cookie => run_cookie(&ctx),
        Command::Drivers(drivers) => run_drivers(&ctx, drivers).await,
        Command::Vehicles(vehicles) => run_vehicles(&ctx, vehicles).await,
        Command::Watch(watch) => run_watch(&ctx, watch).await,
    }
}

fn connect(cli: &Cli) -> Result<CliContext, CliError> {
    let lookup = |key: &str| std::env::var(key).ok();
    let mut store_config = StoreConfig::from_lookup(&lookup);
    store_config.base_url = cli.store_url.trim_end_matches('/').to_owned();

    let dir = session_dir(cli.session_dir.as_deref())?;
    let store: Arc<dyn RecordStore> = Arc::new(HttpRecordStore::new(&store_config)?);
    let cookies = Arc::new(FileCookieStore::new(dir.join("cookies.json")));
    let holder = CredentialHolder::new();

    let session = SessionManager::new(
        Arc::clone(&store),
        Arc::new(FileDurableStore::new(&dir)),
        cookies.clone(),
        holder.clone(),
        SessionConfig { auth_collection: store_config.auth_collection.clone(), client_side: true, secure_cookie: false },
    );
    let service = ServiceIdentity::from_lookup(&lookup, &store_config.auth_collection);
    let access = RecordAccess::new(store, holder, service);
    Ok(CliContext { session, access, cookies })
}

fn session_dir(explicit: Option<&Path>) -> Result<PathBuf, CliError> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".gatepass"))
        .ok_or(CliError::NoSessionDir)
}

// =============================================================================
// SESSION
// =============================================================================

async fn run_login(ctx: &CliContext, identity: &str, password: Option<String>, remember: bool) -> Result<(), CliError> {
    let password = password.filter(|p| !p.is_empty()).ok_or(CliError::MissingPassword)?;
    let user = ctx.session.login(identity, &password, remember).await?;
    if !remember {
        tracing::warn!("session not remembered; later invocations start logged out");
    }
    print_json(&serde_json::to_value(user)?)
}

async fn run_logout(ctx: &CliContext) -> Result<(), CliError> {
    let report = ctx.session.logout().await;
    for warning in &report.warnings {
        tracing::warn!(error = %warning, "logout left a credential copy behind");
    }
    println!("logged out");
    Ok(())
}

fn run_whoami(ctx: &CliContext) -> Result<(), CliError> {
    if !ctx.session.is_authenticated() {
        return Err(CliError::NotLoggedIn);
    }
    print_json(&serde_json::to_value(ctx.session.state())?)
}

fn run_cookie(ctx: &CliContext) -> Result<(), CliError> {
    let value = ctx.cookies.get(COOKIE_NAME)?.ok_or(CliError::NotLoggedIn)?;
    println!("{COOKIE_NAME}={}", urlencoding::encode(&value));
    Ok(())
}

// =============================================================================
// RECORDS
// =============================================================================

async fn run_drivers(ctx: &CliContext, drivers: DriversCommand) -> Result<(), CliError> {
    let access = &ctx.access;
    let json = match drivers.command {
        DriversSubcommand::List { page, per_page } => {
            serde_json::to_value(desk::list_drivers(access, page, per_page).await?)?
        }
        DriversSubcommand::Search { query } => {
            serde_json::to_value(desk::search_drivers(access, &query, 1, DEFAULT_PER_PAGE).await?)?
        }
        DriversSubcommand::Get { id } => serde_json::to_value(desk::get_driver(access, &id).await?)?,
        DriversSubcommand::Create { data } => {
            let body = serde_json::from_str::<Value>(&data)?;
            serde_json::to_value(desk::create_driver(access, &body).await?)?
        }
        DriversSubcommand::Delete { id } => {
            desk::delete_driver(access, &id).await?;
            serde_json::json!({ "deleted": id })
        }
    };
    print_json(&json)
}

async fn run_vehicles(ctx: &CliContext, vehicles: VehiclesCommand) -> Result<(), CliError> {
    let access = &ctx.access;
    let json = match vehicles.command {
        VehiclesSubcommand::List { page, per_page } => {
            serde_json::to_value(desk::list_vehicles(access, page, per_page).await?)?
        }
        VehiclesSubcommand::Get { id } => serde_json::to_value(desk::get_vehicle(access, &id).await?)?,
    };
    print_json(&json)
}

async fn run_watch(ctx: &CliContext, watch: WatchCommand) -> Result<(), CliError> {
    let access = &ctx.access;
    // The single-record watch is owned here and closes on drop.
    let _owned = match watch.command {
        WatchSubcommand::Drivers => {
            desk::watch_drivers(access, print_event).await?;
            None
        }
        WatchSubcommand::Driver { id } => Some(desk::watch_driver(access, &id, print_event).await?),
    };
    tracing::info!("watching; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    access.close_all().await;
    Ok(())
}

fn print_event(event: FeedEvent) {
    match event {
        FeedEvent::Change { action, record } => {
            let line = serde_json::json!({ "action": action, "record": record });
            println!("{line}");
        }
        FeedEvent::Disconnected { reason } => tracing::warn!(%reason, "realtime feed disconnected"),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
