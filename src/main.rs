mod commands;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use student_portal::api::ApiClient;
use student_portal::config::{Config, StoreKind};

/// Command-line client for the student portal.
#[derive(Parser, Debug)]
#[command(name = "student-portal", version)]
struct Args {
    /// API base URL (overrides PORTAL_API_URL / API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Token storage backend (overrides PORTAL_TOKEN_STORE)
    #[arg(long, value_enum, global = true)]
    store: Option<StoreKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in with email and password
    Login {
        #[arg(long)]
        email: String,
        /// Falls back to PORTAL_PASSWORD
        #[arg(long, env = "PORTAL_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// End the session on the server and locally
    Logout,
    /// Show the logged-in student's profile
    Whoami {
        /// Print the raw profile payload
        #[arg(long)]
        json: bool,
    },
    /// Show local session state
    Status,
    /// Exchange the refresh token for a new access token
    Refresh,
    /// Permanently delete the account
    DeleteAccount {
        /// Account id (defaults to the id in the access token)
        #[arg(long)]
        user_id: Option<String>,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    // .env is optional; real environment variables win
    let _ = dotenvy::dotenv();

    env_logger::init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), String> {
    let mut config = Config::from_env().map_err(|e| e.to_string())?;
    if let Some(url) = args.api_url {
        config.api_base_url = url;
    }
    if let Some(store) = args.store {
        config.store = store;
    }
    log::debug!("API base URL: {}", config.api_base_url);

    let tokens = Arc::new(config.token_store().map_err(|e| e.to_string())?);
    let subscription = tokens.subscribe(|logged_in| {
        log::info!("Auth state changed: {}", if logged_in { "logged in" } else { "logged out" });
    });

    let client = ApiClient::with_timeouts(
        &config.api_base_url,
        tokens,
        config.timeout,
        config.connect_timeout,
    );

    let result = match args.command {
        Command::Login { email, password } => commands::login(&client, &email, &password).await,
        Command::Logout => commands::logout(&client).await,
        Command::Whoami { json } => commands::whoami(&client, json).await,
        Command::Status => commands::status(&client),
        Command::Refresh => commands::refresh(&client).await,
        Command::DeleteAccount { user_id, yes } => {
            commands::delete_account(&client, user_id, yes).await
        }
    };

    subscription.unsubscribe();
    result
}
