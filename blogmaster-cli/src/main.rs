mod runtime;
mod session;
mod view;

use crate::{
    runtime::Runtime,
    session::SessionStore,
    view::{App, route::Route},
};
use blogmaster_common::model::auth::AdminDomain;
use blogmaster_db::{ApiKey, BackendConfig, DbClient, RealtimeClient, RemoteError};
use clap::Parser;
use serde::Deserialize;
use std::{io::BufRead, path::PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

#[derive(Debug, Error)]
enum InitError {
    #[error("Error parsing .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),
    #[error("Error parsing environment: {0}")]
    Envy(#[from] envy::Error),
    #[error("Neither SUPABASE_PUBLISHABLE_KEY nor SUPABASE_ANON_KEY is set")]
    MissingApiKey,
    #[error("Error setting up the backend client: {0}")]
    Remote(#[from] RemoteError),
    #[error("Error writing to the terminal: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal client for the BlogMaster blog.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Page to start on: /, /?post=<id>, /stats or /auth
    #[arg(default_value = "/")]
    location: Route,
}

#[derive(Clone, Eq, PartialEq, Debug, Deserialize)]
struct Env {
    supabase_url: Url,
    supabase_publishable_key: Option<String>,
    supabase_anon_key: Option<String>,
    admin_email_domain: Option<String>,
    session_file: Option<PathBuf>,
}

impl Env {
    fn api_key(&self) -> Result<ApiKey, InitError> {
        [&self.supabase_publishable_key, &self.supabase_anon_key]
            .into_iter()
            .flatten()
            .map(|key| key.trim())
            .find(|key| !key.is_empty())
            .map(|key| ApiKey::new(key.to_owned()))
            .ok_or(InitError::MissingApiKey)
    }

    fn admin_domain(&self) -> AdminDomain {
        self.admin_email_domain
            .as_deref()
            .filter(|domain| !domain.trim().is_empty())
            .map_or_else(AdminDomain::default, AdminDomain::new)
    }
}

fn install_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blogmaster=info,blogmaster_db=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn get_env() -> Result<Env, InitError> {
    if let Err(e) = dotenvy::dotenv() {
        if e.not_found() {
            debug!("No .dotenv file found");
        } else {
            return Err(e.into());
        }
    }

    envy::from_env().map_err(InitError::from)
}

/// Reads stdin on its own thread; blocking reads would hold up runtime shutdown.
fn read_lines() -> mpsc::UnboundedReceiver<String> {
    let (lines, receiver) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if lines.send(line).is_err() {
                break;
            }
        }
    });
    receiver
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), InitError> {
    let args = Args::parse();
    install_tracing();
    let env = get_env()?;
    let start = args.location;

    let config = BackendConfig {
        url: env.supabase_url.clone(),
        api_key: env.api_key()?,
    };
    let client = DbClient::new(&config)?;
    let feed = RealtimeClient::connect(&config)?;
    let sessions = SessionStore::activate(client.clone(), env.session_file.clone()).await;
    let app = App::new(env.admin_domain(), sessions.current());

    info!(url = %config.url, %start, "Starting");
    Runtime::new(client, sessions, feed, app)
        .run(start, read_lines(), tokio::io::stdout())
        .await?;

    Ok(())
}
