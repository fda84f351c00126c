//! Command execution
//!
//! Each invocation restores the session from the SQLite store, runs one
//! command through the [`SessionManager`], and exits. Anything the command
//! changes is already persisted by the time it returns.

use std::sync::Arc;

use cg_core::{Config, Error};
use cg_session::{
    Credentials, HttpRequest, HttpResponse, HttpTransport, KeyValueStore, Session, SessionEvent, SessionManager,
    SqliteStore, Transport,
};
use chrono::{DateTime, Local, Utc};
use nu_ansi_term::Color;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::Command;

const PASSWORD_ENV: &str = "CAMPUSGO_PASSWORD";

/// A restored session plus the configuration it was built from
pub struct Cli {
    config: Config,
    session: SessionManager,
}

impl Cli {
    /// Open the configured SQLite store and restore the session
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let store = SqliteStore::new(&config.storage.path)
            .map_err(|e| anyhow::anyhow!("Failed to open session store {}: {}", config.storage.path, e))?;
        let transport = HttpTransport::from_config(&config)
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Self::with_parts(config, Arc::new(store), Arc::new(transport)).await
    }

    pub async fn with_parts(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        let session = SessionManager::new(&config, store, transport);
        spawn_event_logger(&session);

        session.initialize().await.map_err(session_error)?;

        Ok(Self { config, session })
    }

    #[cfg(test)]
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Run one command
    pub async fn run(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Login { username, password } => self.login(username, password).await,
            Command::Logout => {
                self.session.logout();
                println!("Logged out");
                Ok(())
            }
            Command::Whoami => self.whoami().await,
            Command::Status => {
                println!("{}", render_status(&self.session.snapshot(), self.session.is_token_expiring_soon()));
                Ok(())
            }
            Command::Refresh => self.refresh().await,
            Command::Get { path } => self.request(HttpRequest::get(self.config.endpoint_url(&path))).await,
            Command::Post { path, body } => {
                let body: serde_json::Value =
                    serde_json::from_str(&body).map_err(|e| anyhow::anyhow!("Invalid JSON body: {}", e))?;
                self.request(HttpRequest::post(self.config.endpoint_url(&path)).with_json(body))
                    .await
            }
            Command::Help | Command::Version => Ok(()),
        }
    }

    async fn login(&self, username: String, password: Option<String>) -> anyhow::Result<()> {
        let password = resolve_password(password, std::env::var(PASSWORD_ENV).ok())?;

        let user = self
            .session
            .authenticate(&Credentials::new(username, password))
            .await
            .map_err(session_error)?;

        println!(
            "Logged in as {}",
            Color::Green.bold().paint(user.username().unwrap_or("<unknown>"))
        );
        Ok(())
    }

    async fn whoami(&self) -> anyhow::Result<()> {
        match self.session.refresh_user().await.map_err(session_error)? {
            Some(user) => println!("{}", serde_json::to_string_pretty(user.as_json())?),
            None => println!("Not logged in"),
        }
        Ok(())
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        match self.session.refresh_access_token().await.map_err(session_error)? {
            Some(_) => {
                println!("Access token refreshed");
                if let Some(expiry) = self.session.expiry_epoch_millis() {
                    println!("Expires at {}", format_expiry(expiry));
                }
                Ok(())
            }
            None => Err(session_error(Error::SessionExpired)),
        }
    }

    async fn request(&self, request: HttpRequest) -> anyhow::Result<()> {
        debug!("{} {}", request.method, request.url);
        let response = self.session.fetch_with_auth(request).await.map_err(session_error)?;
        println!("{}", render_response(&response));
        Ok(())
    }
}

/// Log session events until the manager goes away
fn spawn_event_logger(session: &SessionManager) {
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::SessionExpired) => warn!("Session expired"),
                Ok(event) => info!("Session event: {:?}", event),
                Err(RecvError::Lagged(skipped)) => debug!("Missed {} session events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Map a session error to a message for the terminal
fn session_error(e: Error) -> anyhow::Error {
    if e.is_session_expired() {
        anyhow::anyhow!("Session expired, please log in again with `campusgo login <username>`")
    } else {
        anyhow::Error::new(e)
    }
}

/// Password argument, falling back to the environment
fn resolve_password(arg: Option<String>, env: Option<String>) -> anyhow::Result<String> {
    arg.or(env)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Password required: pass it as an argument or set {}", PASSWORD_ENV))
}

fn format_expiry(expiry_epoch_millis: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(expiry_epoch_millis) {
        Some(at) => at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %Z").to_string(),
        None => format!("{} ms", expiry_epoch_millis),
    }
}

fn render_status(session: &Session, expiring_soon: bool) -> String {
    if !session.is_authenticated() {
        return Color::Yellow.paint("Not logged in").to_string();
    }

    let user = session
        .user
        .as_ref()
        .and_then(|u| u.username())
        .unwrap_or("<unknown>");
    let expiry = match session.expiry_epoch_millis {
        Some(expiry) => format_expiry(expiry),
        None => "unknown".to_string(),
    };
    let token_state = if expiring_soon {
        Color::Yellow.paint("expiring soon")
    } else {
        Color::Green.paint("valid")
    };

    [
        Color::Green.bold().paint("Logged in").to_string(),
        format!("User:          {}", user),
        format!("Access token:  {}", token_state),
        format!("Expires:       {}", expiry),
        format!(
            "Refresh token: {}",
            if session.has_refresh_token() { "present" } else { "none" }
        ),
    ]
    .join("\n")
}

fn render_response(response: &HttpResponse) -> String {
    let status = if response.is_success() {
        Color::Green.paint(response.status.to_string())
    } else {
        Color::Red.paint(response.status.to_string())
    };

    let body = response
        .json::<serde_json::Value>()
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| response.text());

    format!("{}\n{}", status, body)
}
