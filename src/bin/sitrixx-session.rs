use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use sitrixx_session::{
    AuthClient, CoordinatorConfig, CoordinatorState, FileSessionStore, ProfileClient,
    SessionCoordinator, SupabaseConfig, SupabaseIdentity,
};
use tracing_subscriber::EnvFilter;

type Identity = Arc<SupabaseIdentity<FileSessionStore>>;
type Profiles = Arc<ProfileClient<Identity>>;
type Coordinator = SessionCoordinator<Identity, Profiles>;

#[derive(Parser, Debug)]
#[command(name = "sitrixx-session")]
#[command(about = "Sign in to Sitrixx and inspect the session and profile")]
#[command(version)]
struct Cli {
    /// Where the session is persisted (default: ~/.sitrixx/session.json)
    #[arg(long, global = true, value_name = "FILE")]
    session_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "SITRIXX_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Show the restored session and profile
    Status,

    /// Sign out and forget the persisted session
    Logout,

    /// Replace a temporary password and clear the forced-change flag
    ChangePassword {
        #[arg(long, env = "SITRIXX_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
    },

    /// Email a one-time sign-in code
    SendCode {
        #[arg(long)]
        email: String,
    },

    /// Sign in with an emailed one-time code
    VerifyCode {
        #[arg(long)]
        email: String,
        #[arg(long)]
        code: String,
    },
}

struct App {
    identity: Identity,
    profiles: Profiles,
    coordinator: Coordinator,
}

impl App {
    fn start(session_file: PathBuf) -> anyhow::Result<Self> {
        let config = SupabaseConfig::from_env()?;
        let identity = Arc::new(SupabaseIdentity::new(
            AuthClient::new(config.clone()),
            FileSessionStore::new(session_file),
        ));
        let profiles = Arc::new(ProfileClient::new(config, identity.clone()));
        let coordinator = SessionCoordinator::start(
            identity.clone(),
            profiles.clone(),
            CoordinatorConfig::from_env()?,
        );
        Ok(Self {
            identity,
            profiles,
            coordinator,
        })
    }

    /// Wait until boot is over and any profile lookup has an outcome.
    async fn settled(&self) -> anyhow::Result<CoordinatorState> {
        Ok(self.coordinator.wait_for(is_settled).await?)
    }

    /// Wait for a session whose profile lookup has an outcome.
    async fn signed_in(&self) -> anyhow::Result<CoordinatorState> {
        let state = self
            .coordinator
            .wait_for(|s| s.session.is_some() && is_settled(s))
            .await?;
        Ok(state)
    }

    /// Drop any restored session so the next sign-in starts clean.
    async fn fresh(&self) -> anyhow::Result<()> {
        if self.settled().await?.session.is_some() {
            self.coordinator.sign_out().await;
        }
        Ok(())
    }
}

fn is_settled(state: &CoordinatorState) -> bool {
    !state.session_bootstrapping
        && !state.profile_fetch_in_progress
        && (state.session.is_none()
            || state.profile.is_some()
            || state.profile_fetch_error.is_some())
}

fn summary(state: &CoordinatorState) -> serde_json::Value {
    let profile = state.profile.as_ref();
    json!({
        "phase": format!("{:?}", state.phase()),
        "user_id": state.user_id(),
        "email": state.session.as_ref().and_then(|s| s.user.email.as_deref()),
        "role": profile.and_then(|p| p.role.as_deref()),
        "is_admin": profile.is_some_and(|p| p.is_admin()),
        "needs_password_change": profile.is_some_and(|p| p.must_change_password()),
        "profile_fetch_error": state.profile_fetch_error,
    })
}

fn default_session_file() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().context("cannot locate home directory; pass --session-file")?;
    Ok(home.join(".sitrixx").join("session.json"))
}

async fn run(cli: Cli) -> anyhow::Result<serde_json::Value> {
    let session_file = match cli.session_file {
        Some(path) => path,
        None => default_session_file()?,
    };
    let app = App::start(session_file)?;

    let output = match cli.command {
        Commands::Login { email, password } => {
            app.fresh().await?;
            app.coordinator.sign_in(&email, &password).await?;
            summary(&app.signed_in().await?)
        }
        Commands::Status => summary(&app.settled().await?),
        Commands::Logout => {
            app.settled().await?;
            app.coordinator.sign_out().await;
            json!({ "signed_out": true })
        }
        Commands::ChangePassword { new_password } => {
            let state = app.settled().await?;
            let Some(user_id) = state.user_id().cloned() else {
                bail!("not signed in");
            };
            app.identity
                .update_password(&new_password)
                .await
                .context("password update rejected")?;
            app.profiles
                .set_needs_password_change(&user_id, false)
                .await
                .context("password changed but the profile flag could not be cleared")?;
            app.coordinator.refresh_profile().await;
            summary(&app.coordinator.state())
        }
        Commands::SendCode { email } => {
            app.identity.send_email_otp(&email).await?;
            json!({ "sent": true, "email": email })
        }
        Commands::VerifyCode { email, code } => {
            app.fresh().await?;
            app.identity
                .verify_email_otp(&email, &code)
                .await
                .context("code rejected")?;
            summary(&app.signed_in().await?)
        }
    };

    app.coordinator.stop();
    Ok(output)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = run(cli).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
