mod config;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;
use config::{default_policy_service, Args};
use contentguard::{
    protect, resolve_user_identity, unprotect, AuthError, BearerToken, Consent, FixedConsent,
    IdentityProvider, LicenseInfo, LocalPolicyService, ProtectionError, SessionManager,
    UserIdentity,
};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tracing::{debug, error, info};
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Error)]
enum QuickstartError {
    #[error(transparent)]
    Protection(#[from] ProtectionError),

    #[error("Failed to load template catalogue {path}: {source}")]
    Catalogue {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{0}' has no domain part; pass the user as name@domain")]
    InvalidUser(String),

    #[error("No templates are available to this user")]
    NoTemplates,

    #[error("Invalid template selection '{0}'")]
    InvalidSelection(String),

    #[error("Sign-in did not finish within {0} seconds")]
    Timeout(u64),

    #[error("Sign-in task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Console I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl QuickstartError {
    fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Protection(e) => e.suggestion(),
            Self::Catalogue { .. } => Some("Check the catalogue path and its JSON format"),
            Self::InvalidUser(_) => Some("Use the full email address, e.g. alice@contoso.com"),
            Self::NoTemplates => Some("Ask an administrator to publish a template for your tenant"),
            Self::InvalidSelection(_) => Some("Enter one of the listed template numbers"),
            Self::Timeout(_) => Some("Raise --timeout-secs or supply --token"),
            Self::Join(_) | Self::Io(_) => None,
        }
    }
}

/// Console-backed identity provider
///
/// Uses the user and token given on the command line, and prompts on the
/// terminal for whichever is missing.
struct ConsoleTokenProvider {
    user: Option<UserIdentity>,
    token: Option<BearerToken>,
    redirect_uri: String,
}

impl ConsoleTokenProvider {
    fn from_args(args: &Args) -> Self {
        Self {
            user: args.user.as_deref().map(UserIdentity::new),
            token: args.token.clone().map(BearerToken::new),
            redirect_uri: args.redirect_uri.clone(),
        }
    }
}

fn read_console_line(lines: &[String]) -> Result<String, AuthError> {
    let mut stderr = std::io::stderr();
    let (last, rest) = lines
        .split_last()
        .ok_or_else(|| AuthError::RequestFailed("empty prompt".to_string()))?;
    let write = rest
        .iter()
        .try_for_each(|line| writeln!(stderr, "{line}"))
        .and_then(|_| write!(stderr, "{last}"))
        .and_then(|_| stderr.flush());
    write.map_err(|e| AuthError::RequestFailed(e.to_string()))?;

    let mut line = String::new();
    let read = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| AuthError::RequestFailed(e.to_string()))?;
    if read == 0 {
        return Err(AuthError::Cancelled);
    }
    Ok(line.trim().to_string())
}

impl IdentityProvider for ConsoleTokenProvider {
    fn acquire_token(
        &self,
        identity: &UserIdentity,
        authority: &str,
        resource: &str,
        claims: Option<&str>,
    ) -> Result<String, AuthError> {
        if let (Some(token), None) = (&self.token, claims) {
            return Ok(token.expose().to_string());
        }
        let mut lines = vec![format!(
            "Sign in as {identity} at {authority} for {resource} (redirect URI {})",
            self.redirect_uri
        )];
        if let Some(claims) = claims {
            lines.push(format!("Claims challenge: {claims}"));
        }
        lines.push("Paste the access token: ".to_string());
        read_console_line(&lines)
    }

    fn user_identity(&self) -> Result<UserIdentity, AuthError> {
        match &self.user {
            Some(user) => Ok(user.clone()),
            None => read_console_line(&["Enter your email address: ".to_string()])
                .map(UserIdentity::new),
        }
    }
}

async fn prompt(reader: &mut BufReader<Stdin>, message: &str) -> Result<String, QuickstartError> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(message.as_bytes()).await?;
    stdout.flush().await?;

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "stdin closed").into());
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn run(args: Args) -> Result<(), QuickstartError> {
    let credentials = Arc::new(ConsoleTokenProvider::from_args(&args));
    let user = tokio::task::spawn_blocking({
        let credentials = Arc::clone(&credentials);
        move || resolve_user_identity(credentials.as_ref())
    })
    .await??;
    let domain = user
        .domain()
        .ok_or_else(|| QuickstartError::InvalidUser(user.to_string()))?
        .to_string();

    let policy = match &args.catalogue {
        Some(path) => {
            LocalPolicyService::load_catalogue(path).map_err(|source| QuickstartError::Catalogue {
                path: path.clone(),
                source,
            })?
        }
        None => default_policy_service(&domain),
    };

    let manager = SessionManager::new(
        Arc::new(args.discovery(&domain)),
        Arc::new(policy),
        Arc::new(FixedConsent(Consent::AcceptAlways)),
    );
    let profile = manager.open(args.application(), args.storage())?;

    info!(identity = %user, backend = ?args.backend(), "creating protection session");
    let creating = tokio::task::spawn_blocking({
        let profile = profile.clone();
        let user = user.clone();
        move || profile.get_or_create_session(&user, credentials)
    });
    let session = tokio::time::timeout(Duration::from_secs(args.timeout_secs), creating)
        .await
        .map_err(|_| QuickstartError::Timeout(args.timeout_secs))???;

    let templates = session.list_templates()?;
    if templates.is_empty() {
        return Err(QuickstartError::NoTemplates);
    }
    println!("Templates available to {user}:");
    for (index, template) in templates.iter().enumerate() {
        println!("  {index}: {template}");
    }

    let mut reader = BufReader::new(tokio::io::stdin());
    let selection = prompt(&mut reader, "Select a template: ").await?;
    let template = selection
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|index| templates.get(index))
        .ok_or_else(|| QuickstartError::InvalidSelection(selection.trim().to_string()))?;

    let plaintext = prompt(&mut reader, "Enter some text to protect: ").await?;

    let mut publisher = session.create_publishing_handler(&template.id)?;
    let ciphertext = protect(&mut publisher, plaintext.as_bytes())?;
    println!("Protected content: {}", BASE64.encode(&ciphertext));

    let license = publisher.serialized_license().to_vec();
    if args.show_license {
        let info = LicenseInfo::parse(&license)?;
        match serde_json::to_string_pretty(&info) {
            Ok(json) => println!("License:\n{json}"),
            Err(e) => debug!(error = %e, "license header could not be rendered"),
        }
    }

    let mut consumer = session.create_consumption_handler(&license, Some("console input"))?;
    let decrypted = unprotect(&mut consumer, &ciphertext)?;
    println!("Unprotected content: {}", String::from_utf8_lossy(&decrypted));

    profile.close()?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{e}");
        eprintln!("Error: {e}");
        if let Some(hint) = e.suggestion() {
            eprintln!("Hint: {hint}");
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_and_token_from_args() -> Result<(), Box<dyn std::error::Error>> {
        let args = Args::parse_from([
            "contentguard-quickstart",
            "--app-id",
            "app",
            "--user",
            "Alice@Contoso.com",
            "--token",
            "secret-token",
        ]);
        let provider = ConsoleTokenProvider::from_args(&args);

        let user = resolve_user_identity(&provider)?;
        assert_eq!(user, UserIdentity::new("alice@contoso.com"));
        assert_eq!(
            provider.acquire_token(&user, "https://p/oauth2", "https://p", None)?,
            "secret-token"
        );
        Ok(())
    }

    #[test]
    fn test_suggestions_cover_protection_errors() {
        let err = QuickstartError::Protection(ProtectionError::Authentication {
            identity: "the signed-in user".to_string(),
            reason: "cancelled".to_string(),
            source: None,
        });
        assert!(err.suggestion().is_some());
    }
}
