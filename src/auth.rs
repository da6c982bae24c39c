//! OAuth2 authentication for the Gmail API

use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::{debug, info};
use yup_oauth2::ApplicationSecret;

use crate::error::{GmailError, Result};

/// Scopes this tool asks for
///
/// gmail.modify covers listing, reading headers, trashing and label changes.
/// It does not allow permanent deletion.
pub const REQUIRED_SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.modify"];

/// Environment variable that may hold the whole client secret JSON
pub const CREDENTIALS_ENV: &str = "GOOGLE_CREDENTIALS";

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub =
    Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Whether a user is signed in, as shown by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub logged_in: bool,
    pub email: Option<String>,
}

impl AuthStatus {
    pub fn signed_out() -> Self {
        Self {
            logged_in: false,
            email: None,
        }
    }
}

/// Find the OAuth client secret
///
/// Order: `GOOGLE_CREDENTIALS` (JSON), then `GMAIL_CLIENT_ID` and
/// `GMAIL_CLIENT_SECRET`, then the credentials file.
pub async fn resolve_application_secret(credentials_path: &Path) -> Result<ApplicationSecret> {
    if let Ok(json) = env::var(CREDENTIALS_ENV) {
        if !json.trim().is_empty() {
            debug!("Using OAuth client from {}", CREDENTIALS_ENV);
            return yup_oauth2::parse_application_secret(json.as_bytes()).map_err(|e| {
                GmailError::AuthError(format!("{} is not a valid client secret: {}", CREDENTIALS_ENV, e))
            });
        }
    }

    if let Ok(secret) = load_credentials_from_env() {
        debug!("Using OAuth client from GMAIL_CLIENT_ID/GMAIL_CLIENT_SECRET");
        return Ok(secret);
    }

    yup_oauth2::read_application_secret(credentials_path)
        .await
        .map_err(|e| {
            GmailError::AuthError(format!(
                "Failed to read credentials from {}: {}",
                credentials_path.display(),
                e
            ))
        })
}

/// Initialize the Gmail API hub, running the consent flow if no token is cached
pub async fn initialize_gmail_hub(
    credentials_path: &Path,
    token_cache_path: &Path,
) -> Result<GmailHub> {
    let secret = resolve_application_secret(credentials_path).await?;

    if let Some(parent) = token_cache_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // HTTPRedirect opens a browser for user authorization
    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_cache_path)
    .build()
    .await
    .map_err(|e| GmailError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    // Obtain the token up front so concurrent calls never race the consent flow
    auth.token(REQUIRED_SCOPES)
        .await
        .map_err(|e| GmailError::AuthError(format!("Failed to obtain token: {}", e)))?;

    if token_cache_path.exists() {
        secure_token_file(token_cache_path).await?;
    }

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| GmailError::AuthError(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    info!("Gmail API client ready");
    Ok(Gmail::new(client, auth))
}

/// Load OAuth2 credentials from environment variables
///
/// - `GMAIL_CLIENT_ID`: OAuth2 client ID
/// - `GMAIL_CLIENT_SECRET`: OAuth2 client secret
/// - `GMAIL_REDIRECT_URI`: optional, defaults to http://localhost:8080
pub fn load_credentials_from_env() -> Result<ApplicationSecret> {
    let client_id = env::var("GMAIL_CLIENT_ID")
        .map_err(|_| GmailError::ConfigError("GMAIL_CLIENT_ID not set".to_string()))?;
    let client_secret = env::var("GMAIL_CLIENT_SECRET")
        .map_err(|_| GmailError::ConfigError("GMAIL_CLIENT_SECRET not set".to_string()))?;
    let redirect_uri =
        env::var("GMAIL_REDIRECT_URI").unwrap_or_else(|_| "http://localhost:8080".to_string());

    Ok(ApplicationSecret {
        client_id,
        client_secret,
        auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
        token_uri: "https://oauth2.googleapis.com/token".to_string(),
        redirect_uris: vec![redirect_uri],
        ..Default::default()
    })
}

/// True when a token cache exists on disk
pub fn has_cached_token(token_cache_path: &Path) -> bool {
    token_cache_path.is_file()
}

/// Forget the signed-in user by removing the token cache
///
/// Returns whether a cache was actually removed.
pub async fn sign_out(token_cache_path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(token_cache_path).await {
        Ok(()) => {
            info!("Removed token cache {}", token_cache_path.display());
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Restrict the token file to its owner (0600)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

/// Windows relies on the profile directory ACLs
#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}
