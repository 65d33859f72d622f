//! ACME certificate provisioning via Let's Encrypt (HTTP-01 only)
//!
//! Account credentials and issued PEM pairs persist in the cache
//! directory; nothing else survives a restart. Issuance runs on a
//! background worker fed by the SNI resolver, and pending HTTP-01
//! challenges are published for the plaintext listener to answer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus, RetryPolicy,
};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{certified_key_from_pem, CertError, CertStore, CertificateProvider, SniResolver};

/// ACME errors
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("account error: {0}")]
    Account(String),

    #[error("order error: {0}")]
    Order(String),

    #[error("challenge failed: {0}")]
    Challenge(String),

    #[error("HTTP-01 challenge not offered for this domain")]
    Http01NotSupported,

    #[error("finalization failed: {0}")]
    Finalization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cert(#[from] CertError),
}

/// ACME provider configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// Contact email registered with the ACME account; may be empty
    pub contact_email: String,
    /// Directory holding account credentials and issued PEM pairs
    pub cache_dir: PathBuf,
    /// Use the Let's Encrypt staging directory (for testing)
    pub use_staging: bool,
}

/// Certificate provider backed by Let's Encrypt
pub struct AcmeCertProvider {
    tls_config: Arc<ServerConfig>,
    store: Arc<CertStore>,
    /// Pending HTTP-01 challenges: token -> key authorization
    challenges: Arc<DashMap<String, String>>,
}

impl AcmeCertProvider {
    /// Create the provider: load or create the ACME account, warm the
    /// store from the cache directory, and start the issuance worker.
    pub async fn bootstrap(config: AcmeConfig) -> Result<Arc<Self>, AcmeError> {
        fs::create_dir_all(&config.cache_dir).await?;

        let account = load_or_create_account(&config).await?;

        let store = Arc::new(CertStore::new());
        match store.load_cached(&config.cache_dir) {
            Ok(0) => {}
            Ok(count) => info!("loaded {} cached certificate(s)", count),
            Err(e) => warn!("failed to load certificate cache: {}", e),
        }

        let challenges: Arc<DashMap<String, String>> = Arc::new(DashMap::new());
        let in_flight: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());
        let (issue_tx, issue_rx) = mpsc::unbounded_channel();

        let resolver = Arc::new(SniResolver::new(store.clone(), issue_tx, in_flight.clone()));

        let mut tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        tokio::spawn(issuance_worker(
            account,
            config,
            store.clone(),
            challenges.clone(),
            in_flight,
            issue_rx,
        ));

        Ok(Arc::new(Self {
            tls_config: Arc::new(tls_config),
            store,
            challenges,
        }))
    }

    pub fn store(&self) -> &Arc<CertStore> {
        &self.store
    }
}

impl CertificateProvider for AcmeCertProvider {
    fn tls_config_for_hijack(&self) -> Arc<ServerConfig> {
        self.tls_config.clone()
    }

    fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenges.get(token).map(|entry| entry.value().clone())
    }
}

async fn load_or_create_account(config: &AcmeConfig) -> Result<Account, AcmeError> {
    let account_path = config.cache_dir.join("account.json");

    if let Ok(creds_json) = fs::read_to_string(&account_path).await {
        let creds: AccountCredentials = serde_json::from_str(&creds_json)
            .map_err(|e| AcmeError::Account(format!("failed to parse credentials: {}", e)))?;

        let account = Account::builder()
            .map_err(|e| AcmeError::Account(e.to_string()))?
            .from_credentials(creds)
            .await
            .map_err(|e| AcmeError::Account(e.to_string()))?;

        info!("ACME account loaded from {}", account_path.display());
        return Ok(account);
    }

    let directory_url = if config.use_staging {
        info!("using Let's Encrypt STAGING environment");
        LetsEncrypt::Staging.url().to_string()
    } else {
        LetsEncrypt::Production.url().to_string()
    };

    let mailto = format!("mailto:{}", config.contact_email);
    let contact: Vec<&str> = if config.contact_email.is_empty() {
        Vec::new()
    } else {
        vec![mailto.as_str()]
    };

    let (account, creds) = Account::builder()
        .map_err(|e| AcmeError::Account(e.to_string()))?
        .create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await
        .map_err(|e| AcmeError::Account(e.to_string()))?;

    let creds_json = serde_json::to_string_pretty(&creds)
        .map_err(|e| AcmeError::Account(format!("failed to serialize credentials: {}", e)))?;
    fs::write(&account_path, creds_json).await?;

    info!("ACME account created and saved to {}", account_path.display());
    Ok(account)
}

/// Consumes issuance requests queued by the SNI resolver, one at a time
async fn issuance_worker(
    account: Account,
    config: AcmeConfig,
    store: Arc<CertStore>,
    challenges: Arc<DashMap<String, String>>,
    in_flight: Arc<DashMap<String, ()>>,
    mut issue_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(host) = issue_rx.recv().await {
        info!("requesting certificate for {}", host);

        match issue_certificate(&account, &config, &challenges, &host).await {
            Ok(key) => {
                store.insert(&host, Arc::new(key));
                info!("certificate issued for {}", host);
            }
            Err(e) => {
                warn!("certificate issuance failed for {}: {}", host, e);
            }
        }

        in_flight.remove(&host);
    }
}

async fn issue_certificate(
    account: &Account,
    config: &AcmeConfig,
    challenges: &DashMap<String, String>,
    host: &str,
) -> Result<CertifiedKey, AcmeError> {
    let identifiers = [Identifier::Dns(host.to_string())];
    let mut order = account
        .new_order(&NewOrder::new(&identifiers))
        .await
        .map_err(|e| AcmeError::Order(e.to_string()))?;

    // Publish the HTTP-01 challenge and tell the directory we are ready.
    // The token stays published until the order settles either way.
    let token = {
        let mut authorizations = order.authorizations();
        let mut authz = match authorizations.next().await {
            Some(result) => result.map_err(|e| AcmeError::Order(e.to_string()))?,
            None => return Err(AcmeError::Order("no authorization returned".to_string())),
        };

        match authz.status {
            AuthorizationStatus::Valid => {
                debug!("{} is already authorized", host);
                None
            }
            AuthorizationStatus::Pending => {
                let mut challenge = authz
                    .challenge(ChallengeType::Http01)
                    .ok_or(AcmeError::Http01NotSupported)?;

                let key_auth = challenge.key_authorization().as_str().to_string();
                let token = challenge.token.clone();
                challenges.insert(token.clone(), key_auth);

                challenge
                    .set_ready()
                    .await
                    .map_err(|e| AcmeError::Challenge(e.to_string()))?;
                Some(token)
            }
            other => {
                return Err(AcmeError::Challenge(format!(
                    "authorization status is {:?}",
                    other
                )))
            }
        }
    };

    let retry = RetryPolicy::new()
        .timeout(Duration::from_secs(120))
        .initial_delay(Duration::from_secs(2));

    let result = finalize_order(&mut order, &retry).await;
    if let Some(token) = token {
        challenges.remove(&token);
    }
    let (cert_pem, key_pem) = result?;

    let cert_path = config.cache_dir.join(format!("{}.crt", host));
    let key_path = config.cache_dir.join(format!("{}.key", host));
    fs::write(&cert_path, &cert_pem).await?;
    fs::write(&key_path, &key_pem).await?;
    debug!("certificate for {} cached at {}", host, cert_path.display());

    Ok(certified_key_from_pem(
        cert_pem.as_bytes(),
        key_pem.as_bytes(),
    )?)
}

async fn finalize_order(
    order: &mut Order,
    retry: &RetryPolicy,
) -> Result<(String, String), AcmeError> {
    let status = order
        .poll_ready(retry)
        .await
        .map_err(|e| AcmeError::Challenge(e.to_string()))?;

    match status {
        OrderStatus::Ready => {}
        OrderStatus::Invalid => {
            return Err(AcmeError::Challenge(
                "order became invalid, challenge verification failed".to_string(),
            ))
        }
        other => {
            return Err(AcmeError::Challenge(format!(
                "unexpected order status: {:?}",
                other
            )))
        }
    }

    let key_pem = order
        .finalize()
        .await
        .map_err(|e| AcmeError::Finalization(e.to_string()))?;
    let cert_pem = order
        .poll_certificate(retry)
        .await
        .map_err(|e| AcmeError::Finalization(e.to_string()))?;

    Ok((cert_pem, key_pem))
}
