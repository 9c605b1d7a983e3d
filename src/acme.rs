//! ACME (Let's Encrypt) certificate management
//!
//! Every routed hostname gets its own certificate, obtained with the HTTP-01
//! challenge and renewed when it gets close to expiry. The [`CertCache`] is
//! the only persistence: it holds the account credentials, one key and chain
//! per host under `<host>+cert`, and pending challenge tokens so that any
//! gateway instance sharing the cache can answer a challenge.
//!
//! The HTTPS listener picks the certificate by SNI. Hosts without one yet,
//! and clients sending no SNI, get a self-signed fallback.

use crate::cache::{CacheError, CertCache};
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder,
    OrderStatus,
};
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Cache key of the ACME account credentials
pub const ACCOUNT_CACHE_KEY: &str = "acme_account+key";

/// How often the renewal loop looks at the current certificates
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Retry delay after a failed acquisition, doubled up to the maximum
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(30);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// Delay between polls of an order or authorization
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 30;

/// Cache key of the certificate for `host`
pub fn cert_cache_key(host: &str) -> String {
    format!("{}+cert", host)
}

/// Cache key of a pending HTTP-01 token
pub fn http01_cache_key(token: &str) -> String {
    format!("{}+http-01", token)
}

/// Pending HTTP-01 challenges, kept in memory and mirrored to the cache
#[derive(Clone)]
pub struct Http01Challenges {
    pending: Arc<DashMap<String, String>>,
    cache: Arc<CertCache>,
}

impl Http01Challenges {
    pub fn new(cache: Arc<CertCache>) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            cache,
        }
    }

    pub async fn set(&self, token: &str, key_authorization: &str) -> Result<(), CacheError> {
        self.pending
            .insert(token.to_string(), key_authorization.to_string());
        self.cache
            .put(&http01_cache_key(token), key_authorization.as_bytes())
            .await
    }

    /// Key authorization for `token`, looking in memory first and then the cache
    pub async fn get(&self, token: &str) -> Option<String> {
        if let Some(value) = self.pending.get(token) {
            return Some(value.clone());
        }

        match self.cache.get(&http01_cache_key(token)).await {
            Ok(data) => String::from_utf8(data).ok(),
            Err(CacheError::NotFound) => None,
            Err(e) => {
                warn!(token, error = %e, "Failed to read HTTP-01 token from cache");
                None
            }
        }
    }

    pub async fn remove(&self, token: &str) {
        self.pending.remove(token);
        if let Err(e) = self.cache.delete(&http01_cache_key(token)).await {
            warn!(token, error = %e, "Failed to delete HTTP-01 token from cache");
        }
    }
}

/// Certificate resolver for the HTTPS listener, keyed by lowercase hostname
pub struct CertResolver {
    certs: DashMap<String, Arc<CertifiedKey>>,
    fallback: RwLock<Option<Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("hosts", &self.certs.len())
            .field("has_fallback", &self.fallback.read().is_some())
            .finish()
    }
}

impl CertResolver {
    pub fn new(fallback: Option<Arc<CertifiedKey>>) -> Self {
        Self {
            certs: DashMap::new(),
            fallback: RwLock::new(fallback),
        }
    }

    pub fn set(&self, host: &str, cert: Arc<CertifiedKey>) {
        self.certs.insert(host.to_ascii_lowercase(), cert);
    }

    /// Certificate served for `host`, the fallback when it has none
    pub fn get(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.certs
            .get(&host.to_ascii_lowercase())
            .map(|cert| Arc::clone(cert.value()))
            .or_else(|| self.fallback.read().clone())
    }

    pub fn has_cert(&self, host: &str) -> bool {
        self.certs.contains_key(&host.to_ascii_lowercase())
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => self.get(name),
            None => self.fallback.read().clone(),
        }
    }
}

/// Settings of the ACME manager
#[derive(Debug, Clone)]
pub struct AcmeSettings {
    pub hosts: Vec<String>,
    pub email: Option<String>,
    pub directory_url: String,
    pub renew_before_days: u64,
}

/// ACME certificate manager
pub struct AcmeManager {
    settings: AcmeSettings,
    cache: Arc<CertCache>,
    challenges: Http01Challenges,
    resolver: Arc<CertResolver>,
    leaves: DashMap<String, CertificateDer<'static>>,
}

impl AcmeManager {
    pub fn new(settings: AcmeSettings, cache: Arc<CertCache>, resolver: Arc<CertResolver>) -> Self {
        Self {
            challenges: Http01Challenges::new(Arc::clone(&cache)),
            settings,
            cache,
            resolver,
            leaves: DashMap::new(),
        }
    }

    pub fn http01_challenges(&self) -> Http01Challenges {
        self.challenges.clone()
    }

    pub fn resolver(&self) -> Arc<CertResolver> {
        Arc::clone(&self.resolver)
    }

    /// Load or create the ACME account
    async fn get_or_create_account(&self) -> anyhow::Result<Account> {
        match self.cache.get(ACCOUNT_CACHE_KEY).await {
            Ok(data) => {
                debug!("Loading existing ACME account from cache");
                let credentials: AccountCredentials = serde_json::from_slice(&data)?;
                return Ok(Account::from_credentials(credentials).await?);
            }
            Err(CacheError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        info!(directory = %self.settings.directory_url, "Creating new ACME account");
        let contact = self
            .settings
            .email
            .as_ref()
            .map(|email| format!("mailto:{}", email));
        let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contacts,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.settings.directory_url,
            None,
        )
        .await?;

        let data = serde_json::to_vec(&credentials)?;
        self.cache.put(ACCOUNT_CACHE_KEY, &data).await?;
        info!("ACME account credentials saved to cache");

        Ok(account)
    }

    /// Load the cached certificate of `host` if it is still valid long enough
    async fn load_cached_cert(
        &self,
        host: &str,
    ) -> anyhow::Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
        let key = cert_cache_key(host);
        let data = match self.cache.get(&key).await {
            Ok(data) => data,
            Err(CacheError::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some((certs, private_key)) = parse_pem_bundle(&data) else {
            warn!(key = %key, "Cached certificate is unreadable, ignoring it");
            return Ok(None);
        };

        if !certs
            .first()
            .is_some_and(|leaf| is_cert_valid_for_days(leaf, self.settings.renew_before_days))
        {
            info!(host, "Cached certificate expires soon, will renew");
            return Ok(None);
        }

        info!(key = %key, "Loaded cached certificate");
        Ok(Some((certs, private_key)))
    }

    /// Install every usable cached certificate
    async fn load_cached_certs(&self) {
        for host in &self.settings.hosts {
            let loaded = match self.load_cached_cert(host).await {
                Ok(Some((certs, key))) => self.install(host, certs, key),
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            if let Err(e) = loaded {
                warn!(host = %host, error = %e, "Failed to load cached certificate");
            }
        }
    }

    /// Obtain a new certificate for `host`, returning the chain, the key and their PEM bundle
    async fn obtain_certificate(
        &self,
        account: &Account,
        host: &str,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>, String)> {
        let identifiers = [Identifier::Dns(host.to_string())];

        info!(domain = %host, "Requesting new certificate");

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;

        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("HTTP-01 challenge not available for {}", identifier))?;

            let key_auth = order.key_authorization(challenge);
            debug!(domain = %identifier, token = %challenge.token, "Setting up HTTP-01 challenge");
            self.challenges.set(&challenge.token, key_auth.as_str()).await?;

            order.set_challenge_ready(&challenge.url).await?;

            let result = self.wait_for_authorization(&mut order, &identifier).await;
            self.challenges.remove(&challenge.token).await;
            result?;
        }

        let mut attempts = 0;
        loop {
            let state = order.state();
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("Order for {} invalid", host),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLLS {
                        anyhow::bail!("Order timeout for {}", host);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host.to_string());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            order.refresh().await?;
            let state = order.state();
            match state.status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("Order for {} valid but no certificate returned", host);
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLLS {
                        anyhow::bail!("Certificate timeout for {}", host);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                _ => anyhow::bail!("Unexpected order status for {}: {:?}", host, state.status),
            }
        };

        let bundle = format!("{}{}", private_key.serialize_pem(), cert_chain_pem);
        let (certs, key) = parse_pem_bundle(bundle.as_bytes())
            .ok_or_else(|| anyhow::anyhow!("ACME server returned an unreadable certificate chain"))?;

        info!(domain = %host, "Certificate obtained successfully");
        Ok((certs, key, bundle))
    }

    async fn wait_for_authorization(&self, order: &mut instant_acme::Order, identifier: &str) -> anyhow::Result<()> {
        let mut attempts = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            order.refresh().await?;
            let auths = order.authorizations().await?;
            let status = auths
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == identifier))
                .map(|a| &a.status);

            match status {
                Some(AuthorizationStatus::Valid) => {
                    info!(domain = %identifier, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    attempts += 1;
                    if attempts > MAX_POLLS {
                        anyhow::bail!("Authorization timeout for {}", identifier);
                    }
                    debug!(domain = %identifier, attempt = attempts, "Waiting for authorization");
                }
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("Authorization failed for {}", identifier);
                }
                Some(status) => {
                    anyhow::bail!("Authorization for {} ended as {:?}", identifier, status);
                }
                None => {
                    anyhow::bail!("Authorization not found for {}", identifier);
                }
            }
        }
    }

    /// Install the certificate of `host` on the resolver
    fn install(&self, host: &str, certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> anyhow::Result<()> {
        let leaf = certs
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Empty certificate chain for {}", host))?;
        self.resolver.set(host, certified_key(certs, &key)?);
        self.leaves.insert(host.to_string(), leaf);
        Ok(())
    }

    async fn issue(&self, account: &Account, host: &str) -> anyhow::Result<()> {
        let (certs, key, bundle) = self.obtain_certificate(account, host).await?;
        self.cache.put(&cert_cache_key(host), bundle.as_bytes()).await?;
        self.install(host, certs, key)
    }

    fn needs_renewal(&self, host: &str) -> bool {
        self.leaves
            .get(host)
            .map(|leaf| !is_cert_valid_for_days(leaf.value(), self.settings.renew_before_days))
            .unwrap_or(true)
    }

    /// Issue a certificate for every host that has none or whose certificate expires soon.
    ///
    /// A failing host does not stop the others; the error reports how many failed.
    async fn renew_due(&self, account: &mut Option<Account>) -> anyhow::Result<()> {
        let due: Vec<&String> = self
            .settings
            .hosts
            .iter()
            .filter(|host| self.needs_renewal(host))
            .collect();
        if due.is_empty() {
            debug!("All certificates are current");
            return Ok(());
        }

        let account = match account {
            Some(account) => account,
            None => account.insert(self.get_or_create_account().await?),
        };

        let mut failed = 0;
        for host in &due {
            if let Err(e) = self.issue(account, host).await {
                error!(host = %host, error = %e, "Failed to obtain certificate");
                failed += 1;
            }
        }

        if failed > 0 {
            anyhow::bail!("{} of {} certificates could not be obtained", failed, due.len());
        }
        Ok(())
    }

    /// Obtain, then keep renewing, the certificates until shutdown.
    ///
    /// Failures never end the loop: they are retried with a growing delay.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        if self.settings.hosts.is_empty() {
            warn!("No routed hostnames, ACME manager idle");
            return;
        }

        self.load_cached_certs().await;

        let mut account = None;
        let mut retry_delay = INITIAL_RETRY_DELAY;

        loop {
            let delay = tokio::select! {
                result = self.renew_due(&mut account) => match result {
                    Ok(()) => {
                        retry_delay = INITIAL_RETRY_DELAY;
                        RENEWAL_CHECK_INTERVAL
                    }
                    Err(e) => {
                        let delay = retry_delay;
                        error!(error = %e, retry_in_secs = delay.as_secs(), "Certificate acquisition failed");
                        retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                        delay
                    }
                },
                _ = shutdown_requested(&mut shutdown_rx) => break,
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown_rx) => break,
            }
        }

        info!("ACME manager shutting down");
    }
}

/// Resolves once shutdown is signalled or the sender is gone
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Build a rustls signing key for a chain and its private key
pub fn certified_key(certs: Vec<CertificateDer<'static>>, key: &PrivateKeyDer<'_>) -> anyhow::Result<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// TLS settings of the HTTPS listener, certificates coming from `resolver`
pub fn server_config(resolver: Arc<CertResolver>) -> anyhow::Result<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Self-signed certificate for `hosts`, served until ACME delivers
pub fn self_signed_cert(hosts: &[String]) -> anyhow::Result<Arc<CertifiedKey>> {
    let names = if hosts.is_empty() {
        vec!["localhost".to_string()]
    } else {
        hosts.to_vec()
    };

    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    certified_key(vec![cert_der], &key_der)
}

/// Split a PEM bundle into its certificate chain and private key
fn parse_pem_bundle(data: &[u8]) -> Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut certs = Vec::new();
    let mut key = None;

    let mut reader = BufReader::new(data);
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::X509Certificate(cert))) => certs.push(cert),
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(k))) => key = Some(k.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(k))) => key = Some(k.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(k))) => key = Some(k.into()),
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => return None,
        }
    }

    if certs.is_empty() {
        return None;
    }
    key.map(|key| (certs, key))
}

fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let expiry = parsed.validity().not_after.timestamp();

    let remaining_secs = expiry - now;
    if remaining_secs < 0 {
        info!("Certificate has already expired");
        return false;
    }

    let remaining_days = remaining_secs as u64 / (24 * 60 * 60);
    if remaining_days < days {
        info!(remaining_days, required_days = days, "Certificate expires soon, renewal needed");
        return false;
    }

    debug!(remaining_days, "Certificate validity check passed");
    true
}
