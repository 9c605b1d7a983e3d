//! Per-route authentication
//!
//! A route may carry an [`Authenticator`]. The router asks
//! [`Authenticator::is_authenticated`] first and, on failure, hands the
//! response over to [`Authenticator::authenticate`], which turns it into a
//! complete terminal response (for Basic auth a 401 challenge).
//!
//! Credential checks may be slow (bcrypt), so validators run on the blocking
//! pool and never stall the worker serving other connections.

use crate::body::{full, ProxyBody};
use async_trait::async_trait;
use base64::Engine;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Request, Response, StatusCode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Challenge sent with every Basic auth 401
const BASIC_CHALLENGE: &str = "Basic realm=\"Restricted area\"";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown authenticator: {0:?}")]
    UnknownAuthenticator(String),
    #[error("unknown BasicAuth backend: {0:?}")]
    UnknownBackend(String),
    #[error("option {option:?} is required for {context}")]
    MissingOption { option: &'static str, context: &'static str },
    #[error("passwd file {} is malformed at line {line}", .path.display())]
    MalformedPasswdFile { path: PathBuf, line: usize },
    #[error("invalid password hash for user {user:?}: {reason}")]
    InvalidHash { user: String, reason: String },
    #[error("cannot read passwd file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Authentication capability attached to a route
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Whether the request carries acceptable credentials
    async fn is_authenticated(&self, req: &Request<ProxyBody>) -> bool;

    /// Turn `response` into the terminal response for an unauthenticated request
    fn authenticate(&self, req: &Request<ProxyBody>, response: &mut Response<ProxyBody>);
}

/// Credential store consulted by [`BasicAuth`]
pub trait Validator: Send + Sync {
    fn is_valid_credentials(&self, username: &str, password: &str) -> Result<bool, AuthError>;
}

/// Authenticator that lets everything through
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    async fn is_authenticated(&self, _req: &Request<ProxyBody>) -> bool {
        true
    }

    fn authenticate(&self, _req: &Request<ProxyBody>, _response: &mut Response<ProxyBody>) {}
}

/// HTTP Basic authentication (RFC 7617)
pub struct BasicAuth {
    validator: Arc<dyn Validator>,
}

impl BasicAuth {
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Authenticator for BasicAuth {
    async fn is_authenticated(&self, req: &Request<ProxyBody>) -> bool {
        let Some((username, password)) = basic_credentials(req) else {
            return false;
        };

        let validator = self.validator.clone();
        let result =
            tokio::task::spawn_blocking(move || validator.is_valid_credentials(&username, &password)).await;

        match result {
            Ok(Ok(valid)) => valid,
            Ok(Err(e)) => {
                warn!(error = %e, "Error verifying credentials");
                false
            }
            Err(e) => {
                warn!(error = %e, "Credential check did not complete");
                false
            }
        }
    }

    fn authenticate(&self, _req: &Request<ProxyBody>, response: &mut Response<ProxyBody>) {
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        *response.body_mut() = full("Unauthorized\n");

        let headers = response.headers_mut();
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static(BASIC_CHALLENGE));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    }
}

/// Extract `(username, password)` from a Basic `Authorization` header
fn basic_credentials<B>(req: &Request<B>) -> Option<(String, String)> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// `username:bcrypt-hash` credentials loaded from an htpasswd file
#[derive(Debug)]
pub struct Htpasswd {
    users: HashMap<String, String>,
}

impl Htpasswd {
    /// Load an htpasswd file. Any line that is not exactly `user:hash` fails the load.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| AuthError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|line| AuthError::MalformedPasswdFile {
            path: path.to_path_buf(),
            line,
        })
    }

    /// Parse htpasswd content, returning the 1-based number of the first bad line on error
    fn parse(content: &str) -> Result<Self, usize> {
        let mut users = HashMap::new();
        for (idx, line) in content.lines().enumerate() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() != 2 {
                return Err(idx + 1);
            }
            users.insert(fields[0].to_string(), fields[1].to_string());
        }
        Ok(Self { users })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Validator for Htpasswd {
    fn is_valid_credentials(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        let Some(hash) = self.users.get(username) else {
            return Ok(false);
        };

        bcrypt::verify(password, hash).map_err(|e| AuthError::InvalidHash {
            user: username.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Build an authenticator from a route's `method` and option bag.
///
/// An empty method or `NoAuth` disables authentication. `BasicAuth` needs a
/// `backend` option; the only backend is `htpasswd`, which needs `file`.
pub fn new_authenticator(
    method: &str,
    options: &HashMap<String, String>,
) -> Result<Arc<dyn Authenticator>, AuthError> {
    match method {
        "" | "NoAuth" => Ok(Arc::new(NoAuth)),
        "BasicAuth" => {
            let backend = options.get("backend").ok_or(AuthError::MissingOption {
                option: "backend",
                context: "BasicAuth authenticator",
            })?;
            let validator = new_validator(backend, options)?;
            Ok(Arc::new(BasicAuth::new(validator)))
        }
        other => Err(AuthError::UnknownAuthenticator(other.to_string())),
    }
}

fn new_validator(backend: &str, options: &HashMap<String, String>) -> Result<Arc<dyn Validator>, AuthError> {
    match backend {
        "htpasswd" => {
            let file = options.get("file").ok_or(AuthError::MissingOption {
                option: "file",
                context: "htpasswd backend",
            })?;
            Ok(Arc::new(Htpasswd::load(file)?))
        }
        other => Err(AuthError::UnknownBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::empty;
    use http_body_util::BodyExt;
    use std::io::Write;

    fn request_with_auth(value: Option<&str>) -> Request<ProxyBody> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = value {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(empty()).unwrap()
    }

    fn basic(user: &str, pass: &str) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        format!("Basic {}", encoded)
    }

    fn htpasswd_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn basic_auth_for(user: &str, pass: &str) -> (BasicAuth, tempfile::NamedTempFile) {
        let hash = bcrypt::hash(pass, 4).unwrap();
        let file = htpasswd_file(&format!("{}:{}\n", user, hash));
        let validator = Htpasswd::load(file.path()).unwrap();
        (BasicAuth::new(Arc::new(validator)), file)
    }

    async fn challenge(auth: &BasicAuth, req: &Request<ProxyBody>) -> (StatusCode, Option<String>, Vec<u8>) {
        let mut response = Response::new(empty());
        auth.authenticate(req, &mut response);
        let status = response.status();
        let header = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, header, body)
    }

    #[tokio::test]
    async fn test_no_auth_always_authenticated() {
        assert!(NoAuth.is_authenticated(&request_with_auth(None)).await);
    }

    #[test]
    fn test_basic_credentials_parsing() {
        let req = request_with_auth(Some(&basic("alice", "pa:ss")));
        assert_eq!(
            basic_credentials(&req),
            Some(("alice".to_string(), "pa:ss".to_string()))
        );

        let lower = request_with_auth(Some(&basic("bob", "x").replace("Basic", "basic")));
        assert_eq!(basic_credentials(&lower).unwrap().0, "bob");

        assert!(basic_credentials(&request_with_auth(Some("Bearer abc"))).is_none());
        assert!(basic_credentials(&request_with_auth(Some("Basic !!!"))).is_none());
        assert!(basic_credentials(&request_with_auth(None)).is_none());
    }

    #[tokio::test]
    async fn test_basic_auth_valid_credentials() {
        let (auth, _file) = basic_auth_for("alice", "wonderland");
        assert!(
            auth.is_authenticated(&request_with_auth(Some(&basic("alice", "wonderland"))))
                .await
        );
    }

    #[tokio::test]
    async fn test_basic_auth_rejects_wrong_password_and_unknown_user() {
        let (auth, _file) = basic_auth_for("alice", "wonderland");
        assert!(!auth.is_authenticated(&request_with_auth(Some(&basic("alice", "nope")))).await);
        assert!(
            !auth
                .is_authenticated(&request_with_auth(Some(&basic("Alice", "wonderland"))))
                .await
        );
        assert!(!auth.is_authenticated(&request_with_auth(None)).await);
    }

    struct SlowValidator;

    impl Validator for SlowValidator {
        fn is_valid_credentials(&self, _username: &str, _password: &str) -> Result<bool, AuthError> {
            std::thread::sleep(std::time::Duration::from_millis(300));
            Ok(true)
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_slow_validator_does_not_block_runtime() {
        let auth = BasicAuth::new(Arc::new(SlowValidator));
        let req = request_with_auth(Some(&basic("alice", "wonderland")));
        let started = std::time::Instant::now();

        let ticker = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            started.elapsed()
        };
        let (authenticated, ticked_after) = tokio::join!(auth.is_authenticated(&req), ticker);

        assert!(authenticated);
        assert!(
            ticked_after < std::time::Duration::from_millis(200),
            "runtime stalled for {:?}",
            ticked_after
        );
    }

    #[tokio::test]
    async fn test_challenge_identical_for_missing_and_wrong_credentials() {
        let (auth, _file) = basic_auth_for("alice", "wonderland");

        let missing = challenge(&auth, &request_with_auth(None)).await;
        let wrong = challenge(&auth, &request_with_auth(Some(&basic("alice", "nope")))).await;

        assert_eq!(missing.0, StatusCode::UNAUTHORIZED);
        assert_eq!(missing.1.as_deref(), Some("Basic realm=\"Restricted area\""));
        assert_eq!(missing.2, b"Unauthorized\n");
        assert_eq!(missing, wrong);
    }

    #[tokio::test]
    async fn test_validator_error_is_not_authenticated() {
        let file = htpasswd_file("alice:not-a-bcrypt-hash\n");
        let validator = Htpasswd::load(file.path()).unwrap();
        assert!(matches!(
            validator.is_valid_credentials("alice", "x"),
            Err(AuthError::InvalidHash { .. })
        ));

        let auth = BasicAuth::new(Arc::new(validator));
        assert!(!auth.is_authenticated(&request_with_auth(Some(&basic("alice", "x")))).await);
    }

    #[test]
    fn test_htpasswd_accepts_2y_hashes() {
        let hash = bcrypt::hash_with_result("secret", 4)
            .unwrap()
            .format_for_version(bcrypt::Version::TwoY);
        assert!(hash.starts_with("$2y$"));

        let file = htpasswd_file(&format!("carol:{}\n", hash));
        let validator = Htpasswd::load(file.path()).unwrap();
        assert!(validator.is_valid_credentials("carol", "secret").unwrap());
    }

    #[test]
    fn test_htpasswd_malformed_lines() {
        for content in ["alice\n", "alice:hash:extra\n", "alice:$2y$x\n\nbob:$2y$y\n"] {
            let file = htpasswd_file(content);
            assert!(
                matches!(Htpasswd::load(file.path()), Err(AuthError::MalformedPasswdFile { .. })),
                "content {:?}",
                content
            );
        }
    }

    #[test]
    fn test_htpasswd_missing_file() {
        let err = Htpasswd::load("/nonexistent/htpasswd").unwrap_err();
        assert!(matches!(err, AuthError::Io { .. }));
    }

    #[test]
    fn test_htpasswd_parse_counts_users() {
        let htpasswd = Htpasswd::parse("a:$2y$05$x\nb:$2y$05$y").unwrap();
        assert_eq!(htpasswd.len(), 2);
        assert_eq!(Htpasswd::parse("a:b\nbad").unwrap_err(), 2);
    }

    #[tokio::test]
    async fn test_factory() {
        let none = HashMap::new();
        assert!(new_authenticator("", &none).is_ok());
        assert!(new_authenticator("NoAuth", &none).is_ok());
        assert!(matches!(
            new_authenticator("LDAP", &none),
            Err(AuthError::UnknownAuthenticator(_))
        ));
        assert!(matches!(
            new_authenticator("BasicAuth", &none),
            Err(AuthError::MissingOption { option: "backend", .. })
        ));

        let mut options = HashMap::new();
        options.insert("backend".to_string(), "ldap".to_string());
        assert!(matches!(
            new_authenticator("BasicAuth", &options),
            Err(AuthError::UnknownBackend(_))
        ));

        options.insert("backend".to_string(), "htpasswd".to_string());
        assert!(matches!(
            new_authenticator("BasicAuth", &options),
            Err(AuthError::MissingOption { option: "file", .. })
        ));

        let hash = bcrypt::hash("pw", 4).unwrap();
        let file = htpasswd_file(&format!("dave:{}\n", hash));
        options.insert("file".to_string(), file.path().to_string_lossy().to_string());
        let auth = new_authenticator("BasicAuth", &options).unwrap();
        assert!(auth.is_authenticated(&request_with_auth(Some(&basic("dave", "pw")))).await);
    }
}
