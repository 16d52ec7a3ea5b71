//! Identity provider: credential checks and signed session tokens.
//!
//! [`HmacIdentity`] authenticates users listed in `[[auth.users]]`, whose
//! passwords are stored as salted PBKDF2-HMAC-SHA256 digests, and issues
//! stateless tokens of the form
//!
//! ```text
//! base64url(payload_json) "." hex(HMAC-SHA256(key, base64url(payload_json)))
//! ```
//!
//! where the payload carries the subject, token kind and expiry. The
//! signing key is read from the environment variable named by
//! `auth.signing_key_env`. Every failure surfaces as [`CoreError::Auth`]
//! with a message that does not reveal which check failed.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use healthflow_core::error::{CoreError, CoreResult};

use crate::config::{AuthConfig, UserConfig};

type HmacSha256 = Hmac<Sha256>;

/// PBKDF2 rounds for newly hashed passwords.
pub const PBKDF2_ITERATIONS: u32 = 600_000;
pub const SALT_LENGTH: usize = 16;
pub const HASH_LENGTH: usize = 32;

/// A salted password digest, hex-encoded as it appears in `[[auth.users]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    pub salt: String,
    pub hash: String,
    pub iterations: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Tokens issued on login or refresh.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub subject: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> CoreResult<Session>;

    /// Validate an access token and return its subject.
    async fn verify(&self, token: &str) -> CoreResult<String>;

    /// Exchange a refresh token for a new session.
    async fn refresh(&self, refresh_token: &str) -> CoreResult<Session>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    kind: TokenKind,
    iat: i64,
    exp: i64,
    jti: String,
}

pub struct HmacIdentity {
    key: Vec<u8>,
    users: Vec<UserConfig>,
    /// Rounds spent on unknown usernames so they cost as much as a real check.
    decoy_iterations: u32,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl HmacIdentity {
    pub fn new(key: impl Into<Vec<u8>>, config: &AuthConfig) -> anyhow::Result<Self> {
        let key = key.into();
        if key.len() < 16 {
            anyhow::bail!("signing key must be at least 16 bytes");
        }
        let decoy_iterations = config
            .users
            .iter()
            .map(|u| u.pbkdf2_iterations)
            .max()
            .unwrap_or(PBKDF2_ITERATIONS);
        Ok(Self {
            key,
            users: config.users.clone(),
            decoy_iterations,
            access_ttl_secs: config.access_ttl_secs,
            refresh_ttl_secs: config.refresh_ttl_secs,
        })
    }

    /// Build from configuration, reading the key from the environment.
    pub fn from_config(config: &AuthConfig) -> anyhow::Result<Self> {
        let key = std::env::var(&config.signing_key_env).map_err(|_| {
            anyhow::anyhow!(
                "{} environment variable not set (token signing key)",
                config.signing_key_env
            )
        })?;
        Self::new(key.into_bytes(), config)
    }

    /// Issue an access token for `subject` without a password check.
    pub fn issue_access_token(&self, subject: &str) -> CoreResult<String> {
        self.sign(subject, TokenKind::Access, self.access_ttl_secs)
    }

    fn session_for(&self, subject: &str) -> CoreResult<Session> {
        Ok(Session {
            subject: subject.to_string(),
            access_token: self.sign(subject, TokenKind::Access, self.access_ttl_secs)?,
            refresh_token: self.sign(subject, TokenKind::Refresh, self.refresh_ttl_secs)?,
            token_type: "bearer",
            expires_in: self.access_ttl_secs,
        })
    }

    fn mac(&self) -> CoreResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| CoreError::Storage(anyhow::anyhow!("invalid signing key: {}", e)))
    }

    fn sign(&self, subject: &str, kind: TokenKind, ttl_secs: i64) -> CoreResult<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            kind,
            iat: now,
            exp: now + ttl_secs,
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let json = serde_json::to_vec(&claims).map_err(|e| CoreError::Storage(e.into()))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        Ok(format!(
            "{}.{}",
            payload,
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    fn decode(&self, token: &str, expected: TokenKind) -> CoreResult<Claims> {
        let invalid = || CoreError::Auth("invalid or expired token".to_string());

        let (payload, signature) = token.split_once('.').ok_or_else(invalid)?;
        let signature = hex::decode(signature).map_err(|_| invalid())?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature).map_err(|_| invalid())?;

        let json = URL_SAFE_NO_PAD.decode(payload).map_err(|_| invalid())?;
        let claims: Claims = serde_json::from_slice(&json).map_err(|_| invalid())?;
        if claims.kind != expected || claims.exp <= chrono::Utc::now().timestamp() {
            return Err(invalid());
        }
        Ok(claims)
    }
}

pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// PBKDF2-HMAC-SHA256 of `password` under `salt`.
pub fn derive_password_hash(password: &str, salt: &[u8], iterations: u32) -> [u8; HASH_LENGTH] {
    let mut out = [0u8; HASH_LENGTH];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

/// Hash `password` under a fresh random salt.
pub fn hash_password(password: &str, iterations: u32) -> PasswordHash {
    let salt = generate_salt();
    PasswordHash {
        salt: hex::encode(salt),
        hash: hex::encode(derive_password_hash(password, &salt, iterations)),
        iterations,
    }
}

/// Check `password` against a stored hex salt and digest in constant time.
/// Malformed hex never matches.
pub fn verify_password(password: &str, salt_hex: &str, hash_hex: &str, iterations: u32) -> bool {
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(hash_hex)) else {
        return false;
    };
    let derived = derive_password_hash(password, &salt, iterations);
    derived[..].ct_eq(&expected[..]).into()
}

#[async_trait]
impl IdentityProvider for HmacIdentity {
    async fn authenticate(&self, credentials: &Credentials) -> CoreResult<Session> {
        let user = self
            .users
            .iter()
            .find(|u| u.username == credentials.username)
            .cloned();
        let password = credentials.password.clone();
        let decoy_iterations = self.decoy_iterations;
        // Key stretching is CPU-bound; keep it off the async workers.
        let matched = tokio::task::spawn_blocking(move || match user {
            Some(user) => verify_password(
                &password,
                &user.password_salt,
                &user.password_hash,
                user.pbkdf2_iterations,
            )
            .then_some(user),
            None => {
                let _ = derive_password_hash(&password, &[0u8; SALT_LENGTH], decoy_iterations);
                None
            }
        })
        .await
        .map_err(|e| CoreError::Storage(anyhow::anyhow!("password check failed: {}", e)))?;

        let user =
            matched.ok_or_else(|| CoreError::Auth("invalid username or password".to_string()))?;
        tracing::info!(subject = %user.subject, "user authenticated");
        self.session_for(&user.subject)
    }

    async fn verify(&self, token: &str) -> CoreResult<String> {
        Ok(self.decode(token, TokenKind::Access)?.sub)
    }

    async fn refresh(&self, refresh_token: &str) -> CoreResult<Session> {
        let claims = self.decode(refresh_token, TokenKind::Refresh)?;
        self.session_for(&claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ITERATIONS: u32 = 1_000;

    fn identity(access_ttl_secs: i64) -> HmacIdentity {
        let hashed = hash_password("correct horse", TEST_ITERATIONS);
        let config = AuthConfig {
            access_ttl_secs,
            users: vec![UserConfig {
                username: "alice".into(),
                subject: "user-alice".into(),
                password_salt: hashed.salt,
                password_hash: hashed.hash,
                pbkdf2_iterations: hashed.iterations,
            }],
            ..AuthConfig::default()
        };
        HmacIdentity::new(b"test-signing-key-0123456789".to_vec(), &config).unwrap()
    }

    fn creds(password: &str) -> Credentials {
        Credentials {
            username: "alice".into(),
            password: password.into(),
        }
    }

    #[tokio::test]
    async fn login_and_verify() {
        let idp = identity(900);
        let session = idp.authenticate(&creds("correct horse")).await.unwrap();
        assert_eq!(session.subject, "user-alice");
        assert_eq!(idp.verify(&session.access_token).await.unwrap(), "user-alice");
    }

    #[tokio::test]
    async fn wrong_password_rejected() {
        let idp = identity(900);
        let err = idp.authenticate(&creds("wrong")).await.unwrap_err();
        assert!(matches!(err, CoreError::Auth(_)));
    }

    #[tokio::test]
    async fn unknown_user_rejected() {
        let idp = identity(900);
        let err = idp
            .authenticate(&Credentials {
                username: "mallory".into(),
                password: "correct horse".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Auth(_)));
    }

    #[test]
    fn same_password_gets_distinct_salts() {
        let first = hash_password("s3cret", TEST_ITERATIONS);
        let second = hash_password("s3cret", TEST_ITERATIONS);
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.hash, second.hash);
        assert_eq!(first.salt.len(), SALT_LENGTH * 2);
        assert_eq!(first.hash.len(), HASH_LENGTH * 2);

        assert!(verify_password("s3cret", &first.salt, &first.hash, TEST_ITERATIONS));
        assert!(verify_password("s3cret", &second.salt, &second.hash, TEST_ITERATIONS));
        assert!(!verify_password("s3cret", &first.salt, &second.hash, TEST_ITERATIONS));
        assert!(!verify_password("S3cret", &first.salt, &first.hash, TEST_ITERATIONS));
        assert!(!verify_password("s3cret", &first.salt, &first.hash, TEST_ITERATIONS + 1));
        assert!(!verify_password("s3cret", "zz", &first.hash, TEST_ITERATIONS));
    }

    #[test]
    fn derivation_matches_known_vector() {
        // RFC 7914 section 11, PBKDF2-HMAC-SHA256 with one iteration.
        let derived = derive_password_hash("passwd", b"salt", 1);
        assert_eq!(
            hex::encode(derived),
            "55ac046e56e3089fec1691c22544b605f94185216dde0465e68b9d57c20dacbc"
        );
    }

    #[tokio::test]
    async fn tampered_token_rejected() {
        let idp = identity(900);
        let token = idp.issue_access_token("user-alice").unwrap();
        let (payload, sig) = token.split_once('.').unwrap();
        let forged_payload = URL_SAFE_NO_PAD.encode(
            br#"{"sub":"user-bob","kind":"access","iat":0,"exp":99999999999,"jti":"x"}"#,
        );
        assert!(idp.verify(&format!("{}.{}", forged_payload, sig)).await.is_err());
        assert!(idp.verify(&format!("{}.00", payload)).await.is_err());
        assert!(idp.verify("garbage").await.is_err());
    }

    #[tokio::test]
    async fn expired_token_rejected() {
        let idp = identity(-1);
        let token = idp.issue_access_token("user-alice").unwrap();
        assert!(idp.verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn refresh_token_is_not_an_access_token() {
        let idp = identity(900);
        let session = idp.authenticate(&creds("correct horse")).await.unwrap();
        assert!(idp.verify(&session.refresh_token).await.is_err());
        let renewed = idp.refresh(&session.refresh_token).await.unwrap();
        assert_eq!(idp.verify(&renewed.access_token).await.unwrap(), "user-alice");
        assert!(idp.refresh(&session.access_token).await.is_err());
    }

    #[test]
    fn short_key_rejected() {
        assert!(HmacIdentity::new(b"short".to_vec(), &AuthConfig::default()).is_err());
    }
}
