//! Authentication and authorization primitives
//!
//! Provides:
//! - [`Permission`] predicates attached to endpoints
//! - [`ProtectionTable`] mapping HTTP methods to permissions
//! - [`TokenAuthority`] issuing and verifying RS256 bearer tokens
//! - [`authorize`], the per-request decision

use axum::http::Method;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::core::error::{AuthError, ChassisError, ChassisResult, ConfigError};

/// Methods covered by `deny_all` / `allow_all`
pub const ALL_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
];

/// A predicate guarding an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    /// Token must carry this role
    Role(String),
    /// No token needed
    Anonymous,
    /// Never allowed
    Denied,
    /// Token subject must equal the target object's id
    CurrentSubject,
}

impl Permission {
    pub fn role(name: impl Into<String>) -> Self {
        Permission::Role(name.into())
    }

    /// Check this permission against an authenticated caller
    pub fn check(&self, context: &AuthContext, object_id: Option<&str>) -> bool {
        match self {
            Permission::Role(role) => context.has_role(role),
            Permission::Anonymous => true,
            Permission::Denied => false,
            Permission::CurrentSubject => match (context.subject(), object_id) {
                (Some(sub), Some(id)) => sub == id,
                _ => false,
            },
        }
    }
}

/// Caller identity extracted from a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    /// Verified bearer token
    Subject { sub: String, roles: Vec<String> },

    /// No authentication
    Anonymous,
}

impl AuthContext {
    pub fn subject(&self) -> Option<&str> {
        match self {
            AuthContext::Subject { sub, .. } => Some(sub),
            AuthContext::Anonymous => None,
        }
    }

    pub fn roles(&self) -> &[String] {
        match self {
            AuthContext::Subject { roles, .. } => roles,
            AuthContext::Anonymous => &[],
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles().iter().any(|r| r == role)
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, AuthContext::Anonymous)
    }
}

impl From<Claims> for AuthContext {
    fn from(claims: Claims) -> Self {
        AuthContext::Subject {
            sub: claims.sub,
            roles: claims.roles,
        }
    }
}

/// Per-method permissions of one endpoint
#[derive(Debug, Clone, Default)]
pub struct ProtectionTable {
    rules: HashMap<Method, Vec<Permission>>,
}

impl ProtectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every method
    pub fn deny_all(&mut self) -> &mut Self {
        for method in ALL_METHODS {
            self.rules.insert(method, vec![Permission::Denied]);
        }
        self
    }

    /// Open every method to anonymous callers
    pub fn allow_all(&mut self) -> &mut Self {
        for method in ALL_METHODS {
            self.rules.insert(method, vec![Permission::Anonymous]);
        }
        self
    }

    /// Add a permission to the methods; blanket allow/deny entries are replaced
    pub fn require(&mut self, permission: Permission, methods: &[Method]) -> &mut Self {
        for method in methods {
            let rules = self.rules.entry(method.clone()).or_default();
            rules.retain(|p| !matches!(p, Permission::Anonymous | Permission::Denied));
            if !rules.contains(&permission) {
                rules.push(permission.clone());
            }
        }
        self
    }

    /// Make the permission the only rule of the methods
    pub fn exempt(&mut self, permission: Permission, methods: &[Method]) -> &mut Self {
        for method in methods {
            self.rules.insert(method.clone(), vec![permission.clone()]);
        }
        self
    }

    pub fn permissions(&self, method: &Method) -> &[Permission] {
        self.rules.get(method).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Bearer token as found on the request
#[derive(Debug, Clone)]
pub enum Credentials {
    Missing,
    /// Present but malformed, expired or badly signed
    Invalid(String),
    Verified(AuthContext),
}

/// Decide a request against the endpoint's permissions
///
/// `Denied` wins over everything. An endpoint with no rules, or one listing `Anonymous`,
/// is open. Otherwise a verified token must satisfy at least one permission.
pub fn authorize(
    permissions: &[Permission],
    credentials: Credentials,
    object_id: Option<&str>,
) -> Result<AuthContext, AuthError> {
    if permissions.contains(&Permission::Denied) {
        return Err(AuthError::forbidden("access to this endpoint is denied"));
    }
    if permissions.is_empty() || permissions.contains(&Permission::Anonymous) {
        return Ok(match credentials {
            Credentials::Verified(context) => context,
            _ => AuthContext::Anonymous,
        });
    }
    match credentials {
        Credentials::Missing => Err(AuthError::unauthorized("authorization header is missing")),
        Credentials::Invalid(message) => Err(AuthError::forbidden(message)),
        Credentials::Verified(context) => {
            if permissions.iter().any(|p| p.check(&context, object_id)) {
                Ok(context)
            } else {
                Err(AuthError::forbidden("the caller lacks the required permission"))
            }
        }
    }
}

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub roles: Vec<String>,
}

pub const PRIVATE_KEY_FILE: &str = "appkernel.pem";
pub const PUBLIC_KEY_FILE: &str = "appkernel.pub";

/// Issues and verifies RS256 tokens
pub struct TokenAuthority {
    encoding: Option<EncodingKey>,
    decoding: DecodingKey,
    lifetime_secs: i64,
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("can_issue", &self.encoding.is_some())
            .field("lifetime_secs", &self.lifetime_secs)
            .finish()
    }
}

fn key_error(path: &str, message: impl ToString) -> ConfigError {
    ConfigError::InvalidKey {
        path: path.to_string(),
        message: message.to_string(),
    }
}

impl TokenAuthority {
    /// Build from PEM bytes; without a private key the authority only verifies
    pub fn from_pem(
        private_pem: Option<&[u8]>,
        public_pem: &[u8],
        lifetime_secs: i64,
    ) -> Result<Self, ConfigError> {
        let encoding = private_pem
            .map(EncodingKey::from_rsa_pem)
            .transpose()
            .map_err(|e| key_error(PRIVATE_KEY_FILE, e))?;
        let decoding =
            DecodingKey::from_rsa_pem(public_pem).map_err(|e| key_error(PUBLIC_KEY_FILE, e))?;
        Ok(Self {
            encoding,
            decoding,
            lifetime_secs,
        })
    }

    /// Load `appkernel.pem` and `appkernel.pub` from a key directory
    pub fn from_key_dir(dir: &Path, lifetime_secs: i64) -> Result<Self, ConfigError> {
        let public_path = dir.join(PUBLIC_KEY_FILE);
        let public_pem = std::fs::read(&public_path)
            .map_err(|e| key_error(&public_path.display().to_string(), e))?;
        let private_path = dir.join(PRIVATE_KEY_FILE);
        let private_pem = match std::fs::read(&private_path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %private_path.display(), "no private key; token issuance disabled");
                None
            }
            Err(e) => return Err(key_error(&private_path.display().to_string(), e)),
        };
        Self::from_pem(private_pem.as_deref(), &public_pem, lifetime_secs)
    }

    pub fn lifetime_secs(&self) -> i64 {
        self.lifetime_secs
    }

    /// Sign a token for the subject
    pub fn issue(&self, subject: &str, roles: &[String]) -> ChassisResult<String> {
        let now = chrono::Utc::now().timestamp();
        self.issue_claims(&Claims {
            sub: subject.to_string(),
            iat: now,
            exp: now + self.lifetime_secs,
            roles: roles.to_vec(),
        })
    }

    pub fn issue_claims(&self, claims: &Claims) -> ChassisResult<String> {
        let key = self
            .encoding
            .as_ref()
            .ok_or_else(|| ChassisError::internal("no private key loaded"))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), claims, key)
            .map_err(|e| ChassisError::internal(format!("token signing failed: {}", e)))
    }

    /// Verify signature and expiry
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let validation = Validation::new(Algorithm::RS256);
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::forbidden(format!("invalid token: {}", e)))
    }

    /// Turn an `Authorization` header value into credentials
    pub fn credentials(&self, header: Option<&str>) -> Credentials {
        let Some(header) = header else {
            return Credentials::Missing;
        };
        let Some(token) = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
        else {
            return Credentials::Invalid("expected a bearer token".to_string());
        };
        match self.verify(token.trim()) {
            Ok(claims) => Credentials::Verified(claims.into()),
            Err(e) => Credentials::Invalid(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> TokenAuthority {
        TokenAuthority::from_pem(
            Some(include_bytes!("../../tests/keys/appkernel.pem")),
            include_bytes!("../../tests/keys/appkernel.pub"),
            3600,
        )
        .unwrap()
    }

    fn subject(sub: &str, roles: &[&str]) -> AuthContext {
        AuthContext::Subject {
            sub: sub.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn test_permission_check() {
        let ctx = subject("U1", &["admin"]);
        assert!(Permission::role("admin").check(&ctx, None));
        assert!(!Permission::role("user").check(&ctx, None));
        assert!(Permission::CurrentSubject.check(&ctx, Some("U1")));
        assert!(!Permission::CurrentSubject.check(&ctx, Some("U2")));
        assert!(!Permission::CurrentSubject.check(&ctx, None));
        assert!(!Permission::Denied.check(&ctx, None));
    }

    #[test]
    fn test_protection_table_require_replaces_blanket_rules() {
        let mut table = ProtectionTable::new();
        table
            .allow_all()
            .require(Permission::role("admin"), &[Method::GET]);
        assert_eq!(table.permissions(&Method::GET), &[Permission::role("admin")]);
        assert_eq!(table.permissions(&Method::POST), &[Permission::Anonymous]);
    }

    #[test]
    fn test_protection_table_exempt() {
        let mut table = ProtectionTable::new();
        table
            .deny_all()
            .exempt(Permission::Anonymous, &[Method::POST]);
        assert_eq!(table.permissions(&Method::POST), &[Permission::Anonymous]);
        assert_eq!(table.permissions(&Method::DELETE), &[Permission::Denied]);
    }

    #[test]
    fn test_authorize_denied_ignores_credentials() {
        let err = authorize(
            &[Permission::Denied],
            Credentials::Verified(subject("U1", &["admin"])),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::Forbidden { .. }));
    }

    #[test]
    fn test_authorize_anonymous_needs_no_token() {
        let ctx = authorize(&[Permission::Anonymous], Credentials::Missing, None).unwrap();
        assert!(ctx.is_anonymous());
        assert!(authorize(&[], Credentials::Missing, None).is_ok());
    }

    #[test]
    fn test_authorize_missing_and_invalid_tokens() {
        let perms = [Permission::role("admin")];
        assert!(matches!(
            authorize(&perms, Credentials::Missing, None),
            Err(AuthError::Unauthorized { .. })
        ));
        assert!(matches!(
            authorize(&perms, Credentials::Invalid("bad".into()), None),
            Err(AuthError::Forbidden { .. })
        ));
    }

    #[test]
    fn test_authorize_permissions_are_alternatives() {
        let perms = [Permission::role("admin"), Permission::CurrentSubject];
        assert!(authorize(&perms, Credentials::Verified(subject("U1", &[])), Some("U1")).is_ok());
        assert!(authorize(&perms, Credentials::Verified(subject("U2", &["admin"])), Some("U1")).is_ok());
        assert!(authorize(&perms, Credentials::Verified(subject("U2", &[])), Some("U1")).is_err());
    }

    #[test]
    fn test_issue_and_verify_round_trip() {
        let authority = authority();
        let token = authority.issue("U1", &["admin".to_string()]).unwrap();
        let claims = authority.verify(&token).unwrap();
        assert_eq!(claims.sub, "U1");
        assert_eq!(claims.roles, vec!["admin"]);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_expired_token_rejected() {
        let authority = authority();
        let now = chrono::Utc::now().timestamp();
        let token = authority
            .issue_claims(&Claims {
                sub: "U1".to_string(),
                iat: now - 7200,
                exp: now - 3600,
                roles: vec![],
            })
            .unwrap();
        assert!(authority.verify(&token).is_err());
    }

    #[test]
    fn test_credentials_parsing() {
        let authority = authority();
        assert!(matches!(authority.credentials(None), Credentials::Missing));
        assert!(matches!(
            authority.credentials(Some("Basic abc")),
            Credentials::Invalid(_)
        ));
        assert!(matches!(
            authority.credentials(Some("Bearer not.a.token")),
            Credentials::Invalid(_)
        ));
        let token = authority.issue("U1", &[]).unwrap();
        assert!(matches!(
            authority.credentials(Some(&format!("Bearer {}", token))),
            Credentials::Verified(_)
        ));
    }
}
