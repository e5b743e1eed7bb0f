use ahash::AHashSet as HashSet;
use http::{header, HeaderMap};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use std::sync::Arc;

/// Authenticates API requests from their bearer token.
///
/// Tokens are verified with either a shared HS256 secret or an RS256 public key, and the `sub`
/// claim names the caller. When no key is configured, authentication is disabled and every
/// request is treated as coming from a super role.
#[derive(Clone)]
pub struct Auth {
    verifier: Option<Arc<Verifier>>,
    super_roles: Arc<HashSet<String>>,
}

struct Verifier {
    key: DecodingKey,
    validation: Validation,
}

/// The authenticated caller of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    subject: Option<String>,
    superuser: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("{0} is not authorized")]
    Forbidden(String),
}

#[derive(Clone, serde::Deserialize)]
struct Claims {
    sub: String,
}

// === impl Auth ===

impl Auth {
    pub fn disabled() -> Self {
        Self {
            verifier: None,
            super_roles: Default::default(),
        }
    }

    pub fn hs256(secret: &[u8], super_roles: impl IntoIterator<Item = String>) -> Self {
        Self::verified(
            DecodingKey::from_secret(secret),
            Algorithm::HS256,
            super_roles,
        )
    }

    pub fn rs256_pem(
        pem: &[u8],
        super_roles: impl IntoIterator<Item = String>,
    ) -> Result<Self, jsonwebtoken::errors::Error> {
        let key = DecodingKey::from_rsa_pem(pem)?;
        Ok(Self::verified(key, Algorithm::RS256, super_roles))
    }

    fn verified(
        key: DecodingKey,
        alg: Algorithm,
        super_roles: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut validation = Validation::new(alg);
        validation.required_spec_claims = ["sub".to_string()].into_iter().collect();
        Self {
            verifier: Some(Arc::new(Verifier { key, validation })),
            super_roles: Arc::new(super_roles.into_iter().collect()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.verifier.is_some()
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let Some(verifier) = self.verifier.as_deref() else {
            return Ok(Principal {
                subject: None,
                superuser: true,
            });
        };

        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let data = jsonwebtoken::decode::<Claims>(token, &verifier.key, &verifier.validation)?;
        let subject = data.claims.sub;
        Ok(Principal {
            superuser: self.super_roles.contains(&subject),
            subject: Some(subject),
        })
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("enabled", &self.is_enabled())
            .field("super_roles", &self.super_roles)
            .finish()
    }
}

// === impl Principal ===

impl Principal {
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Checks that the caller may manage every tenant.
    pub fn require_super(&self) -> Result<(), AuthError> {
        if self.superuser {
            return Ok(());
        }
        Err(self.forbidden())
    }

    /// Checks that the caller may read `tenant`'s resources.
    pub fn require_tenant(&self, tenant: &str) -> Result<(), AuthError> {
        if self.superuser {
            return Ok(());
        }
        match self.subject.as_deref() {
            Some(subject) if verify_subject(tenant, subject) => Ok(()),
            _ => Err(self.forbidden()),
        }
    }

    fn forbidden(&self) -> AuthError {
        AuthError::Forbidden(self.subject.clone().unwrap_or_default())
    }
}

/// Returns whether `subject` was issued for `tenant`.
pub fn verify_subject(tenant: &str, subject: &str) -> bool {
    let (t1, t2) = extract_tenant(subject);
    tenant == t1 || tenant == t2
}

/// Derives the tenant names a subject may have been issued for.
///
/// Subjects take the form `<tenant>[-client|-admin]-<id>`. The first name is the subject without
/// its trailing id; the second additionally drops one `-client` or `-admin` role suffix, if
/// present. A subject without any `-` names only itself.
pub fn extract_tenant(subject: &str) -> (&str, &str) {
    let t1 = match subject.rfind('-') {
        Some(idx) => &subject[..idx],
        None => subject,
    };
    let t2 = t1
        .strip_suffix("-client")
        .or_else(|| t1.strip_suffix("-admin"))
        .unwrap_or(t1);
    (t1, t2)
}
