//! Authentication and authorization
//!
//! Bearer tokens map to distinct user identities; the internal proxy secret
//! authenticates instance-to-instance and raft-internal calls. Authorization
//! always runs before any metadata existence check so that permission
//! failures cannot leak whether a path exists.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{FsError, FsResult};

/// Operation classes subject to authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Delete,
    Link,
}

/// Authenticated caller identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    fn for_user(user: &str, ordinal: u32) -> Self {
        // uid 0 is reserved for entries the engine itself creates
        Self {
            user: user.to_string(),
            uid: 1000 + ordinal,
            gid: 1000 + ordinal,
        }
    }
}

/// Maps bearer tokens to identities and recognizes the internal secret.
pub struct Authenticator {
    keys: HashMap<String, Identity>,
    internal_secret: String,
}

impl Authenticator {
    /// Build from parsed `key → user` pairs. Each configured user receives a
    /// stable uid/gid derived from its sorted position.
    pub fn new(api_keys: HashMap<String, String>, internal_secret: String) -> Self {
        let mut users: Vec<&String> = api_keys.values().collect();
        users.sort();
        users.dedup();
        let ordinals: HashMap<&String, u32> = users
            .iter()
            .enumerate()
            .map(|(i, u)| (*u, i as u32))
            .collect();

        let keys = api_keys
            .iter()
            .map(|(key, user)| {
                (
                    key.clone(),
                    Identity::for_user(user, *ordinals.get(user).unwrap_or(&0)),
                )
            })
            .collect();

        Self {
            keys,
            internal_secret,
        }
    }

    /// Resolve a bearer token to an identity.
    pub fn authenticate(&self, token: &str) -> FsResult<Identity> {
        self.keys
            .get(token)
            .cloned()
            .ok_or_else(|| FsError::Unauthorized("unknown API key".to_string()))
    }

    /// Check the internal instance-to-instance secret.
    pub fn verify_internal(&self, token: &str) -> FsResult<()> {
        if constant_time_eq(token.as_bytes(), self.internal_secret.as_bytes()) {
            Ok(())
        } else {
            Err(FsError::Unauthorized(
                "invalid internal proxy secret".to_string(),
            ))
        }
    }

    /// The shared internal secret, for outbound peer calls.
    pub fn internal_secret(&self) -> &str {
        &self.internal_secret
    }
}

/// Authorization policy seam.
///
/// The default policy grants every configured user full access; the identity
/// is still threaded through so stores and audit logs see who acted.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, identity: &Identity, op: Operation, path: &str) -> FsResult<()>;
}

/// Grants all operations to any authenticated identity.
pub struct AllowConfiguredUsers;

impl Authorizer for AllowConfiguredUsers {
    fn authorize(&self, _identity: &Identity, _op: Operation, _path: &str) -> FsResult<()> {
        Ok(())
    }
}

/// Shared authorizer handle
pub type SharedAuthorizer = Arc<dyn Authorizer>;

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Extract the token from an `Authorization: Bearer ...` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> Authenticator {
        let mut keys = HashMap::new();
        keys.insert("key-a".to_string(), "alice".to_string());
        keys.insert("key-b".to_string(), "bob".to_string());
        Authenticator::new(keys, "internal".to_string())
    }

    #[test]
    fn test_keys_map_to_distinct_users() {
        let auth = authenticator();
        let alice = auth.authenticate("key-a").unwrap();
        let bob = auth.authenticate("key-b").unwrap();
        assert_eq!(alice.user, "alice");
        assert_eq!(bob.user, "bob");
        assert_ne!(alice.uid, bob.uid);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = authenticator().authenticate("nope").unwrap_err();
        assert!(matches!(err, FsError::Unauthorized(_)));
    }

    #[test]
    fn test_internal_secret() {
        let auth = authenticator();
        auth.verify_internal("internal").unwrap();
        assert!(auth.verify_internal("wrong").is_err());
        assert!(auth.verify_internal("internal-longer").is_err());
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
    }

    #[test]
    fn test_default_policy_allows() {
        let auth = authenticator();
        let identity = auth.authenticate("key-a").unwrap();
        AllowConfiguredUsers
            .authorize(&identity, Operation::Write, "/any")
            .unwrap();
    }
}
