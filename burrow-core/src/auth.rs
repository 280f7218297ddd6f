//! User verification and HTTP Basic auth helpers.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use subtle::ConstantTimeEq;

/// Verifies username/password pairs against the configured user map.
#[derive(Debug, Clone)]
pub struct UserVerifier {
    users: Arc<HashMap<String, String>>,
}

impl UserVerifier {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self {
            users: Arc::new(users),
        }
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        match self.users.get(username) {
            Some(expected) => bool::from(expected.as_bytes().ct_eq(password.as_bytes())),
            None => false,
        }
    }
}

/// Checks an `Authorization`/`Proxy-Authorization` header value.
pub fn basic_auth_ok(header: Option<&str>, verifier: &UserVerifier) -> bool {
    let Some(value) = header else { return false };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    match credentials.split_once(':') {
        Some((user, pass)) => verifier.verify(user, pass),
        None => false,
    }
}

/// Builds the value of a Basic `Authorization` header.
pub fn basic_auth_value(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        BASE64.encode(format!("{}:{}", username, password))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> UserVerifier {
        UserVerifier::new(HashMap::from([
            ("admin".to_string(), "123456".to_string()),
            ("user".to_string(), "abcde".to_string()),
        ]))
    }

    #[test]
    fn verify_checks_user_and_password() {
        let v = verifier();
        assert!(v.verify("admin", "123456"));
        assert!(v.verify("user", "abcde"));
        assert!(!v.verify("admin", "12345"));
        assert!(!v.verify("nobody", "123456"));
    }

    #[test]
    fn basic_auth_round_trip() {
        let v = verifier();
        let header = basic_auth_value("user", "abcde");
        assert!(basic_auth_ok(Some(&header), &v));
    }

    #[test]
    fn basic_auth_rejects_malformed_headers() {
        let v = verifier();
        assert!(!basic_auth_ok(None, &v));
        assert!(!basic_auth_ok(Some("Bearer abc"), &v));
        assert!(!basic_auth_ok(Some("Basic !!!"), &v));
        let no_colon = format!("Basic {}", BASE64.encode("useronly"));
        assert!(!basic_auth_ok(Some(&no_colon), &v));
    }
}
