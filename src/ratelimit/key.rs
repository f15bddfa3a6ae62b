//! Rate limit key derivation from request attributes.

use std::borrow::Cow;

use super::class::{self, OperationClass};
use super::policy::ResolvedPolicy;

/// Longest User-Agent prefix that goes into a `general` key.
pub const USER_AGENT_KEY_CHARS: usize = 50;

const UNKNOWN: &str = "unknown";
const ANONYMOUS: &str = "anonymous";

/// The request attributes the limiter looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Client address reported by a trusted proxy
    pub forwarded_ip: Option<String>,
    /// Socket peer address
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    /// Authenticated user id, if any
    pub user_id: Option<String>,
}

impl RequestDescriptor {
    /// Client IP: forwarded address, then socket address, then `unknown`.
    pub fn client_ip(&self) -> &str {
        self.forwarded_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .or_else(|| self.remote_addr.as_deref().filter(|ip| !ip.is_empty()))
            .unwrap_or(UNKNOWN)
    }
}

/// A key that uniquely identifies a rate-limited subject for one class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Built-in prefix, or the class name for configured custom classes
    pub prefix: Cow<'static, str>,
    pub ip: String,
    /// User id, `anonymous`, or a truncated User-Agent for `general`
    pub identity: String,
}

impl RateLimitKey {
    /// Derive the key for `request` under a built-in `class`.
    ///
    /// Names outside [`OperationClass`] derive a `general` key, matching the
    /// policy fallback. Use [`RateLimitKey::for_policy`] for classes that
    /// may be configured custom ones.
    pub fn derive(request: &RequestDescriptor, class: &str) -> Self {
        let class = OperationClass::from_name(class).unwrap_or(OperationClass::General);
        let identity = if class.is_user_scoped() {
            user_identity(request)
        } else {
            agent_identity(request)
        };

        Self {
            prefix: Cow::Borrowed(class.key_prefix()),
            ip: request.client_ip().to_string(),
            identity,
        }
    }

    /// Derive the key for a resolved policy.
    ///
    /// A custom class with its own policy is keyed under its name, scoped
    /// to the user. Only a fallback lookup shares the `general` key.
    pub fn for_policy(request: &RequestDescriptor, resolved: &ResolvedPolicy) -> Self {
        if resolved.fallback {
            return Self::derive(request, class::GENERAL);
        }
        if OperationClass::from_name(&resolved.class).is_some() {
            return Self::derive(request, &resolved.class);
        }
        Self {
            prefix: Cow::Owned(resolved.class.clone()),
            ip: request.client_ip().to_string(),
            identity: user_identity(request),
        }
    }

    /// The string form used as the store key.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}:{}", self.prefix, self.ip, self.identity)
    }
}

fn user_identity(request: &RequestDescriptor) -> String {
    request.user_id.as_deref().unwrap_or(ANONYMOUS).to_string()
}

fn agent_identity(request: &RequestDescriptor) -> String {
    request
        .user_agent
        .as_deref()
        .unwrap_or(UNKNOWN)
        .chars()
        .take(USER_AGENT_KEY_CHARS)
        .collect()
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestDescriptor {
        RequestDescriptor {
            forwarded_ip: Some("203.0.113.7".to_string()),
            remote_addr: Some("10.0.0.1".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
            user_id: Some("42".to_string()),
        }
    }

    #[test]
    fn test_user_scoped_keys() {
        let req = request();
        assert_eq!(RateLimitKey::derive(&req, "order_create").to_string(), "order_create:203.0.113.7:42");
        assert_eq!(RateLimitKey::derive(&req, "order_read").to_string(), "order_read:203.0.113.7:42");
        assert_eq!(RateLimitKey::derive(&req, "critical_endpoints").to_string(), "critical:203.0.113.7:42");
        assert_eq!(RateLimitKey::derive(&req, "admin_operations").to_string(), "admin:203.0.113.7:42");
        assert_eq!(RateLimitKey::derive(&req, "file_upload").to_string(), "upload:203.0.113.7:42");
    }

    #[test]
    fn test_general_key_uses_user_agent() {
        let req = request();
        assert_eq!(RateLimitKey::derive(&req, "general").to_string(), "general:203.0.113.7:Mozilla/5.0");
    }

    #[test]
    fn test_unknown_class_derives_general_key() {
        let req = request();
        assert_eq!(
            RateLimitKey::derive(&req, "checkout"),
            RateLimitKey::derive(&req, "general")
        );
    }

    #[test]
    fn test_user_agent_truncated_to_fifty_chars() {
        let mut req = request();
        req.user_agent = Some("x".repeat(80));
        let key = RateLimitKey::derive(&req, "general");
        assert_eq!(key.identity.len(), USER_AGENT_KEY_CHARS);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let mut req = request();
        req.user_agent = Some("é".repeat(60));
        let key = RateLimitKey::derive(&req, "general");
        assert_eq!(key.identity.chars().count(), USER_AGENT_KEY_CHARS);
    }

    #[test]
    fn test_missing_attributes() {
        let req = RequestDescriptor::default();
        assert_eq!(RateLimitKey::derive(&req, "order_read").to_string(), "order_read:unknown:anonymous");
        assert_eq!(RateLimitKey::derive(&req, "general").to_string(), "general:unknown:unknown");
    }

    #[test]
    fn test_ip_falls_back_to_remote_addr() {
        let mut req = request();
        req.forwarded_ip = None;
        assert_eq!(req.client_ip(), "10.0.0.1");
        req.forwarded_ip = Some(String::new());
        assert_eq!(req.client_ip(), "10.0.0.1");
    }

    fn resolved(class: &str, fallback: bool) -> ResolvedPolicy {
        ResolvedPolicy {
            class: class.to_string(),
            policy: crate::ratelimit::Policy::new(1, 1000),
            fallback,
        }
    }

    #[test]
    fn test_configured_custom_class_gets_own_key() {
        let req = request();
        let key = RateLimitKey::for_policy(&req, &resolved("checkout", false));
        assert_eq!(key.to_string(), "checkout:203.0.113.7:42");
        assert_ne!(key, RateLimitKey::derive(&req, "general"));
    }

    #[test]
    fn test_fallback_policy_uses_general_key() {
        let req = request();
        assert_eq!(
            RateLimitKey::for_policy(&req, &resolved("checkout", true)),
            RateLimitKey::derive(&req, "general")
        );
        assert_eq!(
            RateLimitKey::for_policy(&req, &resolved("file_upload", false)).to_string(),
            "upload:203.0.113.7:42"
        );
    }

    #[test]
    fn test_classes_get_independent_keys() {
        let req = request();
        assert_ne!(
            RateLimitKey::derive(&req, "order_create"),
            RateLimitKey::derive(&req, "order_read")
        );
    }
}
