use serde::{Deserialize, Serialize};

/// Opaque bearer credential carried by every RPC call, grounded in the
/// bearer/cookie token extraction used at the ambient HTTP/RPC boundary.
/// `Debug`/`Display` are deliberately not derived so a context can't be
/// accidentally logged with the token attached.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenSecret(String);

impl TokenSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenSecret(****)")
    }
}

/// Every handler in §6's RPC surface takes a request context as its first
/// argument, carrying the auth token and whether the caller is an admin.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub auth_token: TokenSecret,
    pub is_admin: bool,
}

impl RequestContext {
    pub fn new(auth_token: TokenSecret, is_admin: bool) -> Self {
        Self {
            auth_token,
            is_admin,
        }
    }
}

/// Abstracts the concrete wire transport (gRPC, HTTP, an in-process bus).
/// A real binary implements this once per transport and forwards into
/// `ConductorCore`'s handler methods; the transport and serialization
/// format are out of scope here.
pub trait RpcEndpoint {
    fn register_handlers(&mut self);
}
