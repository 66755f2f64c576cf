//! Capability tokens for the Horizon fabric
//!
//! Tokens are Ed25519-signed JWTs naming an account, a role and a list of
//! capabilities. Hubs verify them with the control plane's public key; trust
//! is purely cryptographic and time-bounded, there is no revocation lookup.

pub mod authorization;
pub mod token;

pub use authorization::{bearer_token, require_role, AuthError, AUTHORIZATION};
pub use token::{Role, TokenClaims, TokenCreator, TokenError, TokenValidator, ValidToken};

// Re-export useful types
pub use jsonwebtoken::{DecodingKey, EncodingKey};
