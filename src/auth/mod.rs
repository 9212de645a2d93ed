//! OAuth 2.0 bearer-token authentication.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to read `kid` and `alg`.
//! 2. Resolve the signing key through the [`KeySetCache`]; an unknown `kid`
//!    triggers a single key set refresh before failing.
//! 3. Verify the signature, `exp`, `aud` and `iss` as hard requirements.
//! 4. Return a [`VerifiedIdentity`] with the subject and space-delimited scopes.
//!
//! Only signing keys are cached. Tokens are re-verified on every request.
//!
//! The [`TokenAcquirer`] is the client side: it obtains client-credentials
//! access tokens for test and integration flows and is not consulted on the
//! request path.

pub mod acquirer;
pub mod error;
pub mod jwks;
pub mod scope;
pub mod verifier;

pub use acquirer::{CachedAccessToken, TokenAcquirer, TokenCacheInfo};
pub use error::AuthError;
pub use jwks::{KeySetCache, SigningKey};
pub use scope::require_scopes;
pub use verifier::{TokenVerifier, UnverifiedTokenInfo, VerifiedIdentity};
