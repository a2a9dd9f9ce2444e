//! Authentication
//!
//! | Module          | Responsibility                                      |
//! |-----------------|-----------------------------------------------------|
//! | `backend`       | API key exchange and key set fetch over HTTPS       |
//! | `jwks`          | EdDSA signature check against the published keys   |
//! | `token_cache`   | Per-environment token file with owner-only access   |
//! | `authenticator` | Cache-first token issuance                          |

pub mod backend;
pub mod jwks;
pub mod token_cache;

mod authenticator;

pub use authenticator::{Authenticator, TokenProvider, DEFAULT_TOKEN_LIFETIME_SECS};
pub use backend::{AuthBackend, HttpAuthBackend};
pub use jwks::{ed25519_jwk, Claims, Jwk, KeySet};
pub use token_cache::{default_cache_path, CachedToken, TokenCache, REFRESH_BUFFER_SECS};
