//! Cairn Params
//!
//! Turns what a caller provides for a node into a resolved [`ParameterSet`]
//! (defaults filled, every violation collected) and digests a resolved set
//! into a [`Fingerprint`], the content address used by the cache.
//!
//! Fingerprints cover the unit type, every identity-affecting input in
//! canonical order, the content of referenced files and directories, and the
//! fan-out combination index. Hashing reads files synchronously; async
//! callers should move it onto the blocking pool.
//!
//! [`ParameterSet`]: cairn_unit::ParameterSet

mod error;
mod identity;
mod resolve;

pub use error::{ParamError, ValidationError};
pub use identity::{FINGERPRINT_VERSION, Fingerprint, Identity, fingerprint, fingerprint_at, identity};
pub use resolve::{check, check_outputs, resolve};
