//! Session credential issuance, verification and recovery.

pub mod credentials;

pub use credentials::{
    CredentialAuthority, CredentialError, CredentialKind, SessionClaims,
};
