//! Certificates for the QUIC peer link
//!
//! QUIC always runs over TLS 1.3, so a `portmux serve` peer needs a
//! certificate even on a private network. When none is configured a
//! self-signed one is generated here.

pub mod self_signed;

pub use self_signed::{
    generate_self_signed_cert, generate_self_signed_cert_for, SelfSignedCertificate,
    SelfSignedError,
};
