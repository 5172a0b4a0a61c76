//! Publishing intent extracted from container labels
//!
//! A `ProxyEndpoint` is one routable mapping: requests for
//! `frontend_domain` + `frontend_path` are forwarded to
//! `backend_ip:backend_port` + `backend_path`. The reconciliation loop
//! compares sets of endpoints via an order-insensitive 64-bit fingerprint
//! rather than diffing them structurally.

use crc::{Crc, CRC_64_XZ};
use serde::{Deserialize, Serialize};
use tracing::warn;

// Same polynomial and algorithm as the ECMA table of the classic crc64
// implementations, so equal endpoints always digest to the same value.
const ENDPOINT_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// One publishing intent, as advertised by a container network interface.
///
/// Fields hold the label values as discovered; paths are normalized at the
/// points of use (config synthesis and digesting), so two endpoints are
/// interchangeable exactly when all fields compare equal post-normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    /// Frontend hostname. May be empty, in which case routing is by path only.
    pub frontend_domain: String,
    /// Path prefix matched on the frontend.
    pub frontend_path: String,
    /// Address of the container interface serving this endpoint.
    pub backend_ip: String,
    /// Backend port, 1..=65535.
    pub backend_port: u16,
    /// Path prefix requests are rewritten to when it differs from the
    /// frontend path.
    pub backend_path: String,
    /// Whether to also expose this endpoint over HTTPS with an ACME cert.
    pub ssl_auto_cert: bool,
    /// Explicit routing priority. `None` derives the priority from the
    /// frontend path length (shorter paths sort first).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
}

impl ProxyEndpoint {
    /// A copy with both paths normalized, used as the canonical form for
    /// digesting and equality.
    fn canonical(&self) -> ProxyEndpoint {
        ProxyEndpoint {
            frontend_path: normalize_path(&self.frontend_path),
            backend_path: normalize_path(&self.backend_path),
            ..self.clone()
        }
    }

    /// 64-bit digest of the canonical serialization of this endpoint.
    pub fn digest(&self) -> u64 {
        match serde_json::to_vec(&self.canonical()) {
            Ok(bytes) => ENDPOINT_CRC.checksum(&bytes),
            Err(e) => {
                warn!(endpoint = ?self, error = %e, "Could not serialize endpoint for digest");
                0
            }
        }
    }
}

/// Normalize a routing path: empty maps to `/`, everything else is
/// guaranteed a leading slash.
pub fn normalize_path(p: &str) -> String {
    if p.is_empty() || p == "/" {
        return "/".to_string();
    }
    if !p.starts_with('/') {
        return format!("/{}", p);
    }
    p.to_string()
}

/// Order-insensitive fingerprint of an endpoint set: the XOR-fold of the
/// per-endpoint digests. Equal sets produce equal fingerprints in any
/// order; any field change flips the fingerprint with overwhelming
/// probability.
pub fn fingerprint(endpoints: &[ProxyEndpoint]) -> u64 {
    endpoints.iter().map(ProxyEndpoint::digest).fold(0, |acc, d| acc ^ d)
}
