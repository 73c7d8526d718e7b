use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// SHA-256 of an asset's bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssetHash([u8; 32]);

impl AssetHash {
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Self(hash)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// base64url without padding, as used in manifest `hash` fields
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Asset `key`: the first 32 hex characters
    pub fn key(&self) -> String {
        self.to_hex()[..32].to_string()
    }
}

impl std::fmt::Debug for AssetHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssetHash({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for AssetHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base64url())
    }
}

/// Does a publisher-declared hash name this content? Accepts hex or base64url.
pub fn declared_hash_matches(declared: &str, actual: &AssetHash) -> bool {
    let declared = declared.trim();
    if declared.len() == 64 && declared.chars().all(|c| c.is_ascii_hexdigit()) {
        return declared.eq_ignore_ascii_case(&actual.to_hex());
    }
    declared.trim_end_matches('=') == actual.to_base64url()
}
