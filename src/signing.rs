//! Code signing for manifest and directive bodies.
//!
//! Expo code signing: RSASSA-PKCS1-v1_5 over SHA-256 of the exact body bytes,
//! sent as the structured-field dictionary `sig="<base64>", keyid="main"`.
//! Clients announce what they verify with `expo-expect-signature`, a dictionary
//! of the same shape (`sig, keyid="main", alg="rsa-v1_5-sha256"`).

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sfv::{BareItem, Dictionary, FieldType, Item, Key, ListEntry, Parser};
use sha2::Sha256;

use crate::error::{Result, ServerError};

pub const SIGNATURE_HEADER: &str = "expo-signature";
pub const EXPECT_SIGNATURE_HEADER: &str = "expo-expect-signature";
pub const KEY_ID: &str = "main";
pub const ALGORITHM: &str = "rsa-v1_5-sha256";

/// What a client expects to verify, from `expo-expect-signature`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectSignature {
    pub key_id: String,
    pub alg: String,
}

fn text_member(value: &ListEntry) -> Option<String> {
    match value {
        ListEntry::Item(item) => match &item.bare_item {
            BareItem::String(s) => Some(s.clone().into()),
            BareItem::Token(t) => Some(t.clone().into()),
            _ => None,
        },
        ListEntry::InnerList(_) => None,
    }
}

/// Parse `expo-expect-signature`. Missing members default to the only key
/// and algorithm this server signs with; anything else is rejected.
pub fn parse_expect_signature(value: &str) -> Result<ExpectSignature> {
    let dict: Dictionary = Parser::new(value).parse().map_err(|e| {
        ServerError::Validation(format!("invalid {} header: {:?}", EXPECT_SIGNATURE_HEADER, e))
    })?;

    let mut expect = ExpectSignature {
        key_id: KEY_ID.to_string(),
        alg: ALGORITHM.to_string(),
    };
    for (key, member) in &dict {
        let field = match key.as_str() {
            "keyid" => &mut expect.key_id,
            "alg" => &mut expect.alg,
            _ => continue,
        };
        *field = text_member(member).ok_or_else(|| {
            ServerError::Validation(format!(
                "{} member {} must be a string",
                EXPECT_SIGNATURE_HEADER,
                key.as_str()
            ))
        })?;
    }

    if expect.alg != ALGORITHM {
        return Err(ServerError::Validation(format!(
            "unsupported signature algorithm: {}",
            expect.alg
        )));
    }
    if expect.key_id != KEY_ID {
        return Err(ServerError::Validation(format!(
            "unknown signing key id: {}",
            expect.key_id
        )));
    }
    Ok(expect)
}

fn string_member(key: &str, value: String) -> Result<(Key, ListEntry)> {
    let key = Key::try_from(key.to_string())
        .map_err(|e| ServerError::Signing(format!("signature header key: {:?}", e)))?;
    let value = sfv::String::try_from(value)
        .map_err(|e| ServerError::Signing(format!("signature header value: {:?}", e)))?;
    Ok((key, ListEntry::Item(Item::new(BareItem::String(value)))))
}

/// Configured signing state. `Unsigned` is a deliberate mode, reported at
/// startup and on every response that would otherwise carry a signature.
pub enum ManifestSigner {
    Signed(SigningKey<Sha256>),
    Unsigned,
}

impl ManifestSigner {
    /// Parse a PEM private key, PKCS#8 first, then PKCS#1
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| ServerError::Signing(format!("invalid private key: {}", e)))?;
        Ok(Self::from_key(key))
    }

    pub fn from_key(key: RsaPrivateKey) -> Self {
        ManifestSigner::Signed(SigningKey::<Sha256>::new(key))
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let pem = tokio::fs::read_to_string(path).await.map_err(|e| {
            ServerError::Signing(format!("read private key {}: {}", path.display(), e))
        })?;
        Self::from_pem(&pem)
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, ManifestSigner::Signed(_))
    }

    pub fn state(&self) -> &'static str {
        match self {
            ManifestSigner::Signed(_) => "signed",
            ManifestSigner::Unsigned => "unsigned",
        }
    }

    /// Signature header value for `body`, `None` in unsigned mode
    pub fn sign(&self, body: &[u8]) -> Result<Option<String>> {
        let ManifestSigner::Signed(key) = self else {
            return Ok(None);
        };
        let signature = key
            .try_sign(body)
            .map_err(|e| ServerError::Signing(e.to_string()))?;

        let mut dict = Dictionary::new();
        for (key, value) in [
            string_member("sig", STANDARD.encode(signature.to_bytes()))?,
            string_member("keyid", KEY_ID.to_string())?,
        ] {
            dict.insert(key, value);
        }
        Ok(Some(dict.serialize().unwrap_or_default()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs1v15::{Signature, VerifyingKey};
    use rsa::pkcs8::EncodePrivateKey;
    use rsa::signature::Verifier;

    #[test]
    fn test_signature_verifies_with_public_key() {
        let key = testing::private_key();
        let verifying = VerifyingKey::<Sha256>::new(key.to_public_key());
        let signer = ManifestSigner::from_key(key);

        let body = br#"{"id":"0754dad0-d200-d634-113c-ef1f26106028"}"#;
        let header = signer.sign(body).unwrap().unwrap();
        assert!(header.ends_with(", keyid=\"main\""));

        let signature =
            Signature::try_from(testing::signature_bytes(&header).as_slice()).unwrap();
        assert!(verifying.verify(body, &signature).is_ok());
        assert!(verifying.verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn test_pem_formats() {
        let key = testing::private_key();
        let pkcs8 = key.to_pkcs8_pem(Default::default()).unwrap();
        let pkcs1 = key.to_pkcs1_pem(Default::default()).unwrap();

        assert!(ManifestSigner::from_pem(&pkcs8).unwrap().is_signed());
        assert!(ManifestSigner::from_pem(&pkcs1).unwrap().is_signed());
        assert!(matches!(
            ManifestSigner::from_pem("-----BEGIN NOTHING-----"),
            Err(ServerError::Signing(_))
        ));
    }

    #[test]
    fn test_unsigned_mode() {
        let signer = ManifestSigner::Unsigned;
        assert_eq!(signer.state(), "unsigned");
        assert_eq!(signer.sign(b"body").unwrap(), None);
    }

    #[test]
    fn test_expect_signature_header() {
        let expect = parse_expect_signature(r#"sig, keyid="main", alg="rsa-v1_5-sha256""#).unwrap();
        assert_eq!(expect.key_id, "main");
        assert_eq!(expect.alg, ALGORITHM);

        // Bare `sig` and token values are accepted
        assert!(parse_expect_signature("sig").is_ok());
        assert!(parse_expect_signature("sig, keyid=main").is_ok());

        for rejected in [
            r#"sig, alg="ecdsa-p256-sha256""#,
            r#"sig, keyid="root""#,
            "sig, keyid=1",
            "sig=(",
        ] {
            assert!(
                matches!(parse_expect_signature(rejected), Err(ServerError::Validation(_))),
                "{} should be rejected",
                rejected
            );
        }
    }
}
