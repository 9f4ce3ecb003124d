// Compact JWS encoding shared by the token service and the ID token validator

use base64::{engine::general_purpose, Engine as _};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;

use super::TokenError;

pub const RS256: &str = "RS256";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl JwtHeader {
    #[must_use]
    pub fn rs256(kid: Option<&str>) -> Self {
        Self {
            alg: RS256.to_string(),
            typ: Some("JWT".to_string()),
            kid: kid.map(str::to_string),
        }
    }
}

/// A token split into its parts, signature not yet checked
#[derive(Debug)]
pub struct UnverifiedJwt<'a> {
    pub header: JwtHeader,
    /// `header.payload` exactly as received; the bytes the signature covers
    pub signing_input: &'a str,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl UnverifiedJwt<'_> {
    /// Deserialize the payload
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Malformed` when the payload is not the expected JSON
    pub fn claims<T: DeserializeOwned>(&self) -> Result<T, TokenError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| TokenError::Malformed(format!("Invalid claims: {e}")))
    }

    /// Check an RS256 signature over the signing input
    ///
    /// # Errors
    ///
    /// Returns `TokenError::SignatureInvalid` on any mismatch
    pub fn verify_rs256(&self, key: &VerifyingKey<Sha256>) -> Result<(), TokenError> {
        let signature = Signature::try_from(self.signature.as_slice())
            .map_err(|_| TokenError::SignatureInvalid)?;
        key.verify(self.signing_input.as_bytes(), &signature)
            .map_err(|_| TokenError::SignatureInvalid)
    }
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>, TokenError> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| TokenError::Malformed(format!("Invalid {what} encoding: {e}")))
}

/// Split a compact JWS into header, payload and signature
///
/// # Errors
///
/// Returns `TokenError::Malformed` unless the token has exactly three
/// base64url segments with a JSON header
pub fn split(token: &str) -> Result<UnverifiedJwt<'_>, TokenError> {
    let malformed = || TokenError::Malformed("Invalid JWT format".to_string());

    let (signing_input, signature_b64) = token.rsplit_once('.').ok_or_else(malformed)?;
    let (header_b64, payload_b64) = signing_input.split_once('.').ok_or_else(malformed)?;
    if header_b64.is_empty() || payload_b64.is_empty() || payload_b64.contains('.') {
        return Err(malformed());
    }

    let header: JwtHeader = serde_json::from_slice(&decode_segment(header_b64, "header")?)
        .map_err(|e| TokenError::Malformed(format!("Invalid header: {e}")))?;

    Ok(UnverifiedJwt {
        header,
        signing_input,
        payload: decode_segment(payload_b64, "payload")?,
        signature: decode_segment(signature_b64, "signature")?,
    })
}

/// Serialize, encode and RS256-sign a payload
///
/// # Errors
///
/// Returns an error if serialization or signing fails
pub fn encode_rs256<T: Serialize>(
    header: &JwtHeader,
    claims: &T,
    key: &SigningKey<Sha256>,
) -> Result<String, TokenError> {
    let header_json = serde_json::to_vec(header)
        .map_err(|e| TokenError::Signing(format!("Failed to serialize JWT header: {e}")))?;
    let payload_json = serde_json::to_vec(claims)
        .map_err(|e| TokenError::Signing(format!("Failed to serialize JWT payload: {e}")))?;

    let message = format!(
        "{}.{}",
        general_purpose::URL_SAFE_NO_PAD.encode(header_json),
        general_purpose::URL_SAFE_NO_PAD.encode(payload_json)
    );

    let signature = key
        .try_sign(message.as_bytes())
        .map_err(|e| TokenError::Signing(e.to_string()))?;
    let signature_b64 = general_purpose::URL_SAFE_NO_PAD.encode(signature.to_bytes());

    Ok(format!("{message}.{signature_b64}"))
}
