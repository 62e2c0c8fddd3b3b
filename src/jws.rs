//! Request signing, see [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use rsa::{
    signature::{SignatureEncoding as _, Signer as _},
    traits::PublicKeyParts as _,
    RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{
    account::AccountKey,
    error::{Error, Result},
};

const ALG_RS256: &str = "RS256";

/// How the signing key is identified in the protected header.
#[derive(Debug, Clone, Copy)]
pub(crate) enum KeyRef<'a> {
    /// Embed the public key. Only for `newAccount`.
    Jwk,

    /// The account URL returned by `newAccount`.
    Kid(&'a str),
}

/// JWS protected header as defined in [RFC 8555 §6.2].
///
/// > For newAccount requests, and for revokeCert requests authenticated by a certificate key,
/// there MUST be a "jwk" field. [...] For all other requests, the request is signed using an
/// existing account, and there MUST be a "kid" field.
///
/// [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JwsProtectedHeader {
    alg: String,

    /// Anti-replay token, see [RFC 8555 §6.5].
    ///
    /// [RFC 8555 §6.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.5
    nonce: String,

    /// Target of the request, see [RFC 8555 §6.4].
    ///
    /// [RFC 8555 §6.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.4
    url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtectedHeader {
    fn new(key: &AccountKey, key_ref: KeyRef<'_>, url: &str, nonce: String) -> Self {
        let (jwk, kid) = match key_ref {
            KeyRef::Jwk => (Some(key.jwk().clone()), None),
            KeyRef::Kid(kid) => (None, Some(kid.to_owned())),
        };

        JwsProtectedHeader {
            alg: ALG_RS256.to_owned(),
            nonce,
            url: url.to_owned(),
            jwk,
            kid,
        }
    }
}

/// Public half of an RSA account key.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub(crate) struct Jwk {
    alg: String,
    e: String,
    kty: String,
    n: String,
    #[serde(rename = "use")]
    _use: String,
}

impl From<&RsaPublicKey> for Jwk {
    fn from(key: &RsaPublicKey) -> Self {
        Jwk {
            alg: ALG_RS256.to_owned(),
            e: BASE64_URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
            kty: "RSA".to_owned(),
            n: BASE64_URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
            _use: "sig".to_owned(),
        }
    }
}

impl Jwk {
    /// base64url SHA-256 of the canonical JWK, see [RFC 7638].
    ///
    /// [RFC 7638]: https://datatracker.ietf.org/doc/html/rfc7638
    pub(crate) fn thumbprint(&self) -> Result<String> {
        let canonical = serde_json::to_string(&JwkThumb::from(self))?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(canonical)))
    }
}

/// Required RSA members only.
#[derive(Debug, Serialize)]
// LEXICAL ORDER OF FIELDS MATTER!
struct JwkThumb<'a> {
    e: &'a str,
    kty: &'a str,
    n: &'a str,
}

impl<'a> From<&'a Jwk> for JwkThumb<'a> {
    fn from(jwk: &'a Jwk) -> Self {
        JwkThumb {
            e: &jwk.e,
            kty: &jwk.kty,
            n: &jwk.n,
        }
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJsonJws {
    pub(crate) protected: String,
    pub(crate) payload: String,
    pub(crate) signature: String,
}

/// Signs `payload` for `url`.
///
/// A `None` payload produces the empty payload used by POST-as-GET requests.
pub(crate) fn sign<T: Serialize + ?Sized>(
    key: &AccountKey,
    key_ref: KeyRef<'_>,
    nonce: String,
    url: &str,
    payload: Option<&T>,
) -> Result<FlattenedJsonJws> {
    let protected = {
        let header = JwsProtectedHeader::new(key, key_ref, url, nonce);
        BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(&header)?)
    };

    let payload = match payload {
        Some(payload) => BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(payload)?),
        None => String::new(),
    };

    let signature = key
        .signing_key()
        .try_sign(format!("{protected}.{payload}").as_bytes())
        .map_err(Error::crypto)?;

    Ok(FlattenedJsonJws {
        protected,
        payload,
        signature: BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use rsa::{
        pkcs1v15::Signature,
        signature::{Keypair as _, Verifier as _},
    };

    use super::*;

    fn decode_json(part: &str) -> serde_json::Value {
        let bytes = BASE64_URL_SAFE_NO_PAD.decode(part).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn new_account_request_embeds_jwk() {
        let key = AccountKey::test_key();
        let payload = serde_json::json!({ "termsOfServiceAgreed": true });

        let jws = sign(
            key,
            KeyRef::Jwk,
            "nonce-1".to_owned(),
            "https://example.com/acme/new-acct",
            Some(&payload),
        )
        .unwrap();

        let header = decode_json(&jws.protected);
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["nonce"], "nonce-1");
        assert_eq!(header["url"], "https://example.com/acme/new-acct");
        assert_eq!(header["jwk"]["kty"], "RSA");
        assert!(header.get("kid").is_none());

        assert_eq!(decode_json(&jws.payload), payload);
    }

    #[test]
    fn post_as_get_uses_kid_and_empty_payload() {
        let key = AccountKey::test_key();

        let jws = sign::<()>(
            key,
            KeyRef::Kid("https://example.com/acme/acct/1"),
            "nonce-2".to_owned(),
            "https://example.com/acme/authz/1",
            None,
        )
        .unwrap();

        let header = decode_json(&jws.protected);
        assert_eq!(header["kid"], "https://example.com/acme/acct/1");
        assert!(header.get("jwk").is_none());
        assert_eq!(jws.payload, "");
    }

    #[test]
    fn signature_verifies_with_account_public_key() {
        let key = AccountKey::test_key();

        let jws = sign(
            key,
            KeyRef::Kid("kid"),
            "n".to_owned(),
            "https://example.com/x",
            Some(&crate::api::EmptyObject),
        )
        .unwrap();

        let signature_bytes = BASE64_URL_SAFE_NO_PAD.decode(&jws.signature).unwrap();
        let signature = Signature::try_from(signature_bytes.as_slice()).unwrap();
        let signed = format!("{}.{}", jws.protected, jws.payload);

        key.signing_key()
            .verifying_key()
            .verify(signed.as_bytes(), &signature)
            .unwrap();
    }

    #[test]
    fn thumbprint_matches_rfc7638_example() {
        // RFC 7638 §3.1
        let jwk = Jwk {
            alg: ALG_RS256.to_owned(),
            e: "AQAB".to_owned(),
            kty: "RSA".to_owned(),
            n: "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw".to_owned(),
            _use: "sig".to_owned(),
        };

        assert_eq!(
            jwk.thumbprint().unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }
}
