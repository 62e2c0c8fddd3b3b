use rsa::{pkcs1v15::SigningKey, RsaPrivateKey};
use sha2::Sha256;

use crate::{
    error::{Error, Result},
    jws::Jwk,
};

const ACCOUNT_KEY_BITS: usize = 2048;

/// RSA key pair an account signs its requests with (RS256).
#[derive(Clone, Debug)]
pub(crate) struct AccountKey {
    signing_key: SigningKey<Sha256>,
    jwk: Jwk,
    thumbprint: String,
}

impl AccountKey {
    pub(crate) fn generate() -> Result<AccountKey> {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), ACCOUNT_KEY_BITS)
            .map_err(Error::crypto)?;
        Self::from_key(private_key)
    }

    fn from_key(private_key: RsaPrivateKey) -> Result<AccountKey> {
        let jwk = Jwk::from(&private_key.to_public_key());
        let thumbprint = jwk.thumbprint()?;

        Ok(AccountKey {
            signing_key: SigningKey::<Sha256>::new(private_key),
            jwk,
            thumbprint,
        })
    }

    pub(crate) fn signing_key(&self) -> &SigningKey<Sha256> {
        &self.signing_key
    }

    pub(crate) fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    /// See [RFC 8555 §8.1](https://datatracker.ietf.org/doc/html/rfc8555#section-8.1).
    pub(crate) fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{}", self.thumbprint)
    }

    /// Shared across tests; RSA generation is too slow to repeat per test.
    #[cfg(test)]
    pub(crate) fn test_key() -> &'static AccountKey {
        static KEY: std::sync::OnceLock<AccountKey> = std::sync::OnceLock::new();
        KEY.get_or_init(|| AccountKey::generate().unwrap())
    }
}
