//! Per-issuer ACME directories and their nonce supply.

use std::collections::HashMap;

use futures::future::try_join_all;
use parking_lot::Mutex;

use crate::{
    api,
    config::IssuerSettings,
    error::{Error, Result},
};

pub(crate) const REPLAY_NONCE: &str = "replay-nonce";

#[derive(Debug)]
struct IssuerDirectory {
    directory: api::Directory,

    /// Freshest nonce seen in a response, consumed by the next request.
    nonce: Mutex<Option<String>>,

    /// Held from nonce-take until the response nonce is latched.
    lane: tokio::sync::Mutex<()>,
}

/// Resolved directories for every configured issuer.
///
/// Built once at startup by [`DirectoryCache::load()`] and read-only afterwards, apart from the
/// latched nonces.
#[derive(Debug)]
pub struct DirectoryCache {
    http: reqwest::Client,
    issuers: HashMap<String, IssuerDirectory>,
}

impl DirectoryCache {
    /// Fetches the directory document of every issuer.
    ///
    /// Any issuer whose directory cannot be resolved fails the whole load.
    pub async fn load(
        issuers: &HashMap<String, IssuerSettings>,
        http: reqwest::Client,
    ) -> Result<DirectoryCache> {
        let fetches = issuers.iter().map(|(id, settings)| {
            let http = &http;

            async move {
                let directory = fetch_directory(http, &settings.directory_url)
                    .await
                    .map_err(|err| {
                        Error::configuration(format!(
                            "cannot load directory of issuer {id} from {}: {err}",
                            settings.directory_url
                        ))
                    })?;

                log::info!("loaded ACME directory for issuer {id}");

                Ok::<_, Error>((
                    id.clone(),
                    IssuerDirectory {
                        directory,
                        nonce: Mutex::new(None),
                        lane: tokio::sync::Mutex::new(()),
                    },
                ))
            }
        });

        let issuers = try_join_all(fetches).await?.into_iter().collect();

        Ok(DirectoryCache { http, issuers })
    }

    pub fn directory_for(&self, issuer_id: &str) -> Result<&api::Directory> {
        self.issuer(issuer_id).map(|issuer| &issuer.directory)
    }

    /// Takes the latched nonce, or asks the `newNonce` resource for a fresh one.
    pub async fn nonce_for(&self, issuer_id: &str) -> Result<String> {
        let issuer = self.issuer(issuer_id)?;

        let latched = issuer.nonce.lock().take();

        if let Some(nonce) = latched {
            log::trace!("using latched nonce for issuer {issuer_id}");
            return Ok(nonce);
        }

        log::trace!("requesting new nonce for issuer {issuer_id}");

        let res = self
            .http
            .head(&issuer.directory.new_nonce)
            .send()
            .await?;

        res.headers()
            .get(REPLAY_NONCE)
            .and_then(|nonce| nonce.to_str().ok())
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                Error::protocol(format!(
                    "{} returned no Replay-Nonce header",
                    issuer.directory.new_nonce
                ))
            })
    }

    /// Keeps `nonce` for the next request to this issuer. Unknown issuers are ignored.
    pub fn latch(&self, issuer_id: &str, nonce: String) {
        match self.issuers.get(issuer_id) {
            Some(issuer) => {
                log::trace!("latching nonce for issuer {issuer_id}");
                *issuer.nonce.lock() = Some(nonce);
            }
            None => log::trace!("dropping nonce for unknown issuer {issuer_id}"),
        }
    }

    /// Serializes signed requests to one issuer so each consumes a distinct nonce.
    pub(crate) async fn lane(&self, issuer_id: &str) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        Ok(self.issuer(issuer_id)?.lane.lock().await)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn issuer(&self, issuer_id: &str) -> Result<&IssuerDirectory> {
        self.issuers
            .get(issuer_id)
            .ok_or_else(|| Error::configuration(format!("unknown issuer {issuer_id}")))
    }
}

async fn fetch_directory(http: &reqwest::Client, url: &str) -> Result<api::Directory> {
    let res = http.get(url).send().await?.error_for_status()?;
    Ok(res.json::<api::Directory>().await?)
}
