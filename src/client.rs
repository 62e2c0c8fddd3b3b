use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    account::{AccountKey, AccountManager},
    api,
    config::{IssuerSettings, Settings},
    directory::{DirectoryCache, REPLAY_NONCE},
    error::{Error, Result},
    jws::{self, KeyRef},
};

const CONTENT_TYPE_JOSE: &str = "application/jose+json";
const CONTENT_TYPE_PROBLEM: &str = "application/problem+json";
const ACCEPT_JSON: &str = "application/json";
const ACCEPT_PEM_CHAIN: &str = "application/pem-certificate-chain";

/// HTTP client for ACME servers with the configured response timeout.
pub fn http_client(settings: &Settings) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(settings.response_timeout())
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Successful (2xx) response to a signed request.
#[derive(Debug)]
pub(crate) struct AcmeResponse {
    location: Option<String>,
    body: String,
}

impl AcmeResponse {
    pub(crate) fn location(&self) -> Result<&str> {
        self.location
            .as_deref()
            .ok_or_else(|| Error::protocol("response has no Location header"))
    }

    pub(crate) fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub(crate) fn into_body(self) -> String {
        self.body
    }
}

/// Signed request/response layer over a [`DirectoryCache`].
///
/// Has no retry policy; a rejected request surfaces as [`Error::AcmeProblem`].
#[derive(Debug, Clone)]
pub(crate) struct AcmeClient {
    directories: Arc<DirectoryCache>,
}

impl AcmeClient {
    pub(crate) fn new(directories: Arc<DirectoryCache>) -> Self {
        AcmeClient { directories }
    }

    pub(crate) fn directories(&self) -> &DirectoryCache {
        &self.directories
    }

    /// Signs and posts `payload` to `url`. `None` makes a POST-as-GET request.
    pub(crate) async fn request<T: Serialize + Sync + ?Sized>(
        &self,
        issuer_id: &str,
        key: &AccountKey,
        key_ref: KeyRef<'_>,
        url: &str,
        payload: Option<&T>,
    ) -> Result<AcmeResponse> {
        self.send(issuer_id, key, key_ref, url, payload, ACCEPT_JSON)
            .await
    }

    async fn send<T: Serialize + Sync + ?Sized>(
        &self,
        issuer_id: &str,
        key: &AccountKey,
        key_ref: KeyRef<'_>,
        url: &str,
        payload: Option<&T>,
        accept: &str,
    ) -> Result<AcmeResponse> {
        let lane = self.directories.lane(issuer_id).await?;

        let nonce = self.directories.nonce_for(issuer_id).await?;
        let body = serde_json::to_string(&jws::sign(key, key_ref, nonce, url, payload)?)?;

        log::debug!("POST {url}");

        let res = self
            .directories
            .http()
            .post(url)
            .header(CONTENT_TYPE, CONTENT_TYPE_JOSE)
            .header(ACCEPT, accept)
            .body(body)
            .send()
            .await?;

        // the nonce is valid whatever the outcome of the request
        if let Some(nonce) = res.headers().get(REPLAY_NONCE).and_then(|v| v.to_str().ok()) {
            self.directories.latch(issuer_id, nonce.to_owned());
        }

        drop(lane);

        let status = res.status();
        let location = res
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        let is_problem = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with(CONTENT_TYPE_PROBLEM));

        if status.is_success() {
            let body = res.text().await?;
            return Ok(AcmeResponse { location, body });
        }

        // best effort, the status alone fails the request
        let body = res.text().await.unwrap_or_default();

        let problem = if is_problem {
            serde_json::from_str(&body).unwrap_or_else(|err| {
                api::Problem::synthetic(
                    "problemJsonFail",
                    format!("failed to deserialize application/problem+json ({err}) body: {body}"),
                )
            })
        } else {
            api::Problem::synthetic("httpReqError", format!("{status} body: {body}"))
        };

        log::warn!("{url} rejected request: {problem}");

        Err(Error::AcmeProblem(problem))
    }

    /// POST-as-GET for a PEM certificate chain.
    pub(crate) async fn download(
        &self,
        issuer_id: &str,
        key: &AccountKey,
        key_ref: KeyRef<'_>,
        url: &str,
    ) -> Result<String> {
        self.send::<()>(issuer_id, key, key_ref, url, None, ACCEPT_PEM_CHAIN)
            .await
            .map(AcmeResponse::into_body)
    }
}

/// The ACME operations certificate issuance needs, each run as the issuer's account.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AcmeApi: Send + Sync {
    /// Creates an order for `hosts` and returns its URL together with the order.
    async fn new_order(&self, issuer_id: &str, hosts: &[String]) -> Result<(String, api::Order)>;

    async fn authorization(&self, issuer_id: &str, url: &str) -> Result<api::Authorization>;

    /// Tells the server the challenge at `url` is ready to be validated.
    async fn trigger_challenge(&self, issuer_id: &str, url: &str) -> Result<api::Challenge>;

    /// Submits a base64url DER CSR.
    async fn finalize(&self, issuer_id: &str, finalize_url: &str, csr: String)
        -> Result<api::Order>;

    async fn order(&self, issuer_id: &str, order_url: &str) -> Result<api::Order>;

    /// Downloads the PEM certificate chain.
    async fn download_certificate(&self, issuer_id: &str, url: &str) -> Result<String>;

    async fn key_authorization(&self, issuer_id: &str, token: &str) -> Result<String>;
}

/// [`AcmeApi`] backed by real ACME servers.
#[derive(Debug)]
pub struct AcmeService {
    client: AcmeClient,
    accounts: AccountManager,
}

impl AcmeService {
    pub fn new(directories: Arc<DirectoryCache>, issuers: HashMap<String, IssuerSettings>) -> Self {
        let client = AcmeClient::new(directories);
        let accounts = AccountManager::new(client.clone(), issuers);

        AcmeService { client, accounts }
    }

    async fn post_as_get(&self, issuer_id: &str, url: &str) -> Result<AcmeResponse> {
        let account = self.accounts.account_for(issuer_id).await?;
        self.client
            .request::<()>(issuer_id, account.key(), KeyRef::Kid(account.url()), url, None)
            .await
    }

    async fn post<T: Serialize + Sync + ?Sized>(
        &self,
        issuer_id: &str,
        url: &str,
        payload: &T,
    ) -> Result<AcmeResponse> {
        let account = self.accounts.account_for(issuer_id).await?;
        self.client
            .request(
                issuer_id,
                account.key(),
                KeyRef::Kid(account.url()),
                url,
                Some(payload),
            )
            .await
    }
}

#[async_trait]
impl AcmeApi for AcmeService {
    async fn new_order(&self, issuer_id: &str, hosts: &[String]) -> Result<(String, api::Order)> {
        let new_order_url = self.client.directories().directory_for(issuer_id)?.new_order.clone();

        let res = self
            .post(issuer_id, &new_order_url, &api::NewOrder::for_hosts(hosts))
            .await?;

        let order_url = res.location()?.to_owned();
        log::debug!("created order {order_url}");

        Ok((order_url, res.json()?))
    }

    async fn authorization(&self, issuer_id: &str, url: &str) -> Result<api::Authorization> {
        self.post_as_get(issuer_id, url).await?.json()
    }

    async fn trigger_challenge(&self, issuer_id: &str, url: &str) -> Result<api::Challenge> {
        self.post(issuer_id, url, &api::EmptyObject).await?.json()
    }

    async fn finalize(
        &self,
        issuer_id: &str,
        finalize_url: &str,
        csr: String,
    ) -> Result<api::Order> {
        self.post(issuer_id, finalize_url, &api::Finalize { csr })
            .await?
            .json()
    }

    async fn order(&self, issuer_id: &str, order_url: &str) -> Result<api::Order> {
        self.post_as_get(issuer_id, order_url).await?.json()
    }

    async fn download_certificate(&self, issuer_id: &str, url: &str) -> Result<String> {
        let account = self.accounts.account_for(issuer_id).await?;
        self.client
            .download(issuer_id, account.key(), KeyRef::Kid(account.url()), url)
            .await
    }

    async fn key_authorization(&self, issuer_id: &str, token: &str) -> Result<String> {
        self.accounts.key_authorization_for(issuer_id, token).await
    }
}
