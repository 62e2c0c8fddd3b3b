use std::{collections::HashMap, sync::Arc};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt as _, TryFutureExt as _,
};
use parking_lot::Mutex;

use crate::{
    api,
    client::AcmeClient,
    config::IssuerSettings,
    error::{Error, Result},
    jws::KeyRef,
};

mod key;

pub(crate) use self::key::AccountKey;

type PendingAccount = Shared<BoxFuture<'static, Result<Account, Arc<Error>>>>;

/// Account with an ACME provider.
///
/// Consists of the RSA key every request is signed with and the account URL the server assigned
/// on registration, used as the `kid` of all later requests.
#[derive(Debug, Clone)]
pub struct Account {
    key: Arc<AccountKey>,
    url: String,
}

impl Account {
    pub(crate) fn key(&self) -> &AccountKey {
        &self.key
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Lazily registers one account per issuer and keeps it for the lifetime of the process.
///
/// Concurrent callers for the same issuer share a single registration. A failed registration is
/// forgotten so the next caller tries again.
pub struct AccountManager {
    client: AcmeClient,
    issuers: HashMap<String, IssuerSettings>,
    accounts: Mutex<HashMap<String, PendingAccount>>,
}

impl std::fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountManager")
            .field("issuers", &self.issuers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl AccountManager {
    pub(crate) fn new(client: AcmeClient, issuers: HashMap<String, IssuerSettings>) -> Self {
        AccountManager {
            client,
            issuers,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn account_for(&self, issuer_id: &str) -> Result<Account> {
        let pending = self.pending_account(issuer_id)?;

        match pending.clone().await {
            Ok(account) => Ok(account),
            Err(err) => {
                let mut accounts = self.accounts.lock();

                // a later caller may already have started a new attempt
                if accounts
                    .get(issuer_id)
                    .is_some_and(|current| current.ptr_eq(&pending))
                {
                    accounts.remove(issuer_id);
                }

                Err(Error::AccountCreation(err))
            }
        }
    }

    /// `token.thumbprint` for the issuer's account, see
    /// [RFC 8555 §8.1](https://datatracker.ietf.org/doc/html/rfc8555#section-8.1).
    pub async fn key_authorization_for(&self, issuer_id: &str, token: &str) -> Result<String> {
        let account = self.account_for(issuer_id).await?;
        Ok(account.key.key_authorization(token))
    }

    fn pending_account(&self, issuer_id: &str) -> Result<PendingAccount> {
        let mut accounts = self.accounts.lock();

        if let Some(pending) = accounts.get(issuer_id) {
            return Ok(pending.clone());
        }

        let settings = self
            .issuers
            .get(issuer_id)
            .ok_or_else(|| Error::configuration(format!("unknown issuer {issuer_id}")))?
            .clone();

        let pending = register_account(self.client.clone(), issuer_id.to_owned(), settings)
            .map_err(Arc::new)
            .boxed()
            .shared();

        accounts.insert(issuer_id.to_owned(), pending.clone());

        Ok(pending)
    }
}

async fn register_account(
    client: AcmeClient,
    issuer_id: String,
    settings: IssuerSettings,
) -> Result<Account> {
    log::info!("registering ACME account for issuer {issuer_id}");

    let key = tokio::task::spawn_blocking(AccountKey::generate)
        .await
        .map_err(Error::crypto)??;

    let new_account_url = client
        .directories()
        .directory_for(&issuer_id)?
        .new_account
        .clone();

    let payload = api::NewAccount::from_emails(&settings.emails, settings.terms_of_service_agreed);

    let res = client
        .request(&issuer_id, &key, KeyRef::Jwk, &new_account_url, Some(&payload))
        .await?;

    let api_account = res.json::<api::Account>()?;

    if !api_account.is_status_valid() {
        return Err(Error::Account {
            issuer: issuer_id,
            status: api_account.status().to_owned(),
        });
    }

    let url = res.location()?.to_owned();
    log::debug!("account URL for issuer {issuer_id} is {url}");

    Ok(Account {
        key: Arc::new(key),
        url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::test_settings, directory::DirectoryCache, test::TestServer};

    async fn manager(server: &TestServer) -> AccountManager {
        let settings = test_settings(&server.dir_url);
        let directories = DirectoryCache::load(&settings.issuers, reqwest::Client::new())
            .await
            .unwrap();

        AccountManager::new(AcmeClient::new(Arc::new(directories)), settings.issuers)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_registration() {
        let server = crate::test::with_directory_server();
        server.set_new_account_delay_ms(200);
        let accounts = manager(&server).await;

        let results =
            futures::future::join_all((0..5).map(|_| accounts.account_for("staging"))).await;

        let urls = results
            .into_iter()
            .map(|res| res.unwrap().url().to_owned())
            .collect::<Vec<_>>();

        assert!(urls.iter().all(|url| *url == urls[0]));
        assert_eq!(server.new_account_calls(), 1);
    }

    #[tokio::test]
    async fn account_is_cached_after_success() {
        let server = crate::test::with_directory_server();
        let accounts = manager(&server).await;

        let first = accounts.account_for("staging").await.unwrap();
        let second = accounts.account_for("staging").await.unwrap();

        assert_eq!(first.url(), second.url());
        assert_eq!(
            accounts.key_authorization_for("staging", "tok").await.unwrap(),
            accounts.key_authorization_for("staging", "tok").await.unwrap(),
        );
        assert_eq!(server.new_account_calls(), 1);
    }

    #[tokio::test]
    async fn failed_registration_is_retried() {
        let server = crate::test::with_directory_server();
        server.fail_next_new_account();
        let accounts = manager(&server).await;

        let err = accounts.account_for("staging").await.unwrap_err();
        assert!(err.problem().is_some(), "{err}");

        accounts.account_for("staging").await.unwrap();
        assert_eq!(server.new_account_calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failure() {
        let server = crate::test::with_directory_server();
        server.fail_next_new_account();
        server.set_new_account_delay_ms(200);
        let accounts = manager(&server).await;

        let results =
            futures::future::join_all((0..5).map(|_| accounts.account_for("staging"))).await;

        for res in results {
            let err = res.unwrap_err();
            assert!(matches!(err, Error::AccountCreation(_)), "{err}");
            assert!(err.problem().is_some());
        }
        assert_eq!(server.new_account_calls(), 1);

        // the failure is not remembered
        accounts.account_for("staging").await.unwrap();
        assert_eq!(server.new_account_calls(), 2);
    }

    #[tokio::test]
    async fn unknown_issuer_is_a_configuration_error() {
        let server = crate::test::with_directory_server();
        let accounts = manager(&server).await;

        assert!(matches!(
            accounts.account_for("prod").await,
            Err(Error::Configuration(_))
        ));
    }
}
