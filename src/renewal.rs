//! When to renew certificates.
//!
//! A certificate is due for renewal once two thirds of its lifetime have passed.

use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::{sync::mpsc, task::AbortHandle};

use crate::{cert, controller::Trigger, error::Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalDecision {
    Due,

    /// `check_at` is when it becomes due; `None` if the certificate could not be inspected.
    NotDue { check_at: Option<OffsetDateTime> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Validity {
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl Validity {
    fn renewal_due_at(&self) -> OffsetDateTime {
        let lifetime = self.not_after - self.not_before;
        self.not_after - lifetime / 3
    }
}

fn leaf_validity(pem: &[u8]) -> Result<Validity> {
    let chain = cert::parse_chain(pem)?;
    let validity = &chain[0].tbs_certificate.validity;

    Ok(Validity {
        not_before: OffsetDateTime::UNIX_EPOCH + validity.not_before.to_unix_duration(),
        not_after: OffsetDateTime::UNIX_EPOCH + validity.not_after.to_unix_duration(),
    })
}

/// Decides whether the certificate in `tls.crt` of `secret_name` needs renewing at `now`.
///
/// Missing or unreadable certificates are logged and treated as not due.
pub fn evaluate(secret_name: &str, cert_pem: Option<&[u8]>, now: OffsetDateTime) -> RenewalDecision {
    let Some(cert_pem) = cert_pem else {
        log::error!("secret {secret_name} has no certificate data");
        return RenewalDecision::NotDue { check_at: None };
    };

    let validity = match leaf_validity(cert_pem) {
        Ok(validity) => validity,
        Err(err) => {
            log::error!("certificate in secret {secret_name} is unreadable: {err}");
            return RenewalDecision::NotDue { check_at: None };
        }
    };

    let due_at = validity.renewal_due_at();

    log::debug!(
        "certificate in secret {secret_name} has a lifetime of {} days, expires at {}, renewal due at {due_at}",
        (validity.not_after - validity.not_before).whole_days(),
        validity.not_after,
    );

    if now >= due_at {
        log::info!(
            "certificate in secret {secret_name} is due for renewal, expires at {}",
            validity.not_after
        );
        RenewalDecision::Due
    } else {
        RenewalDecision::NotDue {
            check_at: Some(due_at + time::Duration::SECOND),
        }
    }
}

/// One pending renewal check per secret.
#[derive(Debug)]
pub struct RenewalScheduler {
    triggers: mpsc::Sender<Trigger>,
    timers: Mutex<HashMap<String, AbortHandle>>,
}

impl RenewalScheduler {
    pub fn new(triggers: mpsc::Sender<Trigger>) -> Self {
        RenewalScheduler {
            triggers,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Sends [`Trigger::RenewalDue`] for `secret_name` at `at`, replacing any earlier schedule.
    pub fn schedule(&self, secret_name: &str, at: OffsetDateTime) {
        let delay = Duration::try_from(at - OffsetDateTime::now_utc()).unwrap_or(Duration::ZERO);

        log::info!("scheduling renewal check of secret {secret_name} at {at}");

        let triggers = self.triggers.clone();
        let name = secret_name.to_owned();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if triggers.send(Trigger::RenewalDue(name)).await.is_err() {
                log::debug!("controller stopped before renewal check");
            }
        });

        let previous = self
            .timers
            .lock()
            .insert(secret_name.to_owned(), timer.abort_handle());

        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn cancel(&self, secret_name: &str) {
        let timer = self.timers.lock().remove(secret_name);

        if let Some(timer) = timer {
            log::debug!("cancelled renewal check of secret {secret_name}");
            timer.abort();
        }
    }

    pub fn is_scheduled(&self, secret_name: &str) -> bool {
        self.timers
            .lock()
            .get(secret_name)
            .is_some_and(|timer| !timer.is_finished())
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        for timer in self.timers.get_mut().values() {
            timer.abort();
        }
    }
}

#[cfg(test)]
pub(crate) fn test_certificate(not_before: OffsetDateTime, not_after: OffsetDateTime) -> String {
    let mut params = rcgen::CertificateParams::new(vec!["a.example.com".to_owned()]).unwrap();
    params.not_before = not_before;
    params.not_after = not_after;

    let key = rcgen::KeyPair::generate().unwrap();
    params.self_signed(&key).unwrap().pem()
}

#[cfg(test)]
mod tests {
    use time::Duration as TimeDuration;

    use super::*;

    fn issued_at() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn ninety_day_cert() -> String {
        test_certificate(issued_at(), issued_at() + TimeDuration::days(90))
    }

    #[test]
    fn not_due_before_two_thirds_of_lifetime() {
        let pem = ninety_day_cert();
        let now = issued_at() + TimeDuration::days(59);

        assert_eq!(
            evaluate("web-tls", Some(pem.as_bytes()), now),
            RenewalDecision::NotDue {
                check_at: Some(issued_at() + TimeDuration::days(60) + TimeDuration::SECOND)
            }
        );
    }

    #[test]
    fn due_at_two_thirds_of_lifetime() {
        let pem = ninety_day_cert();

        let at_due = issued_at() + TimeDuration::days(60);
        assert_eq!(
            evaluate("web-tls", Some(pem.as_bytes()), at_due),
            RenewalDecision::Due
        );

        let expired = issued_at() + TimeDuration::days(100);
        assert_eq!(
            evaluate("web-tls", Some(pem.as_bytes()), expired),
            RenewalDecision::Due
        );
    }

    #[test]
    fn unreadable_certificate_is_not_due() {
        let not_due = RenewalDecision::NotDue { check_at: None };

        assert_eq!(evaluate("web-tls", None, issued_at()), not_due);
        assert_eq!(
            evaluate("web-tls", Some(b"garbage"), issued_at()),
            not_due
        );
        assert_eq!(evaluate("web-tls", Some(b""), issued_at()), not_due);
        assert_eq!(evaluate("web-tls", Some(b"\n"), issued_at()), not_due);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_check_fires() {
        let (tx, mut rx) = mpsc::channel(4);
        let scheduler = RenewalScheduler::new(tx);

        scheduler.schedule("web-tls", OffsetDateTime::now_utc() + TimeDuration::seconds(10));
        assert!(scheduler.is_scheduled("web-tls"));

        let trigger = rx.recv().await.unwrap();
        assert_eq!(trigger, Trigger::RenewalDue("web-tls".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn new_schedule_replaces_old_one() {
        let (tx, mut rx) = mpsc::channel(4);
        let scheduler = RenewalScheduler::new(tx);

        scheduler.schedule("web-tls", OffsetDateTime::now_utc() + TimeDuration::seconds(10));
        scheduler.schedule("web-tls", OffsetDateTime::now_utc() + TimeDuration::seconds(20));

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            rx.recv().await.unwrap(),
            Trigger::RenewalDue("web-tls".to_owned())
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_check_never_fires() {
        let (tx, mut rx) = mpsc::channel(4);
        let scheduler = RenewalScheduler::new(tx);

        scheduler.schedule("web-tls", OffsetDateTime::now_utc() + TimeDuration::seconds(10));
        scheduler.cancel("web-tls");
        assert!(!scheduler.is_scheduled("web-tls"));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
