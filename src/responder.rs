//! Answers `http-01` challenge probes from the ACME server.
//!
//! See [RFC 8555 §8.3](https://datatracker.ietf.org/doc/html/rfc8555#section-8.3).

use std::{collections::HashMap, net::ToSocketAddrs, sync::Arc};

use actix_web::{dev::Server, get, web, App, HttpResponse, HttpServer, Responder};
use parking_lot::Mutex;
use tokio::sync::oneshot;

pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug)]
struct PendingChallenge {
    key_authorization: String,

    /// Fired on the first successful probe.
    probed: Option<oneshot::Sender<()>>,
}

/// Tokens currently being validated and their key authorizations.
#[derive(Debug, Default)]
pub struct ChallengeResponder {
    pending: Mutex<HashMap<String, PendingChallenge>>,
}

impl ChallengeResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts answering probes for `token`.
    ///
    /// The returned receiver completes once the token has been probed. Registering a token again
    /// replaces the earlier registration.
    pub fn register(&self, token: &str, key_authorization: String) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(
            token.to_owned(),
            PendingChallenge {
                key_authorization,
                probed: Some(tx),
            },
        );

        rx
    }

    /// Key authorization to serve for `token`, if registered.
    pub fn respond(&self, token: &str) -> Option<String> {
        let mut pending = self.pending.lock();
        let challenge = pending.get_mut(token)?;

        if let Some(probed) = challenge.probed.take() {
            log::debug!("challenge token {token} probed");
            // the solver may already have given up
            let _ = probed.send(());
        }

        Some(challenge.key_authorization.clone())
    }

    pub fn unregister(&self, token: &str) {
        self.pending.lock().remove(token);
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, token: &str) -> bool {
        self.pending.lock().contains_key(token)
    }
}

#[get("/.well-known/acme-challenge/{token}")]
async fn acme_challenge(
    responder: web::Data<ChallengeResponder>,
    token: web::Path<String>,
) -> impl Responder {
    match responder.respond(&token) {
        Some(key_authorization) => HttpResponse::Ok()
            .content_type("text/plain")
            .body(key_authorization),

        None => {
            log::debug!("unknown challenge token {token}");
            HttpResponse::NotFound().finish()
        }
    }
}

#[get("/healthz")]
async fn healthz() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

fn configure(responder: web::Data<ChallengeResponder>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(responder).service(acme_challenge).service(healthz);
    }
}

/// Binds the challenge endpoint; the returned server must be awaited or spawned.
pub fn serve(
    responder: Arc<ChallengeResponder>,
    addr: impl ToSocketAddrs,
) -> std::io::Result<Server> {
    let responder = web::Data::from(responder);

    let server = HttpServer::new(move || App::new().configure(configure(responder.clone())))
        .workers(1)
        .disable_signals()
        .bind(addr)?
        .run();

    Ok(server)
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test as actix_test};

    use super::*;

    #[actix_web::test]
    async fn serves_registered_token_and_fires_probe_once() {
        let responder = Arc::new(ChallengeResponder::new());
        let mut probed = responder.register("tok", "tok.thumb".to_owned());

        let app = actix_test::init_service(
            App::new().configure(configure(web::Data::from(Arc::clone(&responder)))),
        )
        .await;

        assert!(probed.try_recv().is_err());

        let req = actix_test::TestRequest::get()
            .uri("/.well-known/acme-challenge/tok")
            .to_request();
        let body = actix_test::call_and_read_body(&app, req).await;
        assert_eq!(body, "tok.thumb");

        probed.await.unwrap();

        // later probes are still answered
        let req = actix_test::TestRequest::get()
            .uri("/.well-known/acme-challenge/tok")
            .to_request();
        let res = actix_test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn unknown_token_is_not_found() {
        let responder = Arc::new(ChallengeResponder::new());
        let app = actix_test::init_service(
            App::new().configure(configure(web::Data::from(responder))),
        )
        .await;

        let req = actix_test::TestRequest::get()
            .uri("/.well-known/acme-challenge/nope")
            .to_request();
        let res = actix_test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn healthz_is_ok() {
        let app = actix_test::init_service(
            App::new().configure(configure(web::Data::new(ChallengeResponder::new()))),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/healthz").to_request();
        let res = actix_test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::OK);
    }

    #[test]
    fn unregister_stops_serving() {
        let responder = ChallengeResponder::new();
        let _probed = responder.register("tok", "tok.thumb".to_owned());

        assert!(responder.is_registered("tok"));
        responder.unregister("tok");

        assert!(!responder.is_registered("tok"));
        assert_eq!(responder.respond("tok"), None);
    }
}
