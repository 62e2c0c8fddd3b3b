//! Kubernetes controller that provisions TLS certificates for Ingresses from ACME (Automatic
//! Certificate Management Environment) providers such as [Let's Encrypt](https://letsencrypt.org/).
//!
//! It follows the [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555) spec, using ACME v2 to
//! issue/renew certificates.
//!
//! # Managed Ingresses
//!
//! An Ingress opts in by carrying the issuer label naming one of the configured issuers. For every
//! TLS entry of such an Ingress the controller makes sure the referenced Secret holds a current
//! certificate for the entry's hosts, ordering a new one when the Secret is missing, was produced
//! by another issuer, or has used up two thirds of its lifetime.
//!
//! # Domain Ownership
//!
//! Control over each host is proven with the `http-01` challenge. The controller serves the key
//! authorization itself and routes `/.well-known/acme-challenge/<token>` for the host to its own
//! Service through a short-lived solver Ingress. See [`solver`].
//!
//! # Rate Limits
//!
//! The ACME API provider Let's Encrypt uses [rate limits] to ensure the API is not being abused. It
//! might be tempting to put the polling delay really low, but balance this against the real risk of
//! having access cut off.
//!
//! ## Use Staging For Development!
//!
//! Especially take care to use the Let's Encrypt staging environment for development where the rate
//! limits are more relaxed. Combine it with `dry_run` to see what would be ordered.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod account;
mod cert;
mod client;
mod directory;
mod error;
mod jws;
mod poll;

pub mod api;
pub mod config;
pub mod controller;
pub mod metadata;
pub mod orchestrator;
pub mod renewal;
pub mod responder;
pub mod solver;
pub mod store;


pub use crate::{
    cert::Certificate,
    client::{http_client, AcmeApi, AcmeService},
    directory::DirectoryCache,
    error::{Error, Result},
};
