//! HTTP/HTTPS client layer over wireline transport sessions.
//!
//! This crate stays deliberately thin: requests serialize through
//! [`HttpRequest`], inbound bytes reassemble through the incremental
//! [`HttpResponse`] parser, and [`HttpClient`] / [`HttpClientEx`] bridge
//! both onto a TCP or TLS session. Connection pooling, redirects and
//! HTTP/2+ are out of scope.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod request;
pub mod response;

pub use client::{HttpClient, HttpClientEx, HttpEvents, HttpEventsFactory};
pub use request::HttpRequest;
pub use response::{HttpError, HttpResponse, Progress};
