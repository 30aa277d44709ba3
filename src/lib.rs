//! h1client - HTTP/1.1 client engine
//!
//! This crate turns a [`http::Request`] into bytes on a socket, reads the
//! bytes a server returns and rebuilds them into a [`http::Response`],
//! handling persistent connections, redirects, chunked transfer-coding and
//! cooperative scheduling of many in-flight requests over a socket pool.

pub mod http;
