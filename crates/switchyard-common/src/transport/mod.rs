//! JSON-RPC over HTTP/1.1.

pub mod http;

pub use http::HttpTransport;
