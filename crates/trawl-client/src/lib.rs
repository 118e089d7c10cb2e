pub mod http;
pub mod web;

pub use http::HttpFetcher;
pub use web::WebExtractor;
