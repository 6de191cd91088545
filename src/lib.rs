pub mod builder;
pub mod cache;
pub mod config;
pub mod exception;
pub mod param;
pub mod request;
pub mod resolver;
pub mod response;
pub mod rewrite;
pub mod runner;
pub mod server;
pub mod store;
pub mod util;

pub use builder::{BuildOutcome, Orchestrator};
pub use cache::FileCache;
pub use config::Config;
pub use exception::Exception;
pub use param::{HttpEncoding, HttpRequestMethod, HttpVersion};
pub use request::Request;
pub use response::Response;
pub use runner::{BuildRunner, CommandRunner};
pub use server::AppContext;
pub use store::BuildStore;
pub use util::HtmlBuilder;
