//! Fluxion — a meta HTTP server defined entirely by the contents of a
//! dynamic directory. `.mjs` files become handler routes executed inside
//! supervised QuickJS workers; everything else is served statically.

pub mod binding;
pub mod config;
pub mod error;
pub mod install;
pub mod meta;
pub mod protocol;
pub mod request_path;
pub mod resolver;
pub mod runtime;
pub mod server;
pub mod static_files;
pub mod supervisor;
pub mod version;
pub mod worker;

pub use config::FluxionConfig;
pub use runtime::FileRuntime;
pub use server::build_app;
