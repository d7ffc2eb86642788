//! Concrete content-provider adapters.

pub mod github;

pub use github::GithubAddonProvider;
