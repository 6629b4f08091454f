pub mod client;
pub mod completeness;
pub mod config;
pub mod driver;
pub mod index;
pub mod logging;
pub mod metadata;
pub mod normalize;
pub mod page;
pub mod record;
pub mod runtime;
pub mod source;
pub mod state;
pub mod verify;
