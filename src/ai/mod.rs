pub mod client;
pub mod directive;
mod managed;
mod openai;
pub mod prompts;
pub mod refine;
pub mod satellite;
pub mod stream;
pub mod types;

pub use client::build_client;
pub use refine::{RefineObserver, RefineReport, RefineRequest, Refiner};
pub use satellite::MapProxyClient;
pub use types::{ImageRef, Location, ParsedDirective};
