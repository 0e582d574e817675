pub mod client;
pub mod data_source;
pub mod pipeline;
pub mod prompts;
pub mod router;
pub mod sanitize;

pub use client::*;
pub use data_source::{DataSource, DataSourceCatalog, DataSourceDescriptor};
pub use pipeline::*;
pub use prompts::*;
pub use router::*;
pub use sanitize::sanitize_answer;
