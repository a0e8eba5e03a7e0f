pub mod airtable;
pub mod fetcher;
pub mod record_api;
pub mod sampler;

pub use airtable::*;
pub use fetcher::*;
pub use record_api::*;
pub use sampler::*;
