pub mod config;
pub mod video_item;


pub use config::*;
pub use video_item::*;
