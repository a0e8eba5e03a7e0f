pub mod app;
pub mod poster;


pub use app::*;
pub use poster::*;
