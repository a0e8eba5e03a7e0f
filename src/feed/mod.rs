pub mod controller;
pub mod input;

pub use controller::*;
pub use input::*;
