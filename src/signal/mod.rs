pub mod engine;
pub mod rr;

pub use engine::*;
pub use rr::*;
