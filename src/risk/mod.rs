pub mod correlation;
pub mod exits;
pub mod protections;
pub mod sizing;
pub mod stops;

pub use correlation::*;
pub use exits::*;
pub use protections::*;
pub use sizing::*;
pub use stops::*;
