pub mod account;
pub mod backtest;
pub mod drift;
pub mod executor;
pub mod exit_rules;
pub mod monitor;
pub mod paper;
pub mod results;

pub use account::*;
pub use backtest::*;
pub use drift::*;
pub use executor::*;
pub use exit_rules::*;
pub use monitor::*;
pub use paper::*;
pub use results::*;
