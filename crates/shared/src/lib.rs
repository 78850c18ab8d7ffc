pub mod config;
pub mod ids;
pub mod realtime;
pub mod states;

pub use config::*;
pub use ids::*;
pub use states::*;
