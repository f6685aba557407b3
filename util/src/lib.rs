pub mod clock;
pub mod config;
pub mod events;
pub mod filters;
