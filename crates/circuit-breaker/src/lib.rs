pub mod breaker;
pub mod config;

pub use breaker::{CallPermit, CircuitBreaker, CircuitBreakerState};
pub use config::CircuitBreakerConfig;
