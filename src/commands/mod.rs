pub mod positions;
pub mod reset_circuit_breaker;
pub mod run;
pub mod run_now;
pub mod runs;
pub mod strategy;
pub mod trades;
