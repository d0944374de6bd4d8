//! Background workers

pub mod canceller;
pub mod executor;
pub mod restarter;
pub mod token_refresh;
