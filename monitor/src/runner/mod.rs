//! Native process execution of deployment steps

pub mod cancel;
pub mod dispatcher;
pub mod process;
