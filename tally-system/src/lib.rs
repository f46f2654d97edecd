//! Foundational framework for the services that make up the tally daemon.
//!
//! Services are asynchronous units that respond to typed messages sent through an
//! [`Addr`]. Each service declares an [`Interface`], usually an enumeration of all
//! messages it handles, and spawns a handler task when started. See [`Service`]
//! for implementation patterns.
//!
//! The [`Controller`] owns process-wide shutdown: it listens for termination
//! signals and broadcasts a [`Shutdown`] message to every service that obtained a
//! [`ShutdownHandle`].

mod controller;
mod service;
mod statsd;

pub use self::controller::*;
pub use self::service::*;
