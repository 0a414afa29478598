//! Core services for the ferrule system utilities.
//!
//! This crate provides the cross-cutting pieces shared by the rest of the
//! workspace:
//!
//! - **Diagnostics fan-out**: [`DiagnosticsBus`] lets a component publish
//!   leveled messages to any number of subscribers, each with its own
//!   minimum-level filter. [`DiagnosticsContext`] temporarily labels every
//!   message published while a scope is alive.
//! - **Reporting**: [`stream_reporter`] builds a subscriber delegate that
//!   renders messages to a pair of output sinks, with warnings and errors
//!   routed to the error sink.
//!
//! # Example
//!
//! ```
//! use ferrule_core::{DiagnosticsBus, DiagnosticsContext, level};
//!
//! let bus = DiagnosticsBus::new("demo");
//! let _subscription = bus.subscribe_scoped(
//!     |sender, lvl, message| println!("{sender} [{lvl}]: {message}"),
//!     level::WARNING,
//! );
//!
//! bus.publish(level::WARNING, "something looks off");
//! {
//!     let _scope = DiagnosticsContext::new(&bus, "startup");
//!     bus.publish(level::ERROR, "something is definitely off");
//! }
//! ```

pub mod diagnostics;
pub mod reporter;

pub use diagnostics::{
    DiagnosticDelegate, DiagnosticsBus, DiagnosticsContext, SubscriptionGuard, SubscriptionId,
    level,
};
pub use reporter::{stderr_reporter, stream_reporter};
