//! Streaming and device arbitration core of a software-defined FM receiver.
//!
//! One demodulation session owns the radio at a time. Its PCM stream fans
//! out to playback, an optional recording and the spectrum view, while a
//! side channel feeds an RDS decoder whose output updates the station
//! database. [`control::Controller`] is the single owner of all of it.

pub mod config;
pub mod control;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod metadata;
pub mod pipe;
pub mod process;
pub mod recording;
pub mod session;
pub mod sink;
pub mod spectrum;
pub mod station;

pub use control::{Activity, Backends, Controller};
pub use error::{RadioError, Result};
pub use events::Notification;
