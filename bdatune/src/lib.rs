//! BDA tuner graph core.
//!
//! Builds a broadcast tuner pipeline on top of an abstract media platform
//! and exposes the received transport stream through a pull-based read API.
//!
//! - [`locator`]: tune parameters to locator and tuning space
//! - [`device`]: device cursor and discovery
//! - [`pin`]: first-fit pin connection
//! - [`graph`]: graph build and teardown
//! - [`buffer`]: sample FIFO between the grabber callback and the reader
//! - [`tuner`]: the [`BdaTuner`] orchestrator
//! - [`platform`]: capability traits and the in-process loopback platform
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bdatune::platform::loopback::LoopbackPlatform;
//! use bdatune::{BdaTuner, TunerSettings};
//! use bdatune_types::{NetworkStandard, TuneParameters};
//!
//! let platform = Arc::new(LoopbackPlatform::default());
//! let mut tuner = BdaTuner::new(platform, TunerSettings::default());
//! let params = TuneParameters {
//!     frequency: Some(522_000),
//!     ..TuneParameters::default()
//! };
//! tuner.submit(NetworkStandard::DvbT, &params)?;
//!
//! let size = tuner.snapshot_size()?;
//! let mut buf = vec![0u8; size];
//! tuner.drain(&mut buf)?;
//! # Ok::<(), bdatune::TuneError>(())
//! ```

pub mod buffer;
pub mod device;
pub mod error;
pub mod graph;
pub mod locator;
pub mod pin;
pub mod platform;
pub mod settings;
pub mod tuner;

pub use buffer::{BufferError, BufferStats, DrainReport, Sample, SampleBuffer, TS_PACKET_SIZE};
pub use device::{DeviceCursor, DiscoveryError};
pub use error::TuneError;
pub use graph::{BuildError, GraphBuilder, StageRole};
pub use pin::ConnectError;
pub use platform::{Platform, PlatformError};
pub use settings::TunerSettings;
pub use tuner::BdaTuner;
