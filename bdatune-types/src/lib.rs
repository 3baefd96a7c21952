//! Shared types for the bdatune BDA tuner graph.
//!
//! This crate holds the values that cross the boundary between the host
//! application and the tuner core:
//!
//! - [`NetworkStandard`] and the raw [`TuneParameters`] read through a [`ConfigSource`]
//! - coded parameter tables ([`FecRate`], [`GuardInterval`], [`Modulation`], ...)
//! - the normalized [`Locator`], [`TuneRequest`] and [`TuningSpace`]
//!
//! ```rust
//! use bdatune_types::{FecRate, NetworkStandard, TuningSpace};
//!
//! assert_eq!(FecRate::from_code(3), Some(FecRate::Rate3_4));
//! assert_eq!(FecRate::from_code(9), None);
//!
//! let space = TuningSpace::new(NetworkStandard::DvbT, "Local DVB-T");
//! assert!(space.matches(NetworkStandard::DvbT, None));
//! ```

pub mod error;
pub mod locator;
pub mod types;

pub use error::ConfigurationError;
pub use locator::{
    AtscLocator, DvbCLocator, DvbSLocator, DvbTLocator, Locator, SatelliteSettings, StreamIds,
    TuneRequest, TuningSpace,
};
pub use types::{
    keys, ConfigSource, FecRate, GuardInterval, HierarchyAlpha, Modulation, NetworkStandard,
    Polarisation, SpectralInversion, TransmissionMode, TuneParameters, TuningSpaceKind, QPSK_CODE,
};
