//! Normalized locators, tune requests and tuning spaces.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::types::{
    FecRate, GuardInterval, HierarchyAlpha, Modulation, NetworkStandard, Polarisation,
    SpectralInversion, TransmissionMode, TuningSpaceKind,
};

/// ATSC locator. Major/minor channel travel with the locator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtscLocator {
    pub carrier_frequency: Option<i32>,
    pub physical_channel: Option<i32>,
    pub major_channel: Option<i32>,
    pub minor_channel: Option<i32>,
}

/// DVB-T locator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DvbTLocator {
    pub carrier_frequency: Option<i32>,
    pub bandwidth: Option<i32>,
    pub inner_fec_rate: Option<FecRate>,
    pub lp_inner_fec_rate: Option<FecRate>,
    pub guard: Option<GuardInterval>,
    pub mode: Option<TransmissionMode>,
    pub hierarchy: Option<HierarchyAlpha>,
}

/// DVB-C locator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DvbCLocator {
    pub carrier_frequency: Option<i32>,
    pub symbol_rate: Option<i32>,
    pub modulation: Option<Modulation>,
}

/// DVB-S locator.
///
/// Azimuth and elevation describe antenna pointing and are informational.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DvbSLocator {
    pub carrier_frequency: Option<i32>,
    pub symbol_rate: Option<i32>,
    pub polarisation: Option<Polarisation>,
    pub modulation: Option<Modulation>,
    pub inner_fec_rate: Option<FecRate>,
    pub azimuth: Option<i32>,
    pub elevation: Option<i32>,
    /// Absolute orbital position, tenths of a degree.
    pub orbital_position: Option<i32>,
    pub west_position: Option<bool>,
}

/// Where and how to tune, typed by network standard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Locator {
    Atsc(AtscLocator),
    DvbT(DvbTLocator),
    DvbC(DvbCLocator),
    DvbS(DvbSLocator),
}

impl Locator {
    /// Network standard this locator belongs to.
    pub fn standard(&self) -> NetworkStandard {
        match self {
            Locator::Atsc(_) => NetworkStandard::Atsc,
            Locator::DvbT(_) => NetworkStandard::DvbT,
            Locator::DvbC(_) => NetworkStandard::DvbC,
            Locator::DvbS(_) => NetworkStandard::DvbS,
        }
    }

    /// Carrier frequency, if set.
    pub fn carrier_frequency(&self) -> Option<i32> {
        match self {
            Locator::Atsc(l) => l.carrier_frequency,
            Locator::DvbT(l) => l.carrier_frequency,
            Locator::DvbC(l) => l.carrier_frequency,
            Locator::DvbS(l) => l.carrier_frequency,
        }
    }
}

/// DVB stream identifiers attached to a tune request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamIds {
    pub original_network_id: i32,
    pub service_id: i32,
    pub transport_stream_id: i32,
}

impl StreamIds {
    /// All identifiers left unspecified (-1).
    pub const UNSPECIFIED: StreamIds = StreamIds {
        original_network_id: -1,
        service_id: -1,
        transport_stream_id: -1,
    };
}

/// A locator bound to the tuning space it was created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuneRequest {
    /// Unique name of the owning tuning space.
    pub tuning_space: String,
    pub locator: Locator,
    /// `Some` for DVB requests, `None` for ATSC.
    pub stream_ids: Option<StreamIds>,
}

impl TuneRequest {
    pub fn standard(&self) -> NetworkStandard {
        self.locator.standard()
    }
}

/// Satellite settings stored on a DVB-S tuning space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteSettings {
    pub low_oscillator: Option<i32>,
    pub high_oscillator: Option<i32>,
    pub lnb_switch: Option<i32>,
    pub spectral_inversion: Option<SpectralInversion>,
    pub network_id: Option<i32>,
    pub input_range: Option<String>,
}

/// A named, standard-scoped tuning context persisted in the tuning-space directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningSpace {
    pub unique_name: String,
    pub friendly_name: String,
    pub standard: NetworkStandard,
    pub kind: TuningSpaceKind,
    /// Only meaningful for [`TuningSpaceKind::DvbS`].
    pub satellite: SatelliteSettings,
}

impl TuningSpace {
    /// Create a tuning space of the subtype matching `standard`.
    pub fn new(standard: NetworkStandard, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            friendly_name: name.clone(),
            unique_name: name,
            standard,
            kind: standard.tuning_space_kind(),
            satellite: SatelliteSettings::default(),
        }
    }

    /// Whether this tuning space satisfies a lookup for `standard` and an optional name.
    pub fn matches(&self, standard: NetworkStandard, name: Option<&str>) -> bool {
        self.standard == standard && name.map_or(true, |n| n == self.unique_name)
    }

    /// Attach `locator` to a new tune request scoped to this tuning space.
    pub fn create_tune_request(&self, locator: Locator) -> Result<TuneRequest, ConfigurationError> {
        if locator.standard() != self.standard {
            return Err(ConfigurationError::StandardMismatch {
                name: self.unique_name.clone(),
                expected: locator.standard(),
                actual: self.standard,
            });
        }
        let stream_ids = match self.standard {
            NetworkStandard::Atsc => None,
            _ => Some(StreamIds::UNSPECIFIED),
        };
        Ok(TuneRequest {
            tuning_space: self.unique_name.clone(),
            locator,
            stream_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuning_space_matching() {
        let space = TuningSpace::new(NetworkStandard::DvbT, "Local DVB-T");
        assert_eq!(space.kind, TuningSpaceKind::Dvb);
        assert_eq!(space.friendly_name, "Local DVB-T");
        assert!(space.matches(NetworkStandard::DvbT, None));
        assert!(space.matches(NetworkStandard::DvbT, Some("Local DVB-T")));
        assert!(!space.matches(NetworkStandard::DvbT, Some("Other")));
        assert!(!space.matches(NetworkStandard::DvbC, None));
    }

    #[test]
    fn test_tune_request_stream_ids() {
        let dvb = TuningSpace::new(NetworkStandard::DvbC, "Cable");
        let request = dvb
            .create_tune_request(Locator::DvbC(DvbCLocator::default()))
            .unwrap();
        assert_eq!(request.stream_ids, Some(StreamIds::UNSPECIFIED));
        assert_eq!(request.tuning_space, "Cable");

        let atsc = TuningSpace::new(NetworkStandard::Atsc, "Antenna");
        let request = atsc
            .create_tune_request(Locator::Atsc(AtscLocator::default()))
            .unwrap();
        assert_eq!(request.stream_ids, None);
    }

    #[test]
    fn test_tune_request_rejects_foreign_locator() {
        let space = TuningSpace::new(NetworkStandard::DvbS, "Astra");
        let err = space
            .create_tune_request(Locator::DvbT(DvbTLocator::default()))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::StandardMismatch { .. }));
    }
}
