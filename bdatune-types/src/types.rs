//! Network standards, tune parameters and the coded values they carry.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Modulation code selecting QPSK for DVB-S.
pub const QPSK_CODE: i64 = 10004;

/// Broadcast network standard of a tune request.
///
/// Selected once per tune request. It decides which locator fields are
/// meaningful, which network provider is loaded and which tuning-space
/// subtype is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkStandard {
    /// ATSC terrestrial (North America).
    Atsc,
    /// DVB-T terrestrial.
    DvbT,
    /// DVB-C cable.
    DvbC,
    /// DVB-S satellite.
    DvbS,
}

impl NetworkStandard {
    /// All standards, in declaration order.
    pub const ALL: [NetworkStandard; 4] = [
        NetworkStandard::Atsc,
        NetworkStandard::DvbT,
        NetworkStandard::DvbC,
        NetworkStandard::DvbS,
    ];

    /// Short name used in logs and default tuning-space names.
    pub fn name(&self) -> &'static str {
        match self {
            NetworkStandard::Atsc => "ATSC",
            NetworkStandard::DvbT => "DVB-T",
            NetworkStandard::DvbC => "DVB-C",
            NetworkStandard::DvbS => "DVB-S",
        }
    }

    /// Display name of the network provider stage for this standard.
    pub fn provider_name(&self) -> &'static str {
        match self {
            NetworkStandard::Atsc => "ATSC Network Provider",
            NetworkStandard::DvbT => "DVB-T Network Provider",
            NetworkStandard::DvbC => "DVB-C Network Provider",
            NetworkStandard::DvbS => "DVB-S Network Provider",
        }
    }

    /// Tuning-space subtype created for this standard.
    pub fn tuning_space_kind(&self) -> TuningSpaceKind {
        match self {
            NetworkStandard::Atsc => TuningSpaceKind::Atsc,
            NetworkStandard::DvbT | NetworkStandard::DvbC => TuningSpaceKind::Dvb,
            NetworkStandard::DvbS => TuningSpaceKind::DvbS,
        }
    }
}

impl fmt::Display for NetworkStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for NetworkStandard {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "atsc" => Ok(NetworkStandard::Atsc),
            "dvb-t" | "dvbt" => Ok(NetworkStandard::DvbT),
            "dvb-c" | "dvbc" => Ok(NetworkStandard::DvbC),
            "dvb-s" | "dvbs" => Ok(NetworkStandard::DvbS),
            other => Err(format!("unknown network standard: {}", other)),
        }
    }
}

/// Tuning-space subtype stored in the tuning-space directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TuningSpaceKind {
    Atsc,
    /// Shared by DVB-T and DVB-C.
    Dvb,
    /// Carries satellite settings (LNB, inversion, input range).
    DvbS,
}

/// Inner forward-error-correction code rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FecRate {
    Rate1_2,
    Rate2_3,
    Rate3_4,
    Rate5_6,
    Rate7_8,
}

impl FecRate {
    /// Map the 1..=5 configuration code. Anything else is "not set".
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(FecRate::Rate1_2),
            2 => Some(FecRate::Rate2_3),
            3 => Some(FecRate::Rate3_4),
            4 => Some(FecRate::Rate5_6),
            5 => Some(FecRate::Rate7_8),
            _ => None,
        }
    }
}

/// DVB-T guard interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardInterval {
    Guard1_32,
    Guard1_16,
    Guard1_8,
    Guard1_4,
}

impl GuardInterval {
    /// Map the interval denominator (32, 16, 8 or 4).
    pub fn from_denominator(denominator: i64) -> Option<Self> {
        match denominator {
            32 => Some(GuardInterval::Guard1_32),
            16 => Some(GuardInterval::Guard1_16),
            8 => Some(GuardInterval::Guard1_8),
            4 => Some(GuardInterval::Guard1_4),
            _ => None,
        }
    }
}

/// DVB-T transmission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransmissionMode {
    Mode2K,
    Mode8K,
}

impl TransmissionMode {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            2 => Some(TransmissionMode::Mode2K),
            8 => Some(TransmissionMode::Mode8K),
            _ => None,
        }
    }
}

/// DVB-T hierarchy alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HierarchyAlpha {
    Alpha1,
    Alpha2,
    Alpha4,
}

impl HierarchyAlpha {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(HierarchyAlpha::Alpha1),
            2 => Some(HierarchyAlpha::Alpha2),
            4 => Some(HierarchyAlpha::Alpha4),
            _ => None,
        }
    }
}

/// Carrier modulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modulation {
    Qam16,
    Qam32,
    Qam64,
    Qam128,
    Qam256,
    Qpsk,
}

impl Modulation {
    /// DVB-C mapping from the QAM order.
    pub fn from_qam_order(order: i64) -> Option<Self> {
        match order {
            16 => Some(Modulation::Qam16),
            32 => Some(Modulation::Qam32),
            64 => Some(Modulation::Qam64),
            128 => Some(Modulation::Qam128),
            256 => Some(Modulation::Qam256),
            _ => None,
        }
    }

    /// DVB-S mapping: 16/128/256-QAM, or [`QPSK_CODE`] for QPSK.
    pub fn from_satellite_code(code: i64) -> Option<Self> {
        match code {
            16 => Some(Modulation::Qam16),
            128 => Some(Modulation::Qam128),
            256 => Some(Modulation::Qam256),
            QPSK_CODE => Some(Modulation::Qpsk),
            _ => None,
        }
    }
}

/// Satellite signal polarisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarisation {
    LinearH,
    LinearV,
    CircularL,
    CircularR,
}

impl Polarisation {
    /// Map the first letter of a label (`H`, `V`, `L` or `R`, any case).
    pub fn from_label(label: &str) -> Option<Self> {
        match label.chars().next().map(|c| c.to_ascii_uppercase()) {
            Some('H') => Some(Polarisation::LinearH),
            Some('V') => Some(Polarisation::LinearV),
            Some('L') => Some(Polarisation::CircularL),
            Some('R') => Some(Polarisation::CircularR),
            _ => None,
        }
    }
}

/// Spectral inversion of a satellite tuning space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpectralInversion {
    Normal,
    Inverted,
    Automatic,
}

impl SpectralInversion {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SpectralInversion::Normal),
            1 => Some(SpectralInversion::Inverted),
            2 => Some(SpectralInversion::Automatic),
            _ => None,
        }
    }
}

/// Configuration keys read from the host's variable store.
pub mod keys {
    pub const FREQUENCY: &str = "dvb-frequency";
    pub const BANDWIDTH: &str = "dvb-bandwidth";
    pub const CODE_RATE_HP: &str = "dvb-code-rate-hp";
    pub const CODE_RATE_LP: &str = "dvb-code-rate-lp";
    pub const GUARD: &str = "dvb-guard";
    pub const TRANSMISSION: &str = "dvb-transmission";
    pub const HIERARCHY: &str = "dvb-hierarchy";
    pub const SYMBOL_RATE: &str = "dvb-srate";
    pub const MODULATION: &str = "dvb-modulation";
    pub const AZIMUTH: &str = "dvb-azimuth";
    pub const ELEVATION: &str = "dvb-elevation";
    pub const LONGITUDE: &str = "dvb-longitude";
    pub const LNB_LOF1: &str = "dvb-lnb-lof1";
    pub const LNB_LOF2: &str = "dvb-lnb-lof2";
    pub const LNB_SLOF: &str = "dvb-lnb-slof";
    pub const INVERSION: &str = "dvb-inversion";
    pub const NETWORK_ID: &str = "dvb-network-id";
    pub const RANGE: &str = "dvb-range";
    pub const POLARISATION: &str = "dvb-polarisation";
    pub const MAJOR_CHANNEL: &str = "dvb-major-channel";
    pub const MINOR_CHANNEL: &str = "dvb-minor-channel";
    pub const PHYSICAL_CHANNEL: &str = "dvb-physical-channel";
    pub const NETWORK_NAME: &str = "dvb-network-name";
    pub const CREATE_NAME: &str = "dvb-create-name";
}

/// Source of named configuration values (the host's variable store).
pub trait ConfigSource {
    /// Integer value for `key`; `Ok(None)` when absent.
    fn integer(&self, key: &str) -> Result<Option<i64>, ConfigurationError>;

    /// Non-empty string value for `key`.
    fn string(&self, key: &str) -> Option<String>;
}

impl ConfigSource for HashMap<String, String> {
    fn integer(&self, key: &str) -> Result<Option<i64>, ConfigurationError> {
        match self.get(key).map(|v| v.trim()) {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| ConfigurationError::InvalidValue {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
        }
    }

    fn string(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// Raw, standard-specific tune parameters.
///
/// Every field is optional. Scalar values `<= 0` mean "leave at the device
/// default"; coded values that do not map to a known constant are "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuneParameters {
    /// Carrier frequency in kHz.
    pub frequency: Option<i64>,
    /// DVB-T channel bandwidth in MHz.
    pub bandwidth: Option<i64>,
    /// Symbol rate (DVB-C, DVB-S).
    pub symbol_rate: Option<i64>,
    /// QAM order, or [`QPSK_CODE`] on DVB-S.
    pub modulation: Option<i64>,
    /// High-priority FEC code (1..=5).
    pub code_rate_hp: Option<i64>,
    /// Low-priority FEC code (1..=5).
    pub code_rate_lp: Option<i64>,
    /// Guard interval denominator.
    pub guard: Option<i64>,
    /// Transmission mode (2 or 8, in K).
    pub transmission: Option<i64>,
    pub hierarchy: Option<i64>,
    /// Polarisation label, first letter significant.
    pub polarisation: Option<String>,
    /// Signed orbital longitude in tenths of a degree; negative is west.
    pub longitude: Option<i64>,
    pub azimuth: Option<i64>,
    pub elevation: Option<i64>,
    pub lnb_lof1: Option<i64>,
    pub lnb_lof2: Option<i64>,
    pub lnb_slof: Option<i64>,
    /// Spectral inversion code (0 normal, 1 inverted, 2 automatic).
    pub inversion: Option<i64>,
    pub network_id: Option<i64>,
    /// Input-range label stored on a DVB-S tuning space.
    pub input_range: Option<String>,
    pub major_channel: Option<i64>,
    pub minor_channel: Option<i64>,
    pub physical_channel: Option<i64>,
    /// Exact unique name of the tuning space to use.
    pub network_name: Option<String>,
    /// Name for a tuning space created when none matches.
    pub create_name: Option<String>,
}

impl TuneParameters {
    /// Read every known key from a configuration source.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigurationError> {
        Ok(Self {
            frequency: source.integer(keys::FREQUENCY)?,
            bandwidth: source.integer(keys::BANDWIDTH)?,
            symbol_rate: source.integer(keys::SYMBOL_RATE)?,
            modulation: source.integer(keys::MODULATION)?,
            code_rate_hp: source.integer(keys::CODE_RATE_HP)?,
            code_rate_lp: source.integer(keys::CODE_RATE_LP)?,
            guard: source.integer(keys::GUARD)?,
            transmission: source.integer(keys::TRANSMISSION)?,
            hierarchy: source.integer(keys::HIERARCHY)?,
            polarisation: source.string(keys::POLARISATION),
            longitude: source.integer(keys::LONGITUDE)?,
            azimuth: source.integer(keys::AZIMUTH)?,
            elevation: source.integer(keys::ELEVATION)?,
            lnb_lof1: source.integer(keys::LNB_LOF1)?,
            lnb_lof2: source.integer(keys::LNB_LOF2)?,
            lnb_slof: source.integer(keys::LNB_SLOF)?,
            inversion: source.integer(keys::INVERSION)?,
            network_id: source.integer(keys::NETWORK_ID)?,
            input_range: source.string(keys::RANGE),
            major_channel: source.integer(keys::MAJOR_CHANNEL)?,
            minor_channel: source.integer(keys::MINOR_CHANNEL)?,
            physical_channel: source.integer(keys::PHYSICAL_CHANNEL)?,
            network_name: source.string(keys::NETWORK_NAME),
            create_name: source.string(keys::CREATE_NAME),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fec_rate_mapping_is_total() {
        assert_eq!(FecRate::from_code(1), Some(FecRate::Rate1_2));
        assert_eq!(FecRate::from_code(3), Some(FecRate::Rate3_4));
        assert_eq!(FecRate::from_code(5), Some(FecRate::Rate7_8));
        for code in [-1, 0, 6, 9, 100] {
            assert_eq!(FecRate::from_code(code), None);
        }
    }

    #[test]
    fn test_guard_and_mode_mapping() {
        assert_eq!(GuardInterval::from_denominator(32), Some(GuardInterval::Guard1_32));
        assert_eq!(GuardInterval::from_denominator(4), Some(GuardInterval::Guard1_4));
        assert_eq!(GuardInterval::from_denominator(2), None);
        assert_eq!(TransmissionMode::from_code(8), Some(TransmissionMode::Mode8K));
        assert_eq!(TransmissionMode::from_code(4), None);
        assert_eq!(HierarchyAlpha::from_code(4), Some(HierarchyAlpha::Alpha4));
        assert_eq!(HierarchyAlpha::from_code(3), None);
    }

    #[test]
    fn test_modulation_mapping_differs_per_standard() {
        assert_eq!(Modulation::from_qam_order(32), Some(Modulation::Qam32));
        assert_eq!(Modulation::from_satellite_code(32), None);
        assert_eq!(Modulation::from_satellite_code(QPSK_CODE), Some(Modulation::Qpsk));
        assert_eq!(Modulation::from_qam_order(QPSK_CODE), None);
    }

    #[test]
    fn test_polarisation_and_inversion() {
        assert_eq!(Polarisation::from_label("h"), Some(Polarisation::LinearH));
        assert_eq!(Polarisation::from_label("Vertical"), Some(Polarisation::LinearV));
        assert_eq!(Polarisation::from_label("right"), Some(Polarisation::CircularR));
        assert_eq!(Polarisation::from_label("x"), None);
        assert_eq!(Polarisation::from_label(""), None);
        assert_eq!(SpectralInversion::from_code(0), Some(SpectralInversion::Normal));
        assert_eq!(SpectralInversion::from_code(3), None);
    }

    #[test]
    fn test_standard_parse_and_kind() {
        assert_eq!("dvb-t".parse::<NetworkStandard>(), Ok(NetworkStandard::DvbT));
        assert_eq!("DVBS".parse::<NetworkStandard>(), Ok(NetworkStandard::DvbS));
        assert!("isdb-t".parse::<NetworkStandard>().is_err());
        assert_eq!(NetworkStandard::DvbC.tuning_space_kind(), TuningSpaceKind::Dvb);
        assert_eq!(NetworkStandard::DvbS.tuning_space_kind(), TuningSpaceKind::DvbS);
    }

    #[test]
    fn test_parameters_from_map() {
        let mut map = HashMap::new();
        map.insert(keys::FREQUENCY.to_string(), "514000".to_string());
        map.insert(keys::POLARISATION.to_string(), " ".to_string());
        map.insert(keys::NETWORK_NAME.to_string(), "My DVB-T".to_string());

        let params = TuneParameters::from_source(&map).unwrap();
        assert_eq!(params.frequency, Some(514000));
        assert_eq!(params.polarisation, None);
        assert_eq!(params.network_name.as_deref(), Some("My DVB-T"));
        assert_eq!(params.bandwidth, None);
    }

    #[test]
    fn test_parameters_reject_garbage_integer() {
        let mut map = HashMap::new();
        map.insert(keys::SYMBOL_RATE.to_string(), "fast".to_string());

        let err = TuneParameters::from_source(&map).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::InvalidValue {
                key: keys::SYMBOL_RATE.to_string(),
                value: "fast".to_string(),
            }
        );
    }
}
