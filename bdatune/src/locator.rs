//! Tune parameter translation.
//!
//! Turns the raw [`TuneParameters`] of one network standard into a typed
//! [`Locator`], and resolves the tuning space the resulting tune request is
//! created from. Scalar parameters `<= 0` leave the locator field unset;
//! coded parameters that do not map to a known constant are unset as well.

use log::{debug, info, warn};

use bdatune_types::{
    AtscLocator, ConfigurationError, DvbCLocator, DvbSLocator, DvbTLocator, FecRate,
    GuardInterval, HierarchyAlpha, Locator, Modulation, NetworkStandard, Polarisation,
    SpectralInversion, TransmissionMode, TuneParameters, TuneRequest, TuningSpace,
};

use crate::platform::TuningSpaceDirectory;

/// How the active tuning space was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceResolution {
    /// The active tuning space already matched.
    Reused,
    /// An existing tuning space was found in the directory.
    Adopted,
    /// A new tuning space was created and registered.
    Created,
}

impl SpaceResolution {
    /// Whether the active tuning space changed.
    pub fn replaced(&self) -> bool {
        !matches!(self, SpaceResolution::Reused)
    }
}

/// Name a tuning space is created under when no match exists.
pub fn creation_name(standard: NetworkStandard, params: &TuneParameters) -> String {
    params
        .create_name
        .clone()
        .or_else(|| params.network_name.clone())
        .unwrap_or_else(|| format!("BDA {}", standard))
}

/// Make sure `active` holds a tuning space for `standard`.
///
/// The current one is kept when its standard matches and either no
/// `dvb-network-name` was given or its unique name equals it. Otherwise the
/// directory is searched, and a new tuning space is created when nothing
/// matches.
pub fn resolve_tuning_space(
    directory: &dyn TuningSpaceDirectory,
    active: &mut Option<TuningSpace>,
    standard: NetworkStandard,
    params: &TuneParameters,
) -> Result<SpaceResolution, ConfigurationError> {
    let name = params.network_name.as_deref();
    if let Some(space) = active.as_ref() {
        if space.matches(standard, name) {
            debug!("[Locator] Reusing tuning space '{}'", space.unique_name);
            return Ok(SpaceResolution::Reused);
        }
        debug!(
            "[Locator] Releasing tuning space '{}' ({})",
            space.unique_name, space.standard
        );
    }
    *active = None;

    let found = directory.find(standard, name).map_err(|e| {
        warn!("[Locator] Tuning space lookup failed: {}", e);
        ConfigurationError::TuningSpaceLookup {
            standard,
            reason: e.to_string(),
        }
    })?;
    if let Some(space) = found {
        info!("[Locator] Using tuning space '{}'", space.unique_name);
        *active = Some(space);
        return Ok(SpaceResolution::Adopted);
    }

    let create_name = creation_name(standard, params);
    let space = directory.create(standard, &create_name).map_err(|e| {
        warn!("[Locator] Cannot create tuning space '{}': {}", create_name, e);
        ConfigurationError::TuningSpaceCreate {
            name: create_name.clone(),
            reason: e.to_string(),
        }
    })?;
    info!(
        "[Locator] Created {} tuning space '{}' ({:?})",
        standard, space.unique_name, space.kind
    );
    *active = Some(space);
    Ok(SpaceResolution::Created)
}

/// A positive parameter narrowed to a locator field.
fn positive(field: &'static str, value: Option<i64>) -> Result<Option<i32>, ConfigurationError> {
    match value {
        Some(v) if v > 0 => i32::try_from(v)
            .map(Some)
            .map_err(|_| ConfigurationError::FieldOutOfRange { field, value: v }),
        _ => Ok(None),
    }
}

fn atsc(params: &TuneParameters) -> Result<AtscLocator, ConfigurationError> {
    Ok(AtscLocator {
        carrier_frequency: positive("carrier frequency", params.frequency)?,
        physical_channel: positive("physical channel", params.physical_channel)?,
        major_channel: positive("major channel", params.major_channel)?,
        minor_channel: positive("minor channel", params.minor_channel)?,
    })
}

fn dvbt(params: &TuneParameters) -> Result<DvbTLocator, ConfigurationError> {
    Ok(DvbTLocator {
        carrier_frequency: positive("carrier frequency", params.frequency)?,
        bandwidth: positive("bandwidth", params.bandwidth)?,
        inner_fec_rate: params.code_rate_hp.and_then(FecRate::from_code),
        lp_inner_fec_rate: params.code_rate_lp.and_then(FecRate::from_code),
        guard: params.guard.and_then(GuardInterval::from_denominator),
        mode: params.transmission.and_then(TransmissionMode::from_code),
        hierarchy: params.hierarchy.and_then(HierarchyAlpha::from_code),
    })
}

fn dvbc(params: &TuneParameters) -> Result<DvbCLocator, ConfigurationError> {
    Ok(DvbCLocator {
        carrier_frequency: positive("carrier frequency", params.frequency)?,
        symbol_rate: positive("symbol rate", params.symbol_rate)?,
        modulation: params.modulation.and_then(Modulation::from_qam_order),
    })
}

fn dvbs(params: &TuneParameters) -> Result<DvbSLocator, ConfigurationError> {
    // Longitude is signed: negative is west. Present means both fields are written.
    let (west_position, orbital_position) = match params.longitude {
        Some(longitude) => {
            let orbital = i32::try_from(longitude.unsigned_abs()).map_err(|_| {
                ConfigurationError::FieldOutOfRange {
                    field: "orbital position",
                    value: longitude,
                }
            })?;
            (Some(longitude < 0), Some(orbital))
        }
        None => (None, None),
    };

    Ok(DvbSLocator {
        carrier_frequency: positive("carrier frequency", params.frequency)?,
        symbol_rate: positive("symbol rate", params.symbol_rate)?,
        polarisation: params.polarisation.as_deref().and_then(Polarisation::from_label),
        modulation: params.modulation.and_then(Modulation::from_satellite_code),
        inner_fec_rate: params.code_rate_hp.and_then(FecRate::from_code),
        azimuth: positive("azimuth", params.azimuth)?,
        elevation: positive("elevation", params.elevation)?,
        orbital_position,
        west_position,
    })
}

/// Translate `params` into the locator of `standard`.
///
/// No partial locator is returned: the first field that cannot be set fails
/// the whole translation.
pub fn build_locator(
    standard: NetworkStandard,
    params: &TuneParameters,
) -> Result<Locator, ConfigurationError> {
    let locator = match standard {
        NetworkStandard::Atsc => Locator::Atsc(atsc(params)?),
        NetworkStandard::DvbT => Locator::DvbT(dvbt(params)?),
        NetworkStandard::DvbC => Locator::DvbC(dvbc(params)?),
        NetworkStandard::DvbS => Locator::DvbS(dvbs(params)?),
    };
    debug!("[Locator] {} locator: {:?}", standard, locator);
    Ok(locator)
}

/// Write the LNB, inversion, network id and input range of a DVB-S request
/// onto its tuning space. Unset values keep what the tuning space holds.
///
/// The tuning space is left untouched when any value is out of range.
pub fn apply_satellite_settings(
    space: &mut TuningSpace,
    params: &TuneParameters,
) -> Result<(), ConfigurationError> {
    let mut satellite = space.satellite.clone();
    if let Some(lof1) = positive("LNB low oscillator", params.lnb_lof1)? {
        satellite.low_oscillator = Some(lof1);
    }
    if let Some(slof) = positive("LNB switch", params.lnb_slof)? {
        satellite.lnb_switch = Some(slof);
    }
    if let Some(lof2) = positive("LNB high oscillator", params.lnb_lof2)? {
        satellite.high_oscillator = Some(lof2);
    }
    if let Some(inversion) = params.inversion.and_then(SpectralInversion::from_code) {
        satellite.spectral_inversion = Some(inversion);
    }
    if let Some(network_id) = positive("network id", params.network_id)? {
        satellite.network_id = Some(network_id);
    }
    if let Some(range) = params.input_range.as_ref().filter(|r| !r.is_empty()) {
        satellite.input_range = Some(range.clone());
    }
    space.satellite = satellite;
    Ok(())
}

/// Tune request ready for the graph, and how its tuning space was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    pub request: TuneRequest,
    pub resolution: SpaceResolution,
}

/// Resolve the tuning space, translate the parameters and create the tune request.
pub fn prepare(
    directory: &dyn TuningSpaceDirectory,
    active: &mut Option<TuningSpace>,
    standard: NetworkStandard,
    params: &TuneParameters,
) -> Result<PreparedRequest, ConfigurationError> {
    let resolution = resolve_tuning_space(directory, active, standard, params)?;
    let locator = build_locator(standard, params)?;

    let space = active
        .as_mut()
        .ok_or_else(|| ConfigurationError::TuningSpaceLookup {
            standard,
            reason: "no active tuning space".into(),
        })?;
    if standard == NetworkStandard::DvbS {
        apply_satellite_settings(space, params)?;
    }
    let request = space.create_tune_request(locator)?;
    Ok(PreparedRequest {
        request,
        resolution,
    })
}
