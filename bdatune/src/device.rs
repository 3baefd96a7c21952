//! Device cursor and discovery.
//!
//! The cursor remembers, per category, the ordinal of the last device that was
//! tried so that a rebuild continues with the next candidate instead of
//! offering a failing device again.

use std::collections::HashMap;

use log::{debug, info, warn};
use thiserror::Error;

use crate::pin::{self, ConnectError};
use crate::platform::{
    DeviceCategory, DeviceDirectory, DeviceHandle, Filter, FilterGraph, PlatformError,
    PlatformResult,
};

/// Per-category enumeration progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCursor {
    last_tried: HashMap<DeviceCategory, usize>,
}

impl DeviceCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordinal of the last device offered for `category`.
    pub fn last_tried(&self, category: DeviceCategory) -> Option<usize> {
        self.last_tried.get(&category).copied()
    }

    /// Next device of `category` after the last one tried, advancing the cursor.
    ///
    /// Returns `Ok(None)` when the enumeration is exhausted.
    pub fn next(
        &mut self,
        directory: &dyn DeviceDirectory,
        category: DeviceCategory,
    ) -> PlatformResult<Option<DeviceHandle>> {
        let after = self.last_tried(category);
        let next = directory
            .enumerate(category)?
            .into_iter()
            .enumerate()
            .find(|(ordinal, _)| after.map_or(true, |last| *ordinal > last));

        Ok(next.map(|(ordinal, handle)| {
            self.last_tried.insert(category, ordinal);
            handle
        }))
    }

    /// Forget every category.
    pub fn reset(&mut self) {
        self.last_tried.clear();
    }
}

/// How many candidates one discovery call may try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPolicy {
    /// Offer only the next candidate; a rejection is reported to the caller.
    NextCandidate,
    /// Try every remaining candidate until one connects.
    Scan,
}

/// A device bound, added to the graph and connected downstream of its upstream stage.
pub struct DiscoveredDevice {
    pub handle: DeviceHandle,
    pub friendly_name: String,
    pub filter: Box<dyn Filter>,
}

/// Discovery errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// No remaining device of the category connected.
    #[error("No {category} device available ({tried} tried)")]
    Exhausted {
        category: DeviceCategory,
        tried: usize,
    },

    /// The offered device could not be connected.
    #[error("Device '{device}' rejected: {source}")]
    Rejected {
        device: String,
        #[source]
        source: ConnectError,
    },

    /// The directory or graph failed while handling a device.
    #[error("{step} failed for {device}: {source}")]
    Platform {
        step: &'static str,
        device: String,
        #[source]
        source: PlatformError,
    },
}

/// Find a device of `category` that connects downstream of `upstream`.
///
/// Devices that fail to bind are skipped. A device whose pins do not connect
/// is removed from the graph before the next candidate is considered.
pub fn discover(
    directory: &dyn DeviceDirectory,
    cursor: &mut DeviceCursor,
    category: DeviceCategory,
    graph: &mut dyn FilterGraph,
    upstream: &dyn Filter,
    policy: DiscoveryPolicy,
) -> Result<DiscoveredDevice, DiscoveryError> {
    let mut tried = 0;

    loop {
        let handle = cursor
            .next(directory, category)
            .map_err(|source| DiscoveryError::Platform {
                step: "enumerate",
                device: category.to_string(),
                source,
            })?;
        let Some(handle) = handle else {
            warn!("[Discovery] No {} device connected ({} tried)", category, tried);
            return Err(DiscoveryError::Exhausted { category, tried });
        };
        tried += 1;

        let filter = match directory.bind(&handle) {
            Ok(filter) => filter,
            Err(e) => {
                debug!("[Discovery] Cannot bind {}: {}", handle.path, e);
                continue;
            }
        };

        let friendly_name =
            directory
                .friendly_name(&handle)
                .map_err(|source| DiscoveryError::Platform {
                    step: "read friendly name",
                    device: handle.path.clone(),
                    source,
                })?;

        graph
            .add_filter(filter.as_ref(), &friendly_name)
            .map_err(|source| DiscoveryError::Platform {
                step: "add filter",
                device: friendly_name.clone(),
                source,
            })?;

        match pin::connect(graph, upstream, filter.as_ref()) {
            Ok(()) => {
                info!(
                    "[Discovery] Connected {} #{}: {}",
                    category, handle.index, friendly_name
                );
                return Ok(DiscoveredDevice {
                    handle,
                    friendly_name,
                    filter,
                });
            }
            Err(e) => {
                debug!("[Discovery] {} did not connect: {}", friendly_name, e);
                graph
                    .remove_filter(filter.as_ref())
                    .map_err(|source| DiscoveryError::Platform {
                        step: "remove filter",
                        device: friendly_name.clone(),
                        source,
                    })?;
                if policy == DiscoveryPolicy::NextCandidate {
                    return Err(DiscoveryError::Rejected {
                        device: friendly_name,
                        source: e,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::loopback::{DeviceSpec, LoopbackConfig, LoopbackPlatform, Medium};
    use crate::platform::{FilterKind, Platform};
    use bdatune_types::NetworkStandard;

    fn platform_with_tuners(tuners: Vec<DeviceSpec>) -> LoopbackPlatform {
        LoopbackPlatform::new(LoopbackConfig {
            tuners,
            ..LoopbackConfig::default()
        })
    }

    #[test]
    fn test_cursor_never_reoffers_an_index() {
        let platform = platform_with_tuners(vec![
            DeviceSpec::new("Tuner A"),
            DeviceSpec::new("Tuner B"),
            DeviceSpec::new("Tuner C"),
        ]);
        let mut cursor = DeviceCursor::new();
        let mut seen = Vec::new();
        while let Some(handle) = cursor
            .next(platform.devices(), DeviceCategory::NetworkTuner)
            .unwrap()
        {
            seen.push(handle.index);
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(cursor.last_tried(DeviceCategory::NetworkTuner), Some(2));
        assert_eq!(cursor.last_tried(DeviceCategory::ReceiverComponent), None);

        cursor.reset();
        let first = cursor
            .next(platform.devices(), DeviceCategory::NetworkTuner)
            .unwrap()
            .unwrap();
        assert_eq!(first.index, 0);
    }

    #[test]
    fn test_discover_skips_unbindable_devices() {
        let platform = platform_with_tuners(vec![
            DeviceSpec::new("Broken").bind_fails(),
            DeviceSpec::new("Working"),
        ]);
        let mut graph = platform.create_graph().unwrap();
        let provider = platform
            .create_filter(FilterKind::NetworkProvider(NetworkStandard::DvbT))
            .unwrap();
        graph.add_filter(provider.as_ref(), "Network Provider").unwrap();

        let mut cursor = DeviceCursor::new();
        let found = discover(
            platform.devices(),
            &mut cursor,
            DeviceCategory::NetworkTuner,
            graph.as_mut(),
            provider.as_ref(),
            DiscoveryPolicy::NextCandidate,
        )
        .unwrap();
        assert_eq!(found.friendly_name, "Working");
        assert_eq!(found.handle.index, 1);
    }

    #[test]
    fn test_next_candidate_reports_rejection() {
        let platform = platform_with_tuners(vec![
            DeviceSpec::new("Wrong input").with_input(Medium::Tag(99)),
            DeviceSpec::new("Good"),
        ]);
        let mut graph = platform.create_graph().unwrap();
        let provider = platform
            .create_filter(FilterKind::NetworkProvider(NetworkStandard::DvbC))
            .unwrap();
        graph.add_filter(provider.as_ref(), "Network Provider").unwrap();

        let mut cursor = DeviceCursor::new();
        let err = discover(
            platform.devices(),
            &mut cursor,
            DeviceCategory::NetworkTuner,
            graph.as_mut(),
            provider.as_ref(),
            DiscoveryPolicy::NextCandidate,
        )
        .err()
        .unwrap();
        assert!(matches!(err, DiscoveryError::Rejected { ref device, .. } if device == "Wrong input"));
        assert_eq!(cursor.last_tried(DeviceCategory::NetworkTuner), Some(0));

        let found = discover(
            platform.devices(),
            &mut cursor,
            DeviceCategory::NetworkTuner,
            graph.as_mut(),
            provider.as_ref(),
            DiscoveryPolicy::NextCandidate,
        )
        .unwrap();
        assert_eq!(found.friendly_name, "Good");
    }

    #[test]
    fn test_scan_exhausts_category() {
        let platform = platform_with_tuners(vec![
            DeviceSpec::new("A").with_input(Medium::Tag(1)),
            DeviceSpec::new("B").with_input(Medium::Tag(2)),
        ]);
        let mut graph = platform.create_graph().unwrap();
        let provider = platform
            .create_filter(FilterKind::NetworkProvider(NetworkStandard::Atsc))
            .unwrap();
        graph.add_filter(provider.as_ref(), "Network Provider").unwrap();

        let mut cursor = DeviceCursor::new();
        let err = discover(
            platform.devices(),
            &mut cursor,
            DeviceCategory::NetworkTuner,
            graph.as_mut(),
            provider.as_ref(),
            DiscoveryPolicy::Scan,
        )
        .err()
        .unwrap();
        assert_eq!(
            err,
            DiscoveryError::Exhausted {
                category: DeviceCategory::NetworkTuner,
                tried: 2
            }
        );
        assert_eq!(platform.graph_member_count(), 1);
    }
}
