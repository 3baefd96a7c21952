//! First-fit pin connection between two stages.

use log::{debug, trace};
use thiserror::Error;

use crate::platform::{Filter, FilterGraph, PinDirection, PlatformError};

/// Pin connection errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// No unconnected output/input pair was accepted.
    #[error("No compatible pins")]
    NoCompatiblePins,

    /// Pins could not be enumerated or queried.
    #[error("Pin query failed: {0}")]
    Platform(#[from] PlatformError),
}

/// Connect an unconnected output pin of `upstream` to an unconnected input
/// pin of `downstream`.
///
/// Output pins are tried in enumeration order, and for each of them every
/// input pin of `downstream` in enumeration order. The first pair the graph
/// accepts wins. Failures to enumerate or query pins abort the search; a
/// rejected pair just moves on to the next one.
pub fn connect(
    graph: &mut dyn FilterGraph,
    upstream: &dyn Filter,
    downstream: &dyn Filter,
) -> Result<(), ConnectError> {
    for output in upstream.pins()? {
        if output.direction()? != PinDirection::Output || output.is_connected()? {
            continue;
        }

        for input in downstream.pins()? {
            if input.direction()? != PinDirection::Input || input.is_connected()? {
                continue;
            }

            match graph.connect_direct(output.as_ref(), input.as_ref()) {
                Ok(()) => {
                    debug!(
                        "[Pin] Connected {:?}:{:?} -> {:?}:{:?}",
                        upstream.id(),
                        output.id(),
                        downstream.id(),
                        input.id()
                    );
                    return Ok(());
                }
                Err(e) => {
                    trace!("[Pin] {:?} -> {:?} rejected: {}", output.id(), input.id(), e);
                }
            }
        }
    }

    Err(ConnectError::NoCompatiblePins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::loopback::{LoopbackConfig, LoopbackPlatform, Medium, PinSpec};
    use crate::platform::{FilterKind, Platform};

    #[test]
    fn test_connects_first_compatible_pair() {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let mut graph = platform.create_graph().unwrap();
        let grabber = platform.create_filter(FilterKind::SampleGrabber).unwrap();
        let demux = platform.create_filter(FilterKind::Demultiplexer).unwrap();
        graph.add_filter(grabber.as_ref(), "Sample Grabber").unwrap();
        graph.add_filter(demux.as_ref(), "Demux").unwrap();

        connect(graph.as_mut(), grabber.as_ref(), demux.as_ref()).unwrap();

        let connected_inputs = demux
            .pins()
            .unwrap()
            .iter()
            .filter(|p| p.direction().unwrap() == PinDirection::Input && p.is_connected().unwrap())
            .count();
        assert_eq!(connected_inputs, 1);
    }

    #[test]
    fn test_skips_connected_and_incompatible_pins() {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let mut graph = platform.create_graph().unwrap();
        let upstream = platform.custom_filter(vec![
            PinSpec::output(Medium::Tag(7)),
            PinSpec::output(Medium::TransportStream),
        ]);
        let downstream = platform.custom_filter(vec![
            PinSpec::input(Medium::TransportStream),
            PinSpec::input(Medium::TransportStream),
        ]);
        graph.add_filter(upstream.as_ref(), "up").unwrap();
        graph.add_filter(downstream.as_ref(), "down").unwrap();

        connect(graph.as_mut(), upstream.as_ref(), downstream.as_ref()).unwrap();
        // The only free output is now incompatible with the remaining input.
        assert_eq!(
            connect(graph.as_mut(), upstream.as_ref(), downstream.as_ref()),
            Err(ConnectError::NoCompatiblePins)
        );
    }

    #[test]
    fn test_no_pins_is_incompatible() {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let mut graph = platform.create_graph().unwrap();
        let upstream = platform.custom_filter(vec![PinSpec::input(Medium::Any)]);
        let downstream = platform.custom_filter(vec![PinSpec::input(Medium::Any)]);
        graph.add_filter(upstream.as_ref(), "up").unwrap();
        graph.add_filter(downstream.as_ref(), "down").unwrap();

        assert_eq!(
            connect(graph.as_mut(), upstream.as_ref(), downstream.as_ref()),
            Err(ConnectError::NoCompatiblePins)
        );
    }
}
