use anyhow::Result;
use log::trace;
use smithay_client_toolkit::{
    delegate_output, delegate_registry,
    output::{OutputHandler, OutputInfo, OutputState},
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
};
use wayland_client::{globals::registry_queue_init, protocol::wl_output::WlOutput, Connection, QueueHandle};

use crate::handoff::{CaptureSource, SourceProvider};

struct OutputListing {
    registry_state: RegistryState,
    output_state: OutputState,
}

delegate_registry!(OutputListing);
impl ProvidesRegistryState for OutputListing {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }
    registry_handlers![OutputState];
}

delegate_output!(OutputListing);
impl OutputHandler for OutputListing {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _output: WlOutput) {}

    fn update_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _output: WlOutput) {}

    fn output_destroyed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _output: WlOutput) {}
}

/// Outputs of the running compositor, in announcement order.
#[derive(Default, Debug)]
pub struct WaylandOutputs;

impl SourceProvider for WaylandOutputs {
    fn sources(&mut self) -> Result<Vec<CaptureSource>> {
        let conn = Connection::connect_to_env()?;
        let (globals, mut event_queue) = registry_queue_init::<OutputListing>(&conn)?;
        let qh = event_queue.handle();
        let mut listing = OutputListing {
            registry_state: RegistryState::new(&globals),
            output_state: OutputState::new(&globals, &qh),
        };
        // outputs, then their xdg-output names
        event_queue.roundtrip(&mut listing)?;
        event_queue.roundtrip(&mut listing)?;

        Ok(listing
            .output_state
            .outputs()
            .filter_map(|output| listing.output_state.info(&output))
            .filter_map(|info| capture_source(&info))
            .collect())
    }
}

fn capture_source(info: &OutputInfo) -> Option<CaptureSource> {
    let source = describe(info.name.as_deref(), info.description.as_deref(), &info.make, &info.model);
    if source.is_none() {
        trace!("skipping output {} without a connector name", info.id);
    }
    source
}

/// The connector name is the id, what a user would recognise is the name.
fn describe(connector: Option<&str>, description: Option<&str>, make: &str, model: &str) -> Option<CaptureSource> {
    let id = connector.filter(|c| !c.is_empty())?;
    let name = match description {
        Some(description) if !description.is_empty() => description.to_owned(),
        _ => format!("{make} {model}").trim().to_owned(),
    };
    Some(CaptureSource {
        id: id.to_owned(),
        name,
    })
}
