//! Host-side cache of remote components and their ports
//!
//! Components and ports live in an arena and reference each other by index,
//! so the graph has no back-pointers to manage. Port fields mirror what the
//! remote last reported; any RPC that changes a port is followed by an info
//! refresh, making this cache the single source of truth on the host.

use tracing::debug;

use crate::error::{Error, Result};
use crate::mmal::wire::{ElementaryFormat, PortKind, PortSettings};

pub type ComponentId = usize;

/// Index-based reference to one port of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRef {
    pub component: ComponentId,
    pub kind: PortKind,
    pub index: usize,
}

/// One port as the remote last described it.
#[derive(Debug, Clone)]
pub struct Port {
    pub kind: PortKind,
    pub index: u32,
    pub settings: PortSettings,
    pub format: ElementaryFormat,
    pub zero_copy: bool,
}

impl Port {
    fn new(kind: PortKind, index: u32) -> Self {
        Port {
            kind,
            index,
            settings: PortSettings::default(),
            format: ElementaryFormat::default(),
            zero_copy: false,
        }
    }
}

/// One remote component with its fixed port complement.
#[derive(Debug, Clone)]
pub struct Component {
    pub name: String,
    pub handle: u32,
    pub enabled: bool,
    pub control: Port,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
}

/// Arena of every component this host has created.
#[derive(Default)]
pub struct ComponentStore {
    components: Vec<Component>,
}

impl ComponentStore {
    pub fn new() -> Self {
        ComponentStore::default()
    }

    /// Record a freshly created component and lay out its port cache from
    /// the counts the remote reported.
    pub fn add(
        &mut self,
        name: &str,
        handle: u32,
        input_count: u32,
        output_count: u32,
    ) -> ComponentId {
        let component = Component {
            name: name.to_owned(),
            handle,
            enabled: false,
            control: Port::new(PortKind::Control, 0),
            inputs: (0..input_count)
                .map(|i| Port::new(PortKind::Input, i))
                .collect(),
            outputs: (0..output_count)
                .map(|i| Port::new(PortKind::Output, i))
                .collect(),
        };
        debug!(name, handle, input_count, output_count, "component cached");
        self.components.push(component);
        self.components.len() - 1
    }

    pub fn get(&self, id: ComponentId) -> Result<&Component> {
        self.components
            .get(id)
            .ok_or(Error::Corrupted("component index out of range"))
    }

    pub fn get_mut(&mut self, id: ComponentId) -> Result<&mut Component> {
        self.components
            .get_mut(id)
            .ok_or(Error::Corrupted("component index out of range"))
    }

    pub fn port(&self, port: PortRef) -> Result<&Port> {
        let component = self.get(port.component)?;
        let slot = match port.kind {
            PortKind::Control => Some(&component.control),
            PortKind::Input => component.inputs.get(port.index),
            PortKind::Output => component.outputs.get(port.index),
            PortKind::Clock => None,
        };
        slot.ok_or(Error::Corrupted("port index out of range"))
    }

    pub fn port_mut(&mut self, port: PortRef) -> Result<&mut Port> {
        let component = self.get_mut(port.component)?;
        let slot = match port.kind {
            PortKind::Control => Some(&mut component.control),
            PortKind::Input => component.inputs.get_mut(port.index),
            PortKind::Output => component.outputs.get_mut(port.index),
            PortKind::Clock => None,
        };
        slot.ok_or(Error::Corrupted("port index out of range"))
    }

    /// Overwrite the cached view of a port with what the remote just
    /// reported.
    pub fn apply_port_info(
        &mut self,
        port: PortRef,
        settings: PortSettings,
        format: ElementaryFormat,
    ) -> Result<()> {
        let slot = self.port_mut(port)?;
        slot.settings = settings;
        slot.format = format;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_addresses_ports_by_index() {
        let mut store = ComponentStore::new();
        let cam = store.add("vc.ril.camera", 0x1000, 0, 3);
        let video = PortRef {
            component: cam,
            kind: PortKind::Output,
            index: 1,
        };
        assert_eq!(store.port(video).unwrap().index, 1);
        assert!(store
            .port(PortRef {
                component: cam,
                kind: PortKind::Output,
                index: 3,
            })
            .is_err());
    }

    #[test]
    fn refresh_overwrites_the_cache() {
        let mut store = ComponentStore::new();
        let enc = store.add("vc.ril.video_encode", 0x1001, 1, 1);
        let out = PortRef {
            component: enc,
            kind: PortKind::Output,
            index: 0,
        };
        let settings = PortSettings {
            port_handle: 0x301,
            enabled: true,
            buffer_num_recommended: 8,
            buffer_size_recommended: 262_144,
            ..Default::default()
        };
        store
            .apply_port_info(out, settings, ElementaryFormat::default())
            .unwrap();
        let port = store.port(out).unwrap();
        assert!(port.settings.enabled);
        assert_eq!(port.settings.buffer_num_recommended, 8);
    }
}
