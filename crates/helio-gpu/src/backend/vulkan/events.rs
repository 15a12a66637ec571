//! Event pool for split barriers, keyed by the producer's command location.

use std::collections::HashMap;

use ash::vk;

use crate::bundle::CommandLocation;
use crate::error::DeviceError;

pub struct EventPool {
    device: ash::Device,
    by_location: HashMap<CommandLocation, vk::Event>,
    free: Vec<vk::Event>,
}

impl EventPool {
    pub fn new(device: ash::Device) -> Self {
        Self { device, by_location: HashMap::new(), free: Vec::new() }
    }

    /// Returns the event for `location`, creating or recycling one. The
    /// `recycled` flag tells the recorder the event may still be signaled and
    /// needs a reset before use.
    pub fn acquire(
        &mut self,
        location: CommandLocation,
    ) -> Result<(vk::Event, bool), DeviceError> {
        if let Some(&event) = self.by_location.get(&location) {
            return Ok((event, true));
        }
        let (event, recycled) = match self.free.pop() {
            Some(event) => (event, true),
            None => {
                let info = vk::EventCreateInfo::default();
                (unsafe { self.device.create_event(&info, None)? }, false)
            }
        };
        self.by_location.insert(location, event);
        Ok((event, recycled))
    }

    /// The event a begin barrier registered for `location`, if any.
    pub fn find(&self, location: CommandLocation) -> Option<vk::Event> {
        self.by_location.get(&location).copied()
    }

    /// Returns a retired location's event to the free list.
    pub fn release(&mut self, location: CommandLocation) {
        if let Some(event) = self.by_location.remove(&location) {
            self.free.push(event);
        }
    }

    pub fn destroy(&mut self) {
        for (_, event) in self.by_location.drain() {
            unsafe { self.device.destroy_event(event, None) };
        }
        for event in self.free.drain(..) {
            unsafe { self.device.destroy_event(event, None) };
        }
    }
}
