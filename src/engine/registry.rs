//! Device registry: one record per logical address
//!
//! Sixteen fixed slots, directly indexed by logical address. A slot is
//! never destroyed; it is cleared and reused when the device behind that
//! address disappears. Attribute fields are `Option`s: `None` is "not yet
//! reported", and a record whose device is absent always reads as unknown.

use crate::message::{CecVersion, DeviceType, PhysicalAddress, PowerStatus, VendorId};
use serde::Serialize;
use std::time::Instant;

/// Attributes the poller may request from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedAttribute {
    PhysicalAddress,
    CecVersion,
    VendorId,
    PowerStatus,
    OsdName,
}

impl RequestedAttribute {
    const ALL: [RequestedAttribute; 5] = [
        RequestedAttribute::PhysicalAddress,
        RequestedAttribute::CecVersion,
        RequestedAttribute::VendorId,
        RequestedAttribute::PowerStatus,
        RequestedAttribute::OsdName,
    ];

    fn bit(self) -> u8 {
        match self {
            RequestedAttribute::PhysicalAddress => 1 << 0,
            RequestedAttribute::CecVersion => 1 << 1,
            RequestedAttribute::VendorId => 1 << 2,
            RequestedAttribute::PowerStatus => 1 << 3,
            RequestedAttribute::OsdName => 1 << 4,
        }
    }
}

/// An in-flight info request towards one device
///
/// At most one request is outstanding per device at any time, so a single
/// unresponsive box cannot monopolize the cycle.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub attribute: RequestedAttribute,
    pub requested_at: Instant,
    pub retries: u8,
}

/// Everything known about the device at one logical address
#[derive(Debug, Clone, Default)]
pub struct DeviceRecord {
    pub device_type: Option<DeviceType>,
    pub physical_address: Option<PhysicalAddress>,
    pub cec_version: Option<CecVersion>,
    pub vendor_id: Option<VendorId>,
    pub osd_name: Option<String>,
    pub power_status: Option<PowerStatus>,
    pub current_language: Option<String>,
    pub is_present: bool,
    /// Set when the device failed the last poll pass and awaits cleanup
    pub is_disconnected: bool,
    pub is_active_source: bool,
    pub pending: Option<PendingRequest>,
    /// Attributes given up on after the retry cap; bitmask of [`RequestedAttribute`]
    abandoned: u8,
    /// Set whenever an attribute lands; cleared when the change notification
    /// for this device goes out, so each change is reported exactly once
    pub info_dirty: bool,
    pub last_power_update: Option<Instant>,
}

impl DeviceRecord {
    /// Reset the slot to "nothing known"; the slot itself is reused
    pub fn clear(&mut self) {
        *self = DeviceRecord::default();
    }

    /// True once every attribute is either reported or abandoned
    pub fn is_complete(&self) -> bool {
        self.next_missing_attribute().is_none()
    }

    /// The next attribute worth requesting, in fixed priority order
    pub fn next_missing_attribute(&self) -> Option<RequestedAttribute> {
        RequestedAttribute::ALL.into_iter().find(|attr| {
            if self.abandoned & attr.bit() != 0 {
                return false;
            }
            match attr {
                RequestedAttribute::PhysicalAddress => self.physical_address.is_none(),
                RequestedAttribute::CecVersion => self.cec_version.is_none(),
                RequestedAttribute::VendorId => self.vendor_id.is_none(),
                RequestedAttribute::PowerStatus => self.power_status.is_none(),
                RequestedAttribute::OsdName => self.osd_name.is_none(),
            }
        })
    }

    /// Stop asking for this attribute; it stays unknown
    pub fn abandon(&mut self, attribute: RequestedAttribute) {
        self.abandoned |= attribute.bit();
        if matches!(&self.pending, Some(p) if p.attribute == attribute) {
            self.pending = None;
        }
    }

    pub fn is_abandoned(&self, attribute: RequestedAttribute) -> bool {
        self.abandoned & attribute.bit() != 0
    }

    fn settle(&mut self, attribute: RequestedAttribute) {
        if matches!(&self.pending, Some(p) if p.attribute == attribute) {
            self.pending = None;
        }
        self.abandoned &= !attribute.bit();
        self.info_dirty = true;
    }

    pub fn update_physical_address(&mut self, addr: PhysicalAddress) {
        self.physical_address = Some(addr);
        self.settle(RequestedAttribute::PhysicalAddress);
    }

    pub fn update_device_type(&mut self, device_type: DeviceType) {
        self.device_type = Some(device_type);
        self.info_dirty = true;
    }

    pub fn update_cec_version(&mut self, version: CecVersion) {
        self.cec_version = Some(version);
        self.settle(RequestedAttribute::CecVersion);
    }

    pub fn update_vendor_id(&mut self, vendor_id: VendorId) {
        self.vendor_id = Some(vendor_id);
        self.settle(RequestedAttribute::VendorId);
    }

    pub fn update_osd_name(&mut self, name: String) {
        self.osd_name = Some(name);
        self.settle(RequestedAttribute::OsdName);
    }

    pub fn update_power_status(&mut self, status: PowerStatus) {
        self.power_status = Some(status);
        self.last_power_update = Some(Instant::now());
        self.settle(RequestedAttribute::PowerStatus);
    }

    pub fn update_language(&mut self, language: String) {
        self.current_language = Some(language);
        self.info_dirty = true;
    }
}

/// Summary of one known device, as handed to the RPC layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub logical_address: u8,
    pub physical_address: Option<String>,
    pub device_type: Option<String>,
    pub cec_version: Option<String>,
    pub vendor_id: Option<String>,
    pub osd_name: Option<String>,
    pub power_status: Option<String>,
    pub is_active_source: bool,
    /// 1-based HDMI input port, when the physical address pins one down
    pub port: Option<u8>,
}

/// The sixteen device slots
#[derive(Debug, Default)]
pub struct Registry {
    slots: [DeviceRecord; 16],
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn get(&self, logical_address: u8) -> Option<&DeviceRecord> {
        self.slots.get(logical_address as usize)
    }

    pub fn get_mut(&mut self, logical_address: u8) -> Option<&mut DeviceRecord> {
        self.slots.get_mut(logical_address as usize)
    }

    /// Logical addresses currently marked present
    pub fn present_addresses(&self) -> Vec<u8> {
        (0u8..16)
            .filter(|&la| self.slots[la as usize].is_present)
            .collect()
    }

    /// Count of present devices other than the one at `own`
    pub fn device_count(&self, own: Option<u8>) -> usize {
        (0u8..16)
            .filter(|&la| Some(la) != own && self.slots[la as usize].is_present)
            .count()
    }

    /// Iterate mutable slots alongside their logical address
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u8, &mut DeviceRecord)> {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(la, rec)| (la as u8, rec))
    }

    /// Build the summary for one slot; absent devices report every field
    /// unknown regardless of what an earlier session stored there
    pub fn summary(&self, logical_address: u8, port: Option<u8>) -> Option<DeviceSummary> {
        let record = self.get(logical_address)?;
        if !record.is_present {
            return None;
        }
        Some(DeviceSummary {
            logical_address,
            physical_address: record.physical_address.map(|pa| pa.to_string()),
            device_type: record.device_type.map(|dt| dt.to_string()),
            cec_version: record.cec_version.map(|v| v.to_string()),
            vendor_id: record.vendor_id.map(|v| v.to_string()),
            osd_name: record.osd_name.clone(),
            power_status: record.power_status.map(|p| p.to_string()),
            is_active_source: record.is_active_source,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleared_record_reports_everything_unknown() {
        let mut record = DeviceRecord::default();
        record.is_present = true;
        record.update_physical_address(PhysicalAddress::new(1, 0, 0, 0));
        record.update_osd_name("Player".to_string());
        record.clear();

        assert!(!record.is_present);
        assert!(record.physical_address.is_none());
        assert!(record.osd_name.is_none());
        assert_eq!(
            record.next_missing_attribute(),
            Some(RequestedAttribute::PhysicalAddress)
        );
    }

    #[test]
    fn absent_device_has_no_summary() {
        let mut registry = Registry::new();
        {
            let record = registry.get_mut(3).unwrap();
            record.is_present = true;
            record.update_osd_name("Box".to_string());
        }
        assert!(registry.summary(3, Some(1)).is_some());

        registry.get_mut(3).unwrap().clear();
        assert!(registry.summary(3, Some(1)).is_none());
    }

    #[test]
    fn attribute_arrival_clears_matching_pending_request() {
        let mut record = DeviceRecord::default();
        record.is_present = true;
        record.pending = Some(PendingRequest {
            attribute: RequestedAttribute::VendorId,
            requested_at: Instant::now(),
            retries: 1,
        });

        // A different attribute leaves the request outstanding
        record.update_power_status(PowerStatus::On);
        assert!(record.pending.is_some());

        record.update_vendor_id(VendorId([0, 0x19, 0xFB]));
        assert!(record.pending.is_none());
    }

    #[test]
    fn abandoned_attribute_is_skipped_but_not_complete_blocking() {
        let mut record = DeviceRecord::default();
        record.is_present = true;
        record.update_physical_address(PhysicalAddress::new(1, 0, 0, 0));
        record.update_cec_version(CecVersion::V1_4);
        record.update_vendor_id(VendorId([0, 0, 1]));
        record.update_power_status(PowerStatus::On);

        assert_eq!(
            record.next_missing_attribute(),
            Some(RequestedAttribute::OsdName)
        );
        record.abandon(RequestedAttribute::OsdName);
        assert!(record.is_complete());
        assert!(record.osd_name.is_none());

        // A late answer still lands and un-abandons the attribute
        record.update_osd_name("Late".to_string());
        assert!(!record.is_abandoned(RequestedAttribute::OsdName));
    }
}
