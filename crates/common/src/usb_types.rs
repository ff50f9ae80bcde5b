//! Shared USB device handle
//!
//! A [`UsbDevice`] is an opaque, reference-counted identity. The channel
//! core never creates or destroys devices: it clones a handle when it starts
//! using one and drops the clone when it is done. Every clone is released
//! exactly once because ownership is tracked by the type system.

use std::fmt;
use std::sync::Arc;

/// Bus number reported by emulated (software) devices
///
/// Emulated devices have no device node, so they never need an
/// out-of-process permission check.
pub const BUS_NUMBER_FOR_EMULATED_USB: u16 = u16::MAX;

/// Identity of a redirectable USB device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Bus number on the host
    pub bus: u16,
    /// Device address on the bus
    pub address: u16,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Whether any endpoint of the device is isochronous
    pub isochronous: bool,
    /// Manufacturer string (if available)
    pub manufacturer: Option<String>,
    /// Product string (if available)
    pub product: Option<String>,
}

/// Reference-counted handle to a device
#[derive(Clone)]
pub struct UsbDevice(Arc<DeviceIdentity>);

impl UsbDevice {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self(Arc::new(identity))
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.0
    }

    pub fn bus(&self) -> u16 {
        self.0.bus
    }

    pub fn address(&self) -> u16 {
        self.0.address
    }

    pub fn vendor_id(&self) -> u16 {
        self.0.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.0.product_id
    }

    /// Isochronous endpoints are timing sensitive; their traffic is never compressed
    pub fn is_isochronous(&self) -> bool {
        self.0.isochronous
    }

    /// Software-emulated device (no physical device node)
    pub fn is_emulated(&self) -> bool {
        self.0.bus == BUS_NUMBER_FOR_EMULATED_USB
    }

    /// Whether two handles refer to the same device object
    pub fn same_device(&self, other: &UsbDevice) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live handles to this device
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Human readable description, e.g. `"Acme Storage [1234:5678] at 1-4"`
    pub fn description(&self) -> String {
        let id = &self.0;
        let manufacturer = id.manufacturer.as_deref().unwrap_or("USB");
        let product = id.product.as_deref().unwrap_or("Device");
        format!(
            "{} {} [{:04x}:{:04x}] at {}-{}",
            manufacturer, product, id.vendor_id, id.product_id, id.bus, id.address
        )
    }
}

impl fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UsbDevice({:04x}:{:04x} @ {}-{})",
            self.0.vendor_id, self.0.product_id, self.0.bus, self.0.address
        )
    }
}

impl fmt::Display for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(bus: u16) -> DeviceIdentity {
        DeviceIdentity {
            bus,
            address: 4,
            vendor_id: 0x1234,
            product_id: 0x5678,
            isochronous: false,
            manufacturer: Some("Acme".to_string()),
            product: Some("Storage".to_string()),
        }
    }

    #[test]
    fn test_description_format() {
        let device = UsbDevice::new(identity(1));
        assert_eq!(device.description(), "Acme Storage [1234:5678] at 1-4");
    }

    #[test]
    fn test_handle_counting() {
        let device = UsbDevice::new(identity(1));
        assert_eq!(device.handle_count(), 1);

        let clone = device.clone();
        assert_eq!(device.handle_count(), 2);
        assert!(clone.same_device(&device));

        drop(clone);
        assert_eq!(device.handle_count(), 1);
    }

    #[test]
    fn test_equal_identity_is_not_same_device() {
        let a = UsbDevice::new(identity(1));
        let b = UsbDevice::new(identity(1));
        assert_eq!(a.identity(), b.identity());
        assert!(!a.same_device(&b));
    }

    #[test]
    fn test_emulated_bus() {
        assert!(UsbDevice::new(identity(BUS_NUMBER_FOR_EMULATED_USB)).is_emulated());
        assert!(!UsbDevice::new(identity(2)).is_emulated());
    }
}
