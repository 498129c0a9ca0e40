//! Handler registry keyed by device type.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;

use super::VendorHandler;
use super::vendors;
use crate::device::DeviceType;
use crate::error::{PlatformError, Result};

/// Maps a device-type tag to its handler.
///
/// Created once at startup and shared by the pool, executor and engine.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<DeviceType, Arc<dyn VendorHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn empty() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the four built-in handlers.
    pub fn with_builtin() -> Self {
        let registry = Self::empty();
        registry.register(Arc::new(vendors::cisco_ios::CiscoIosHandler::new()));
        registry.register(Arc::new(vendors::cisco_iosxe::CiscoIosXeHandler::new()));
        registry.register(Arc::new(vendors::cisco_nxos::CiscoNxosHandler::new()));
        registry.register(Arc::new(vendors::juniper::JuniperHandler::new()));
        registry
    }

    /// Register a handler, replacing any handler for the same device type.
    pub fn register(&self, handler: Arc<dyn VendorHandler>) {
        let device_type = handler.device_type();
        debug!("registering handler for {}", device_type);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_type, handler);
    }

    /// Resolve the handler for a device type.
    pub fn resolve(&self, device_type: DeviceType) -> Result<Arc<dyn VendorHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&device_type)
            .cloned()
            .ok_or_else(|| {
                PlatformError::UnknownDeviceType {
                    name: device_type.to_string(),
                }
                .into()
            })
    }

    /// Device types with a registered handler.
    pub fn device_types(&self) -> Vec<DeviceType> {
        let mut types: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_handlers_resolve() {
        let registry = HandlerRegistry::with_builtin();
        for t in DeviceType::ALL {
            assert_eq!(registry.resolve(t).unwrap().device_type(), t);
        }
        assert_eq!(registry.device_types().len(), 4);
    }

    #[test]
    fn test_capabilities_by_vendor() {
        let registry = HandlerRegistry::with_builtin();
        let junos = registry.resolve(DeviceType::JuniperJunos).unwrap();
        let ios = registry.resolve(DeviceType::CiscoIos).unwrap();
        let nxos = registry.resolve(DeviceType::CiscoNxos).unwrap();

        assert!(junos.supports_staged_commit());
        assert!(junos.supports_confirmed_commit());
        assert!(!ios.supports_staged_commit());
        assert!(!ios.supports_checkpoint());
        assert!(nxos.supports_checkpoint());
        assert!(!nxos.supports_staged_commit());
    }

    #[test]
    fn test_empty_registry_fails_resolution() {
        let registry = HandlerRegistry::empty();
        let err = registry.resolve(DeviceType::CiscoIos).unwrap_err();
        assert_eq!(err.kind(), "UnknownDeviceType");
    }
}
