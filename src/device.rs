//! Device enumeration and selection.

use crate::error::{IblinkError, Result};
use crate::verbs::{DeviceDescriptor, Verbs};

/// How to pick a device out of the enumerated list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceQuery {
    /// Positional index in enumeration order.
    Index(usize),
    /// Exact kernel device name, e.g. `mlx5_0`.
    Name(String),
}

impl std::fmt::Display for DeviceQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceQuery::Index(i) => write!(f, "index {i}"),
            DeviceQuery::Name(name) => write!(f, "name '{name}'"),
        }
    }
}

/// Enumerate available devices.
///
/// An empty list is a valid result, distinct from an enumeration failure.
/// Whatever backing list the driver produced is released before this
/// returns; descriptors are plain copies.
pub fn list_devices(driver: &dyn Verbs) -> Result<Vec<DeviceDescriptor>> {
    let devices = driver.list_devices()?;
    tracing::debug!(count = devices.len(), "enumerated RDMA devices");
    Ok(devices)
}

/// Select one descriptor by index or exact name.
pub fn select_device(
    devices: &[DeviceDescriptor],
    query: &DeviceQuery,
) -> Result<DeviceDescriptor> {
    let found = match query {
        DeviceQuery::Index(i) => devices.get(*i),
        DeviceQuery::Name(name) => devices.iter().find(|d| d.name == *name),
    };
    match found {
        Some(descriptor) => {
            tracing::info!(device = %descriptor.name, transport = %descriptor.transport, "selected RDMA device");
            Ok(descriptor.clone())
        }
        None => Err(IblinkError::DeviceNotFound {
            query: query.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transport;

    fn descriptors() -> Vec<DeviceDescriptor> {
        ["mlx5_0", "mlx5_1"]
            .iter()
            .enumerate()
            .map(|(index, name)| DeviceDescriptor {
                name: name.to_string(),
                index,
                transport: Transport::Infiniband,
            })
            .collect()
    }

    #[test]
    fn select_by_index() {
        let devices = descriptors();
        let d = select_device(&devices, &DeviceQuery::Index(1)).unwrap();
        assert_eq!(d.name, "mlx5_1");
    }

    #[test]
    fn select_by_name() {
        let devices = descriptors();
        let d = select_device(&devices, &DeviceQuery::Name("mlx5_0".into())).unwrap();
        assert_eq!(d.index, 0);
    }

    #[test]
    fn out_of_range_index_is_not_found() {
        let devices = descriptors();
        let err = select_device(&devices, &DeviceQuery::Index(7)).unwrap_err();
        assert!(matches!(err, IblinkError::DeviceNotFound { .. }));
    }

    #[test]
    fn unknown_name_is_not_found() {
        let devices = descriptors();
        let err = select_device(&devices, &DeviceQuery::Name("mlx5_9".into())).unwrap_err();
        assert_eq!(err.to_string(), "no RDMA device matched name 'mlx5_9'");
    }

    #[test]
    fn selection_from_empty_list_fails() {
        let err = select_device(&[], &DeviceQuery::Index(0)).unwrap_err();
        assert!(matches!(err, IblinkError::DeviceNotFound { .. }));
    }
}
