#[cfg(target_os = "linux")]
pub mod udev_discovery;

use crate::native::InterfaceKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub devnode: PathBuf,
    pub kind: InterfaceKind,
}

#[derive(Debug)]
pub enum DiscoveryError {
    UdevError(String),
    NotFound,
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::UdevError(msg) => write!(f, "udev error: {}", msg),
            DiscoveryError::NotFound => write!(f, "no rmi/tcm device node found"),
        }
    }
}

impl std::error::Error for DiscoveryError {}

pub trait DeviceDiscovery {
    fn find_controllers() -> Result<Vec<DeviceInfo>, DiscoveryError>;
}

/// Interface implied by a node name: `rmi*` or `tcm*`.
pub fn infer_kind(path: &Path) -> Option<InterfaceKind> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    if name.starts_with("rmi") {
        Some(InterfaceKind::Rmi)
    } else if name.starts_with("tcm") {
        Some(InterfaceKind::Tcm)
    } else {
        None
    }
}

/// RMI nodes are preferred when both kinds are present.
pub fn sort_candidates(devices: &mut [DeviceInfo]) {
    devices.sort_by(|a, b| {
        let rank = |d: &DeviceInfo| (d.kind != InterfaceKind::Rmi, d.devnode.clone());
        rank(a).cmp(&rank(b))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_node_name() {
        assert_eq!(infer_kind(Path::new("/dev/rmi0")), Some(InterfaceKind::Rmi));
        assert_eq!(infer_kind(Path::new("/dev/tcm1")), Some(InterfaceKind::Tcm));
        assert_eq!(infer_kind(Path::new("/dev/input/event3")), None);
        assert_eq!(infer_kind(Path::new("/")), None);
    }

    #[test]
    fn rmi_nodes_first() {
        let mut devices = vec![
            DeviceInfo {
                devnode: "/dev/tcm0".into(),
                kind: InterfaceKind::Tcm,
            },
            DeviceInfo {
                devnode: "/dev/rmi1".into(),
                kind: InterfaceKind::Rmi,
            },
            DeviceInfo {
                devnode: "/dev/rmi0".into(),
                kind: InterfaceKind::Rmi,
            },
        ];
        sort_candidates(&mut devices);
        let order: Vec<_> = devices.iter().map(|d| d.devnode.clone()).collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("/dev/rmi0"),
                PathBuf::from("/dev/rmi1"),
                PathBuf::from("/dev/tcm0")
            ]
        );
    }
}
