use super::{infer_kind, sort_candidates, DeviceDiscovery, DeviceInfo, DiscoveryError};
use std::fs;
use std::path::{Path, PathBuf};

pub struct UdevDiscovery;

const NODE_PATTERNS: [&str; 2] = ["rmi*", "tcm*"];

impl DeviceDiscovery for UdevDiscovery {
    fn find_controllers() -> Result<Vec<DeviceInfo>, DiscoveryError> {
        let mut results = Vec::new();

        for pattern in NODE_PATTERNS {
            let mut enumerator =
                udev::Enumerator::new().map_err(|e| DiscoveryError::UdevError(e.to_string()))?;

            enumerator
                .match_sysname(pattern)
                .map_err(|e| DiscoveryError::UdevError(e.to_string()))?;

            for device in enumerator
                .scan_devices()
                .map_err(|e| DiscoveryError::UdevError(e.to_string()))?
            {
                if let Some(devnode) = device.devnode() {
                    push_node(&mut results, devnode);
                }
            }
        }

        // udev may not know about vendor nodes created outside a class
        if results.is_empty() {
            if let Ok(entries) = fs::read_dir("/dev") {
                for entry in entries.flatten() {
                    push_node(&mut results, &entry.path());
                }
            }
        }

        if results.is_empty() {
            Err(DiscoveryError::NotFound)
        } else {
            sort_candidates(&mut results);
            Ok(results)
        }
    }
}

fn push_node(results: &mut Vec<DeviceInfo>, devnode: &Path) {
    if let Some(kind) = infer_kind(devnode) {
        log::debug!("discovery: {} ({})", devnode.display(), kind);
        results.push(DeviceInfo {
            devnode: PathBuf::from(devnode),
            kind,
        });
    }
}
