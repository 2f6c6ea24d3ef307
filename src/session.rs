//! One controller handle and its open/identify/close lifecycle.
//!
//! Two levels of "open" exist. The handle is open from [`DeviceSession::open`]
//! until [`DeviceSession::close`]; the native node underneath is opened only
//! for the duration of an operation (identify, a stream, a test batch, a
//! script) and never twice at once.

use crate::discovery;
use crate::error::{Result, TouchError};
use crate::native::{IdentifyInfo, InterfaceKind, NativeDevice};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub node_path: PathBuf,
    pub interface_kind: InterfaceKind,
    pub is_tddi: bool,
    pub is_open: bool,
    pub is_identified: bool,
}

pub struct DeviceSession {
    handle: DeviceHandle,
    info: Option<IdentifyInfo>,
    device: Box<dyn NativeDevice>,
    connected: bool,
}

/// Touch-and-display parts report ids starting with `td` or a leading `4`.
pub fn classify_tddi(device_id: &str) -> bool {
    let id = device_id.trim().to_ascii_lowercase();
    id.starts_with("td") || id.starts_with('4')
}

impl DeviceSession {
    /// Set up a handle for `node`. An empty or missing node runs discovery
    /// and takes the interface from the node that was found; otherwise the
    /// hints decide, falling back to the node name.
    pub fn open(node: Option<&Path>, rmi_hint: bool, tcm_hint: bool) -> Result<Self> {
        let (node_path, kind) = match node.filter(|p| !p.as_os_str().is_empty()) {
            Some(path) => {
                if !path.exists() {
                    return Err(TouchError::DeviceNotFound(path.display().to_string()));
                }
                let kind = match (rmi_hint, tcm_hint) {
                    (true, false) => InterfaceKind::Rmi,
                    (false, true) => InterfaceKind::Tcm,
                    _ => discovery::infer_kind(path).ok_or_else(|| {
                        TouchError::DeviceNotFound(format!(
                            "cannot tell interface of {}; pass --rmi or --tcm",
                            path.display()
                        ))
                    })?,
                };
                (path.to_path_buf(), kind)
            }
            None => discover(rmi_hint, tcm_hint)?,
        };

        log::info!("session: {} node {}", kind, node_path.display());
        let device = native_for(&node_path, kind)?;
        Ok(Self::from_device(node_path, device))
    }

    /// Wrap an already constructed transport (simulated controllers, tests).
    pub fn from_device(node_path: impl Into<PathBuf>, device: Box<dyn NativeDevice>) -> Self {
        let handle = DeviceHandle {
            node_path: node_path.into(),
            interface_kind: device.kind(),
            is_tddi: false,
            is_open: true,
            is_identified: false,
        };
        Self {
            handle,
            info: None,
            device,
            connected: false,
        }
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn kind(&self) -> InterfaceKind {
        self.handle.interface_kind
    }

    /// Last successful identification, kept even after a later identify
    /// failed (`is_identified` is false then).
    pub fn info(&self) -> Option<&IdentifyInfo> {
        self.info.as_ref()
    }

    pub fn is_rmi(&self) -> bool {
        self.handle.interface_kind == InterfaceKind::Rmi
    }

    pub fn is_tcm(&self) -> bool {
        self.handle.interface_kind == InterfaceKind::Tcm
    }

    pub fn is_tddi(&self) -> bool {
        self.handle.is_tddi
    }

    pub fn is_rmi_tddi(&self) -> bool {
        self.is_rmi() && self.is_tddi()
    }

    pub fn is_tcm_tddi(&self) -> bool {
        self.is_tcm() && self.is_tddi()
    }

    /// Whether the native node is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn require_open(&self) -> Result<()> {
        if self.handle.is_open {
            Ok(())
        } else {
            Err(TouchError::DeviceNotOpen)
        }
    }

    pub fn require_identified(&self) -> Result<&IdentifyInfo> {
        self.require_open()?;
        match (&self.info, self.handle.is_identified) {
            (Some(info), true) => Ok(info),
            _ => Err(TouchError::NotIdentified),
        }
    }

    /// Bracketed open/identify/close. The cached info is replaced only on
    /// success.
    pub fn identify(&mut self) -> Result<&IdentifyInfo> {
        self.connect("identify").map_err(|e| match e {
            TouchError::Io { source, .. } => TouchError::IdentifyFailed(source),
            other => other,
        })?;
        let res = self.device.identify();
        if let Err(e) = self.disconnect("identify") {
            log::warn!("{}: {}", self.describe(), e);
        }

        match res {
            Ok(info) => {
                self.handle.is_tddi = classify_tddi(&info.device_id);
                self.handle.is_identified = true;
                log::info!(
                    "identify: {} id={} fw={} config={} {}x{} buttons={} force={} hybrid={}{}",
                    self.handle.interface_kind,
                    info.device_id,
                    info.firmware_id,
                    info.config_id,
                    info.image_rows,
                    info.image_cols,
                    info.button_count,
                    info.force_electrode_count,
                    info.has_hybrid,
                    if self.handle.is_tddi { " (TDDI)" } else { "" }
                );
                Ok(self.info.insert(info))
            }
            Err(e) => {
                self.handle.is_identified = false;
                log::error!("{}: identify failed: {}", self.describe(), e);
                Err(TouchError::IdentifyFailed(e))
            }
        }
    }

    /// Invalidate the handle. Closing twice is reported, not fatal.
    pub fn close(&mut self) -> bool {
        if !self.handle.is_open {
            log::error!("{}: close on a handle that is already closed", self.describe());
            return false;
        }
        let mut ok = true;
        if self.connected {
            log::warn!("{}: closing while the device is still open", self.describe());
            ok = self.disconnect("close").is_ok();
        }
        self.handle.is_open = false;
        self.handle.is_identified = false;
        ok
    }

    pub(crate) fn connect(&mut self, op: &'static str) -> Result<()> {
        self.require_open()?;
        if self.connected {
            let err = TouchError::InvalidState(format!("{}: device is already open", op));
            log::error!("{}: {}", self.describe(), err);
            return Err(err);
        }
        if let Err(e) = self.device.open() {
            log::error!("{}: {}: open failed: {}", self.describe(), op, e);
            return Err(TouchError::Io { op: "open", source: e });
        }
        self.connected = true;
        Ok(())
    }

    /// The node counts as closed afterwards even when the close call failed.
    pub(crate) fn disconnect(&mut self, op: &'static str) -> Result<()> {
        if !self.connected {
            let err = TouchError::InvalidState(format!("{}: device is not open", op));
            log::error!("{}: {}", self.describe(), err);
            return Err(err);
        }
        self.connected = false;
        self.device.close().map_err(|e| {
            log::error!("{}: {}: close failed: {}", self.describe(), op, e);
            TouchError::Io { op: "close", source: e }
        })
    }

    /// The transport, available only while the node is open.
    pub(crate) fn device(&mut self, op: &'static str) -> Result<&mut dyn NativeDevice> {
        self.require_open()?;
        if !self.connected {
            log::error!("{}: {} on a device that is not open", self.describe(), op);
            return Err(TouchError::DeviceNotOpen);
        }
        Ok(self.device.as_mut())
    }

    /// Run `f` with the node open, closing it afterwards whatever `f` did.
    pub fn with_connection<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.connect(op)?;
        let res = f(self);
        let closed = self.disconnect(op);
        let value = res?;
        closed?;
        Ok(value)
    }

    pub fn error_messages(&self) -> String {
        self.device.error_messages()
    }

    pub fn clear_error_messages(&mut self) {
        self.device.clear_error_messages();
    }

    pub fn describe(&self) -> String {
        format!(
            "{} {}{}",
            self.handle.interface_kind,
            self.handle.node_path.display(),
            if self.connected { " [open]" } else { "" }
        )
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.connected {
            let _ = self.device.close();
        }
    }
}

fn discover(rmi_hint: bool, tcm_hint: bool) -> Result<(PathBuf, InterfaceKind)> {
    #[cfg(target_os = "linux")]
    {
        use discovery::DeviceDiscovery;

        let devices = discovery::udev_discovery::UdevDiscovery::find_controllers()
            .map_err(|e| TouchError::DeviceNotFound(e.to_string()))?;
        let wanted = |kind: InterfaceKind| match (rmi_hint, tcm_hint) {
            (true, false) => kind == InterfaceKind::Rmi,
            (false, true) => kind == InterfaceKind::Tcm,
            _ => true,
        };
        devices
            .into_iter()
            .find(|d| wanted(d.kind))
            .map(|d| (d.devnode, d.kind))
            .ok_or_else(|| TouchError::DeviceNotFound("no node of the requested interface".into()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (rmi_hint, tcm_hint);
        Err(TouchError::DeviceNotFound(
            "device discovery needs Linux".into(),
        ))
    }
}

#[cfg(target_os = "linux")]
fn native_for(node: &Path, kind: InterfaceKind) -> Result<Box<dyn NativeDevice>> {
    use crate::native::{rmi::RmiDevice, tcm::TcmDevice};
    Ok(match kind {
        InterfaceKind::Rmi => Box::new(RmiDevice::new(node)),
        InterfaceKind::Tcm => Box::new(TcmDevice::new(node)),
    })
}

#[cfg(not(target_os = "linux"))]
fn native_for(node: &Path, _kind: InterfaceKind) -> Result<Box<dyn NativeDevice>> {
    Err(TouchError::DeviceNotFound(format!(
        "{}: character nodes need Linux",
        node.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::{FailPoint, MockController};

    fn session(mock: MockController) -> DeviceSession {
        DeviceSession::from_device("mock", Box::new(mock))
    }

    #[test]
    fn tddi_prefixes() {
        assert!(classify_tddi("td4310"));
        assert!(classify_tddi("TD4322"));
        assert!(classify_tddi("4322"));
        assert!(!classify_tddi("s3908"));
        assert!(!classify_tddi(""));
    }

    #[test]
    fn identify_brackets_native_open() {
        let mock = MockController::new(InterfaceKind::Tcm);
        let probe = mock.probe();
        let mut s = session(mock);
        let info = s.identify().unwrap().clone();
        assert_eq!(info.image_rows, 18);
        assert_eq!((probe.opens(), probe.closes()), (1, 1));
        assert!(!s.is_connected());
        assert!(s.handle().is_identified);
        assert!(s.is_tcm() && !s.is_tddi());
    }

    #[test]
    fn failed_identify_clears_flag_but_keeps_cache() {
        let mut s = session(MockController::new(InterfaceKind::Rmi));
        s.identify().unwrap();
        s.device = Box::new(MockController::new(InterfaceKind::Rmi).fail(FailPoint::Identify));
        assert!(matches!(s.identify(), Err(TouchError::IdentifyFailed(_))));
        assert!(!s.handle().is_identified);
        assert!(s.info().is_some());
        assert!(matches!(s.require_identified(), Err(TouchError::NotIdentified)));
    }

    #[test]
    fn variant_follows_interface() {
        let mut rmi = session(MockController::tddi(InterfaceKind::Rmi));
        rmi.identify().unwrap();
        assert!(rmi.is_rmi_tddi());
        assert!(!rmi.is_tcm_tddi());

        let mut tcm = session(MockController::tddi(InterfaceKind::Tcm));
        tcm.identify().unwrap();
        assert!(tcm.is_tcm_tddi());
        assert!(!tcm.is_rmi_tddi());
    }

    #[test]
    fn double_connect_is_rejected() {
        let mut s = session(MockController::new(InterfaceKind::Rmi));
        s.connect("first").unwrap();
        assert!(matches!(s.connect("second"), Err(TouchError::InvalidState(_))));
        s.disconnect("first").unwrap();
        assert!(s.disconnect("again").is_err());
    }

    #[test]
    fn close_twice_reports_failure() {
        let mut s = session(MockController::new(InterfaceKind::Rmi));
        assert!(s.close());
        assert!(!s.close());
        assert!(matches!(s.identify(), Err(TouchError::DeviceNotOpen)));
    }

    #[test]
    fn missing_node_is_not_found() {
        let err = DeviceSession::open(Some(Path::new("/nonexistent/rmi9")), true, false)
            .err()
            .unwrap();
        assert!(matches!(err, TouchError::DeviceNotFound(_)));
    }
}
