//! Synaptics RMI4 / TouchComm diagnostics: device sessions, raw register and
//! command access, delta/raw report streaming, production test batches and
//! command scripts.

pub mod acquisition;
pub mod channel;
pub mod csv_log;
pub mod discovery;
pub mod error;
pub mod native;
pub mod production;
pub mod protocol;
pub mod report;
pub mod script;
pub mod session;
pub mod settings;
pub mod view;
pub mod worker;

pub use error::{Result, TouchError};
pub use session::DeviceSession;
