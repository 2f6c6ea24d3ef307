//! CSV sinks for captured frames and test results.

use crate::error::{Result, TouchError};
use crate::production::runner::ItemReport;
use crate::report::ReportFrame;
use std::fs::File;
use std::io;
use std::path::Path;

fn csv_err(e: csv::Error) -> TouchError {
    TouchError::Io {
        op: "csv write",
        source: io::Error::other(e),
    }
}

/// One row per frame: the frame index, then every value in frame order.
pub struct FrameLogger {
    writer: csv::Writer<File>,
    columns: usize,
}

impl FrameLogger {
    /// Header names are `r<row>c<col>` for the image and `x<n>` for hybrid
    /// channels.
    pub fn create(path: &Path, rows: usize, cols: usize, values: usize) -> Result<Self> {
        let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
        let mut header = Vec::with_capacity(values + 1);
        header.push("frame".to_string());
        for i in 0..values {
            if i < rows * cols {
                header.push(format!("r{}c{}", i / cols.max(1), i % cols.max(1)));
            } else {
                header.push(format!("x{}", i - rows * cols));
            }
        }
        writer.write_record(&header).map_err(csv_err)?;
        log::info!("frame log: {}", path.display());
        Ok(Self {
            writer,
            columns: values,
        })
    }

    pub fn write(&mut self, frame: &ReportFrame) -> Result<()> {
        if frame.data.len() != self.columns {
            return Err(TouchError::InvalidState(format!(
                "frame {} has {} values, log expects {}",
                frame.index,
                frame.data.len(),
                self.columns
            )));
        }
        let mut record = Vec::with_capacity(self.columns + 1);
        record.push(frame.index.to_string());
        record.extend(frame.data.iter().map(|v| v.to_string()));
        self.writer.write_record(&record).map_err(csv_err)
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(TouchError::io("csv flush"))
    }
}

pub struct ResultLogger {
    writer: csv::Writer<File>,
}

impl ResultLogger {
    pub fn create(path: &Path) -> Result<Self> {
        let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
        writer
            .write_record(["test", "id", "result", "message"])
            .map_err(csv_err)?;
        Ok(Self { writer })
    }

    pub fn write(&mut self, item: &ItemReport) -> Result<()> {
        self.writer
            .write_record([
                item.kind.key().to_string(),
                format!("0x{:02X}", item.test_id),
                item.result.to_string(),
                item.message.clone(),
            ])
            .map_err(csv_err)
    }

    pub fn finish(mut self, passed: bool) -> Result<()> {
        self.writer
            .write_record(["aggregate", "", if passed { "PASS" } else { "FAIL" }, ""])
            .map_err(csv_err)?;
        self.writer.flush().map_err(TouchError::io("csv flush"))
    }
}
