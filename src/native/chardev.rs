use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// A controller character node (`/dev/rmiN`, `/dev/tcmN`) that can be
/// opened and closed repeatedly over the life of a session.
pub struct CharNode {
    path: PathBuf,
    file: Option<File>,
}

impl CharNode {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
        }
    }

    pub fn open(&mut self) -> io::Result<()> {
        if self.file.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already open", self.path.display()),
            ));
        }
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.file = Some(file);
        Ok(())
    }

    pub fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => {
                drop(file);
                Ok(())
            }
            None => Err(not_open(&self.path)),
        }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        let path = &self.path;
        self.file.as_mut().ok_or_else(|| not_open(path))
    }

    /// Positional read; the driver maps the offset to a register address.
    pub fn read_at(&mut self, addr: u16, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file()?;
        file.read_exact_at(buf, addr as u64)?;
        Ok(buf.len())
    }

    pub fn write_at(&mut self, addr: u16, data: &[u8]) -> io::Result<usize> {
        let file = self.file()?;
        file.write_all_at(data, addr as u64)?;
        Ok(data.len())
    }

    pub fn read_stream(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file()?;
        file.read_exact(buf)?;
        Ok(buf.len())
    }

    pub fn write_stream(&mut self, data: &[u8]) -> io::Result<usize> {
        let file = self.file()?;
        file.write_all(data)?;
        Ok(data.len())
    }
}

fn not_open(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("{} is not open", path.display()),
    )
}
