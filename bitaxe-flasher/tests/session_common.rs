//! Hardware free stand-ins for the serial port and the flashing library.
//!
//! Both share a count of currently open links, so a test can tell whether the log reader still
//! holds the port while the writer runs.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bitaxe_flasher::{
    DeviceInfo, Error, FirmwareWriter, PortInfo, PortOpener, Result, SerialSettings,
    serial::SerialLink,
};

pub struct MockLink {
    chunks: VecDeque<Vec<u8>>,
    broken: bool,
    open: Arc<AtomicUsize>,
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.chunks.pop_front() {
            Some(c) => {
                let n = c.len().min(buf.len());
                buf[..n].copy_from_slice(&c[..n]);
                Ok(n)
            }
            None if self.broken => Err(io::ErrorKind::BrokenPipe.into()),
            None => {
                std::thread::sleep(Duration::from_millis(5));
                Err(io::ErrorKind::TimedOut.into())
            }
        }
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockOpener {
    pub open: Arc<AtomicUsize>,
    pub opened: AtomicUsize,
    /// Data served by every link, one chunk per read
    pub script: Vec<Vec<u8>>,
    /// Links fail once the script runs out, like an unplugged device
    pub broken: bool,
    pub missing: bool,
}

impl MockOpener {
    pub fn with_script(open: Arc<AtomicUsize>, script: &[&[u8]]) -> Self {
        Self {
            open,
            script: script.iter().map(|x| x.to_vec()).collect(),
            ..Default::default()
        }
    }
}

impl PortOpener for MockOpener {
    fn open(&self, port: &str, _: &SerialSettings) -> io::Result<Box<dyn SerialLink>> {
        if self.missing {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{port} not found"),
            ));
        }

        self.open.fetch_add(1, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockLink {
            chunks: self.script.iter().cloned().collect(),
            broken: self.broken,
            open: self.open.clone(),
        }))
    }
}

#[derive(Default)]
pub struct MockWriter {
    pub open: Arc<AtomicUsize>,
    pub fail_probe: bool,
    pub writes: Mutex<Vec<(u32, usize)>>,
    pub resets: AtomicUsize,
}

impl MockWriter {
    pub fn new(open: Arc<AtomicUsize>) -> Self {
        Self {
            open,
            ..Default::default()
        }
    }

    fn check_free(&self, port: &PortInfo) -> Result<()> {
        if self.open.load(Ordering::SeqCst) == 0 {
            Ok(())
        } else {
            Err(Error::Flasher(format!("{port} is busy")))
        }
    }
}

impl FirmwareWriter for MockWriter {
    fn probe(&self, port: &PortInfo) -> Result<DeviceInfo> {
        if self.fail_probe {
            return Err(Error::Flasher("Failed to connect to the device".into()));
        }
        self.check_free(port)?;

        Ok(DeviceInfo {
            chip: "esp32s3".into(),
        })
    }

    fn write(
        &self,
        port: &PortInfo,
        image: &[u8],
        address: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        self.check_free(port)?;

        progress(0, image.len());
        progress(image.len() / 2, image.len());
        progress(image.len(), image.len());
        self.writes.lock().unwrap().push((address, image.len()));

        Ok(())
    }

    fn reset(&self, port: &PortInfo) -> Result<()> {
        self.check_free(port)?;
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
