//! Live serial log.
//!
//! The reader runs on a blocking thread and owns the open port. Stopping the stream cancels the
//! reader and waits for it, so the port is closed by the time [`LogStream::stop`] returns.

use std::{io, sync::Arc, time::Duration};

use futures::channel::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    Error, Result,
    serial::{PortOpener, SerialLink, SerialSettings},
    transcript::TranscriptHandle,
};

const READ_CHUNK: usize = 1024;
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct LogStream {
    port: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl LogStream {
    /// Open `port` and start copying everything it sends into `transcript`. Decoded text is also
    /// forwarded to `lines`, if given. Text is dropped from the channel (not the transcript) when
    /// the receiver falls behind.
    pub async fn start<O>(
        opener: Arc<O>,
        port: &str,
        settings: SerialSettings,
        transcript: TranscriptHandle,
        lines: Option<mpsc::Sender<String>>,
    ) -> Result<Self>
    where
        O: PortOpener + ?Sized,
    {
        let name = port.to_string();
        let link = tokio::task::spawn_blocking(move || opener.open(&name, &settings))
            .await?
            .map_err(|source| Error::OpenPort {
                port: port.to_string(),
                source,
            })?;
        info!("Serial log started on {port}");

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task =
            tokio::task::spawn_blocking(move || read_loop(link, token, transcript, lines));

        Ok(Self {
            port: port.to_string(),
            cancel,
            task: Some(task),
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// The reader exited on its own, which only happens on a read error.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop reading and release the port. Returns the read error that ended the stream early,
    /// if any.
    pub async fn stop(mut self) -> Result<()> {
        self.cancel.cancel();

        let res = match self.task.take() {
            Some(t) => t.await?,
            None => Ok(()),
        };
        info!("Serial log stopped on {}", self.port);

        res
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        // Reader notices on its next timeout and closes the port
        self.cancel.cancel();
    }
}

fn read_loop(
    mut link: Box<dyn SerialLink>,
    cancel: CancellationToken,
    transcript: TranscriptHandle,
    mut lines: Option<mpsc::Sender<String>>,
) -> Result<()> {
    let mut buf = [0u8; READ_CHUNK];
    let mut lagging = false;

    while !cancel.is_cancelled() {
        let count = match link.read(&mut buf) {
            Ok(0) => {
                std::thread::sleep(IDLE_BACKOFF);
                continue;
            }
            Ok(x) => x,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!("Serial read failed: {e}");
                return Err(Error::Serial(e));
            }
        };

        debug!("Read {count} bytes");
        let text = transcript.push_bytes(&buf[..count]);
        if text.is_empty() {
            continue;
        }

        if let Some(chan) = lines.as_mut() {
            match chan.try_send(text) {
                Ok(()) => lagging = false,
                Err(e) if e.is_disconnected() => lines = None,
                Err(_) => {
                    if !lagging {
                        warn!("Log consumer is lagging, dropping output");
                    }
                    lagging = true;
                }
            }
        }
    }

    Ok(())
}
