//! Chunked I/Q readers
//!
//! Convenience wrappers around a single-channel [`RspSource`]: [`RspReader`]
//! is a blocking iterator of sample chunks and [`AsyncRspReader`] a
//! [`Stream`] of the same chunks, fed by a reader thread.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use num_complex::Complex;
use tracing::debug;

use crate::controller::DeviceController;
use crate::error::{Error, Result};
use crate::port::{Health, Produced};
use crate::source::RspSource;

/// Wait between polls of an empty ring buffer.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/**
 * Synchronous RSP I/Q Reader
 */
pub struct RspReader {
    source: RspSource,
    buf: Vec<Complex<f32>>,
    finished: bool,
}

impl RspReader {
    /// Start streaming from `controller` and read chunks of up to
    /// `chunk_size` samples.
    pub fn new(controller: DeviceController, chunk_size: usize) -> Result<Self> {
        if controller.channels() != 1 {
            return Err(Error::unsupported(
                "dual tuner streams must be read with RspSource",
            ));
        }
        let mut source = RspSource::new(controller)?;
        source.start()?;
        Ok(Self {
            source,
            buf: vec![Complex::default(); chunk_size.max(1)],
            finished: false,
        })
    }

    pub fn controller(&self) -> &DeviceController {
        self.source.controller()
    }

    /// Stop the stream; the iterator ends once the buffer is drained.
    pub fn stop(&mut self) -> Result<()> {
        self.source.stop()
    }

    pub fn health(&self) -> Option<Health> {
        self.source.health().into_iter().next()
    }

    /// Read one chunk without waiting; `Pending` while the buffer is empty.
    fn poll_chunk(&mut self) -> Poll<Option<Result<Vec<Complex<f32>>>>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.source.work(&mut [&mut self.buf[..]]) {
            Produced::Items(0) => Poll::Pending,
            Produced::Items(n) => Poll::Ready(Some(Ok(self.buf[..n].to_vec()))),
            Produced::Done => {
                self.finished = true;
                let faulted = self.health().is_some_and(|h| h.faulted);
                Poll::Ready(faulted.then(|| Err(Error::fault("stream closed by a device error"))))
            }
        }
    }
}

impl Iterator for RspReader {
    type Item = Result<Vec<Complex<f32>>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.poll_chunk() {
                Poll::Pending => std::thread::sleep(POLL_INTERVAL),
                Poll::Ready(chunk) => return chunk,
            }
        }
    }
}

/**
 * Asynchronous RSP I/Q Reader
 */
pub struct AsyncRspReader {
    rx: tokio::sync::mpsc::Receiver<Result<Vec<Complex<f32>>>>,
    _handle: std::thread::JoinHandle<()>,
}

impl AsyncRspReader {
    /// Start streaming from `controller` on a reader thread.
    ///
    /// The stream ends when the device stops or when the reader is dropped,
    /// which also closes the device.
    pub fn new(controller: DeviceController, chunk_size: usize) -> Result<Self> {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Vec<Complex<f32>>>>(32);
        let (tx_init, rx_init) = std::sync::mpsc::channel::<Result<()>>();

        let handle = std::thread::Builder::new()
            .name("rsp-reader".to_string())
            .spawn(move || match RspReader::new(controller, chunk_size) {
                Ok(mut reader) => {
                    let _ = tx_init.send(Ok(()));
                    loop {
                        if tx.is_closed() {
                            debug!("reader dropped, closing device");
                            return;
                        }
                        match reader.poll_chunk() {
                            Poll::Pending => std::thread::sleep(POLL_INTERVAL),
                            Poll::Ready(None) => return,
                            Poll::Ready(Some(chunk)) => {
                                if tx.blocking_send(chunk).is_err() {
                                    debug!("reader dropped, closing device");
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = tx_init.send(Err(e));
                }
            })?;

        match rx_init.recv() {
            Ok(Ok(())) => Ok(Self {
                rx,
                _handle: handle,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::fault("reader thread exited during start")),
        }
    }
}

impl Stream for AsyncRspReader {
    type Item = Result<Vec<Complex<f32>>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
