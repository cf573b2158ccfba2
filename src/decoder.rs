//! Frame source
//!
//! Pulls media out of whatever the active adapter exposes and turns it into
//! per-frame events. Raw pipes are sliced into fixed-size RGB24 frames;
//! sample streams are forwarded as they arrive. Only the most recent frame
//! matters to a live preview, so nothing is buffered beyond the read in
//! flight.

use crate::error::CamlinkError;
use crate::protocols::MediaOutput;
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type FrameCallback = Arc<dyn Fn(Bytes) + Send + Sync>;
pub type DecodeErrorCallback = Arc<dyn Fn(CamlinkError) + Send + Sync>;

struct Task {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct FrameDecoder {
    frame_bytes: usize,
    frames: Arc<AtomicU64>,
    on_frame: Arc<Mutex<Option<FrameCallback>>>,
    on_error: Arc<Mutex<Option<DecodeErrorCallback>>>,
    task: tokio::sync::Mutex<Option<Task>>,
}

impl FrameDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        FrameDecoder {
            frame_bytes: width as usize * height as usize * 3,
            frames: Arc::new(AtomicU64::new(0)),
            on_frame: Arc::new(Mutex::new(None)),
            on_error: Arc::new(Mutex::new(None)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Replace the per-frame hook. Takes effect from the next frame.
    pub fn set_frame_callback(&self, callback: FrameCallback) {
        *self.on_frame.lock().unwrap() = Some(callback);
    }

    /// Replace the read-failure hook, fired once when the media source dies.
    pub fn set_error_callback(&self, callback: DecodeErrorCallback) {
        *self.on_error.lock().unwrap() = Some(callback);
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Begin consuming `output` on a background task. A second call while
    /// running is a no-op.
    pub async fn start(&self, output: MediaOutput) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let worker = Worker {
            frame_bytes: self.frame_bytes,
            frames: Arc::clone(&self.frames),
            on_frame: Arc::clone(&self.on_frame),
            on_error: Arc::clone(&self.on_error),
            token: token.clone(),
        };

        let handle = tokio::spawn(async move {
            match output {
                MediaOutput::RawVideoPipe(stdout) => worker.run_pipe(stdout).await,
                MediaOutput::RtpSamples(receiver) => worker.run_samples(receiver).await,
            }
        });

        *task = Some(Task { token, handle });
        info!("frame source started");
    }

    /// Stop the reader and wait for it to exit, so no frame callback can
    /// fire after this returns.
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        task.token.cancel();
        let _ = task.handle.await;
        info!("frame source stopped after {} frames", self.frames_decoded());
    }
}

struct Worker {
    frame_bytes: usize,
    frames: Arc<AtomicU64>,
    on_frame: Arc<Mutex<Option<FrameCallback>>>,
    on_error: Arc<Mutex<Option<DecodeErrorCallback>>>,
    token: CancellationToken,
}

impl Worker {
    fn emit(&self, frame: Bytes) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        let callback = self.on_frame.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(frame);
        }
    }

    fn fail(&self, message: String) {
        warn!("media source read failed: {}", message);
        let callback = self.on_error.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(CamlinkError::Decode(message));
        }
    }

    async fn run_pipe<R: AsyncRead + Unpin>(&self, mut reader: R) {
        let mut buf = BytesMut::zeroed(self.frame_bytes);
        loop {
            let read = tokio::select! {
                _ = self.token.cancelled() => break,
                read = reader.read_exact(&mut buf) => read,
            };
            match read {
                Ok(_) => self.emit(Bytes::copy_from_slice(&buf)),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("media pipe closed");
                    self.fail("media pipe closed".to_string());
                    break;
                }
                Err(e) => {
                    self.fail(e.to_string());
                    break;
                }
            }
        }
    }

    async fn run_samples(&self, mut receiver: tokio::sync::mpsc::Receiver<Bytes>) {
        loop {
            let sample = tokio::select! {
                _ = self.token.cancelled() => break,
                sample = receiver.recv() => sample,
            };
            match sample {
                Some(sample) => self.emit(sample),
                None => {
                    debug!("sample stream closed");
                    self.fail("sample stream closed".to_string());
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn counting(decoder: &FrameDecoder) -> Arc<Mutex<Vec<usize>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        decoder.set_frame_callback(Arc::new(move |frame| {
            sink.lock().unwrap().push(frame.len());
        }));
        seen
    }

    #[tokio::test]
    async fn slices_pipe_into_fixed_frames() {
        let decoder = FrameDecoder::new(4, 2);
        let seen = counting(&decoder);

        let (mut writer, reader) = tokio::io::duplex(256);
        let worker = Worker {
            frame_bytes: decoder.frame_bytes,
            frames: Arc::clone(&decoder.frames),
            on_frame: Arc::clone(&decoder.on_frame),
            on_error: Arc::clone(&decoder.on_error),
            token: CancellationToken::new(),
        };
        let reading = tokio::spawn(async move { worker.run_pipe(reader).await });

        writer.write_all(&[7u8; 4 * 2 * 3 * 2]).await.unwrap();
        drop(writer);
        reading.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![24, 24]);
        assert_eq!(decoder.frames_decoded(), 2);
    }

    #[tokio::test]
    async fn pipe_eof_reports_an_error() {
        let decoder = FrameDecoder::new(4, 2);
        let failed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&failed);
        decoder.set_error_callback(Arc::new(move |err| {
            *sink.lock().unwrap() = Some(err.to_string());
        }));

        let (writer, reader) = tokio::io::duplex(64);
        drop(writer);
        let worker = Worker {
            frame_bytes: decoder.frame_bytes,
            frames: Arc::clone(&decoder.frames),
            on_frame: Arc::clone(&decoder.on_frame),
            on_error: Arc::clone(&decoder.on_error),
            token: CancellationToken::new(),
        };
        worker.run_pipe(reader).await;

        assert!(failed.lock().unwrap().is_some());
        assert_eq!(decoder.frames_decoded(), 0);
    }

    #[tokio::test]
    async fn forwards_samples_as_frames() {
        let decoder = FrameDecoder::new(1280, 720);
        let seen = counting(&decoder);

        let (tx, rx) = mpsc::channel(8);
        decoder.start(MediaOutput::RtpSamples(rx)).await;

        tx.send(Bytes::from_static(b"abc")).await.unwrap();
        tx.send(Bytes::from_static(b"defgh")).await.unwrap();
        tokio::task::yield_now().await;
        while decoder.frames_decoded() < 2 {
            tokio::task::yield_now().await;
        }

        decoder.stop().await;
        assert_eq!(*seen.lock().unwrap(), vec![3, 5]);
    }

    #[tokio::test]
    async fn stop_without_start_is_fine() {
        let decoder = FrameDecoder::new(1280, 720);
        decoder.stop().await;
        decoder.stop().await;
    }

    #[tokio::test]
    async fn no_frames_arrive_after_stop() {
        let decoder = FrameDecoder::new(1280, 720);
        let seen = counting(&decoder);

        let (tx, rx) = mpsc::channel(8);
        decoder.start(MediaOutput::RtpSamples(rx)).await;
        decoder.stop().await;

        let _ = tx.send(Bytes::from_static(b"late")).await;
        tokio::task::yield_now().await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
