// decompression is the only cpu heavy step, it runs on its own os threads so the request loop
// never stalls on a big gzip body
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::server::dtos::stats_dto::{WorkerPoolStats, WorkerStats};
use crate::server::utils::compression_utils::{CompressionError, ContentEncoding, decompress};

/// one unit of work, owns its input and the only handle to its result
struct WorkerTask {
    encoding: ContentEncoding,
    input: Bytes,
    reply: oneshot::Sender<Result<Vec<u8>, CompressionError>>,
}

struct WorkerHandle {
    sender: mpsc::Sender<WorkerTask>,
    // written by the submitting side only, workers never touch shared counters
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug)]
pub struct Decompressed {
    pub body: Bytes,
    pub duration: Duration,
}

pub struct DecompressionService {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
    queue_depth: usize,
    timeout: Duration,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    sync_fallbacks: AtomicU64,
}

fn run_worker(id: usize, mut tasks: mpsc::Receiver<WorkerTask>) {
    debug!("decompress-{} ready", id);

    while let Some(task) = tasks.blocking_recv() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            decompress(task.encoding, &task.input)
        }))
        .unwrap_or_else(|_| {
            error!("decompress-{} panicked on a {} body", id, task.encoding.as_header_value());
            Err(CompressionError::Panicked)
        });

        // the caller is gone if it timed out, the result just gets dropped
        let _ = task.reply.send(result);
    }

    debug!("decompress-{} shutting down", id);
}

impl DecompressionService {
    /// Spawn `worker_count` threads. Zero workers is allowed and means every task runs inline.
    pub fn new(worker_count: usize, queue_depth: usize, timeout: Duration) -> std::io::Result<Self> {
        let queue_depth = queue_depth.max(1);
        let mut workers = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let (sender, receiver) = mpsc::channel(queue_depth);
            thread::Builder::new()
                .name(format!("decompress-{}", id))
                .spawn(move || run_worker(id, receiver))?;

            workers.push(WorkerHandle {
                sender,
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            });
        }

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            queue_depth,
            timeout,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            sync_fallbacks: AtomicU64::new(0),
        })
    }

    /// round robin starting point, then the first worker with room in its queue
    fn dispatch(&self, mut task: WorkerTask) -> Result<usize, WorkerTask> {
        let count = self.workers.len();
        if count == 0 {
            return Err(task);
        }

        let start = self.next.fetch_add(1, Ordering::Relaxed) % count;
        for offset in 0..count {
            let id = (start + offset) % count;
            match self.workers[id].sender.try_send(task) {
                Ok(()) => return Ok(id),
                Err(e) => task = e.into_inner(),
            }
        }

        Err(task)
    }

    fn run_inline(&self, encoding: ContentEncoding, input: &[u8], started: Instant) -> Result<Decompressed, CompressionError> {
        self.sync_fallbacks.fetch_add(1, Ordering::Relaxed);

        match decompress(encoding, input) {
            Ok(body) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                Ok(Decompressed {
                    body: Bytes::from(body),
                    duration: started.elapsed(),
                })
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Decompress a whole body off the request loop.
    ///
    /// Full queues, a worker that died, or one that blows through the timeout all end up
    /// decompressing inline instead. A decode error from the worker is returned as is, running
    /// the same bytes again inline would just fail again.
    pub async fn decompress(&self, encoding: ContentEncoding, input: Bytes) -> Result<Decompressed, CompressionError> {
        let started = Instant::now();
        if !encoding.is_compressed() {
            return Ok(Decompressed {
                body: input,
                duration: Duration::ZERO,
            });
        }

        self.submitted.fetch_add(1, Ordering::Relaxed);

        let (reply, result) = oneshot::channel();
        let task = WorkerTask {
            encoding,
            input: input.clone(),
            reply,
        };

        let id = match self.dispatch(task) {
            Ok(id) => id,
            Err(_) => {
                warn!("every decompression queue is full, decoding {} bytes inline", input.len());
                return self.run_inline(encoding, &input, started);
            }
        };

        match tokio::time::timeout(self.timeout, result).await {
            Ok(Ok(Ok(body))) => {
                self.workers[id].completed.fetch_add(1, Ordering::Relaxed);
                self.completed.fetch_add(1, Ordering::Relaxed);
                Ok(Decompressed {
                    body: Bytes::from(body),
                    duration: started.elapsed(),
                })
            }
            Ok(Ok(Err(e))) => {
                self.workers[id].failed.fetch_add(1, Ordering::Relaxed);
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Ok(Err(_)) => {
                // reply sender dropped without an answer, the worker thread is gone
                error!("decompress-{} dropped its task, decoding inline", id);
                self.workers[id].failed.fetch_add(1, Ordering::Relaxed);
                self.run_inline(encoding, &input, started)
            }
            Err(_) => {
                warn!(
                    "decompress-{} took longer than {:?}, decoding inline",
                    id, self.timeout
                );
                self.run_inline(encoding, &input, started)
            }
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        WorkerPoolStats {
            worker_count: self.workers.len(),
            queue_depth: self.queue_depth,
            submitted: load(&self.submitted),
            completed: load(&self.completed),
            failed: load(&self.failed),
            sync_fallbacks: load(&self.sync_fallbacks),
            workers: self
                .workers
                .iter()
                .enumerate()
                .map(|(id, worker)| WorkerStats {
                    id,
                    completed: load(&worker.completed),
                    failed: load(&worker.failed),
                    queued: worker.sender.max_capacity() - worker.sender.capacity(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[tokio::test]
    async fn workers_decode_and_spread_the_load() {
        let pool = DecompressionService::new(2, 4, Duration::from_secs(5)).unwrap();
        let original = b"#EXTM3U\n#EXTINF:4,\nseg.ts\n".repeat(100);

        for _ in 0..4 {
            let out = pool
                .decompress(ContentEncoding::Gzip, gzip(&original))
                .await
                .unwrap();
            assert_eq!(&out.body[..], &original[..]);
        }

        let stats = pool.stats();
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.sync_fallbacks, 0);
        assert_eq!(stats.workers[0].completed, 2);
        assert_eq!(stats.workers[1].completed, 2);
    }

    #[tokio::test]
    async fn a_bad_body_resolves_to_an_error() {
        let pool = DecompressionService::new(1, 4, Duration::from_secs(5)).unwrap();
        let err = pool
            .decompress(ContentEncoding::Gzip, Bytes::from_static(b"\x47not gzip"))
            .await
            .unwrap_err();

        assert!(matches!(err, CompressionError::Decode { .. }));
        assert_eq!(pool.stats().failed, 1);
        assert_eq!(pool.stats().workers[0].failed, 1);
    }

    #[tokio::test]
    async fn no_workers_means_inline() {
        let pool = DecompressionService::new(0, 4, Duration::from_secs(5)).unwrap();
        let out = pool
            .decompress(ContentEncoding::Gzip, gzip(b"hello"))
            .await
            .unwrap();

        assert_eq!(&out.body[..], b"hello");
        assert_eq!(pool.stats().sync_fallbacks, 1);
    }

    /// one worker whose queue nobody drains, the receiver keeps the channel open
    fn stalled_pool(queue_depth: usize, timeout: Duration) -> (DecompressionService, mpsc::Receiver<WorkerTask>) {
        let (sender, receiver) = mpsc::channel(queue_depth);
        let pool = DecompressionService {
            workers: vec![WorkerHandle {
                sender,
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }],
            next: AtomicUsize::new(0),
            queue_depth,
            timeout,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            sync_fallbacks: AtomicU64::new(0),
        };
        (pool, receiver)
    }

    #[tokio::test]
    async fn a_stuck_worker_times_out_into_inline() {
        let (pool, _receiver) = stalled_pool(4, Duration::from_millis(20));
        let out = pool
            .decompress(ContentEncoding::Gzip, gzip(b"late"))
            .await
            .unwrap();

        assert_eq!(&out.body[..], b"late");
        let stats = pool.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.sync_fallbacks, 1);
        assert_eq!(stats.workers[0].completed, 0);
    }

    #[tokio::test]
    async fn a_full_queue_decodes_inline() {
        let (pool, mut receiver) = stalled_pool(1, Duration::from_secs(5));
        let (reply, _result) = oneshot::channel();
        pool.workers[0]
            .sender
            .try_send(WorkerTask {
                encoding: ContentEncoding::Gzip,
                input: gzip(b"queued"),
                reply,
            })
            .unwrap();
        assert_eq!(pool.stats().workers[0].queued, 1);

        let out = pool
            .decompress(ContentEncoding::Gzip, gzip(b"overflow"))
            .await
            .unwrap();

        assert_eq!(&out.body[..], b"overflow");
        assert_eq!(pool.stats().sync_fallbacks, 1);
        // only the task queued by hand ever reached the worker
        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn identity_skips_the_pool() {
        let pool = DecompressionService::new(1, 1, Duration::from_secs(1)).unwrap();
        let out = pool
            .decompress(ContentEncoding::Identity, Bytes::from_static(b"raw"))
            .await
            .unwrap();

        assert_eq!(&out.body[..], b"raw");
        assert_eq!(pool.stats().submitted, 0);
    }
}
