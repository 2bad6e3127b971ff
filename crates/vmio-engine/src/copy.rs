//! Image copy
//!
//! The planner iterates source extents and submits COPY and ZERO
//! requests to a bounded queue shared by the worker pool. Workers may
//! execute requests out of order; destination content is well defined
//! only after all workers drained the queue and flushed.

use std::io::SeekFrom;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use vmio_backend::Backend;
use vmio_common::units::MIB;
use vmio_common::{AlignedBuffer, DirtyExtent, Error, Result, ZeroExtent};

use crate::progress::Progress;
use crate::queue::Queue;

// Limit request size to spread the workload over the workers and to
// get frequent progress updates when handling large extents.
const MAX_COPY_SIZE: u64 = 128 * MIB;
const MAX_ZERO_SIZE: u64 = 128 * MIB;

// NBD hard limit.
const MAX_BUFFER_SIZE: usize = (32 * MIB) as usize;

const DEFAULT_BUFFER_SIZE: usize = (4 * MIB) as usize;
const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_QUEUE_DEPTH: usize = 32;

/// One unit of work for a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    Copy { start: u64, length: u64 },
    Zero { start: u64, length: u64 },
    Stop,
}

/// Options for [`copy`].
#[derive(Clone)]
pub struct CopyOptions {
    /// Copy dirty extents instead of allocated data.
    pub dirty: bool,
    /// Zero the zero extents. When the destination is known to read as
    /// zeroes, skipping them avoids useless work.
    pub zero: bool,
    /// Zero hole extents. Must be disabled when copying into an image
    /// with a backing chain, so holes keep exposing the backing data.
    pub hole: bool,
    pub max_workers: usize,
    pub buffer_size: usize,
    pub queue_depth: usize,
    pub progress: Option<Arc<Progress>>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            dirty: false,
            zero: true,
            hole: true,
            max_workers: DEFAULT_MAX_WORKERS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            progress: None,
        }
    }
}

/// Copy the image behind `src` into `dst`.
///
/// The caller's handles are used to iterate extents and to clone the
/// per-worker handles; the extra source reader iterates extents while
/// the workers copy.
pub async fn copy(src: &mut dyn Backend, dst: &dyn Backend, options: &CopyOptions) -> Result<()> {
    let buffer_size = options.buffer_size.min(MAX_BUFFER_SIZE);

    let size = src.size().await?;
    if let Some(progress) = &options.progress {
        progress.set_size(size);
    }

    let workers = options
        .max_workers
        .min(src.max_readers().max(1) as usize)
        .min(dst.max_writers().max(1) as usize)
        .max(1);

    // Clone all worker pairs up front; connecting may fail and open
    // clones must not leak.
    let mut pairs = Vec::with_capacity(workers);
    for _ in 0..workers {
        match clone_pair(src, dst).await {
            Ok(pair) => pairs.push(pair),
            Err(err) => {
                for (mut src, mut dst) in pairs {
                    src.close().await;
                    dst.close().await;
                }
                return Err(err);
            }
        }
    }

    let queue = Arc::new(Queue::new(options.queue_depth));
    let errors = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<JoinHandle<()>> = pairs
        .into_iter()
        .enumerate()
        .map(|(index, (src, dst))| {
            let queue = Arc::clone(&queue);
            let errors = Arc::clone(&errors);
            let progress = options.progress.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    run_worker(src, dst, &queue, progress.as_deref(), buffer_size).await
                {
                    debug!("worker {index} failed: {err}");
                    // Cancel everything; remaining workers drain and
                    // exit.
                    errors.lock().push(err);
                    queue.close();
                }
            })
        })
        .collect();

    // Submit requests; a closed queue means some worker failed and
    // its error is already recorded.
    let planned = submit_requests(src, &queue, options).await;

    match &planned {
        Ok(()) => {
            for _ in 0..workers {
                if queue.put(Request::Stop).await.is_err() {
                    break;
                }
            }
        }
        Err(_) => queue.close(),
    }

    for handle in handles {
        let _ = handle.await;
    }

    if let Some(err) = errors.lock().drain(..).next() {
        return Err(err);
    }
    planned
}

async fn clone_pair(
    src: &dyn Backend,
    dst: &dyn Backend,
) -> Result<(Box<dyn Backend>, Box<dyn Backend>)> {
    let src_clone = src.clone_backend().await?;
    match dst.clone_backend().await {
        Ok(dst_clone) => Ok((src_clone, dst_clone)),
        Err(err) => {
            let mut src_clone = src_clone;
            src_clone.close().await;
            Err(err)
        }
    }
}

// ── Planner ───────────────────────────────────────────────────────────────────

struct Plan {
    requests: Vec<Request>,
    skipped: u64,
}

/// Plan a full copy from zero extents: copy data, zero the rest unless
/// disabled.
fn plan_zero(extents: &[ZeroExtent], zero: bool, hole: bool) -> Plan {
    let mut plan = Plan {
        requests: Vec::new(),
        skipped: 0,
    };
    for ext in extents {
        if ext.data() {
            plan.requests.push(Request::Copy {
                start: ext.start,
                length: ext.length,
            });
        } else if zero && (!ext.hole || hole) {
            plan.requests.push(Request::Zero {
                start: ext.start,
                length: ext.length,
            });
        } else {
            plan.skipped += ext.length;
        }
    }
    plan
}

/// Plan an incremental copy: clean extents are skipped entirely, the
/// destination must already reflect their content.
fn plan_dirty(extents: &[DirtyExtent]) -> Plan {
    let mut plan = Plan {
        requests: Vec::new(),
        skipped: 0,
    };
    for ext in extents {
        if ext.dirty {
            if ext.data() {
                plan.requests.push(Request::Copy {
                    start: ext.start,
                    length: ext.length,
                });
            } else {
                plan.requests.push(Request::Zero {
                    start: ext.start,
                    length: ext.length,
                });
            }
        } else {
            plan.skipped += ext.length;
        }
    }
    plan
}

/// Split an oversized request so the workload spreads over all
/// workers.
fn split_request(req: Request) -> Vec<Request> {
    let (step, start, length, zero) = match req {
        Request::Copy { start, length } => (MAX_COPY_SIZE, start, length, false),
        Request::Zero { start, length } => (MAX_ZERO_SIZE, start, length, true),
        Request::Stop => return vec![Request::Stop],
    };

    let mut parts = Vec::new();
    let mut start = start;
    let mut length = length;
    while length > step {
        parts.push(make_request(start, step, zero));
        start += step;
        length -= step;
    }
    parts.push(make_request(start, length, zero));
    parts
}

const fn make_request(start: u64, length: u64, zero: bool) -> Request {
    if zero {
        Request::Zero { start, length }
    } else {
        Request::Copy { start, length }
    }
}

async fn submit_requests(
    src: &mut dyn Backend,
    queue: &Queue<Request>,
    options: &CopyOptions,
) -> Result<()> {
    let plan = if options.dirty {
        plan_dirty(&src.dirty_extents().await?)
    } else {
        plan_zero(&src.zero_extents().await?, options.zero, options.hole)
    };

    if let Some(progress) = &options.progress {
        progress.update(plan.skipped);
    }

    for req in plan.requests {
        for part in split_request(req) {
            if queue.put(part).await.is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

// ── Workers ───────────────────────────────────────────────────────────────────

async fn run_worker(
    mut src: Box<dyn Backend>,
    mut dst: Box<dyn Backend>,
    queue: &Queue<Request>,
    progress: Option<&Progress>,
    buffer_size: usize,
) -> Result<()> {
    let result = worker_loop(src.as_mut(), dst.as_mut(), queue, progress, buffer_size).await;
    // An error closing the destination fails the copy; the source is
    // closed on a best effort basis.
    dst.close().await;
    src.close().await;
    result
}

async fn worker_loop(
    src: &mut dyn Backend,
    dst: &mut dyn Backend,
    queue: &Queue<Request>,
    progress: Option<&Progress>,
    buffer_size: usize,
) -> Result<()> {
    let mut buf = AlignedBuffer::new(buffer_size);

    loop {
        let Ok(req) = queue.get().await else {
            debug!("worker cancelled");
            return Ok(());
        };

        match req {
            Request::Zero { start, length } => {
                dst.seek(SeekFrom::Start(start)).await?;
                let mut todo = length;
                while todo > 0 {
                    let n = dst.zero(todo).await?;
                    if n == 0 {
                        return Err(Error::internal("backend refused to zero"));
                    }
                    todo -= n;
                }
                if let Some(progress) = progress {
                    progress.update(length);
                }
            }
            Request::Copy { start, length } => {
                src.seek(SeekFrom::Start(start)).await?;
                dst.seek(SeekFrom::Start(start)).await?;

                if dst.can_read_from() {
                    dst.read_from(src, length, &mut buf).await?;
                } else if src.can_write_to() {
                    src.write_to(dst, length, &mut buf).await?;
                } else {
                    generic_copy(src, dst, length, &mut buf).await?;
                }

                if let Some(progress) = progress {
                    progress.update(length);
                }
            }
            Request::Stop => {
                dst.flush().await?;
                return Ok(());
            }
        }
    }
}

async fn generic_copy(
    src: &mut dyn Backend,
    dst: &mut dyn Backend,
    length: u64,
    buf: &mut AlignedBuffer,
) -> Result<()> {
    let mut todo = length;
    while todo > 0 {
        let step = todo.min(buf.len() as u64) as usize;
        let n = src.readinto(&mut buf.as_mut_slice()[..step]).await?;
        if n == 0 {
            return Err(Error::PartialContent {
                requested: length,
                available: length - todo,
            });
        }

        let mut chunk = &buf.as_slice()[..n];
        while !chunk.is_empty() {
            let written = dst.write(chunk).await?;
            if written == 0 {
                return Err(Error::internal("backend refused to write"));
            }
            chunk = &chunk[written..];
        }
        todo -= n as u64;
    }
    Ok(())
}
