//! /images/{id} handlers
//!
//! Ranged read and write on the image behind a ticket, PATCH for zero
//! and flush, and the OPTIONS capability reply.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Frame;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use vmio_auth::Ticket;
use vmio_auth::ticket::{Context, Op};
use vmio_common::{Clock, Error, Result};

use crate::errors::{ApiError, ApiResult};
use crate::range::{ContentRange, Range};
use crate::state::{SharedState, checkin, checkout};

const BASE_FEATURES: [&str; 2] = ["checksum", "extents"];
const ALL_FEATURES: [&str; 4] = ["checksum", "extents", "flush", "zero"];

/// Verify that `[offset, offset + size)` is inside the window permitted
/// by the ticket.
pub fn allowed_range(offset: u64, size: u64, ticket: &Ticket) -> Result<()> {
    let end = offset
        .checked_add(size)
        .ok_or_else(|| Error::Forbidden("requested range overflows".to_string()))?;
    if end > ticket.size() {
        return Err(Error::Forbidden(format!(
            "requested range {offset}-{end} exceeds permitted size {}",
            ticket.size()
        )));
    }
    Ok(())
}

fn query_flag(query: &HashMap<String, String>, name: &str) -> bool {
    query.get(name).map(String::as_str) == Some("y")
}

// ── PUT ───────────────────────────────────────────────────────────────────────

pub async fn put(
    State(state): State<SharedState>,
    Path(ticket_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Response> {
    let close = query_flag(&query, "close");
    // For backward compatibility, flush by default.
    let flush = match query.get("flush").map(String::as_str) {
        None | Some("y") => true,
        Some("n") => false,
        Some(other) => {
            return Err(Error::invalid_argument(format!(
                "invalid flush value {other:?}, expecting y or n"
            ))
            .into());
        }
    };

    let size = content_length(&headers)?;
    let offset = match headers.get(header::CONTENT_RANGE) {
        Some(value) => {
            let value = header_str(value)?;
            ContentRange::parse(value)?.first
        }
        None => 0,
    };

    let ticket = state.auth.authorize(&ticket_id, Op::Write)?;
    allowed_range(offset, size, &ticket)?;

    debug!(
        transfer = ticket.transfer_id(),
        size, offset, flush, close, "WRITE"
    );

    let clock = Clock::new();
    let mut ctx = checkout(&state, &ticket).await?;
    let result = write_op(&mut ctx, body, offset, size, flush, &ticket, &clock).await;
    checkin(&ticket, ctx, result.is_err()).await;
    debug!(transfer = ticket.transfer_id(), %clock, "WRITE done");
    result?;

    Ok(ok_response(close))
}

async fn write_op(
    ctx: &mut Context,
    body: Body,
    offset: u64,
    size: u64,
    flush: bool,
    ticket: &Ticket,
    clock: &Clock,
) -> Result<()> {
    let Context { backend, buffer } = ctx;
    let backend = backend.as_mut();
    backend.seek(SeekFrom::Start(offset)).await?;

    let mut body = body;
    let mut received = 0u64;
    let mut fill = 0usize;

    loop {
        let frame = {
            let _timer = clock.run("read");
            body.frame().await
        };
        let Some(frame) = frame else { break };
        let frame = frame.map_err(|err| Error::Io(std::io::Error::other(err)))?;
        let Some(data) = frame.data_ref() else {
            continue;
        };

        if ticket.canceled() {
            return Err(Error::Forbidden(format!(
                "ticket {} was canceled",
                ticket.uuid()
            )));
        }

        received += data.len() as u64;
        if received > size {
            return Err(Error::invalid_argument(format!(
                "client sent {received} bytes, expected {size}"
            )));
        }

        let mut chunk = &data[..];
        while !chunk.is_empty() {
            let step = chunk.len().min(buffer.len() - fill);
            buffer.as_mut_slice()[fill..fill + step].copy_from_slice(&chunk[..step]);
            fill += step;
            chunk = &chunk[step..];
            if fill == buffer.len() {
                let _timer = clock.run("write");
                write_all(backend, buffer.as_slice()).await?;
                fill = 0;
            }
        }
    }

    if received < size {
        return Err(Error::PartialContent {
            requested: size,
            available: received,
        });
    }

    if fill > 0 {
        let _timer = clock.run("write");
        write_all(backend, &buffer.as_slice()[..fill]).await?;
    }

    if flush {
        let _timer = clock.run("flush");
        backend.flush().await?;
    }

    Ok(())
}

async fn write_all(backend: &mut dyn vmio_backend::Backend, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = backend.write(buf).await?;
        if n == 0 {
            return Err(Error::internal("backend refused to make progress"));
        }
        buf = &buf[n..];
    }
    Ok(())
}

// ── GET ───────────────────────────────────────────────────────────────────────

pub async fn get(
    State(state): State<SharedState>,
    Path(ticket_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let close = query_flag(&query, "close");

    let range = match headers.get(header::RANGE) {
        Some(value) => Some(Range::parse(header_str(value)?)?),
        None => None,
    };
    if matches!(range, Some(Range::Suffix { .. })) {
        return Err(Error::RangeNotSatisfiable(
            "suffix-byte-range-spec not supported".to_string(),
        )
        .into());
    }

    let ticket = state.auth.authorize(&ticket_id, Op::Read)?;
    let mut ctx = checkout(&state, &ticket).await?;

    let prepared = prepare_read(&ticket, &mut ctx, range).await;
    let (offset, size) = match prepared {
        Ok(window) => window,
        Err(err) => {
            checkin(&ticket, ctx, true).await;
            return Err(err.into());
        }
    };

    debug!(
        transfer = ticket.transfer_id(),
        size, offset, close, "READ"
    );

    let mut content_disposition = "attachment".to_string();
    if let Some(filename) = ticket.filename() {
        content_disposition.push_str("; filename=");
        content_disposition.push_str(filename);
    }

    let mut response = Response::builder()
        .status(if range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::CONTENT_LENGTH, size)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_DISPOSITION, content_disposition);
    if range.is_some() {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", offset, offset + size - 1, ticket.size()),
        );
    }
    if close {
        response = response.header(header::CONNECTION, "close");
    }

    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(stream_task(ticket, ctx, offset, size, tx));

    response
        .body(Body::new(StreamBody { rx }))
        .map_err(|err| ApiError(Error::internal(err.to_string())))
}

/// Validate the requested window against the ticket and the image.
async fn prepare_read(
    ticket: &Ticket,
    ctx: &mut Context,
    range: Option<Range>,
) -> Result<(u64, u64)> {
    let backend_size = ctx.backend.size().await?;
    let available = ticket.size().min(backend_size);

    match range {
        Some(Range::FromTo { first, last }) => match last {
            Some(last) => {
                let size = last - first + 1;
                allowed_range(first, size, ticket)?;
                if first + size > available {
                    return Err(Error::RangeNotSatisfiable(format!(
                        "requested range {first}-{last} exceeds image size {available}"
                    )));
                }
                Ok((first, size))
            }
            None => {
                let size = available.checked_sub(first).filter(|&n| n > 0).ok_or_else(|| {
                    Error::RangeNotSatisfiable(format!(
                        "requested range starts after image size {available}"
                    ))
                })?;
                Ok((first, size))
            }
        },
        // range::Suffix was rejected by the caller.
        Some(Range::Suffix { .. }) => unreachable!("suffix range must be rejected earlier"),
        None => Ok((0, available)),
    }
}

async fn stream_task(
    ticket: Arc<Ticket>,
    mut ctx: Context,
    offset: u64,
    size: u64,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
) {
    let clock = Clock::new();
    let result = stream_image(&mut ctx, offset, size, &ticket, &clock, &tx).await;
    if let Err(err) = &result {
        debug!(transfer = ticket.transfer_id(), "READ failed: {err}");
        // The status line was already sent; erroring the body stream
        // aborts the connection so the client cannot mistake a partial
        // download for a complete one.
        let _ = tx.send(Err(std::io::Error::other(err.to_string()))).await;
    }
    checkin(&ticket, ctx, result.is_err()).await;
    debug!(transfer = ticket.transfer_id(), %clock, "READ done");
}

async fn stream_image(
    ctx: &mut Context,
    offset: u64,
    size: u64,
    ticket: &Ticket,
    clock: &Clock,
    tx: &mpsc::Sender<std::io::Result<Bytes>>,
) -> Result<()> {
    let Context { backend, buffer } = ctx;
    let backend = backend.as_mut();

    // Direct I/O needs aligned reads: start at the containing block
    // and skip the unwanted head of the first chunk.
    let block_size = backend.block_size() as u64;
    let mut skip = (offset % block_size) as usize;
    backend.seek(SeekFrom::Start(offset - skip as u64)).await?;

    let mut todo = size;
    while todo > 0 {
        if ticket.canceled() {
            return Err(Error::Forbidden(format!(
                "ticket {} was canceled",
                ticket.uuid()
            )));
        }

        let want = round_up(skip as u64 + todo, block_size).min(buffer.len() as u64) as usize;
        let n = {
            let _timer = clock.run("read");
            backend.readinto(&mut buffer.as_mut_slice()[..want]).await?
        };
        if n <= skip {
            return Err(Error::PartialContent {
                requested: size,
                available: size - todo,
            });
        }

        let chunk = ((n - skip) as u64).min(todo) as usize;
        if tx
            .send(Ok(Bytes::copy_from_slice(
                &buffer.as_slice()[skip..skip + chunk],
            )))
            .await
            .is_err()
        {
            return Err(Error::internal("client closed the connection"));
        }
        todo -= chunk as u64;
        skip = 0;
    }
    Ok(())
}

fn round_up(n: u64, size: u64) -> u64 {
    vmio_common::units::round_up(n, size)
}

/// Response body fed by the image streaming task.
struct StreamBody {
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
}

impl hyper::body::Body for StreamBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, std::io::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(data))) => Poll::Ready(Some(Ok(Frame::data(data)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ── PATCH ─────────────────────────────────────────────────────────────────────

pub async fn patch(
    State(state): State<SharedState>,
    Path(ticket_id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let msg: Value = serde_json::from_slice(&body)
        .map_err(|err| ApiError(Error::invalid_argument(format!("invalid JSON message: {err}"))))?;

    match msg["op"].as_str() {
        Some("zero") => zero(&state, &ticket_id, &msg).await,
        Some("flush") => flush(&state, &ticket_id).await,
        other => Err(Error::invalid_argument(format!(
            "invalid op {other:?}, expecting \"zero\" or \"flush\""
        ))
        .into()),
    }
}

async fn zero(state: &SharedState, ticket_id: &str, msg: &Value) -> ApiResult<Response> {
    let size = msg["size"]
        .as_u64()
        .ok_or_else(|| ApiError(Error::invalid_argument("size is required and must be >= 0")))?;
    let offset = match msg.get("offset") {
        None => 0,
        Some(value) => value
            .as_u64()
            .ok_or_else(|| ApiError(Error::invalid_argument("offset must be >= 0")))?,
    };
    let flush = match msg.get("flush") {
        None => false,
        Some(value) => value
            .as_bool()
            .ok_or_else(|| ApiError(Error::invalid_argument("flush must be a boolean")))?,
    };

    let ticket = state.auth.authorize(ticket_id, Op::Write)?;
    allowed_range(offset, size, &ticket)?;

    debug!(
        transfer = ticket.transfer_id(),
        size, offset, flush, "ZERO"
    );

    let clock = Clock::new();
    let mut ctx = checkout(state, &ticket).await?;
    let result = zero_op(&mut ctx, offset, size, flush, &ticket, &clock).await;
    checkin(&ticket, ctx, result.is_err()).await;
    debug!(transfer = ticket.transfer_id(), %clock, "ZERO done");
    result?;

    Ok(ok_response(false))
}

async fn zero_op(
    ctx: &mut Context,
    offset: u64,
    size: u64,
    flush: bool,
    ticket: &Ticket,
    clock: &Clock,
) -> Result<()> {
    let backend = ctx.backend.as_mut();
    backend.seek(SeekFrom::Start(offset)).await?;

    let mut todo = size;
    while todo > 0 {
        if ticket.canceled() {
            return Err(Error::Forbidden(format!(
                "ticket {} was canceled",
                ticket.uuid()
            )));
        }
        let n = {
            let _timer = clock.run("zero");
            backend.zero(todo).await?
        };
        if n == 0 {
            return Err(Error::internal("backend refused to zero"));
        }
        todo -= n;
    }

    if flush {
        let _timer = clock.run("flush");
        backend.flush().await?;
    }
    Ok(())
}

async fn flush(state: &SharedState, ticket_id: &str) -> ApiResult<Response> {
    let ticket = state.auth.authorize(ticket_id, Op::Write)?;

    debug!(transfer = ticket.transfer_id(), "FLUSH");

    let clock = Clock::new();
    let mut ctx = checkout(state, &ticket).await?;
    let result = {
        let _timer = clock.run("flush");
        ctx.backend.flush().await
    };
    checkin(&ticket, ctx, result.is_err()).await;
    result?;

    Ok(ok_response(false))
}

// ── OPTIONS ───────────────────────────────────────────────────────────────────

pub async fn options(
    State(state): State<SharedState>,
    Path(ticket_id): Path<String>,
) -> ApiResult<Response> {
    let mut options = json!({});
    if let Some(socket) = &state.unix_socket {
        options["unix_socket"] = json!(socket);
    }

    let allow;
    if ticket_id == "*" {
        // Meta capabilities for all images, no ticket required.
        allow = "OPTIONS,GET,PUT,PATCH".to_string();
        options["features"] = json!(ALL_FEATURES);
    } else {
        let ticket = state.auth.authorize(&ticket_id, Op::Read)?;

        // Accessing ticket options counts as client activity.
        ticket.touch();

        let mut verbs = vec!["OPTIONS", "GET"];
        options["features"] = json!(BASE_FEATURES);
        if ticket.may(Op::Write) {
            verbs.extend(["PUT", "PATCH"]);
            options["features"] = json!(ALL_FEATURES);
        }
        allow = verbs.join(",");

        // Backend specific limits.
        let ctx = checkout(&state, &ticket).await?;
        options["max_readers"] = json!(ctx.backend.max_readers());
        options["max_writers"] = json!(ctx.backend.max_writers());
        checkin(&ticket, ctx, false).await;
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::ALLOW, allow)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(options.to_string()))
        .map_err(|err| ApiError(Error::internal(err.to_string())))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn content_length(headers: &HeaderMap) -> Result<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| Error::invalid_argument("Content-Length header is required"))
}

fn header_str(value: &header::HeaderValue) -> Result<&str> {
    value
        .to_str()
        .map_err(|_| Error::invalid_argument("invalid header encoding"))
}

fn ok_response(close: bool) -> Response {
    let mut response = Response::new(Body::empty());
    if close {
        response
            .headers_mut()
            .insert(header::CONNECTION, header::HeaderValue::from_static("close"));
    }
    response
}
