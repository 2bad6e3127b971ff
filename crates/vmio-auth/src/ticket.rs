//! Tickets
//!
//! A ticket binds a transfer id to a backing resource, the permitted
//! operations, and a size window. Tickets are built from the JSON
//! documents received on the control socket; every field is validated
//! with a field-specific error so callers can fix their request.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::debug;

use vmio_backend::{Backend, ImageUrl};
use vmio_common::AlignedBuffer;

use crate::error::AuthError;

/// Ticket expiration used when the control request does not set one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// A backend handle with its transfer buffer, cached per ticket.
pub struct Context {
    pub backend: Box<dyn Backend>,
    pub buffer: AlignedBuffer,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub async fn close(&mut self) {
        self.backend.close().await;
    }
}

/// Operations a ticket may allow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

impl Op {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

#[derive(Debug)]
struct Expiry {
    deadline: Instant,
    accessed: Instant,
}

#[derive(Debug)]
struct Pool {
    idle: Vec<Context>,
    active: usize,
    canceled: bool,
}

/// An authorization record for one transfer.
#[derive(Debug)]
pub struct Ticket {
    uuid: String,
    url: ImageUrl,
    url_text: String,
    size: u64,
    ops: Vec<Op>,
    sparse: bool,
    dirty: bool,
    transfer_id: String,
    filename: Option<String>,
    timeout: Duration,
    inactivity_timeout: Option<Duration>,

    expiry: Mutex<Expiry>,
    pool: Mutex<Pool>,
    // Signaled whenever a context is returned, waking remove().
    released: Notify,
}

impl Ticket {
    /// Build a validated ticket from a control request document.
    pub fn from_value(value: &Value) -> Result<Self, AuthError> {
        let obj = value
            .as_object()
            .ok_or_else(|| AuthError::invalid("ticket", "expecting a JSON object"))?;

        let uuid = required_str(obj, "uuid")?;
        let size = required_u64(obj, "size")?;

        let url_text = required_str(obj, "url")?;
        let url: ImageUrl = url_text
            .parse()
            .map_err(|err| AuthError::invalid("url", format!("{err}")))?;

        let ops_value = obj
            .get("ops")
            .ok_or(AuthError::MissingParameter("ops"))?
            .as_array()
            .ok_or_else(|| AuthError::invalid("ops", "expecting a list"))?;
        let mut ops = Vec::new();
        for op in ops_value {
            match op.as_str() {
                Some("read") => ops.push(Op::Read),
                Some("write") => ops.push(Op::Write),
                other => {
                    return Err(AuthError::invalid(
                        "ops",
                        format!("expecting \"read\" or \"write\", got {other:?}"),
                    ));
                }
            }
        }
        if ops.is_empty() {
            return Err(AuthError::invalid("ops", "expecting at least one operation"));
        }

        let timeout = match obj.get("timeout") {
            Some(value) => Duration::from_secs(
                value
                    .as_u64()
                    .ok_or_else(|| AuthError::invalid("timeout", "expecting an integer"))?,
            ),
            None => DEFAULT_TIMEOUT,
        };

        let inactivity_timeout = obj
            .get("inactivity_timeout")
            .map(|value| {
                value
                    .as_u64()
                    .map(Duration::from_secs)
                    .ok_or_else(|| AuthError::invalid("inactivity_timeout", "expecting an integer"))
            })
            .transpose()?;

        let now = Instant::now();
        Ok(Self {
            uuid,
            url,
            url_text,
            size,
            ops,
            sparse: optional_bool(obj, "sparse")?,
            dirty: optional_bool(obj, "dirty")?,
            transfer_id: obj
                .get("transfer_id")
                .and_then(Value::as_str)
                .unwrap_or("(unknown)")
                .to_string(),
            filename: obj
                .get("filename")
                .and_then(Value::as_str)
                .map(str::to_string),
            timeout,
            inactivity_timeout,
            expiry: Mutex::new(Expiry {
                deadline: now + timeout,
                accessed: now,
            }),
            pool: Mutex::new(Pool {
                idle: Vec::new(),
                active: 0,
                canceled: false,
            }),
            released: Notify::new(),
        })
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn url(&self) -> &ImageUrl {
        &self.url
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn sparse(&self) -> bool {
        self.sparse
    }

    #[must_use]
    pub const fn dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    #[must_use]
    pub const fn inactivity_timeout(&self) -> Option<Duration> {
        self.inactivity_timeout
    }

    /// Whether the ticket allows an operation. A write ticket also
    /// allows reading, so upload clients can probe capabilities and
    /// verify their upload.
    #[must_use]
    pub fn may(&self, op: Op) -> bool {
        match op {
            Op::Read => self
                .ops
                .iter()
                .any(|&o| o == Op::Read || o == Op::Write),
            Op::Write => self.ops.contains(&Op::Write),
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expiry.lock().deadline
    }

    #[must_use]
    pub fn canceled(&self) -> bool {
        self.pool.lock().canceled
    }

    /// Record client activity, postponing the inactivity expiration.
    pub fn touch(&self) {
        let mut expiry = self.expiry.lock();
        let now = Instant::now();
        expiry.accessed = now;
        let timeout = self.inactivity_timeout.unwrap_or(self.timeout);
        expiry.deadline = expiry.deadline.max(now + timeout);
    }

    /// Extend the expiration to `timeout` from now.
    pub fn extend(&self, timeout: Duration) {
        self.expiry.lock().deadline = Instant::now() + timeout;
    }

    /// Check an idle context out of the ticket pool, marking one more
    /// running operation. Returns None when the caller must open a new
    /// backend.
    pub fn take_context(&self) -> Result<Option<Context>, AuthError> {
        let mut pool = self.pool.lock();
        if pool.canceled {
            return Err(AuthError::Forbidden(format!(
                "ticket {} was canceled",
                self.uuid
            )));
        }
        pool.active += 1;
        Ok(pool.idle.pop())
    }

    /// Return a context after use. If the ticket was canceled
    /// meanwhile the context is closed instead of pooled.
    pub async fn release_context(&self, ctx: Context) {
        let leftover = {
            let mut pool = self.pool.lock();
            pool.active -= 1;
            if pool.canceled {
                Some(ctx)
            } else {
                pool.idle.push(ctx);
                None
            }
        };
        if let Some(mut ctx) = leftover {
            ctx.close().await;
        }
        self.released.notify_waiters();
    }

    /// Drop an operation slot taken with [`take_context`] without
    /// returning a context, e.g. when opening the backend failed.
    pub fn release_slot(&self) {
        self.pool.lock().active -= 1;
        self.released.notify_waiters();
    }

    /// Number of contexts currently checked out.
    #[must_use]
    pub fn active_contexts(&self) -> usize {
        self.pool.lock().active
    }

    /// Cancel the ticket: close idle contexts and wait until running
    /// operations return theirs, or fail with a cancel timeout.
    pub(crate) async fn cancel(&self, timeout: Duration) -> Result<(), AuthError> {
        debug!(uuid = self.uuid, transfer = self.transfer_id, "canceling ticket");

        let idle = {
            let mut pool = self.pool.lock();
            pool.canceled = true;
            std::mem::take(&mut pool.idle)
        };
        for mut ctx in idle {
            ctx.close().await;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            if self.pool.lock().active == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(AuthError::CancelTimeout(self.transfer_id.clone()));
            }
        }
    }

    /// Ticket details served on the control socket.
    #[must_use]
    pub fn info(&self) -> Value {
        let connections = self.pool.lock().active;
        let expiry = self.expiry.lock();
        let now = Instant::now();
        json!({
            "uuid": self.uuid,
            "size": self.size,
            "url": self.url_text,
            "ops": self.ops.iter().map(|op| op.as_str()).collect::<Vec<_>>(),
            "sparse": self.sparse,
            "dirty": self.dirty,
            "transfer_id": self.transfer_id,
            "filename": self.filename,
            "timeout": self.timeout.as_secs(),
            "expires_in": expiry.deadline.saturating_duration_since(now).as_secs(),
            "idle_time": now.saturating_duration_since(expiry.accessed).as_secs(),
            "active": connections > 0,
            "connections": connections,
        })
    }
}

fn required_str(
    obj: &serde_json::Map<String, Value>,
    parameter: &'static str,
) -> Result<String, AuthError> {
    match obj.get(parameter) {
        None => Err(AuthError::MissingParameter(parameter)),
        Some(value) => value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AuthError::invalid(parameter, "expecting a string")),
    }
}

fn required_u64(
    obj: &serde_json::Map<String, Value>,
    parameter: &'static str,
) -> Result<u64, AuthError> {
    match obj.get(parameter) {
        None => Err(AuthError::MissingParameter(parameter)),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| AuthError::invalid(parameter, "expecting a non-negative integer")),
    }
}

fn optional_bool(
    obj: &serde_json::Map<String, Value>,
    parameter: &'static str,
) -> Result<bool, AuthError> {
    match obj.get(parameter) {
        None => Ok(false),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| AuthError::invalid(parameter, "expecting a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn spec() -> Value {
        json!({
            "uuid": "test",
            "size": 1024,
            "url": "file:/var/tmp/disk.img",
            "ops": ["read", "write"],
            "timeout": 300,
            "sparse": false,
            "dirty": false,
            "transfer_id": "transfer-1",
        })
    }

    #[test]
    fn test_from_value() {
        let ticket = Ticket::from_value(&spec()).unwrap();
        assert_eq!(ticket.uuid(), "test");
        assert_eq!(ticket.size(), 1024);
        assert_eq!(ticket.transfer_id(), "transfer-1");
        assert!(!ticket.sparse());
        assert!(!ticket.is_expired());
    }

    #[test]
    fn test_missing_parameter() {
        for parameter in ["uuid", "size", "url", "ops"] {
            let mut value = spec();
            value.as_object_mut().unwrap().remove(parameter);
            let err = Ticket::from_value(&value).unwrap_err();
            assert!(
                matches!(err, AuthError::MissingParameter(p) if p == parameter),
                "unexpected error for {parameter}: {err}"
            );
        }
    }

    #[test]
    fn test_invalid_parameters() {
        let mut value = spec();
        value["size"] = json!(-1);
        assert!(Ticket::from_value(&value).is_err());

        let mut value = spec();
        value["ops"] = json!([]);
        assert!(Ticket::from_value(&value).is_err());

        let mut value = spec();
        value["ops"] = json!(["delete"]);
        assert!(Ticket::from_value(&value).is_err());

        let mut value = spec();
        value["url"] = json!("ftp://host/file");
        assert!(Ticket::from_value(&value).is_err());
    }

    #[test]
    fn test_write_implies_read() {
        let mut value = spec();
        value["ops"] = json!(["write"]);
        let ticket = Ticket::from_value(&value).unwrap();
        assert!(ticket.may(Op::Read));
        assert!(ticket.may(Op::Write));

        let mut value = spec();
        value["ops"] = json!(["read"]);
        let ticket = Ticket::from_value(&value).unwrap();
        assert!(ticket.may(Op::Read));
        assert!(!ticket.may(Op::Write));
    }

    #[test]
    fn test_expiry_and_extend() {
        let mut value = spec();
        value["timeout"] = json!(0);
        let ticket = Ticket::from_value(&value).unwrap();
        assert!(ticket.is_expired());

        ticket.extend(Duration::from_secs(60));
        assert!(!ticket.is_expired());
    }

    #[test]
    fn test_info_fields() {
        let ticket = Ticket::from_value(&spec()).unwrap();
        let info = ticket.info();
        assert_eq!(info["uuid"], "test");
        assert_eq!(info["size"], 1024);
        assert_eq!(info["url"], "file:/var/tmp/disk.img");
        assert_eq!(info["ops"], json!(["read", "write"]));
        assert_eq!(info["active"], false);
        assert_eq!(info["connections"], 0);
    }
}
