//! Ticket store
//!
//! Process-wide map of ticket id to ticket, protected by a mutex. The
//! store lock is held only for map access; operations on a ticket take
//! the ticket's own locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::AuthError;
use crate::ticket::{Op, Ticket};

/// How long removal waits for running operations before giving up.
const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(60);

/// In-memory ticket store.
pub struct TicketStore {
    tickets: Mutex<HashMap<String, Arc<Ticket>>>,
    cancel_timeout: Duration,
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new(DEFAULT_CANCEL_TIMEOUT)
    }
}

impl TicketStore {
    #[must_use]
    pub fn new(cancel_timeout: Duration) -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
            cancel_timeout,
        }
    }

    /// Validate a ticket document and install the ticket. Installing a
    /// ticket again replaces the previous one, so control-plane
    /// retries are idempotent.
    pub fn add(&self, value: &Value) -> Result<(), AuthError> {
        let ticket = Ticket::from_value(value)?;
        info!(
            uuid = ticket.uuid(),
            transfer = ticket.transfer_id(),
            size = ticket.size(),
            "adding ticket"
        );
        self.tickets
            .lock()
            .insert(ticket.uuid().to_string(), Arc::new(ticket));
        Ok(())
    }

    pub fn get(&self, ticket_id: &str) -> Result<Arc<Ticket>, AuthError> {
        self.tickets
            .lock()
            .get(ticket_id)
            .cloned()
            .ok_or_else(|| AuthError::NoSuchTicket(ticket_id.to_string()))
    }

    /// Authorize an operation, verifying that the ticket exists, is
    /// not expired or canceled, and allows the operation. A missing
    /// ticket is an authorization error, not a lookup error.
    pub fn authorize(&self, ticket_id: &str, op: Op) -> Result<Arc<Ticket>, AuthError> {
        let ticket = self
            .get(ticket_id)
            .map_err(|_| AuthError::Forbidden(format!("no such ticket {ticket_id}")))?;

        if ticket.canceled() {
            return Err(AuthError::Forbidden(format!(
                "ticket {ticket_id} was canceled"
            )));
        }

        if ticket.is_expired() {
            return Err(AuthError::Forbidden(format!("ticket {ticket_id} expired")));
        }

        if !ticket.may(op) {
            return Err(AuthError::Forbidden(format!(
                "ticket {ticket_id} does not allow {}",
                op.as_str()
            )));
        }

        Ok(ticket)
    }

    /// Extend a ticket's expiration.
    pub fn extend(&self, ticket_id: &str, timeout: Duration) -> Result<(), AuthError> {
        let ticket = self.get(ticket_id)?;
        info!(
            uuid = ticket_id,
            transfer = ticket.transfer_id(),
            timeout = timeout.as_secs(),
            "extending ticket"
        );
        ticket.extend(timeout);
        Ok(())
    }

    /// Cancel a ticket and remove it once all its contexts were
    /// released. When running operations do not finish within the
    /// cancel timeout, the ticket is kept and the caller may retry.
    pub async fn remove(&self, ticket_id: &str) -> Result<(), AuthError> {
        let ticket = self.get(ticket_id)?;
        info!(
            uuid = ticket_id,
            transfer = ticket.transfer_id(),
            "removing ticket"
        );

        ticket.cancel(self.cancel_timeout).await?;
        self.tickets.lock().remove(ticket_id);
        Ok(())
    }

    /// Remove all tickets, canceling each one.
    pub async fn clear(&self) -> Result<(), AuthError> {
        let ids: Vec<String> = self.tickets.lock().keys().cloned().collect();
        for ticket_id in ids {
            match self.remove(&ticket_id).await {
                Ok(()) | Err(AuthError::NoSuchTicket(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Drop expired tickets with no attached contexts. Run
    /// periodically by the daemon.
    pub fn sweep(&self) {
        let mut tickets = self.tickets.lock();
        tickets.retain(|ticket_id, ticket| {
            let keep = !ticket.is_expired() || ticket.active_contexts() > 0;
            if !keep {
                debug!(uuid = ticket_id, "dropping expired ticket");
            }
            keep
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tickets.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tickets.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::Context;
    use serde_json::json;
    use vmio_backend::mem::MemBackend;
    use vmio_backend::Mode;
    use vmio_common::AlignedBuffer;

    fn spec(uuid: &str, ops: Value) -> Value {
        json!({
            "uuid": uuid,
            "size": 1024,
            "url": "file:/var/tmp/disk.img",
            "ops": ops,
            "timeout": 300,
        })
    }

    fn test_context() -> Context {
        Context {
            backend: Box::new(MemBackend::new(1024, Mode::ReadWrite)),
            buffer: AlignedBuffer::new(4096),
        }
    }

    #[test]
    fn test_add_get() {
        let store = TicketStore::default();
        store.add(&spec("t1", json!(["read"]))).unwrap();
        let ticket = store.get("t1").unwrap();
        assert_eq!(ticket.uuid(), "t1");
        assert!(matches!(
            store.get("missing"),
            Err(AuthError::NoSuchTicket(_))
        ));
    }

    #[test]
    fn test_authorize_ops() {
        let store = TicketStore::default();
        store.add(&spec("t1", json!(["read"]))).unwrap();

        assert!(store.authorize("t1", Op::Read).is_ok());
        assert!(matches!(
            store.authorize("t1", Op::Write),
            Err(AuthError::Forbidden(_))
        ));
        // Missing tickets are an authorization error so probing ids is
        // indistinguishable from lacking access.
        assert!(matches!(
            store.authorize("missing", Op::Read),
            Err(AuthError::Forbidden(_))
        ));
    }

    #[test]
    fn test_authorize_expired() {
        let store = TicketStore::default();
        let mut value = spec("t1", json!(["read"]));
        value["timeout"] = json!(0);
        store.add(&value).unwrap();

        assert!(matches!(
            store.authorize("t1", Op::Read),
            Err(AuthError::Forbidden(_))
        ));

        // Extending makes it usable again.
        store.extend("t1", Duration::from_secs(60)).unwrap();
        assert!(store.authorize("t1", Op::Read).is_ok());
    }

    #[tokio::test]
    async fn test_remove_idle_ticket() {
        let store = TicketStore::default();
        store.add(&spec("t1", json!(["read"]))).unwrap();

        let ticket = store.get("t1").unwrap();
        assert!(ticket.take_context().unwrap().is_none());
        ticket.release_context(test_context()).await;

        store.remove("t1").await.unwrap();
        assert!(store.is_empty());

        // Removal is idempotent at the HTTP layer; here the ticket is
        // simply gone.
        assert!(matches!(
            store.remove("t1").await,
            Err(AuthError::NoSuchTicket(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_waits_for_running_operation() {
        let store = Arc::new(TicketStore::new(Duration::from_secs(5)));
        store.add(&spec("t1", json!(["read"]))).unwrap();

        let ticket = store.get("t1").unwrap();
        assert!(ticket.take_context().unwrap().is_none());

        // Release the context shortly after removal starts.
        let release = {
            let ticket = Arc::clone(&ticket);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ticket.release_context(test_context()).await;
            })
        };

        store.remove("t1").await.unwrap();
        release.await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_remove_times_out_when_context_held() {
        let store = TicketStore::new(Duration::from_millis(20));
        store.add(&spec("t1", json!(["read"]))).unwrap();

        let ticket = store.get("t1").unwrap();
        assert!(ticket.take_context().unwrap().is_none());

        let err = store.remove("t1").await.unwrap_err();
        assert!(matches!(err, AuthError::CancelTimeout(_)));

        // The ticket is still installed but canceled, so new requests
        // are rejected.
        assert_eq!(store.len(), 1);
        assert!(matches!(
            store.authorize("t1", Op::Read),
            Err(AuthError::Forbidden(_))
        ));

        // Returning the context closes it and allows removal.
        ticket.release_context(test_context()).await;
        store.remove("t1").await.unwrap();
    }

    #[tokio::test]
    async fn test_context_pooled_and_reused() {
        let store = TicketStore::default();
        store.add(&spec("t1", json!(["read", "write"]))).unwrap();
        let ticket = store.get("t1").unwrap();

        assert!(ticket.take_context().unwrap().is_none());
        let mut ctx = test_context();
        ctx.backend.write(b"state").await.unwrap();
        ticket.release_context(ctx).await;

        // The next request reuses the pooled context.
        let ctx = ticket.take_context().unwrap().expect("pooled context");
        assert_eq!(ctx.backend.tell(), 5);
        ticket.release_context(ctx).await;
    }

    #[tokio::test]
    async fn test_clear() {
        let store = TicketStore::default();
        store.add(&spec("t1", json!(["read"]))).unwrap();
        store.add(&spec("t2", json!(["write"]))).unwrap();
        store.clear().await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_drops_only_expired_idle_tickets() {
        let store = TicketStore::default();
        let mut expired = spec("t1", json!(["read"]));
        expired["timeout"] = json!(0);
        store.add(&expired).unwrap();
        store.add(&spec("t2", json!(["read"]))).unwrap();

        let mut busy = spec("t3", json!(["read"]));
        busy["timeout"] = json!(0);
        store.add(&busy).unwrap();
        let ticket = store.get("t3").unwrap();
        assert!(ticket.take_context().unwrap().is_none());

        store.sweep();
        assert!(store.get("t1").is_err());
        assert!(store.get("t2").is_ok());
        // Expired but busy tickets survive the sweep.
        assert!(store.get("t3").is_ok());
    }
}
