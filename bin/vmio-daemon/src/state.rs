//! Shared daemon state
//!
//! The ticket store and the daemon configuration, plus the context
//! checkout used by all data-plane handlers: each request borrows the
//! ticket's cached backend context, opening one on first use, and
//! returns it when done.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use vmio_auth::ticket::{Context, Op};
use vmio_auth::{Ticket, TicketStore};
use vmio_backend::{Mode, Options};
use vmio_common::{AlignedBuffer, Result};

use crate::config::Config;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub config: Config,
    pub auth: TicketStore,
    /// Data socket path advertised in OPTIONS replies.
    pub unix_socket: Option<PathBuf>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> SharedState {
        let auth = TicketStore::new(config.daemon.cancel_timeout());
        let unix_socket = config.local.enable.then(|| config.local.socket.clone());
        Arc::new(Self {
            config,
            auth,
            unix_socket,
        })
    }
}

/// Check a backend context out of the ticket, opening a new backend on
/// first use.
pub async fn checkout(state: &AppState, ticket: &Ticket) -> Result<Context> {
    if let Some(ctx) = ticket.take_context()? {
        return Ok(ctx);
    }

    // The slot is taken; give it back if opening the backend fails.
    let opened = open_context(state, ticket).await;
    if opened.is_err() {
        ticket.release_slot();
    }
    opened
}

async fn open_context(state: &AppState, ticket: &Ticket) -> Result<Context> {
    let url = ticket.url();
    debug!(
        transfer = ticket.transfer_id(),
        url = %url,
        "opening backend"
    );

    let options = Options {
        mode: if ticket.may(Op::Write) {
            Mode::ReadWrite
        } else {
            Mode::Read
        },
        sparse: ticket.sparse(),
        dirty: ticket.dirty(),
        max_connections: state.config.daemon.max_connections,
        cafile: state.config.backend_http.ca_file.clone(),
        secure: true,
    };

    let backend = vmio_backend::open(url, &options).await?;
    let buffer = AlignedBuffer::new(state.config.buffer_size(url.scheme()));
    Ok(Context { backend, buffer })
}

/// Return a context to the ticket. A failed operation leaves the
/// backend in an unknown state, so its context is closed instead of
/// cached.
pub async fn checkin(ticket: &Ticket, ctx: Context, failed: bool) {
    if failed {
        let mut ctx = ctx;
        ctx.close().await;
        ticket.release_slot();
    } else {
        ticket.release_context(ctx).await;
    }
}
