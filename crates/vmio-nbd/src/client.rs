//! NBD client
//!
//! Connection lifecycle is CONNECTING -> HANDSHAKE -> TRANSMISSION ->
//! CLOSED. Only the fixed-newstyle handshake is supported. When the
//! server accepts structured replies the client negotiates the
//! `base:allocation`, `qemu:allocation-depth`, and (when requested) a
//! single `qemu:dirty-bitmap:*` meta context, enabling block status
//! queries.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, warn};

use crate::addr::{Address, NbdUrl};
use crate::error::{Error, Result};
use crate::proto::{self, ClientFlags, HandshakeFlags, TransmissionFlags};

// If a server does not advertise block size constraints, it should
// support these values.
const DEFAULT_MINIMUM_BLOCK_SIZE: u32 = 1;
const DEFAULT_PREFERRED_BLOCK_SIZE: u32 = 4096;
const DEFAULT_MAXIMUM_BLOCK_SIZE: u32 = 32 * 1024 * 1024;

// NBD limits a block status request to 4 GiB - 1. Use a smaller step to
// bound the number of extents kept in memory for fragmented images.
const MAX_EXTENTS_STEP: u64 = 2 * 1024 * 1024 * 1024;

trait Transport: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Transport for T {}

type Conn = Box<dyn Transport>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    Handshake,
    Transmission,
    Closed,
}

/// Meta context kinds negotiated with the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContextKind {
    Alloc,
    Depth,
    Dirty,
}

/// An extent received in a block status reply, with flags remapped to
/// the internal disjoint bits so allocation, depth, and dirty results
/// can be merged into one flags word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireExtent {
    pub length: u64,
    pub flags: u32,
}

impl WireExtent {
    #[must_use]
    pub const fn new(length: u64, flags: u32) -> Self {
        Self { length, flags }
    }

    fn from_wire(length: u32, flags: u32, kind: ContextKind) -> Self {
        let flags = match kind {
            // Unknown bits are reserved; clients must ignore them.
            ContextKind::Alloc => flags & (proto::STATE_HOLE | proto::STATE_ZERO),
            ContextKind::Dirty => {
                if flags & proto::STATE_DIRTY != 0 {
                    proto::EXTENT_DIRTY
                } else {
                    0
                }
            }
            // Depth 0 means the extent is not present in any layer and
            // exposes data from the backing file.
            ContextKind::Depth => {
                if flags == 0 {
                    proto::EXTENT_BACKING
                } else {
                    0
                }
            }
        };
        Self {
            length: u64::from(length),
            flags,
        }
    }

    /// The extent reads as zeroes.
    #[must_use]
    pub const fn zero(&self) -> bool {
        self.flags & proto::EXTENT_ZERO != 0
    }

    /// The extent does not exist in the top image and exposes data from
    /// the backing chain.
    #[must_use]
    pub const fn hole(&self) -> bool {
        self.flags & proto::EXTENT_BACKING != 0
    }

    /// The extent was modified and is included in the incremental
    /// backup.
    #[must_use]
    pub const fn dirty(&self) -> bool {
        self.flags & proto::EXTENT_DIRTY != 0
    }
}

/// Merge two extent lists with distinct flag bits, yielding extents
/// carrying the flags of both. Merging stops when either list is
/// consumed.
#[must_use]
pub fn merged(extents_a: &[WireExtent], extents_b: &[WireExtent]) -> Vec<WireExtent> {
    let mut out = Vec::new();
    let mut iter_a = extents_a.iter().copied();
    let mut iter_b = extents_b.iter().copied();
    let mut a: Option<WireExtent> = None;
    let mut b: Option<WireExtent> = None;

    loop {
        if a.is_none() {
            a = iter_a.next();
        }
        if b.is_none() {
            b = iter_b.next();
        }
        let (Some(ext_a), Some(ext_b)) = (a, b) else {
            return out;
        };

        if ext_a.length == ext_b.length {
            out.push(WireExtent::new(ext_a.length, ext_a.flags | ext_b.flags));
            a = None;
            b = None;
        } else if ext_a.length > ext_b.length {
            out.push(WireExtent::new(ext_b.length, ext_a.flags | ext_b.flags));
            a = Some(WireExtent::new(ext_a.length - ext_b.length, ext_a.flags));
            b = None;
        } else {
            out.push(WireExtent::new(ext_a.length, ext_a.flags | ext_b.flags));
            b = Some(WireExtent::new(ext_b.length - ext_a.length, ext_b.flags));
            a = None;
        }
    }
}

/// One block status reply, split by meta context.
#[derive(Debug, Default)]
pub struct BlockStatusReply {
    pub alloc: Option<Vec<WireExtent>>,
    pub depth: Option<Vec<WireExtent>>,
    pub dirty: Option<Vec<WireExtent>>,
}

impl BlockStatusReply {
    fn entry(&mut self, kind: ContextKind) -> &mut Vec<WireExtent> {
        let slot = match kind {
            ContextKind::Alloc => &mut self.alloc,
            ContextKind::Depth => &mut self.depth,
            ContextKind::Dirty => &mut self.dirty,
        };
        slot.get_or_insert_with(Vec::new)
    }
}

struct Command {
    name: &'static str,
    flags: u16,
    cmd: u16,
    handle: u64,
    offset: u64,
    length: u32,
    only_structured: bool,
}

/// NBD client connection.
pub struct Client {
    conn: Conn,
    address: Address,
    export_name: String,
    dirty: bool,
    state: State,
    counter: u64,

    structured_reply: bool,
    contexts: HashMap<u32, ContextKind>,
    dirty_bitmap: Option<String>,

    export_size: u64,
    transmission_flags: TransmissionFlags,
    minimum_block_size: u32,
    preferred_block_size: u32,
    maximum_block_size: u32,
}

impl Client {
    /// Connect to an NBD server and perform the fixed-newstyle
    /// handshake. With `dirty` the client tries to negotiate a dirty
    /// bitmap context for incremental backup.
    pub async fn connect(address: &Address, export_name: &str, dirty: bool) -> Result<Self> {
        debug!(%address, export_name, dirty, "connecting");

        let conn = match address {
            Address::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Box::new(stream) as Conn
            }
            Address::Unix(path) => Box::new(UnixStream::connect(path).await?) as Conn,
        };

        let mut client = Self {
            conn,
            address: address.clone(),
            export_name: export_name.to_string(),
            dirty,
            state: State::Handshake,
            counter: 0,
            structured_reply: false,
            contexts: HashMap::new(),
            dirty_bitmap: None,
            export_size: 0,
            transmission_flags: TransmissionFlags::default(),
            minimum_block_size: DEFAULT_MINIMUM_BLOCK_SIZE,
            preferred_block_size: DEFAULT_PREFERRED_BLOCK_SIZE,
            maximum_block_size: DEFAULT_MAXIMUM_BLOCK_SIZE,
        };

        match client.newstyle_handshake().await {
            Ok(()) => {
                client.state = State::Transmission;
                debug!("ready for transmission");
                Ok(client)
            }
            Err(err) => {
                client.close().await;
                Err(err)
            }
        }
    }

    /// Connect using a parsed NBD URL.
    pub async fn connect_url(url: &NbdUrl, dirty: bool) -> Result<Self> {
        Self::connect(&url.address, &url.export, dirty).await
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[must_use]
    pub fn export_name(&self) -> &str {
        &self.export_name
    }

    #[must_use]
    pub const fn export_size(&self) -> u64 {
        self.export_size
    }

    #[must_use]
    pub const fn transmission_flags(&self) -> TransmissionFlags {
        self.transmission_flags
    }

    #[must_use]
    pub const fn minimum_block_size(&self) -> u32 {
        self.minimum_block_size
    }

    #[must_use]
    pub const fn preferred_block_size(&self) -> u32 {
        self.preferred_block_size
    }

    #[must_use]
    pub const fn maximum_block_size(&self) -> u32 {
        self.maximum_block_size
    }

    /// Name of the negotiated dirty bitmap context, if any.
    #[must_use]
    pub fn dirty_bitmap(&self) -> Option<&str> {
        self.dirty_bitmap.as_deref()
    }

    /// Whether dirty extents were requested for this connection.
    #[must_use]
    pub const fn dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn has_base_allocation(&self) -> bool {
        self.contexts.values().any(|k| *k == ContextKind::Alloc)
    }

    #[must_use]
    pub fn has_allocation_depth(&self) -> bool {
        self.contexts.values().any(|k| *k == ContextKind::Depth)
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Read `length` bytes at `offset`.
    pub async fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; length];
        self.readinto(offset, &mut buf).await?;
        Ok(buf)
    }

    /// Read into `buf` at `offset`.
    pub async fn readinto(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        // If structured reply was negotiated, the server must use a
        // structured reply for CMD_READ.
        let mut cmd = self.command("NBD_CMD_READ", proto::CMD_READ, offset, buf.len() as u32, 0);
        cmd.only_structured = self.structured_reply;
        self.send_command(&cmd).await?;
        self.recv_reply(&mut cmd, Some(buf), None).await
    }

    /// Write `data` at `offset`.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut cmd = self.command("NBD_CMD_WRITE", proto::CMD_WRITE, offset, data.len() as u32, 0);
        self.send_command(&cmd).await?;
        self.conn.write_all(data).await?;
        self.recv_reply(&mut cmd, None, None).await
    }

    /// Zero `length` bytes at `offset`. Without `punch_hole` the zeroed
    /// range stays allocated.
    pub async fn zero(&mut self, offset: u64, length: u64, punch_hole: bool) -> Result<()> {
        if !self
            .transmission_flags
            .contains(TransmissionFlags::SEND_WRITE_ZEROES)
        {
            return Err(Error::UnsupportedRequest(
                "server does not support NBD_CMD_WRITE_ZEROES".to_string(),
            ));
        }
        if length > proto::MAX_LENGTH {
            return Err(Error::UnsupportedRequest(format!(
                "zero length {length} exceeds protocol maximum {}",
                proto::MAX_LENGTH
            )));
        }
        let flags = if punch_hole {
            0
        } else {
            proto::CMD_FLAG_NO_HOLE
        };
        let mut cmd = self.command(
            "NBD_CMD_WRITE_ZEROES",
            proto::CMD_WRITE_ZEROES,
            offset,
            length as u32,
            flags,
        );
        self.send_command(&cmd).await?;
        self.recv_reply(&mut cmd, None, None).await
    }

    /// Flush the export to stable storage. A no-op if the server does
    /// not advertise flush.
    pub async fn flush(&mut self) -> Result<()> {
        if !self
            .transmission_flags
            .contains(TransmissionFlags::SEND_FLUSH)
        {
            return Ok(());
        }
        let mut cmd = self.command("NBD_CMD_FLUSH", proto::CMD_FLUSH, 0, 0, 0);
        self.send_command(&cmd).await?;
        self.recv_reply(&mut cmd, None, None).await
    }

    /// Issue one block status command. The requested range must not
    /// exceed the export size.
    pub async fn block_status(&mut self, offset: u64, length: u64) -> Result<BlockStatusReply> {
        if !self.structured_reply {
            return Err(Error::UnsupportedRequest(
                "server does not support structured replies".to_string(),
            ));
        }
        let mut cmd = self.command(
            "NBD_CMD_BLOCK_STATUS",
            proto::CMD_BLOCK_STATUS,
            offset,
            length as u32,
            0,
        );
        cmd.only_structured = true;
        self.send_command(&cmd).await?;
        let mut reply = BlockStatusReply::default();
        self.recv_reply(&mut cmd, None, Some(&mut reply)).await?;
        Ok(reply)
    }

    /// Iterate extents over `[offset, offset + length)`, issuing as
    /// many block status commands as needed. Handles servers returning
    /// a single extent, short replies, and a last extent exceeding the
    /// requested range; consecutive extents with equal flags are
    /// coalesced. With `dirty` the allocation extents are merged with
    /// the dirty bitmap, otherwise with allocation depth when
    /// available.
    pub async fn extents(
        &mut self,
        offset: u64,
        length: u64,
        dirty: bool,
    ) -> Result<Vec<WireExtent>> {
        let end = offset + length;
        let mut offset = offset;
        let mut result = Vec::new();
        let mut cur: Option<WireExtent> = None;

        while offset < end {
            let step = (end - offset).min(MAX_EXTENTS_STEP);
            let res = self.block_status(offset, step).await?;

            let alloc = res.alloc.filter(|v| !v.is_empty()).ok_or_else(|| {
                Error::protocol("server did not return base:allocation extents")
            })?;

            let extents = if dirty {
                let bitmap = res.dirty.ok_or_else(|| {
                    Error::protocol("server did not return dirty bitmap extents")
                })?;
                merged(&alloc, &bitmap)
            } else if let Some(depth) = res.depth {
                merged(&alloc, &depth)
            } else {
                alloc
            };

            // A reply making no progress would loop forever.
            if extents.is_empty() {
                return Err(Error::protocol("server returned no usable extents"));
            }

            for mut ext in extents {
                // The last extent of the last block status command may
                // exceed the requested range.
                if offset + ext.length > end {
                    ext.length = end - offset;
                }
                offset += ext.length;

                match &mut cur {
                    None => cur = Some(ext),
                    Some(c) if c.flags == ext.flags => c.length += ext.length,
                    Some(c) => {
                        result.push(*c);
                        cur = Some(ext);
                    }
                }

                // The server must not send more extents, but don't
                // report wrong data if it does not comply.
                if offset == end {
                    break;
                }
            }
        }

        if let Some(c) = cur {
            result.push(c);
        }
        Ok(result)
    }

    /// Close the connection. In handshake or transmission state this is
    /// a soft disconnect (OPT_ABORT or CMD_DISC); socket errors during
    /// disconnect are logged and ignored.
    pub async fn close(&mut self) {
        if self.state < State::Closed {
            if let Err(err) = self.soft_disconnect().await {
                debug!("error initiating soft disconnect: {err}");
            }
            self.state = State::Closed;
            let _ = self.conn.shutdown().await;
        }
    }

    async fn soft_disconnect(&mut self) -> Result<()> {
        debug!("initiating a soft disconnect");
        match self.state {
            State::Handshake => {
                // The server may reply, but we are allowed to close the
                // socket without reading the reply.
                self.send_option(proto::OPT_ABORT, &[]).await
            }
            State::Transmission => {
                // The server does not reply to CMD_DISC.
                let cmd = self.command("NBD_CMD_DISC", proto::CMD_DISC, 0, 0, 0);
                self.send_command(&cmd).await
            }
            State::Closed => Ok(()),
        }
    }

    // ── Fixed newstyle handshake ──────────────────────────────────────────────

    async fn newstyle_handshake(&mut self) -> Result<()> {
        let nbd_magic = self.conn.read_u64().await?;
        if nbd_magic != proto::NBDMAGIC {
            return Err(Error::protocol(format!(
                "bad nbd magic {nbd_magic:x}, expecting {:x}",
                proto::NBDMAGIC
            )));
        }

        let cliserv_magic = self.conn.read_u64().await?;
        if cliserv_magic != proto::IHAVEOPT {
            return Err(Error::protocol(format!(
                "server does not support newstyle negotiation magic={cliserv_magic:x} \
                 expected={:x}",
                proto::IHAVEOPT
            )));
        }

        let server_flags = HandshakeFlags::from_bits_truncate(self.conn.read_u16().await?);
        debug!(?server_flags, "received server flags");
        if !server_flags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
            return Err(Error::protocol(
                "server does not support fixed newstyle negotiation",
            ));
        }

        self.conn
            .write_u32(ClientFlags::C_FIXED_NEWSTYLE.bits())
            .await?;

        // Options haggling.

        self.negotiate_structured_reply().await?;

        if self.structured_reply {
            let dirty_bitmap = if self.dirty {
                self.query_dirty_bitmap().await?
            } else {
                None
            };
            self.set_meta_context(dirty_bitmap).await?;
        }

        self.negotiate_go().await
    }

    /// Ask the server to enable structured replies. This allows better
    /// error handling for CMD_READ and enables CMD_BLOCK_STATUS. On
    /// REP_ERR_UNSUP continue without them.
    async fn negotiate_structured_reply(&mut self) -> Result<()> {
        match self.negotiate_option(proto::OPT_STRUCTURED_REPLY).await {
            Ok(()) => {
                debug!("structured reply enabled");
                self.structured_reply = true;
                Ok(())
            }
            Err(err @ Error::OptionUnsupported { .. }) => {
                warn!("structured reply is not available: {err}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Query the server for a dirty bitmap, returning the context name
    /// if the server exports exactly one.
    async fn query_dirty_bitmap(&mut self) -> Result<Option<String>> {
        let opt = proto::OPT_LIST_META_CONTEXT;
        let data = self.format_meta_context_data(&[proto::QEMU_DIRTY_BITMAP]);
        self.send_option(opt, &data).await?;

        let mut bitmaps = self.recv_meta_context_replies(opt).await?;

        if bitmaps.is_empty() {
            warn!(
                "server does not support {} meta context",
                proto::QEMU_DIRTY_BITMAP
            );
            return Ok(None);
        }
        if bitmaps.len() > 1 {
            warn!("cannot use multiple dirty bitmaps: {bitmaps:?}");
            return Ok(None);
        }

        let (name, _) = bitmaps.remove(0);
        debug!("server has dirty bitmap {name}");
        Ok(Some(name))
    }

    /// Register wanted meta contexts with the server. The server
    /// replies once per context it supports, then REP_ACK.
    async fn set_meta_context(&mut self, dirty_bitmap: Option<String>) -> Result<()> {
        let opt = proto::OPT_SET_META_CONTEXT;

        // qemu:allocation-depth is required to detect holes in qcow2
        // images, unallocated clusters exposing data from the backing
        // chain.
        let mut queries = vec![proto::BASE_ALLOCATION, proto::QEMU_ALLOCATION_DEPTH];
        if let Some(name) = &dirty_bitmap {
            queries.push(name);
        }

        let data = self.format_meta_context_data(&queries);
        self.send_option(opt, &data).await?;

        for (name, id) in self.recv_meta_context_replies(opt).await? {
            let kind = if Some(&name) == dirty_bitmap.as_ref() {
                self.dirty_bitmap = Some(name.clone());
                ContextKind::Dirty
            } else if name == proto::QEMU_ALLOCATION_DEPTH {
                ContextKind::Depth
            } else if name == proto::BASE_ALLOCATION {
                ContextKind::Alloc
            } else {
                return Err(Error::protocol(format!(
                    "unexpected context {name}, expecting one of {queries:?}"
                )));
            };
            debug!("meta context {name} is available id={id}");
            self.contexts.insert(id, kind);
        }

        // A missing context is expected with old servers or raw
        // volumes; it reduces functionality but is not an error.
        if !self.has_base_allocation() {
            debug!("meta context {} is not available", proto::BASE_ALLOCATION);
        }
        if !self.has_allocation_depth() {
            debug!(
                "meta context {} is not available",
                proto::QEMU_ALLOCATION_DEPTH
            );
        }

        Ok(())
    }

    /// Format export name and queries for the meta context options.
    fn format_meta_context_data(&self, queries: &[&str]) -> Vec<u8> {
        let name = self.export_name.as_bytes();
        let mut data = Vec::new();
        data.extend_from_slice(&(name.len() as u32).to_be_bytes());
        data.extend_from_slice(name);
        data.extend_from_slice(&(queries.len() as u32).to_be_bytes());
        for query in queries {
            data.extend_from_slice(&(query.len() as u32).to_be_bytes());
            data.extend_from_slice(query.as_bytes());
        }
        data
    }

    /// Receive replies for OPT_LIST_META_CONTEXT or
    /// OPT_SET_META_CONTEXT, collecting (name, id) pairs until REP_ACK.
    /// An unsupported option ends the collection without failing.
    async fn recv_meta_context_replies(&mut self, opt: u32) -> Result<Vec<(String, u32)>> {
        let mut contexts = Vec::new();
        loop {
            let (reply, length) = self.recv_option_reply(opt).await?;

            if proto::is_error_reply(reply) {
                let err = self.option_error(opt, reply, length).await?;
                if matches!(err, Error::OptionUnsupported { .. }) {
                    warn!("meta context is not supported: {err}");
                    return Ok(contexts);
                }
                return Err(err);
            }

            if reply == proto::REP_ACK {
                if length != 0 {
                    return Err(invalid_length("REP_ACK", length, "0"));
                }
                return Ok(contexts);
            }

            if reply != proto::REP_META_CONTEXT {
                return Err(unexpected_reply(reply, opt, proto::REP_META_CONTEXT));
            }

            if length < 4 {
                return Err(invalid_length("REP_META_CONTEXT", length, ">= 4"));
            }

            let ctx_id = self.conn.read_u32().await?;
            let mut name = vec![0; length as usize - 4];
            self.conn.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::protocol("meta context name is not valid UTF-8"))?;
            contexts.push((name, ctx_id));
        }
    }

    /// Send OPT_GO and collect export info. We do not announce
    /// INFO_BLOCK_SIZE, so we are allowed to send unaligned requests;
    /// the server may still send block size constraints.
    async fn negotiate_go(&mut self) -> Result<()> {
        let opt = proto::OPT_GO;

        let name = self.export_name.as_bytes().to_vec();
        let mut data = Vec::new();
        data.extend_from_slice(&(name.len() as u32).to_be_bytes());
        data.extend_from_slice(&name);
        // Number of information requests.
        data.extend_from_slice(&0u16.to_be_bytes());
        self.send_option(opt, &data).await?;

        let mut export_info = false;

        loop {
            let (reply, length) = self.recv_option_reply(opt).await?;

            if proto::is_error_reply(reply) {
                return Err(self.option_error(opt, reply, length).await?);
            }

            if reply == proto::REP_ACK {
                if length != 0 {
                    return Err(invalid_length("REP_ACK", length, "0"));
                }
                if !export_info {
                    return Err(Error::protocol(
                        "server did not send export size or transmission flags",
                    ));
                }
                return Ok(());
            }

            if reply != proto::REP_INFO {
                return Err(unexpected_reply(reply, opt, proto::REP_INFO));
            }

            if length < 2 {
                return Err(invalid_length("REP_INFO", length, ">= 2"));
            }

            let info = self.conn.read_u16().await?;
            let length = length - 2;

            match info {
                proto::INFO_EXPORT => {
                    if length != 10 {
                        return Err(invalid_length("INFO_EXPORT", length, "10"));
                    }
                    self.export_size = self.conn.read_u64().await?;
                    self.transmission_flags =
                        TransmissionFlags::from_bits_truncate(self.conn.read_u16().await?);
                    export_info = true;
                    debug!(
                        size = self.export_size,
                        flags = ?self.transmission_flags,
                        "received export info"
                    );
                }
                proto::INFO_BLOCK_SIZE => {
                    if length != 12 {
                        return Err(invalid_length("INFO_BLOCK_SIZE", length, "12"));
                    }
                    self.minimum_block_size = self.conn.read_u32().await?;
                    self.preferred_block_size = self.conn.read_u32().await?;
                    self.maximum_block_size = self.conn.read_u32().await?;
                    debug!(
                        minimum = self.minimum_block_size,
                        preferred = self.preferred_block_size,
                        maximum = self.maximum_block_size,
                        "received block size info"
                    );
                }
                other => {
                    let mut data = vec![0; length as usize];
                    self.conn.read_exact(&mut data).await?;
                    warn!("dropping unknown info reply={other} length={length}");
                }
            }
        }
    }

    // ── Option plumbing ───────────────────────────────────────────────────────

    /// Negotiate a simple option expecting a zero-length REP_ACK.
    async fn negotiate_option(&mut self, opt: u32) -> Result<()> {
        self.send_option(opt, &[]).await?;
        let (reply, length) = self.recv_option_reply(opt).await?;

        if proto::is_error_reply(reply) {
            return Err(self.option_error(opt, reply, length).await?);
        }

        if reply != proto::REP_ACK {
            return Err(unexpected_reply(reply, opt, proto::REP_ACK));
        }

        if length != 0 {
            return Err(invalid_length("REP_ACK", length, "0"));
        }

        Ok(())
    }

    async fn send_option(&mut self, opt: u32, data: &[u8]) -> Result<()> {
        debug!(opt, data_len = data.len(), "sending option");
        self.conn.write_u64(proto::IHAVEOPT).await?;
        self.conn.write_u32(opt).await?;
        self.conn.write_u32(data.len() as u32).await?;
        if !data.is_empty() {
            self.conn.write_all(data).await?;
        }
        self.conn.flush().await?;
        Ok(())
    }

    /// Receive an option reply header, returning (reply, length of the
    /// reply data still to be read).
    async fn recv_option_reply(&mut self, expected_option: u32) -> Result<(u32, u32)> {
        let magic = self.conn.read_u64().await?;
        let option = self.conn.read_u32().await?;
        let reply = self.conn.read_u32().await?;
        let length = self.conn.read_u32().await?;
        debug!(magic, option, reply, length, "received option reply");

        if magic != proto::OPTION_REPLY_MAGIC {
            return Err(Error::protocol(format!(
                "unexpected reply magic {magic:x} for option {expected_option}, \
                 expecting {:x}",
                proto::OPTION_REPLY_MAGIC
            )));
        }

        if option != expected_option {
            return Err(Error::protocol(format!(
                "unexpected reply option {option}, expecting {expected_option}"
            )));
        }

        Ok((reply, length))
    }

    /// Consume the optional error message and build an option error.
    async fn option_error(&mut self, opt: u32, reply: u32, length: u32) -> Result<Error> {
        let mut message = String::new();

        if length > 0 {
            let mut data = vec![0; length as usize];
            self.conn.read_exact(&mut data).await?;
            message = String::from_utf8_lossy(&data).into_owned();
        }

        if message.is_empty() {
            message = proto::error_reply_message(reply).to_string();
        }

        if reply == proto::REP_ERR_UNSUP {
            Ok(Error::OptionUnsupported {
                option: opt,
                reason: message,
            })
        } else {
            Ok(Error::Option {
                option: opt,
                code: reply,
                reason: message,
            })
        }
    }

    // ── Command plumbing ──────────────────────────────────────────────────────

    fn command(&mut self, name: &'static str, cmd: u16, offset: u64, length: u32, flags: u16) -> Command {
        let handle = self.counter;
        self.counter += 1;
        Command {
            name,
            flags,
            cmd,
            handle,
            offset,
            length,
            only_structured: false,
        }
    }

    async fn send_command(&mut self, cmd: &Command) -> Result<()> {
        debug!(
            name = cmd.name,
            handle = cmd.handle,
            offset = cmd.offset,
            length = cmd.length,
            flags = cmd.flags,
            "sending command"
        );
        self.conn.write_u32(proto::REQUEST_MAGIC).await?;
        self.conn.write_u16(cmd.flags).await?;
        self.conn.write_u16(cmd.cmd).await?;
        self.conn.write_u64(cmd.handle).await?;
        self.conn.write_u64(cmd.offset).await?;
        self.conn.write_u32(cmd.length).await?;
        self.conn.flush().await?;
        Ok(())
    }

    /// Receive either a simple reply or all structured reply chunks for
    /// a command.
    async fn recv_reply(
        &mut self,
        cmd: &mut Command,
        mut buf: Option<&mut [u8]>,
        mut status: Option<&mut BlockStatusReply>,
    ) -> Result<()> {
        // NBD_REPLY_TYPE_ERROR_OFFSET chunks collected while handling a
        // structured reply.
        let mut errors: Vec<(u64, String)> = Vec::new();

        loop {
            let magic = self.conn.read_u32().await?;

            if magic == proto::SIMPLE_REPLY_MAGIC {
                if cmd.only_structured {
                    return Err(Error::protocol(format!(
                        "unexpected simple reply magic {magic:x}, expecting structured \
                         reply magic {:x}",
                        proto::STRUCTURED_REPLY_MAGIC
                    )));
                }
                self.recv_simple_reply(cmd, buf.as_deref_mut()).await?;
                break;
            }

            if magic != proto::STRUCTURED_REPLY_MAGIC {
                return Err(Error::protocol(format!("unexpected reply magic {magic:x}")));
            }

            if !self.structured_reply {
                return Err(Error::protocol(format!(
                    "unexpected structured reply magic {magic:x}, expecting simple \
                     reply magic {:x}",
                    proto::SIMPLE_REPLY_MAGIC
                )));
            }

            // Once the first structured chunk arrived, a simple reply
            // for the same command is invalid.
            cmd.only_structured = true;

            if self
                .recv_reply_chunk(cmd, buf.as_deref_mut(), status.as_deref_mut(), &mut errors)
                .await?
            {
                break;
            }
        }

        if !errors.is_empty() {
            // Some chunks failed. Content chunks may be fragmented, so
            // partial failures cannot be reported; fail the request.
            return Err(Error::Request(errors));
        }

        Ok(())
    }

    async fn recv_simple_reply(&mut self, cmd: &Command, buf: Option<&mut [u8]>) -> Result<()> {
        let error = self.conn.read_u32().await?;
        let handle = self.conn.read_u64().await?;

        if error != 0 {
            return Err(Error::reply(error, "simple reply failed"));
        }

        if handle != cmd.handle {
            return Err(unexpected_handle(handle, cmd.handle));
        }

        if let Some(buf) = buf {
            self.conn.read_exact(buf).await?;
        }

        Ok(())
    }

    /// Receive one structured reply chunk. Returns true if this was the
    /// last chunk.
    async fn recv_reply_chunk(
        &mut self,
        cmd: &Command,
        buf: Option<&mut [u8]>,
        status: Option<&mut BlockStatusReply>,
        errors: &mut Vec<(u64, String)>,
    ) -> Result<bool> {
        let flags = self.conn.read_u16().await?;
        let chunk_type = self.conn.read_u16().await?;
        let handle = self.conn.read_u64().await?;
        let length = self.conn.read_u32().await?;

        if handle != cmd.handle {
            return Err(unexpected_handle(handle, cmd.handle));
        }

        match chunk_type {
            proto::REPLY_TYPE_NONE => {
                if flags & proto::REPLY_FLAG_DONE == 0 {
                    return Err(Error::protocol(format!(
                        "invalid none reply chunk without done flag, flags={flags}"
                    )));
                }
                if length != 0 {
                    return Err(invalid_length("REPLY_TYPE_NONE", length, "0"));
                }
            }
            proto::REPLY_TYPE_OFFSET_DATA => {
                self.recv_data_chunk(cmd, length, buf).await?;
            }
            proto::REPLY_TYPE_OFFSET_HOLE => {
                self.recv_hole_chunk(cmd, length, buf).await?;
            }
            proto::REPLY_TYPE_BLOCK_STATUS => {
                self.recv_block_status_chunk(length, status).await?;
            }
            proto::REPLY_TYPE_ERROR => {
                // The entire request failed. If this is the last chunk
                // the request failed cleanly, otherwise the connection
                // state is unknown.
                let (code, message) = self.recv_error_chunk(length).await?;
                if flags & proto::REPLY_FLAG_DONE != 0 {
                    return Err(Error::reply(code, message));
                }
                return Err(Error::protocol(format!(
                    "unrecoverable error chunk code={code} message={message:?}"
                )));
            }
            proto::REPLY_TYPE_ERROR_OFFSET => {
                // Partial error; collect it and continue with the next
                // chunk.
                if length < 8 {
                    return Err(invalid_length("REPLY_TYPE_ERROR_OFFSET", length, ">= 8"));
                }
                let (code, message) = self.recv_error_chunk(length - 8).await?;
                let offset = self.conn.read_u64().await?;
                errors.push((offset, format!("[error {code}] {message}")));
            }
            other => {
                return Err(Error::protocol(format!(
                    "received unknown chunk type={other} flags={flags} length={length}"
                )));
            }
        }

        Ok(flags & proto::REPLY_FLAG_DONE != 0)
    }

    /// Receive a data chunk payload into the command buffer at the
    /// chunk offset.
    async fn recv_data_chunk(
        &mut self,
        cmd: &Command,
        length: u32,
        buf: Option<&mut [u8]>,
    ) -> Result<()> {
        if length <= 8 {
            return Err(invalid_length("REPLY_TYPE_OFFSET_DATA", length, "> 8"));
        }
        let buf =
            buf.ok_or_else(|| Error::protocol("unexpected data chunk for non-read command"))?;

        let chunk_offset = self.conn.read_u64().await?;
        let chunk_size = (length - 8) as usize;
        debug!(chunk_offset, chunk_size, "receive data chunk");

        let view = chunk_view(buf, cmd.offset, chunk_offset, chunk_size)?;
        self.conn.read_exact(view).await?;
        Ok(())
    }

    /// Receive a hole chunk, zeroing the byte range in the command
    /// buffer.
    async fn recv_hole_chunk(
        &mut self,
        cmd: &Command,
        length: u32,
        buf: Option<&mut [u8]>,
    ) -> Result<()> {
        if length != 12 {
            return Err(invalid_length("REPLY_TYPE_OFFSET_HOLE", length, "12"));
        }
        let buf =
            buf.ok_or_else(|| Error::protocol("unexpected hole chunk for non-read command"))?;

        let chunk_offset = self.conn.read_u64().await?;
        let chunk_size = self.conn.read_u32().await?;
        if chunk_size == 0 {
            return Err(Error::protocol("invalid hole chunk with zero size"));
        }
        debug!(chunk_offset, chunk_size, "receive hole chunk");

        let view = chunk_view(buf, cmd.offset, chunk_offset, chunk_size as usize)?;
        view.fill(0);
        Ok(())
    }

    /// Receive a block status chunk into the reply for its context.
    async fn recv_block_status_chunk(
        &mut self,
        length: u32,
        status: Option<&mut BlockStatusReply>,
    ) -> Result<()> {
        let status = status.ok_or_else(|| {
            Error::protocol("unexpected block status chunk for non-status command")
        })?;

        // Payload is a 32-bit context id followed by one or more 8-byte
        // extent descriptors.
        let count = (length / 8) as usize;
        if count == 0 || length % 8 != 4 {
            return Err(Error::protocol(format!(
                "received invalid payload length {length}"
            )));
        }
        if count > proto::MAX_EXTENTS {
            return Err(Error::protocol(format!(
                "received too many extents {count} > {}",
                proto::MAX_EXTENTS
            )));
        }

        let ctx_id = self.conn.read_u32().await?;
        let kind = *self.contexts.get(&ctx_id).ok_or_else(|| {
            Error::protocol(format!("received unexpected metadata context id {ctx_id}"))
        })?;

        let extents = status.entry(kind);
        extents.reserve(count);
        for _ in 0..count {
            let ext_length = self.conn.read_u32().await?;
            let ext_flags = self.conn.read_u32().await?;
            if ext_length == 0 {
                return Err(Error::protocol(format!(
                    "invalid extent length=0 flags={ext_flags}"
                )));
            }
            if self.minimum_block_size > 1 && ext_length % self.minimum_block_size != 0 {
                return Err(Error::protocol(format!(
                    "invalid extent length {ext_length}: not an integer multiple of \
                     minimum block size {}",
                    self.minimum_block_size
                )));
            }
            extents.push(WireExtent::from_wire(ext_length, ext_flags, kind));
        }

        Ok(())
    }

    async fn recv_error_chunk(&mut self, length: u32) -> Result<(u32, String)> {
        if length < 6 {
            return Err(invalid_length("error chunk", length, ">= 6"));
        }
        let code = self.conn.read_u32().await?;
        let msg_len = self.conn.read_u16().await?;

        if u32::from(msg_len) != length - 6 {
            return Err(Error::protocol(format!(
                "invalid structured reply error message length {msg_len}, expected {}",
                length - 6
            )));
        }

        let mut message = vec![0; msg_len as usize];
        self.conn.read_exact(&mut message).await?;
        // The protocol does not specify the encoding.
        Ok((code, String::from_utf8_lossy(&message).into_owned()))
    }
}

/// Slice the command buffer for a chunk, validating that the chunk is
/// within the requested range.
fn chunk_view(
    buf: &mut [u8],
    cmd_offset: u64,
    chunk_offset: u64,
    chunk_size: usize,
) -> Result<&mut [u8]> {
    let start = chunk_offset
        .checked_sub(cmd_offset)
        .map(|n| n as usize)
        .filter(|&start| start + chunk_size <= buf.len())
        .ok_or_else(|| {
            Error::protocol(format!(
                "chunk offset={chunk_offset} size={chunk_size} out of the requested range"
            ))
        })?;
    Ok(&mut buf[start..start + chunk_size])
}

fn invalid_length(reply: &str, length: u32, expected: &str) -> Error {
    Error::protocol(format!(
        "reply {reply} with invalid length {length}, expecting {expected}"
    ))
}

fn unexpected_reply(reply: u32, option: u32, expected: u32) -> Error {
    Error::protocol(format!(
        "unexpected reply {reply} for option {option}, expecting reply {expected}"
    ))
}

fn unexpected_handle(handle: u64, expected: u64) -> Error {
    Error::protocol(format!(
        "unexpected handle {handle}, expecting {expected}"
    ))
}
