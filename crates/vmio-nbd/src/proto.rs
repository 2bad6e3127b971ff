//! NBD protocol constants
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>
//! for the protocol description. Byte order on the wire is big-endian.

use bitflags::bitflags;

// ── Magic numbers ─────────────────────────────────────────────────────────────

pub const NBDMAGIC: u64 = 0x4e42_444d_4147_4943; // b"NBDMAGIC"
pub const IHAVEOPT: u64 = 0x4948_4156_454f_5054; // b"IHAVEOPT"
pub const OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e_33ef;

// ── Handshake flags ───────────────────────────────────────────────────────────

bitflags! {
    /// 16-bit server handshake flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HandshakeFlags: u16 {
        const FIXED_NEWSTYLE = 1 << 0;
        const NO_ZEROES = 1 << 1;
    }

    /// 32-bit client handshake flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ClientFlags: u32 {
        const C_FIXED_NEWSTYLE = 1 << 0;
        const C_NO_ZEROES = 1 << 1;
    }

    /// 16-bit per-export transmission flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TransmissionFlags: u16 {
        const HAS_FLAGS = 1 << 0;
        const READ_ONLY = 1 << 1;
        const SEND_FLUSH = 1 << 2;
        const SEND_FUA = 1 << 3;
        const ROTATIONAL = 1 << 4;
        const SEND_TRIM = 1 << 5;
        const SEND_WRITE_ZEROES = 1 << 6;
        const SEND_DF = 1 << 7;
        const CAN_MULTI_CONN = 1 << 8;
        const SEND_RESIZE = 1 << 9;
        const SEND_CACHE = 1 << 10;
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

pub const OPT_ABORT: u32 = 2;
pub const OPT_GO: u32 = 7;
pub const OPT_STRUCTURED_REPLY: u32 = 8;
pub const OPT_LIST_META_CONTEXT: u32 = 9;
pub const OPT_SET_META_CONTEXT: u32 = 10;

// ── Option replies ────────────────────────────────────────────────────────────

pub const REP_ACK: u32 = 1;
pub const REP_INFO: u32 = 3;
pub const REP_META_CONTEXT: u32 = 4;

pub const REP_ERR_BASE: u32 = 1 << 31;
pub const REP_ERR_UNSUP: u32 = REP_ERR_BASE + 1;
pub const REP_ERR_POLICY: u32 = REP_ERR_BASE + 2;
pub const REP_ERR_INVALID: u32 = REP_ERR_BASE + 3;
pub const REP_ERR_PLATFORM: u32 = REP_ERR_BASE + 4;
pub const REP_ERR_TLS_REQD: u32 = REP_ERR_BASE + 5;
pub const REP_ERR_UNKNOWN: u32 = REP_ERR_BASE + 6;
pub const REP_ERR_SHUTDOWN: u32 = REP_ERR_BASE + 7;
pub const REP_ERR_BLOCK_SIZE_REQD: u32 = REP_ERR_BASE + 8;
pub const REP_ERR_TOO_BIG: u32 = REP_ERR_BASE + 9;

/// True if an option reply code signals an error.
#[must_use]
pub const fn is_error_reply(reply: u32) -> bool {
    reply >= REP_ERR_BASE
}

/// Builtin message for an option error reply, used when the server did
/// not send one.
#[must_use]
pub const fn error_reply_message(reply: u32) -> &'static str {
    match reply {
        REP_ERR_UNSUP => "the option sent by the client is unknown by this server",
        REP_ERR_POLICY => "server-side policy forbids the server to allow the option",
        REP_ERR_INVALID => "the option sent by the client is invalid",
        REP_ERR_PLATFORM => "the option is not supported on the server platform",
        REP_ERR_TLS_REQD => "the server requires TLS before continuing negotiation",
        REP_ERR_UNKNOWN => "the requested export is not available",
        REP_ERR_SHUTDOWN => "the server is in the process of being shut down",
        REP_ERR_BLOCK_SIZE_REQD => {
            "the server requires the client to acknowledge its block size constraints"
        }
        REP_ERR_TOO_BIG => "the request or the reply is too large to process",
        _ => "unknown error",
    }
}

// ── Info replies ──────────────────────────────────────────────────────────────

pub const INFO_EXPORT: u16 = 0;
pub const INFO_BLOCK_SIZE: u16 = 3;

// ── Commands ──────────────────────────────────────────────────────────────────

pub const CMD_READ: u16 = 0;
pub const CMD_WRITE: u16 = 1;
pub const CMD_DISC: u16 = 2;
pub const CMD_FLUSH: u16 = 3;
pub const CMD_WRITE_ZEROES: u16 = 6;
pub const CMD_BLOCK_STATUS: u16 = 7;

/// Valid only for CMD_WRITE_ZEROES: do not punch a hole, allocate the
/// zeroed range.
pub const CMD_FLAG_NO_HOLE: u16 = 1 << 1;

// ── Structured replies ────────────────────────────────────────────────────────

pub const REPLY_FLAG_DONE: u16 = 1 << 0;

pub const REPLY_TYPE_NONE: u16 = 0;
pub const REPLY_TYPE_OFFSET_DATA: u16 = 1;
pub const REPLY_TYPE_OFFSET_HOLE: u16 = 2;
pub const REPLY_TYPE_BLOCK_STATUS: u16 = 5;
pub const REPLY_ERROR_BASE: u16 = 1 << 15;
pub const REPLY_TYPE_ERROR: u16 = REPLY_ERROR_BASE + 1;
pub const REPLY_TYPE_ERROR_OFFSET: u16 = REPLY_ERROR_BASE + 2;

// ── Meta contexts ─────────────────────────────────────────────────────────────

pub const BASE_ALLOCATION: &str = "base:allocation";
pub const QEMU_ALLOCATION_DEPTH: &str = "qemu:allocation-depth";
pub const QEMU_DIRTY_BITMAP: &str = "qemu:dirty-bitmap:";

// Flags for the base:allocation context. The range does not allocate
// data on storage (STATE_HOLE) or reads as zero (STATE_ZERO).
pub const STATE_HOLE: u32 = 1 << 0;
pub const STATE_ZERO: u32 = 1 << 1;

// Flag for qemu:dirty-bitmap:* contexts.
pub const STATE_DIRTY: u32 = 1 << 0;

// Internal extent flag bits. NBD allocation, depth, and dirty contexts
// use overlapping flag numbers; they are remapped to disjoint bits so a
// single flags word can carry merged results.
pub const EXTENT_HOLE: u32 = 1 << 0;
pub const EXTENT_ZERO: u32 = 1 << 1;
pub const EXTENT_DIRTY: u32 = 1 << 2;
pub const EXTENT_BACKING: u32 = 1 << 3;

// ── Limits ────────────────────────────────────────────────────────────────────

/// Maximum NBD request length.
pub const MAX_LENGTH: u64 = u32::MAX as u64;

/// The NBD protocol does not bound the number of extents a server may send in
/// one block status reply. Practically the minimum extent size is the
/// file system block size, so assume a raw image with 4 KiB blocks and
/// fail the connection on anything larger.
pub const MAX_EXTENTS: usize = (u32::MAX / 4096) as usize;

// ── Error mapping ─────────────────────────────────────────────────────────────

/// Map an NBD reply error code to a system errno. Unknown codes are
/// passed through.
#[must_use]
pub const fn reply_errno(code: u32) -> i32 {
    match code {
        1 => libc::EPERM,
        5 => libc::EIO,
        12 => libc::ENOMEM,
        22 => libc::EINVAL,
        28 => libc::ENOSPC,
        75 => libc::EOVERFLOW,
        108 => libc::ESHUTDOWN,
        other => other as i32,
    }
}

/// Human readable description of a reply error code.
#[must_use]
pub fn strerror(code: u32) -> String {
    std::io::Error::from_raw_os_error(reply_errno(code)).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_reply_detection() {
        assert!(is_error_reply(REP_ERR_UNSUP));
        assert!(is_error_reply(REP_ERR_TOO_BIG));
        assert!(!is_error_reply(REP_ACK));
        assert!(!is_error_reply(REP_META_CONTEXT));
    }

    #[test]
    fn test_reply_errno() {
        assert_eq!(reply_errno(1), libc::EPERM);
        assert_eq!(reply_errno(5), libc::EIO);
        assert_eq!(reply_errno(28), libc::ENOSPC);
        // Unknown codes pass through.
        assert_eq!(reply_errno(1234), 1234);
    }
}
