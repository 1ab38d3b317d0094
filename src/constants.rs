//! Crate-wide constants for tsnet-bridge.
//!
//! Buffer sizes, handle numbering, and the frozen control-protocol limits
//! live here so both ends of every channel agree on them.
//!
//! # Categories
//!
//! - **Descriptor transfer**: marker payload and receive buffer sizes
//! - **Handles**: first value issued per handle category
//! - **Control protocol**: widths and limits shared by client and worker
//! - **Loopback**: credential sizes

// ============================================================================
// Descriptor transfer
// ============================================================================

/// Regular payload sent alongside every transferred descriptor.
///
/// The byte value carries no meaning; the receiver only needs a non-empty
/// payload so the kernel delivers the ancillary block with it.
pub const FD_MARKER: &[u8] = b"\x01";

/// Size of the regular payload buffer used by `recvmsg`.
pub const RECV_PAYLOAD_BUF: usize = 256;

/// Size of the ancillary (control) buffer used by `recvmsg`.
///
/// One `SCM_RIGHTS` block for a single descriptor needs `CMSG_SPACE(4)`
/// (24 bytes on 64-bit Linux); 256 leaves generous headroom.
pub const RECV_CONTROL_BUF: usize = 256;

// ============================================================================
// Handles
// ============================================================================

/// First server handle issued by a bridge.
pub const SERVER_HANDLE_BASE: u32 = (42 << 16) + 1;

/// First listener handle issued by a bridge.
pub const LISTENER_HANDLE_BASE: u32 = (43 << 16) + 1;

/// First connection handle issued by a bridge.
pub const CONN_HANDLE_BASE: u32 = (44 << 16) + 1;

// ============================================================================
// Control protocol
// ============================================================================

/// Width of a handle argument or result on the control pipe.
pub const HANDLE_WIDTH: usize = 4;

/// Width of a status result on the control pipe.
pub const STATUS_WIDTH: usize = 4;

/// Largest error text the worker will transfer in one `ReadErrorMessage`.
pub const MAX_ERROR_TEXT: usize = 4096;

// ============================================================================
// Loopback
// ============================================================================

/// Exact length of each loopback credential token.
pub const CREDENTIAL_LEN: usize = 32;

/// Storage needed for the NUL-terminated text form of a credential.
pub const CREDENTIAL_CSTR_LEN: usize = CREDENTIAL_LEN + 1;
