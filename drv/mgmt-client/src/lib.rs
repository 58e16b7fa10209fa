// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side client for the card-management protocol.
//!
//! [`MgmtClient`] is the single producer on an sGCQ instance: it allocates
//! request ids, posts request records into the SQ, drains the CQ, and hands
//! each response to the one waiter that owns its id. Requests that outlive
//! their timeout are abandoned in place: the consumer still owns the slot
//! and may complete late, in which case the response is counted and
//! discarded.
//!
//! On top of the codec sit the management operations: the identify
//! handshake, board-info and FPT reads, optical-module register access, and
//! the chunked PDI download/FPT update streams with progress reporting.
//!
//! Nothing here blocks except [`MgmtClient::wait`] (and the operations built
//! on it), which spins on a caller-supplied [`Timebase`] so the surrounding
//! task can yield between polls.

#![cfg_attr(not(test), no_std)]

mod codec;
mod ops;
mod stream;

pub use codec::{ClientStats, Completion, MgmtClient};
pub use stream::{PdiStream, StreamPhase};

use drv_mgmt_api::CmdStatus;

/// Time and yield seam for the blocking wait. On a real host this wraps the
/// OS clock and scheduler; in firmware, the kernel timer.
pub trait Timebase {
    fn now_ms(&self) -> u64;

    /// Called between completion polls. Cooperative yield point; must not
    /// touch the client.
    fn yield_now(&mut self) {}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MgmtError {
    /// Transport-level failure (header loss, ring misuse).
    Transport(sgcq::SgcqError),
    /// The FPT read back from the device did not validate.
    Fpt(fpt::FptError),
    /// The image's front matter failed validation.
    Image(pdi::PdiError),
    /// No response within the caller's timeout; the request was abandoned.
    Timeout,
    /// The peer answered with a non-success status.
    Failed { status: CmdStatus, sub_code: u32 },
    /// A PDI stream chunk was rejected; the stream is dead.
    ChunkFailed { chunk: u16, status: CmdStatus },
    /// The response record failed structural validation.
    MalformedResponse,
    /// The peer speaks a different wire version.
    WireMismatch { device: u32 },
    /// `req_id` is not outstanding.
    UnknownRequest,
    /// Request payload exceeds the bulk region (or the inline result cap).
    PayloadTooLarge,
    /// The named partition is not in the device's FPT.
    PartitionMissing,
    /// The image does not fit in the target partition.
    ImageTooLarge,
    /// The image needs more chunks than the 15-bit counter can number.
    TooManyChunks,
    /// Partition copy onto itself.
    CopyToSelf,
}

impl From<sgcq::SgcqError> for MgmtError {
    fn from(e: sgcq::SgcqError) -> Self {
        MgmtError::Transport(e)
    }
}

impl From<fpt::FptError> for MgmtError {
    fn from(e: fpt::FptError) -> Self {
        MgmtError::Fpt(e)
    }
}

impl From<pdi::PdiError> for MgmtError {
    fn from(e: pdi::PdiError) -> Self {
        MgmtError::Image(e)
    }
}

/// Parses an image's front matter for the parent-UUID compatibility check a
/// caller applies before [`MgmtClient::download_pdi`]; see
/// [`pdi::PdiInfo::matches_uuid`].
pub fn image_info(image: &[u8]) -> Result<pdi::PdiInfo, MgmtError> {
    Ok(pdi::parse(image)?)
}
