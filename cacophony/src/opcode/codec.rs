//! Binary framing of the opcode log.
//!
//! A log is a sequence of gzip members. Each member holds records of the form
//! `tag: u32 BE | len: u32 BE | payload`, where the payload is the postcard encoding of the
//! opcode's fields. Appending a new member never touches existing bytes.

use std::io::{self, Read, Write};

use flate2::{read::MultiGzDecoder, write::GzEncoder, Compression};
use tracing::{trace, warn};

use super::{Opcode, OpcodeKind};
use crate::projection::{FolloweeMutation, MiscMutation};

/// Upper bound for a single record, anything larger is treated as corruption.
const MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;

/// Errors reading or writing the opcode log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log io: {0}")]
    Io(#[from] io::Error),
    #[error("unknown opcode tag {0}")]
    UnknownOpcode(u32),
    #[error("corrupt {kind} record: {source}")]
    Corrupt {
        kind: OpcodeKind,
        source: postcard::Error,
    },
    #[error("record of {0} bytes exceeds the size limit")]
    TooLarge(u32),
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: OpcodeKind,
        source: postcard::Error,
    },
}

/// Writes opcodes as one compressed member into a sink.
///
/// The member is finalized by [`OpcodeWriter::finish`]. Dropping the writer without
/// finishing still attempts to finalize and always releases the sink.
pub struct OpcodeWriter<W: Write> {
    encoder: GzEncoder<W>,
    written: usize,
}

impl<W: Write> std::fmt::Debug for OpcodeWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcodeWriter")
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

/// Starts a new compressed opcode member on `sink`.
pub fn create_writer<W: Write>(sink: W) -> OpcodeWriter<W> {
    OpcodeWriter {
        encoder: GzEncoder::new(sink, Compression::default()),
        written: 0,
    }
}

impl<W: Write> OpcodeWriter<W> {
    /// Appends one record.
    pub fn write(&mut self, op: &Opcode) -> Result<(), LogError> {
        let kind = op.kind();
        let payload = op
            .encode_payload()
            .map_err(|source| LogError::Encode { kind, source })?;
        let len = u32::try_from(payload.len()).map_err(|_| LogError::TooLarge(u32::MAX))?;
        if len > MAX_RECORD_SIZE {
            return Err(LogError::TooLarge(len));
        }
        self.encoder.write_all(&(kind as u32).to_be_bytes())?;
        self.encoder.write_all(&len.to_be_bytes())?;
        self.encoder.write_all(&payload)?;
        self.written += 1;
        Ok(())
    }

    /// Number of records written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Finalizes the compressed member and hands back the sink.
    pub fn finish(self) -> Result<W, LogError> {
        Ok(self.encoder.finish()?)
    }
}

/// Outcome of [`decode_whole_stream`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Replay {
    /// Records applied.
    pub applied: usize,
    /// The stream ended inside a record. Anything appended after such a tail is unreadable,
    /// so the log has to be rewritten before it is written again.
    pub torn_tail: bool,
}

/// Reads every record of `input` and applies it to `ctx` in write order.
///
/// A clean end of stream is success. A stream that ends inside a record is treated as
/// ending before that record and reported through [`Replay::torn_tail`]. An unknown tag or
/// an undecodable payload is an error and nothing after it is applied.
pub fn decode_whole_stream<R, C>(input: R, ctx: &mut C) -> Result<Replay, LogError>
where
    R: Read,
    C: MiscMutation + FolloweeMutation,
{
    let mut reader = MultiGzDecoder::new(input);
    let mut replay = Replay::default();
    loop {
        let header = match read_header(&mut reader) {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(applied = replay.applied, "opcode log ends inside a record, ignoring the tail");
                replay.torn_tail = true;
                break;
            }
            Err(err) => return Err(err.into()),
        };
        let tag = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let kind = OpcodeKind::from_repr(tag).ok_or(LogError::UnknownOpcode(tag))?;
        if len > MAX_RECORD_SIZE {
            return Err(LogError::TooLarge(len));
        }
        let mut payload = vec![0u8; len as usize];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(applied = replay.applied, %kind, "opcode log ends inside a record, ignoring the tail");
                replay.torn_tail = true;
                break;
            }
            Err(err) => return Err(err.into()),
        }
        let op = Opcode::decode_payload(kind, &payload)
            .map_err(|source| LogError::Corrupt { kind, source })?;
        trace!(%kind, "replay");
        op.apply(ctx);
        replay.applied += 1;
    }
    Ok(replay)
}

/// Reads a record header, `None` on a clean end of stream.
fn read_header<R: Read>(reader: &mut R) -> io::Result<Option<[u8; 8]>> {
    let mut header = [0u8; 8];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(Some(header))
}
