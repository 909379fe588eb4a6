// Length-delimited framing for envelopes.
//
// Each envelope travels as one frame: a 4-byte big-endian length followed by
// that many bytes of JSON. The frame functions work on raw bytes so they stay
// independent of the codec; `write_envelope`/`read_envelope` combine the two
// for callers that just want typed envelopes on a stream.
//
// `MAX_FRAME_SIZE` bounds the allocation a bogus length prefix can cause. Full
// snapshots are the largest frames in practice.

use std::io::{self, Read, Write};

use crate::codec::{self, Envelope};
use crate::error::Error;

/// Largest accepted frame (4 MiB).
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds {MAX_FRAME_SIZE}", payload.len()),
            )
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one frame.
///
/// A stream that ends before a complete frame yields `UnexpectedEof`; an
/// oversized length prefix yields `InvalidData` without allocating.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {MAX_FRAME_SIZE}"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Encode and frame an envelope.
pub fn write_envelope<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<(), Error> {
    let bytes = codec::encode(envelope)?;
    write_frame(writer, &bytes)?;
    Ok(())
}

/// Read and decode one envelope. A clean end of stream maps to
/// `Error::Closed`.
pub fn read_envelope<R: Read>(reader: &mut R) -> Result<Envelope, Error> {
    let bytes = match read_frame(reader) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Err(Error::Closed),
        Err(err) => return Err(err.into()),
    };
    Ok(codec::decode(&bytes)?)
}
