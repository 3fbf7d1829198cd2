//! Walks top-level MP4 boxes in a rolling byte buffer to find the boundary
//! between the init segment (`ftyp`+`moov`, plus any interleaved `free`/`skip`)
//! and the first media fragment (`moof`).

const INIT_BOX_TYPES: [&[u8; 4]; 4] = [b"ftyp", b"moov", b"free", b"skip"];

#[derive(Debug, PartialEq, Eq)]
pub enum BoundaryResult {
    /// The boundary was found at this byte offset into the buffer.
    Found(usize),
    /// Not enough bytes yet to make a decision; keep accumulating.
    NeedMoreData,
    /// A declared box size was smaller than the 8-byte header; the stream is
    /// corrupt and the cycle should be restarted.
    Fatal,
}

/// Scans `buf` for the first top-level box whose type is not one of the init
/// box types, returning its byte offset. Each box starts with a 4-byte
/// big-endian size followed by a 4-byte ASCII type.
pub fn find_init_boundary(buf: &[u8]) -> BoundaryResult {
    let mut pos = 0usize;

    loop {
        if pos + 8 > buf.len() {
            return BoundaryResult::NeedMoreData;
        }

        let size = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        let box_type: &[u8; 4] = buf[pos + 4..pos + 8].try_into().unwrap();

        if size < 8 {
            return BoundaryResult::Fatal;
        }

        if !INIT_BOX_TYPES.contains(&box_type) {
            return BoundaryResult::Found(pos);
        }

        if pos + size > buf.len() {
            return BoundaryResult::NeedMoreData;
        }

        pos += size;
    }
}
