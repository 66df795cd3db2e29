//! Big-endian field helpers shared by the header and payload codecs.

use crate::header::WireError;

pub(crate) fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn get_u16(buf: &[u8], offset: usize) -> Result<u16, WireError> {
    let bytes = field(buf, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn get_u32(buf: &[u8], offset: usize) -> Result<u32, WireError> {
    let bytes = field(buf, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn get_u64(buf: &[u8], offset: usize) -> Result<u64, WireError> {
    let bytes = field(buf, offset, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(raw))
}

fn field(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], WireError> {
    buf.get(offset..offset + len)
        .ok_or(WireError::ShortPayload {
            needed: offset + len,
            got: buf.len(),
        })
}
