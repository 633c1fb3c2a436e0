use super::ProtocolError;

/// Largest decompressed snapshot a client accepts
const MAX_SNAPSHOT_SIZE: usize = 64 * 1024 * 1024;

/// lz4 block with the uncompressed size prepended (little endian u32)
pub fn compress_snapshot(filter_bytes: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(filter_bytes)
}

pub fn decompress_snapshot(compressed: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let size_bytes: [u8; 4] = compressed
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ProtocolError::Decompression("snapshot too short".to_string()))?;
    let size = u32::from_le_bytes(size_bytes) as usize;
    if size > MAX_SNAPSHOT_SIZE {
        return Err(ProtocolError::Decompression(format!(
            "snapshot of {} bytes exceeds limit",
            size
        )));
    }
    lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| ProtocolError::Decompression(e.to_string()))
}
