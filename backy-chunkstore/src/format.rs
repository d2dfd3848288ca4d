//! On-disk framing for a compressed chunk file.
//!
//! A chunk file is a magic byte `0xF0`, a 4-byte big-endian uncompressed
//! length, and an LZO payload. Unlike Python's `lzo` module, `minilzo`
//! needs the decompressed length up front, so we store it instead of
//! assuming every chunk is exactly `CHUNK_SIZE` — the last chunk of a file
//! is commonly shorter.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use backy_api_types::BackyError;

const MAGIC: u8 = 0xF0;
const HEADER_LEN: usize = 5;

/// Compress `data` and frame it for on-disk storage.
pub fn compress_chunk(data: &[u8]) -> Result<Vec<u8>, BackyError> {
    let payload = minilzo::compress(data)
        .map_err(|err| BackyError::Backend(format!("lzo compress: {err}")))?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(MAGIC);
    out.write_u32::<BigEndian>(data.len() as u32)
        .expect("writing to a Vec cannot fail");
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Reverse of `compress_chunk`: validate the header and decompress the
/// payload back to the original bytes.
pub fn decompress_chunk(framed: &[u8]) -> Result<Vec<u8>, BackyError> {
    if framed.len() < HEADER_LEN {
        return Err(BackyError::Backend(
            "chunk file shorter than its header".into(),
        ));
    }
    if framed[0] != MAGIC {
        return Err(BackyError::Backend(
            "chunk file does not start with the expected magic byte".into(),
        ));
    }
    let mut header = &framed[1..HEADER_LEN];
    let len = header
        .read_u32::<BigEndian>()
        .expect("slice of exactly 4 bytes") as usize;
    let data = minilzo::decompress(&framed[HEADER_LEN..], len)
        .map_err(|err| BackyError::Backend(format!("lzo decompress: {err}")))?;
    if data.len() != len {
        return Err(BackyError::Backend(format!(
            "chunk decompressed to {} bytes, header declared {}",
            data.len(),
            len
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_data() {
        let data = vec![7u8; 1024];
        let framed = compress_chunk(&data).unwrap();
        assert_eq!(framed[0], MAGIC);
        let back = decompress_chunk(&framed).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn round_trips_short_final_chunk() {
        let data = b"a short trailing chunk".to_vec();
        let framed = compress_chunk(&data).unwrap();
        let back = decompress_chunk(&framed).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut framed = compress_chunk(b"hello").unwrap();
        framed[0] = 0x00;
        assert!(decompress_chunk(&framed).is_err());
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(decompress_chunk(&[0xF0, 0, 0]).is_err());
    }
}
