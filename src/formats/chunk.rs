//! A minimal chunked binary stream.
//!
//! Every chunk starts with a four byte identifier, a version and the length of its payload,
//! so readers can verify what they read and skip chunks they are not interested in.
//! All values are little endian.

use crate::error::{TerrainError, TerrainResult};
use bevy::math::Vec3;
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use std::io::{Read, Seek, SeekFrom, Write};

pub type ChunkId = [u8; 4];

pub const CHUNK_HEADER_SIZE: u64 = 4 + 2 + 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id: ChunkId,
    pub version: u16,
    pub length: u32,
}

fn id_to_string(id: &ChunkId) -> String {
    String::from_utf8_lossy(id).into_owned()
}

/// Serializes values into an in-memory buffer, nesting chunks as needed.
#[derive(Default)]
pub struct ChunkWriter {
    buffer: Vec<u8>,
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_to<W: Write>(self, writer: &mut W) -> TerrainResult<()> {
        writer.write_all(&self.buffer)?;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_vec3(&mut self, value: Vec3) {
        value.to_array().into_iter().for_each(|v| self.write_f32(v));
    }

    pub fn write_f32s(&mut self, values: &[f32]) {
        self.buffer.reserve(values.len() * 4);
        values.iter().for_each(|&v| self.write_f32(v));
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_u16(value.len() as u16);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Writes `raw` as a zlib compressed block prefixed by its raw and compressed length.
    pub fn write_compressed(&mut self, raw: &[u8]) -> TerrainResult<()> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw)?;
        let compressed = encoder.finish()?;

        self.write_u32(raw.len() as u32);
        self.write_u32(compressed.len() as u32);
        self.write_bytes(&compressed);

        Ok(())
    }

    /// Writes a nested chunk, whose payload is produced by `body`.
    pub fn write_chunk<F>(&mut self, id: &ChunkId, version: u16, body: F) -> TerrainResult<()>
    where
        F: FnOnce(&mut ChunkWriter) -> TerrainResult<()>,
    {
        let mut payload = ChunkWriter::new();
        body(&mut payload)?;

        self.write_bytes(id);
        self.write_u16(version);
        self.write_u32(payload.buffer.len() as u32);
        self.write_bytes(&payload.buffer);

        Ok(())
    }
}

/// Reads values and chunks from a seekable stream.
pub struct ChunkReader<R> {
    inner: R,
}

impl<R: Read + Seek> ChunkReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn position(&mut self) -> TerrainResult<u64> {
        Ok(self.inner.stream_position()?)
    }

    pub fn seek_to(&mut self, position: u64) -> TerrainResult<()> {
        self.inner.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    fn read_header(&mut self) -> TerrainResult<ChunkHeader> {
        let mut id = [0; 4];
        self.inner.read_exact(&mut id)?;

        Ok(ChunkHeader {
            id,
            version: self.read_u16()?,
            length: self.read_u32()?,
        })
    }

    /// Reads the next chunk header without consuming it.
    pub fn peek_chunk(&mut self) -> TerrainResult<ChunkHeader> {
        let position = self.position()?;
        let header = self.read_header();
        self.seek_to(position)?;
        header
    }

    /// Consumes the header of the next chunk and verifies its identifier and version.
    pub fn begin_chunk(&mut self, id: &ChunkId, max_version: u16) -> TerrainResult<ChunkHeader> {
        let header = self.read_header()?;

        if &header.id != id {
            return Err(TerrainError::UnexpectedChunk {
                expected: id_to_string(id),
                found: id_to_string(&header.id),
            });
        }

        if header.version > max_version {
            return Err(TerrainError::UnsupportedChunkVersion {
                id: id_to_string(id),
                version: header.version,
            });
        }

        Ok(header)
    }

    /// Skips the next chunk entirely, returning its header.
    pub fn skip_chunk(&mut self) -> TerrainResult<ChunkHeader> {
        let header = self.read_header()?;
        self.inner.seek(SeekFrom::Current(header.length as i64))?;
        Ok(header)
    }

    pub fn read_u8(&mut self) -> TerrainResult<u8> {
        let mut bytes = [0; 1];
        self.inner.read_exact(&mut bytes)?;
        Ok(bytes[0])
    }

    pub fn read_bool(&mut self) -> TerrainResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> TerrainResult<u16> {
        let mut bytes = [0; 2];
        self.inner.read_exact(&mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    pub fn read_u32(&mut self) -> TerrainResult<u32> {
        let mut bytes = [0; 4];
        self.inner.read_exact(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_f32(&mut self) -> TerrainResult<f32> {
        let mut bytes = [0; 4];
        self.inner.read_exact(&mut bytes)?;
        Ok(f32::from_le_bytes(bytes))
    }

    pub fn read_vec3(&mut self) -> TerrainResult<Vec3> {
        Ok(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    pub fn read_f32s(&mut self, count: usize) -> TerrainResult<Vec<f32>> {
        let mut bytes = vec![0; count * 4];
        self.inner.read_exact(&mut bytes)?;
        Ok(bytes_to_f32s(&bytes))
    }

    pub fn read_str(&mut self) -> TerrainResult<String> {
        let length = self.read_u16()? as usize;
        let mut bytes = vec![0; length];
        self.inner.read_exact(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn read_bytes(&mut self, count: usize) -> TerrainResult<Vec<u8>> {
        let mut bytes = vec![0; count];
        self.inner.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Reads and inflates a block written by [`ChunkWriter::write_compressed`].
    pub fn read_compressed(&mut self) -> TerrainResult<Vec<u8>> {
        let raw_length = self.read_u32()? as usize;
        let compressed_length = self.read_u32()? as usize;
        let compressed = self.read_bytes(compressed_length)?;

        let mut raw = Vec::with_capacity(raw_length);
        ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut raw)?;

        if raw.len() != raw_length {
            return Err(TerrainError::DecompressedSizeMismatch {
                expected: raw_length,
                actual: raw.len(),
            });
        }

        Ok(raw)
    }
}

pub(crate) fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn bytes_to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn nested_chunks() {
        let mut writer = ChunkWriter::new();
        writer
            .write_chunk(b"OUTR", 1, |w| {
                w.write_u16(513);
                w.write_chunk(b"SKIP", 3, |w| {
                    w.write_f32s(&[1.0; 16]);
                    Ok(())
                })?;
                w.write_chunk(b"INNR", 1, |w| {
                    w.write_str("height");
                    w.write_compressed(&f32s_to_bytes(&[0.5; 100]))
                })
            })
            .unwrap();

        let mut reader = ChunkReader::new(Cursor::new(writer.into_bytes()));
        reader.begin_chunk(b"OUTR", 1).unwrap();
        assert_eq!(reader.read_u16().unwrap(), 513);
        assert_eq!(reader.skip_chunk().unwrap().id, *b"SKIP");
        assert_eq!(reader.peek_chunk().unwrap().id, *b"INNR");
        reader.begin_chunk(b"INNR", 1).unwrap();
        assert_eq!(reader.read_str().unwrap(), "height");
        assert_eq!(
            bytes_to_f32s(&reader.read_compressed().unwrap()),
            vec![0.5; 100]
        );
    }

    #[test]
    fn rejects_unexpected_chunks() {
        let mut writer = ChunkWriter::new();
        writer.write_chunk(b"TERR", 2, |_| Ok(())).unwrap();
        let bytes = writer.into_bytes();

        let mut reader = ChunkReader::new(Cursor::new(bytes.clone()));
        assert!(matches!(
            reader.begin_chunk(b"TLOD", 1),
            Err(TerrainError::UnexpectedChunk { .. })
        ));

        let mut reader = ChunkReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.begin_chunk(b"TERR", 1),
            Err(TerrainError::UnsupportedChunkVersion { version: 2, .. })
        ));
    }
}
