//! Plaintext layouts of the FILE_START / FILE_CHUNK / FILE_END frames.
//! Integers are little-endian.

use bytes::BufMut;

use super::TransferError;
use crate::protocol::MAX_FILENAME_LEN;

/// `u16 nameLen | name | u32 size | u32 crc`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStart {
    pub name: String,
    pub size: u32,
    pub crc: u32,
}

/// `u32 chunkCrc | bytes`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk<'a> {
    pub crc: u32,
    pub data: &'a [u8],
}

/// `u32 finalCrc`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEnd {
    pub crc: u32,
}

fn read_u32_le(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl FileStart {
    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        if self.name.len() > MAX_FILENAME_LEN {
            return Err(TransferError::NameTooLong(self.name.len()));
        }
        let mut out = Vec::with_capacity(2 + self.name.len() + 8);
        out.put_u16_le(self.name.len() as u16);
        out.extend_from_slice(self.name.as_bytes());
        out.put_u32_le(self.size);
        out.put_u32_le(self.crc);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, TransferError> {
        let name_len = data
            .get(..2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            .ok_or(TransferError::Malformed("file start header"))?;
        if name_len > MAX_FILENAME_LEN {
            return Err(TransferError::NameTooLong(name_len));
        }
        let name = data
            .get(2..2 + name_len)
            .ok_or(TransferError::Malformed("file name"))?;
        let name = String::from_utf8_lossy(name).into_owned();
        let size = read_u32_le(data, 2 + name_len).ok_or(TransferError::Malformed("file size"))?;
        let crc = read_u32_le(data, 6 + name_len).ok_or(TransferError::Malformed("file crc"))?;
        Ok(Self { name, size, crc })
    }
}

impl<'a> FileChunk<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.put_u32_le(self.crc);
        out.extend_from_slice(self.data);
        out
    }

    pub fn decode(data: &'a [u8]) -> Result<Self, TransferError> {
        let crc = read_u32_le(data, 0).ok_or(TransferError::Malformed("chunk crc"))?;
        Ok(Self {
            crc,
            data: &data[4..],
        })
    }
}

impl FileEnd {
    pub fn encode(&self) -> Vec<u8> {
        self.crc.to_le_bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, TransferError> {
        let crc = read_u32_le(data, 0).ok_or(TransferError::Malformed("final crc"))?;
        Ok(Self { crc })
    }
}

/// Reduces a sender-supplied name to a bare file name safe to join onto the
/// download directory.
pub fn sanitize_file_name(name: &str) -> Result<String, TransferError> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return Err(TransferError::InvalidFileName(name.to_owned()));
    }
    Ok(base.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_start_layout() {
        let start = FileStart {
            name: "a.txt".into(),
            size: 0x0102_0304,
            crc: 0xAABB_CCDD,
        };
        let bytes = start.encode().unwrap();
        assert_eq!(&bytes[..2], &[5, 0]);
        assert_eq!(&bytes[2..7], b"a.txt");
        assert_eq!(&bytes[7..11], &[4, 3, 2, 1]);
        assert_eq!(&bytes[11..], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(FileStart::decode(&bytes).unwrap(), start);
    }

    #[test]
    fn test_truncated_payloads_are_malformed() {
        assert!(matches!(FileStart::decode(&[5, 0, b'a']), Err(TransferError::Malformed(_))));
        assert!(matches!(FileChunk::decode(&[1, 2, 3]), Err(TransferError::Malformed(_))));
        assert!(matches!(FileEnd::decode(&[]), Err(TransferError::Malformed(_))));
        let mut long = 2000u16.to_le_bytes().to_vec();
        long.extend(vec![b'a'; 2000]);
        assert!(matches!(FileStart::decode(&long), Err(TransferError::NameTooLong(2000))));
    }

    #[test]
    fn test_chunk_payload() {
        let chunk = FileChunk {
            crc: 7,
            data: b"abc",
        };
        let bytes = chunk.encode();
        assert_eq!(FileChunk::decode(&bytes).unwrap(), chunk);
        assert_eq!(FileChunk::decode(&7u32.to_le_bytes()).unwrap().data, b"");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("/tmp/x/report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_file_name("..\\..\\evil.exe").unwrap(), "evil.exe");
        assert_eq!(sanitize_file_name("plain").unwrap(), "plain");
        for bad in ["", "dir/", "..", "a/..", "."] {
            assert!(sanitize_file_name(bad).is_err(), "{bad:?}");
        }
    }
}
