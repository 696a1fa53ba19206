//! Archive framing: every section is an unsigned varint length followed by
//! that many bytes.

use std::io::ErrorKind;

use cid::Cid;
use integer_encoding::VarInt;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::Error;

/// Largest section accepted. Repository blocks are capped well below it.
pub(crate) const MAX_SECTION_LEN: usize = 4 * 1024 * 1024;

/// A `u64` varint takes at most ten bytes.
const MAX_VARINT_LEN: usize = 10;

/// Reads a section length. `None` when the input ends before its first byte.
async fn read_section_len<R>(reader: &mut R) -> Result<Option<usize>, Error>
where
    R: AsyncRead + Send + Unpin,
{
    let mut prefix = [0u8; MAX_VARINT_LEN];
    for read in 0..MAX_VARINT_LEN {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof && read == 0 => return Ok(None),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(Error::Truncated(format!(
                    "input ends inside a section length after {read} bytes"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        prefix[read] = byte;
        if byte & 0x80 == 0 {
            let (len, _) = u64::decode_var(&prefix[..=read])
                .ok_or_else(|| Error::Parsing("invalid section length".to_string()))?;
            return match usize::try_from(len) {
                Ok(len) if len <= MAX_SECTION_LEN => Ok(Some(len)),
                _ => Err(Error::SectionTooLarge(len)),
            };
        }
    }
    Err(Error::Parsing("section length longer than ten bytes".to_string()))
}

/// Reads the next section into `buf`.
pub(crate) async fn read_section<'a, R>(
    reader: &mut R,
    buf: &'a mut Vec<u8>,
) -> Result<Option<&'a [u8]>, Error>
where
    R: AsyncRead + Send + Unpin,
{
    let Some(len) = read_section_len(reader).await? else {
        return Ok(None);
    };
    buf.resize(len, 0);
    reader.read_exact(buf).await.map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => {
            Error::Truncated(format!("input ends inside a section of {len} bytes"))
        }
        _ => e.into(),
    })?;
    Ok(Some(buf.as_slice()))
}

/// Reads the next block section: a CID followed by the block data.
pub(crate) async fn read_block<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> Result<Option<(Cid, Vec<u8>)>, Error>
where
    R: AsyncRead + Send + Unpin,
{
    let Some(section) = read_section(reader, buf).await? else {
        return Ok(None);
    };
    let mut cursor = std::io::Cursor::new(section);
    let cid = Cid::read_bytes(&mut cursor)?;
    let data = section[cursor.position() as usize..].to_vec();
    Ok(Some((cid, data)))
}
