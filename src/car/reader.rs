use cid::Cid;
use futures_util::Stream;
use tokio::io::AsyncRead;

use super::{
    error::Error,
    header::CarHeader,
    util::{read_block, read_section},
};

/// Reads CAR files from an async reader.
#[derive(Debug)]
pub struct CarReader<R> {
    reader: R,
    header: CarHeader,
    buffer: Vec<u8>,
}

impl<R> CarReader<R>
where
    R: AsyncRead + Send + Unpin,
{
    /// Creates a new CarReader and parses the CarHeader
    pub async fn new(mut reader: R) -> Result<Self, Error> {
        let mut buffer = Vec::new();

        let header = match read_section(&mut reader, &mut buffer).await? {
            Some(bytes) => CarHeader::decode(bytes)?,
            None => return Err(Error::Parsing("empty input, no header".to_string())),
        };

        Ok(CarReader {
            reader,
            header,
            buffer,
        })
    }

    /// Returns the header of this car file.
    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    /// Returns the next block in the archive.
    pub async fn next_block(&mut self) -> Result<Option<(Cid, Vec<u8>)>, Error> {
        read_block(&mut self.reader, &mut self.buffer).await
    }

    pub fn stream(self) -> impl Stream<Item = Result<(Cid, Vec<u8>), Error>> {
        futures_util::stream::try_unfold(self, |mut this| async move {
            let maybe_block = read_block(&mut this.reader, &mut this.buffer).await?;
            Ok(maybe_block.map(|b| (b, this)))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use futures_util::TryStreamExt;
    use multihash_codetable::{Code, MultihashDigest};

    use super::*;
    use crate::car::{CarWriter, DAG_CBOR, RAW};

    #[tokio::test]
    async fn car_write_read() {
        let cid_test = Cid::new_v1(RAW, Code::Sha2_256.digest(b"test"));
        let cid_foo = Cid::new_v1(DAG_CBOR, Code::Sha2_256.digest(b"foo"));

        let header = CarHeader::new_v1(vec![cid_foo]);

        let mut buffer = Vec::new();
        let mut writer = CarWriter::new(header, &mut buffer);
        writer.write(cid_test, b"test").await.unwrap();
        writer.write(cid_foo, b"foo").await.unwrap();
        writer.finish().await.unwrap();

        let reader = Cursor::new(&buffer);
        let car_reader = CarReader::new(reader).await.unwrap();
        assert_eq!(car_reader.header().root(), Some(cid_foo));
        let files: Vec<_> = car_reader.stream().try_collect().await.unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].0, cid_test);
        assert_eq!(files[0].1, b"test");
        assert_eq!(files[1].0, cid_foo);
        assert_eq!(files[1].1, b"foo");
    }

    #[tokio::test]
    async fn truncated_archive_fails() {
        let cid = Cid::new_v1(RAW, Code::Sha2_256.digest(&[1u8; 200]));
        let mut buffer = Vec::new();
        let mut writer = CarWriter::new(CarHeader::new_v1(vec![cid]), &mut buffer);
        writer.write(cid, [1u8; 200]).await.unwrap();
        writer.finish().await.unwrap();

        // cut inside the two byte length of the block section
        let header_len = {
            let mut reader = CarReader::new(Cursor::new(&buffer)).await.unwrap();
            assert!(reader.next_block().await.unwrap().is_some());
            buffer.len() - 200 - cid.encoded_len() - 2
        };
        buffer.truncate(header_len + 1);
        let mut reader = CarReader::new(Cursor::new(&buffer)).await.unwrap();
        assert!(matches!(reader.next_block().await, Err(Error::Truncated(_))));
    }

    #[tokio::test]
    async fn empty_input_is_not_a_car() {
        let res = CarReader::new(Cursor::new(Vec::<u8>::new())).await;
        assert!(matches!(res, Err(Error::Parsing(_))));
    }
}
