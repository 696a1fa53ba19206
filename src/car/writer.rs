use cid::Cid;
use integer_encoding::VarIntAsyncWriter;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{error::Error, header::CarHeader};

#[derive(Debug)]
pub struct CarWriter<W> {
    header: CarHeader,
    writer: W,
    cid_buffer: Vec<u8>,
    is_header_written: bool,
}

impl<W> CarWriter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(header: CarHeader, writer: W) -> Self {
        CarWriter {
            header,
            writer,
            cid_buffer: Vec::new(),
            is_header_written: false,
        }
    }

    async fn write_header(&mut self) -> Result<(), Error> {
        if !self.is_header_written {
            let header_bytes = self.header.encode()?;
            self.writer.write_varint_async(header_bytes.len()).await?;
            self.writer.write_all(&header_bytes).await?;
            self.is_header_written = true;
        }
        Ok(())
    }

    /// Writes header and stream of data to writer in Car format.
    pub async fn write<T>(&mut self, cid: Cid, data: T) -> Result<(), Error>
    where
        T: AsRef<[u8]>,
    {
        self.write_header().await?;

        self.cid_buffer.clear();
        cid.write_bytes(&mut self.cid_buffer)?;

        let data = data.as_ref();
        let len = self.cid_buffer.len() + data.len();

        self.writer.write_varint_async(len).await?;
        self.writer.write_all(&self.cid_buffer).await?;
        self.writer.write_all(data).await?;

        Ok(())
    }

    /// Finishes writing, including flushing and returns the writer.
    ///
    /// An archive without blocks still gets its header.
    pub async fn finish(mut self) -> Result<W, Error> {
        self.write_header().await?;
        self.flush().await?;
        Ok(self.writer)
    }

    /// Flushes the underlying writer.
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush().await?;
        Ok(())
    }
}
