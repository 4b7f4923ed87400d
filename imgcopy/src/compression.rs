//! Compression format identities, stream sniffing, and the background
//! codec workers the blob pipeline splices in.

use std::io::Write as _;

use log::error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, SimplexStream, WriteHalf};

use crate::errors::Error;
use crate::stream::{BoxedReader, pipe_reader};

/// How many leading bytes are enough to identify any of the known formats.
const MAX_MAGIC_LEN: usize = 6;

const WORKER_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Gzip,
    Zstd,
    Bzip2,
    Xz,
}

impl CompressionFormat {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionFormat::Gzip => "gzip",
            CompressionFormat::Zstd => "zstd",
            CompressionFormat::Bzip2 => "bzip2",
            CompressionFormat::Xz => "xz",
        }
    }

    fn magic(&self) -> &'static [u8] {
        match self {
            CompressionFormat::Gzip => &[0x1f, 0x8b],
            CompressionFormat::Zstd => &[0x28, 0xb5, 0x2f, 0xfd],
            CompressionFormat::Bzip2 => b"BZh",
            CompressionFormat::Xz => &[0xfd, b'7', b'z', b'X', b'Z', 0x00],
        }
    }

    pub fn detect(prefix: &[u8]) -> Option<CompressionFormat> {
        use CompressionFormat::*;
        [Gzip, Zstd, Bzip2, Xz]
            .into_iter()
            .find(|f| prefix.starts_with(f.magic()))
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The algorithm the pipeline compresses with when the destination wants
/// compressed layers but names no format.
pub const DEFAULT_COMPRESSION_FORMAT: CompressionFormat = CompressionFormat::Gzip;

/// The compression a layer media type promises to carry. Used only for a
/// mismatch warning; the sniffed format wins.
pub fn expected_format_for_media_type(media_type: &str) -> Option<CompressionFormat> {
    match media_type {
        "application/vnd.oci.image.layer.v1.tar+gzip"
        | "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip"
        | "application/vnd.docker.image.rootfs.diff.tar.gzip"
        | "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip" => {
            Some(CompressionFormat::Gzip)
        }
        "application/vnd.oci.image.layer.v1.tar+zstd"
        | "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd" => {
            Some(CompressionFormat::Zstd)
        }
        _ => None,
    }
}

async fn read_prefix(reader: &mut BoxedReader, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Peek the stream's first bytes, identify the compression format if any,
/// and return a reader that re-emits the peeked prefix followed by the
/// rest.
pub async fn detect_compression(
    mut reader: BoxedReader,
) -> std::io::Result<(Option<CompressionFormat>, BoxedReader)> {
    let mut prefix = vec![0u8; MAX_MAGIC_LEN];
    let n = read_prefix(&mut reader, &mut prefix).await?;
    prefix.truncate(n);
    let format = CompressionFormat::detect(&prefix);
    let reader: BoxedReader = Box::new(std::io::Cursor::new(prefix).chain(reader));
    Ok((format, reader))
}

/// Recompress `src` into `format` on a background worker; the returned
/// reader yields the compressed stream.
pub fn compress_stream(src: BoxedReader, format: CompressionFormat) -> Result<BoxedReader, Error> {
    match format {
        CompressionFormat::Gzip => Ok(Box::new(pipe_reader(|wr| gzip_compress_worker(src, wr)))),
        CompressionFormat::Zstd => Ok(Box::new(pipe_reader(|wr| zstd_compress_worker(src, wr)))),
        other => Err(Error::Unsupported(format!(
            "compressing to {other} is not supported"
        ))),
    }
}

/// Decompress `src` (known to be in `format`) on a background worker.
pub fn decompress_stream(
    src: BoxedReader,
    format: CompressionFormat,
) -> Result<BoxedReader, Error> {
    match format {
        CompressionFormat::Gzip => Ok(Box::new(pipe_reader(|wr| gzip_decompress_worker(src, wr)))),
        CompressionFormat::Zstd => Ok(Box::new(pipe_reader(|wr| zstd_decompress_worker(src, wr)))),
        other => Err(Error::Unsupported(format!(
            "decompressing {other} is not supported"
        ))),
    }
}

async fn gzip_compress_worker(
    mut src: BoxedReader,
    mut wr: WriteHalf<SimplexStream>,
) -> std::io::Result<()> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut buf = vec![0u8; WORKER_CHUNK_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
        let out = std::mem::take(encoder.get_mut());
        if !out.is_empty() {
            wr.write_all(&out).await?;
        }
    }
    let out = encoder.finish()?;
    if !out.is_empty() {
        wr.write_all(&out).await?;
    }
    wr.shutdown().await
}

async fn gzip_decompress_worker(
    mut src: BoxedReader,
    mut wr: WriteHalf<SimplexStream>,
) -> std::io::Result<()> {
    let mut decoder = flate2::write::GzDecoder::new(Vec::new());
    let mut buf = vec![0u8; WORKER_CHUNK_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        decoder.write_all(&buf[..n])?;
        let out = std::mem::take(decoder.get_mut());
        if !out.is_empty() {
            wr.write_all(&out).await?;
        }
    }
    let out = decoder.finish()?;
    if !out.is_empty() {
        wr.write_all(&out).await?;
    }
    wr.shutdown().await
}

async fn zstd_compress_worker(
    mut src: BoxedReader,
    mut wr: WriteHalf<SimplexStream>,
) -> std::io::Result<()> {
    let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), zstd::DEFAULT_COMPRESSION_LEVEL)?;
    let mut buf = vec![0u8; WORKER_CHUNK_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
        let out = std::mem::take(encoder.get_mut());
        if !out.is_empty() {
            wr.write_all(&out).await?;
        }
    }
    let out = encoder.finish()?;
    if !out.is_empty() {
        wr.write_all(&out).await?;
    }
    wr.shutdown().await
}

async fn zstd_decompress_worker(
    mut src: BoxedReader,
    mut wr: WriteHalf<SimplexStream>,
) -> std::io::Result<()> {
    let mut decoder = zstd::stream::write::Decoder::new(Vec::new())?;
    let mut buf = vec![0u8; WORKER_CHUNK_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        decoder.write_all(&buf[..n])?;
        let out = std::mem::take(decoder.get_mut());
        if !out.is_empty() {
            wr.write_all(&out).await?;
        }
    }
    decoder.flush()?;
    let out = std::mem::take(decoder.get_mut());
    if !out.is_empty() {
        wr.write_all(&out).await?;
    }
    wr.shutdown().await
}

/// Compressor names as recorded in the blob-info cache.
pub mod compressor_names {
    pub const GZIP: &str = "gzip";
    pub const ZSTD: &str = "zstd";
    pub const ZSTD_CHUNKED: &str = "zstd:chunked";
    pub const UNCOMPRESSED: &str = "uncompressed";
    pub const UNKNOWN: &str = "unknown";
}

/// Cache name for an optional sniffed/produced format.
pub(crate) fn compressor_name_of(format: Option<CompressionFormat>) -> &'static str {
    match format {
        Some(f) => match f {
            CompressionFormat::Gzip => compressor_names::GZIP,
            CompressionFormat::Zstd => compressor_names::ZSTD,
            // recognized but we carry no codec; record them as unknown so
            // nobody tries to substitute them
            CompressionFormat::Bzip2 | CompressionFormat::Xz => {
                error!("recording unsupported compressor {f} as unknown");
                compressor_names::UNKNOWN
            }
        },
        None => compressor_names::UNCOMPRESSED,
    }
}
