//! Compression layers for archives written and read in-process.

use crate::backup::finish::Finish;
use crate::backup::options::EngineKind;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use derive_more::From;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io;
use std::io::{BufRead, BufReader, Read, Write};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

impl Compression {
    /// `None` for mirror engines, which produce no archive.
    pub fn for_engine(engine: EngineKind) -> Option<Self> {
        match engine {
            EngineKind::Tar => Some(Compression::None),
            EngineKind::TarGz => Some(Compression::Gzip),
            EngineKind::TarBz2 => Some(Compression::Bzip2),
            EngineKind::Rsync => None,
        }
    }

    /// Detects the compression of a stream from its leading bytes.
    pub fn sniff(header: &[u8]) -> Self {
        if header.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else if header.starts_with(BZIP2_MAGIC) {
            Compression::Bzip2
        } else {
            Compression::None
        }
    }

    pub fn build_compressor<W: Write>(&self, writer: W) -> Compressor<W> {
        match self {
            Compression::None => Compressor::None(writer),
            Compression::Gzip => {
                Compressor::Gzip(GzEncoder::new(writer, flate2::Compression::default()))
            }
            Compression::Bzip2 => {
                Compressor::Bzip2(BzEncoder::new(writer, bzip2::Compression::default()))
            }
        }
    }
}

#[derive(io_enum::Write, From)]
pub enum Compressor<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    Bzip2(BzEncoder<W>),
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Compressor::Gzip(w) => w.finish(),
            Compressor::Bzip2(w) => w.finish(),
        }
    }
}

#[derive(io_enum::Read)]
pub enum Decompressor<R: Read> {
    None(R),
    Gzip(GzDecoder<R>),
    Bzip2(BzDecoder<R>),
}

impl<R: Read> Decompressor<BufReader<R>> {
    /// Wraps `reader` in the decoder matching its magic bytes.
    pub fn detect(reader: R) -> io::Result<Self> {
        let mut reader = BufReader::new(reader);
        let compression = Compression::sniff(reader.fill_buf()?);
        Ok(match compression {
            Compression::None => Decompressor::None(reader),
            Compression::Gzip => Decompressor::Gzip(GzDecoder::new(reader)),
            Compression::Bzip2 => Decompressor::Bzip2(BzDecoder::new(reader)),
        })
    }
}
