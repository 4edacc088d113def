//! Adaptive table dispatch: route a file to the right reader factory by the
//! magic number in its footer. Writes always go through one configured
//! writer factory.

use crate::error::{Error, Result};
use std::sync::{Arc, OnceLock};

pub const BLOCK_BASED_TABLE_MAGIC: u64 = 0x88e241b785f4cff7;
pub const LEGACY_BLOCK_BASED_TABLE_MAGIC: u64 = 0xdb4775248b80fb57;
pub const PLAIN_TABLE_MAGIC: u64 = 0x8242229663bf9564;
pub const LEGACY_PLAIN_TABLE_MAGIC: u64 = 0x4f3418eb7a8f13b8;
pub const CUCKOO_TABLE_MAGIC: u64 = 0x926789d0c5f17873;

/// Minimal random-access view of a table file; the real file abstraction is
/// the engine's business.
pub trait RandomAccessSource {
    fn len(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The table footer. Only the magic number matters for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub magic: u64,
}

/// Reads the footer: the trailing 8 bytes hold the magic, little-endian.
pub fn read_footer(source: &dyn RandomAccessSource) -> Result<Footer> {
    let len = source.len();
    if len < 8 {
        return Err(Error::Internal(format!(
            "file too short for a footer: {} bytes",
            len
        )));
    }
    let mut buf = [0u8; 8];
    source.read_at(len - 8, &mut buf)?;
    Ok(Footer {
        magic: u64::from_le_bytes(buf),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    BlockBased,
    Plain,
    Cuckoo,
}

/// Magic → format table. Process-wide: initialized once on first use, never
/// freed.
fn magic_table() -> &'static [(u64, TableFormat)] {
    static TABLE: OnceLock<Vec<(u64, TableFormat)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        vec![
            (BLOCK_BASED_TABLE_MAGIC, TableFormat::BlockBased),
            (LEGACY_BLOCK_BASED_TABLE_MAGIC, TableFormat::BlockBased),
            (PLAIN_TABLE_MAGIC, TableFormat::Plain),
            (LEGACY_PLAIN_TABLE_MAGIC, TableFormat::Plain),
            (CUCKOO_TABLE_MAGIC, TableFormat::Cuckoo),
        ]
    })
}

pub fn format_for_magic(magic: u64) -> Option<TableFormat> {
    magic_table()
        .iter()
        .find(|(candidate, _)| *candidate == magic)
        .map(|(_, format)| *format)
}

/// An open table. Opaque to the dispatcher.
pub trait TableReader: Send + std::fmt::Debug {
    fn format(&self) -> TableFormat;
}

pub trait TableReaderFactory: Send + Sync {
    fn new_reader(&self, source: Box<dyn RandomAccessSource>) -> Result<Box<dyn TableReader>>;
}

/// An in-progress table file. Opaque to the dispatcher.
pub trait TableWriter: Send {}

pub trait TableWriterFactory: Send + Sync {
    fn new_writer(&self) -> Result<Box<dyn TableWriter>>;
}

/// Routes reads by footer magic; delegates all writes to one factory.
pub struct AdaptiveTableFactory {
    writer_factory: Arc<dyn TableWriterFactory>,
    block_based_factory: Arc<dyn TableReaderFactory>,
    plain_factory: Arc<dyn TableReaderFactory>,
    cuckoo_factory: Arc<dyn TableReaderFactory>,
}

impl AdaptiveTableFactory {
    pub fn new(
        writer_factory: Arc<dyn TableWriterFactory>,
        block_based_factory: Arc<dyn TableReaderFactory>,
        plain_factory: Arc<dyn TableReaderFactory>,
        cuckoo_factory: Arc<dyn TableReaderFactory>,
    ) -> Self {
        Self {
            writer_factory,
            block_based_factory,
            plain_factory,
            cuckoo_factory,
        }
    }

    pub fn new_reader(&self, source: Box<dyn RandomAccessSource>) -> Result<Box<dyn TableReader>> {
        let footer = read_footer(source.as_ref())?;
        match format_for_magic(footer.magic) {
            Some(TableFormat::BlockBased) => self.block_based_factory.new_reader(source),
            Some(TableFormat::Plain) => self.plain_factory.new_reader(source),
            Some(TableFormat::Cuckoo) => self.cuckoo_factory.new_reader(source),
            None => Err(Error::UnsupportedTableFormat(footer.magic)),
        }
    }

    pub fn new_writer(&self) -> Result<Box<dyn TableWriter>> {
        self.writer_factory.new_writer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemSource(Vec<u8>);

    impl RandomAccessSource for MemSource {
        fn len(&self) -> u64 {
            self.0.len() as u64
        }

        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            let offset = offset as usize;
            buf.copy_from_slice(&self.0[offset..offset + buf.len()]);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct StubReader(TableFormat);
    impl TableReader for StubReader {
        fn format(&self) -> TableFormat {
            self.0
        }
    }

    struct StubReaderFactory(TableFormat);
    impl TableReaderFactory for StubReaderFactory {
        fn new_reader(&self, _source: Box<dyn RandomAccessSource>) -> Result<Box<dyn TableReader>> {
            Ok(Box::new(StubReader(self.0)))
        }
    }

    struct StubWriter;
    impl TableWriter for StubWriter {}

    struct StubWriterFactory;
    impl TableWriterFactory for StubWriterFactory {
        fn new_writer(&self) -> Result<Box<dyn TableWriter>> {
            Ok(Box::new(StubWriter))
        }
    }

    fn factory() -> AdaptiveTableFactory {
        AdaptiveTableFactory::new(
            Arc::new(StubWriterFactory),
            Arc::new(StubReaderFactory(TableFormat::BlockBased)),
            Arc::new(StubReaderFactory(TableFormat::Plain)),
            Arc::new(StubReaderFactory(TableFormat::Cuckoo)),
        )
    }

    fn file_with_magic(magic: u64) -> Box<dyn RandomAccessSource> {
        let mut data = vec![0u8; 32];
        data[24..].copy_from_slice(&magic.to_le_bytes());
        Box::new(MemSource(data))
    }

    #[test]
    fn footer_reads_trailing_magic() {
        let source = file_with_magic(PLAIN_TABLE_MAGIC);
        let footer = read_footer(source.as_ref()).unwrap();
        assert_eq!(footer.magic, PLAIN_TABLE_MAGIC);
    }

    #[test]
    fn short_file_is_an_error() {
        let source = MemSource(vec![1, 2, 3]);
        assert!(read_footer(&source).is_err());
    }

    #[test]
    fn dispatch_by_magic() {
        let factory = factory();
        for (magic, format) in [
            (BLOCK_BASED_TABLE_MAGIC, TableFormat::BlockBased),
            (LEGACY_BLOCK_BASED_TABLE_MAGIC, TableFormat::BlockBased),
            (PLAIN_TABLE_MAGIC, TableFormat::Plain),
            (LEGACY_PLAIN_TABLE_MAGIC, TableFormat::Plain),
            (CUCKOO_TABLE_MAGIC, TableFormat::Cuckoo),
        ] {
            let reader = factory.new_reader(file_with_magic(magic)).unwrap();
            assert_eq!(reader.format(), format);
        }
    }

    #[test]
    fn unknown_magic_is_unsupported() {
        let factory = factory();
        let err = factory.new_reader(file_with_magic(0xdeadbeef)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedTableFormat(0xdeadbeef)));
    }

    #[test]
    fn writes_delegate_to_the_writer_factory() {
        let factory = factory();
        assert!(factory.new_writer().is_ok());
    }
}
