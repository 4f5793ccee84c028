//! Useful traits and other utilities that don't really belong anywhere else.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

use anyhow::{ensure, Context};

pub trait ReadExt {
    /// Tries to fill `buf`, like `read_exact`, but unlike `read_exact`, is forgiving of
    /// unexpected EOF.
    ///
    /// Returns the number of bytes actually read, which is only less than `buf.len()` when an
    /// EOF was encountered.
    fn read_up_to(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read> ReadExt for T {
    fn read_up_to(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut cursor = 0;
        while cursor < buf.len() {
            cursor += match self.read(&mut buf[cursor..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => return Err(e),
            };
        }
        Ok(cursor)
    }
}

/// A bounded source of payload bytes.
///
/// Consumers read from this without caring whether the bytes come from stdin or from a file;
/// the difference is confined to construction.
pub struct Source {
    reader: Box<dyn Read>,
    /// Bytes this source still owes, or None to read until EOF.
    budget: Option<u64>,
    /// Set once an until-EOF source actually hits EOF.
    eof: bool,
}

impl Source {
    pub fn new(reader: Box<dyn Read>, budget: Option<u64>) -> Self {
        Self {
            reader,
            budget,
            eof: false,
        }
    }

    /// A source backed by a file, positioned `skip` bytes in; `length` caps the payload.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        skip: u64,
        length: Option<u64>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut file =
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?;

        let size = file.metadata()?.len();
        ensure!(
            skip <= size,
            "skip of {skip} bytes is past the end of {}",
            path.display()
        );
        if skip > 0 {
            file.seek(SeekFrom::Start(skip))?;
        }

        let mut budget = size - skip;
        if let Some(length) = length {
            budget = budget.min(length);
        }

        Ok(Self::new(Box::new(file), Some(budget)))
    }

    /// A source backed by stdin; without `length`, bytes flow until EOF.
    pub fn from_stdin(length: Option<u64>) -> Self {
        Self::new(Box::new(io::stdin()), length)
    }

    /// The number of bytes this source will still produce, if known up front.
    pub fn total(&self) -> Option<u64> {
        self.budget
    }

    /// Is the source known to have no more bytes to give?
    pub fn exhausted(&self) -> bool {
        self.eof || self.budget == Some(0)
    }

    /// Did an until-EOF source already run dry?
    pub fn hit_eof(&self) -> bool {
        self.eof
    }

    /// Read up to `buf.len()` bytes, never exceeding the remaining budget.
    ///
    /// A bounded source hitting EOF before its budget is an error; an until-EOF source simply
    /// becomes exhausted.
    pub fn fill(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        if self.exhausted() {
            return Ok(0);
        }

        let want = match self.budget {
            Some(budget) => buf.len().min(usize::try_from(budget).unwrap_or(usize::MAX)),
            None => buf.len(),
        };

        let got = self.reader.read_up_to(&mut buf[..want])?;
        match &mut self.budget {
            Some(budget) => {
                ensure!(got == want, "unexpected end of input");
                *budget -= got as u64;
            }
            None => {
                if got < want {
                    self.eof = true;
                }
            }
        }

        Ok(got)
    }
}

/// A byte count parsed from strings like "131072", "128KiB", or "1MiB"
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct ByteSize(pub u64);

impl FromStr for ByteSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (digits, unit) = if let Some(digits) = s.strip_suffix("KiB") {
            (digits, 1024)
        } else if let Some(digits) = s.strip_suffix("MiB") {
            (digits, 1024 * 1024)
        } else {
            (s, 1)
        };

        let count: u64 = digits
            .parse()
            .map_err(|_| anyhow::anyhow!("expected a byte count like 131072 or 128KiB"))?;
        let bytes = count
            .checked_mul(unit)
            .ok_or(anyhow::anyhow!("byte count out of range"))?;

        Ok(ByteSize(bytes))
    }
}

#[test]
fn test_read_up_to() -> io::Result<()> {
    let mut buf = [0u8; 6];
    assert_eq!(io::repeat(0xAA).read_up_to(&mut buf)?, 6);
    assert_eq!(buf, [0xAA; 6]);

    assert_eq!((&[1u8, 2, 3][..]).read_up_to(&mut buf)?, 3);
    assert_eq!(buf[..3], [1, 2, 3]);

    Ok(())
}

#[test]
fn test_source_bounded() -> anyhow::Result<()> {
    let mut buf = [0u8; 4];

    // The budget caps an over-long reader...
    let mut source = Source::new(Box::new(io::repeat(0x11)), Some(6));
    assert_eq!(source.total(), Some(6));
    assert_eq!(source.fill(&mut buf)?, 4);
    assert!(!source.exhausted());
    assert_eq!(source.fill(&mut buf)?, 2);
    assert!(source.exhausted());
    assert_eq!(source.fill(&mut buf)?, 0);

    // ...and an under-long reader is a hard error.
    let mut source = Source::new(Box::new(&[1u8, 2][..]), Some(6));
    assert!(source.fill(&mut buf).is_err());

    Ok(())
}

#[test]
fn test_source_until_eof() -> anyhow::Result<()> {
    let mut buf = [0u8; 4];

    let mut source = Source::new(Box::new(&[1u8, 2, 3, 4, 5][..]), None);
    assert_eq!(source.total(), None);
    assert_eq!(source.fill(&mut buf)?, 4);
    assert!(!source.hit_eof());
    assert_eq!(source.fill(&mut buf)?, 1);
    assert!(source.hit_eof());
    assert!(source.exhausted());
    assert_eq!(source.fill(&mut buf)?, 0);

    Ok(())
}

#[test]
fn test_byte_size() {
    assert_eq!("131072".parse::<ByteSize>().unwrap(), ByteSize(131072));
    assert_eq!("128KiB".parse::<ByteSize>().unwrap(), ByteSize(131072));
    assert_eq!("2MiB".parse::<ByteSize>().unwrap(), ByteSize(2 << 20));
    assert!("128kB".parse::<ByteSize>().is_err());
    assert!("KiB".parse::<ByteSize>().is_err());
    assert!("".parse::<ByteSize>().is_err());
}
