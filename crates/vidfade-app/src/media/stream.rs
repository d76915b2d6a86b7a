use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Sequential reader over a raw elementary stream that can rewind for looping.
pub struct StreamReader {
    file: File,
    len: u64,
    position: u64,
}

impl StreamReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            position: 0,
        })
    }

    /// Read until `buf` is full or the stream ends. Returns the bytes read.
    pub fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => {
                    // The file shrank under us; treat the new end as the end.
                    self.len = self.position;
                    break;
                }
                Ok(n) => {
                    total += n;
                    self.position += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Whether every byte has been handed out.
    pub fn is_eof(&self) -> bool {
        self.position >= self.len
    }

    pub fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.position = 0;
        Ok(())
    }

    pub fn byte_len(&self) -> u64 {
        self.len
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}
