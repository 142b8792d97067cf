use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};

use crate::runtime::runtime_error::RuntimeErrorKind;

enum OpenFile {
    Read { reader: BufReader<File>, eof: bool },
    Write(BufWriter<File>),
}

/// Files opened by a running program, addressed by small ids starting at 1.
pub struct FileTable {
    files: Vec<Option<OpenFile>>,
    max: usize,
}

impl FileTable {
    pub fn new(max: usize) -> Self {
        FileTable {
            files: Vec::new(),
            max,
        }
    }

    /// Opens `path`. Mode `"r"` reads, `"w"` truncates, `"a"` appends.
    /// Returns 0 when the file cannot be opened.
    pub fn open(&mut self, path: &str, mode: &str) -> Result<i64, RuntimeErrorKind> {
        let file = match mode {
            "w" => File::create(path).map(|f| OpenFile::Write(BufWriter::new(f))),
            "a" => OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .map(|f| OpenFile::Write(BufWriter::new(f))),
            _ => File::open(path).map(|f| OpenFile::Read {
                reader: BufReader::new(f),
                eof: false,
            }),
        };
        let Ok(file) = file else {
            return Ok(0);
        };

        let slot = match self.files.iter().position(Option::is_none) {
            Some(slot) => slot,
            None if self.files.len() < self.max => {
                self.files.push(None);
                self.files.len() - 1
            }
            None => return Err(RuntimeErrorKind::FileTableFull(self.max)),
        };
        self.files[slot] = Some(file);
        Ok(slot as i64 + 1)
    }

    fn get(&mut self, id: i64) -> Result<&mut OpenFile, RuntimeErrorKind> {
        usize::try_from(id - 1)
            .ok()
            .and_then(|i| self.files.get_mut(i))
            .and_then(Option::as_mut)
            .ok_or(RuntimeErrorKind::BadFile(id))
    }

    pub fn close(&mut self, id: i64) -> Result<(), RuntimeErrorKind> {
        if let OpenFile::Write(writer) = self.get(id)? {
            writer.flush()?;
        }
        self.files[(id - 1) as usize] = None;
        Ok(())
    }

    pub fn write(&mut self, id: i64, text: &str) -> Result<(), RuntimeErrorKind> {
        match self.get(id)? {
            OpenFile::Write(writer) => Ok(writer.write_all(text.as_bytes())?),
            OpenFile::Read { .. } => Err(RuntimeErrorKind::BadFile(id)),
        }
    }

    /// Next line without its terminator. Empty at end of file.
    pub fn read_line(&mut self, id: i64) -> Result<String, RuntimeErrorKind> {
        match self.get(id)? {
            OpenFile::Read { reader, eof } => {
                let mut line = String::new();
                if reader.read_line(&mut line)? == 0 {
                    *eof = true;
                }
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Ok(line)
            }
            OpenFile::Write(_) => Err(RuntimeErrorKind::BadFile(id)),
        }
    }

    pub fn eof(&mut self, id: i64) -> Result<bool, RuntimeErrorKind> {
        match self.get(id)? {
            OpenFile::Read { reader, eof } => {
                if *eof {
                    return Ok(true);
                }
                Ok(reader.fill_buf()?.is_empty())
            }
            OpenFile::Write(_) => Ok(false),
        }
    }

    /// Flushes and drops everything still open.
    pub fn close_all(&mut self) -> Result<(), RuntimeErrorKind> {
        for file in self.files.iter_mut() {
            if let Some(OpenFile::Write(writer)) = file {
                writer.flush()?;
            }
            *file = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let path = path.to_str().unwrap();

        let mut files = FileTable::new(4);
        let w = files.open(path, "w").unwrap();
        assert_eq!(w, 1);
        files.write(w, "one\ntwo\n").unwrap();
        files.close(w).unwrap();

        let r = files.open(path, "r").unwrap();
        assert!(!files.eof(r).unwrap());
        assert_eq!(files.read_line(r).unwrap(), "one");
        assert_eq!(files.read_line(r).unwrap(), "two");
        assert!(files.eof(r).unwrap());
        assert_eq!(files.read_line(r).unwrap(), "");
    }

    #[test]
    fn test_missing_file_gives_zero() {
        let mut files = FileTable::new(4);
        assert_eq!(files.open("/nonexistent/dir/file", "r").unwrap(), 0);
    }

    #[test]
    fn test_bad_ids() {
        let mut files = FileTable::new(4);
        assert_eq!(files.close(3), Err(RuntimeErrorKind::BadFile(3)));
        assert_eq!(files.read_line(0), Err(RuntimeErrorKind::BadFile(0)));
    }

    #[test]
    fn test_table_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let path = path.to_str().unwrap();
        let mut files = FileTable::new(1);
        files.open(path, "w").unwrap();
        assert_eq!(files.open(path, "w"), Err(RuntimeErrorKind::FileTableFull(1)));
    }
}
