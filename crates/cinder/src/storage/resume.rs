//! Resume records: enough about the files on disk to trust a previous
//! verification without hashing everything again.
//!
//! Bencoded as
//! `{files: [index, size, mtime, ...], partial files: [name, size, mtime, ...], have: bitfield, pieces: n}`.
use std::path::Path;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    bencode::{self, Value},
    bitfield::Bitfield,
    error::Error,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub index: usize,
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchStat {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResumeRecord {
    pub files: Vec<FileStat>,
    pub partial_files: Vec<ScratchStat>,
    pub have: Bitfield,
}

impl ResumeRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let files: Vec<Value> = self
            .files
            .iter()
            .flat_map(|f| [Value::from(f.index as u64), Value::from(f.size), Value::Integer(f.mtime)])
            .collect();
        let partial: Vec<Value> = self
            .partial_files
            .iter()
            .flat_map(|f| [Value::string(f.name.as_str()), Value::from(f.size), Value::Integer(f.mtime)])
            .collect();

        let mut dict = Value::dict();
        dict.insert(b"files", files);
        dict.insert(b"have", Bytes::from(self.have.to_bytes()));
        dict.insert(b"partial files", partial);
        dict.insert(b"pieces", self.have.len() as u64);
        bencode::encode(&dict)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let bad = || Error::ResumeInvalid;
        let v = bencode::decode(buf)?;

        let pieces = v.get(b"pieces").and_then(Value::as_integer).ok_or_else(bad)?;
        let have = v.get(b"have").and_then(Value::as_bytes).ok_or_else(bad)?;
        let have = Bitfield::from_bytes(have, usize::try_from(pieces).map_err(|_| bad())?)?;

        let triples = |key: &[u8]| -> Result<Vec<Value>, Error> {
            let list = v.get(key).and_then(Value::as_list).ok_or_else(bad)?;
            if list.len() % 3 != 0 {
                return Err(bad());
            }
            Ok(list.clone())
        };

        let mut files = Vec::new();
        for t in triples(b"files")?.chunks(3) {
            let index = t[0].as_integer().and_then(|i| usize::try_from(i).ok()).ok_or_else(bad)?;
            let size = t[1].as_integer().and_then(|i| u64::try_from(i).ok()).ok_or_else(bad)?;
            let mtime = t[2].as_integer().ok_or_else(bad)?;
            files.push(FileStat { index, size, mtime });
        }

        let mut partial_files = Vec::new();
        for t in triples(b"partial files")?.chunks(3) {
            let name = t[0].as_str().ok_or_else(bad)?.to_owned();
            let size = t[1].as_integer().and_then(|i| u64::try_from(i).ok()).ok_or_else(bad)?;
            let mtime = t[2].as_integer().ok_or_else(bad)?;
            partial_files.push(ScratchStat { name, size, mtime });
        }

        Ok(Self { files, partial_files, have })
    }

    pub fn read(path: &Path) -> Option<Self> {
        let buf = std::fs::read(path).ok()?;
        match Self::from_bytes(&buf) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("ignoring resume record {path:?}: {e}");
                None
            }
        }
    }

    /// Write through a temporary file so a crash never leaves half a record.
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.to_bytes())?;
        std::fs::rename(&tmp, path)?;
        debug!("wrote resume record {path:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let mut have = Bitfield::new(4);
        have.set(0, true);
        have.set(2, true);
        let record = ResumeRecord {
            files: vec![FileStat { index: 0, size: 1024, mtime: 1_700_000_000 }],
            partial_files: vec![ScratchStat { name: "1".into(), size: 10, mtime: 5 }],
            have,
        };
        let buf = record.to_bytes();
        assert!(buf.starts_with(b"d5:filesli0ei1024ei1700000000ee"));
        assert_eq!(ResumeRecord::from_bytes(&buf).unwrap(), record);
    }

    #[test]
    fn reject_broken_records() {
        assert!(ResumeRecord::from_bytes(b"de").is_err());
        assert!(ResumeRecord::from_bytes(b"d5:filesli0ei1ee4:have1:\x0013:partial filesle6:piecesi4ee").is_err());
    }
}
