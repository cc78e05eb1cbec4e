//! Metainfo is a .torrent file with information about the Torrent.
use std::path::{Path, PathBuf};

use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::{self, AsString, SingleItemEncoder, ToBencode},
};

use crate::{
    bencode::{self, Value},
    error::Error,
    tcp_wire::{BlockInfo, BLOCK_LEN},
    torrent::InfoHash,
};

#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    pub creation_date: Option<u64>,
    pub http_seeds: Option<Vec<String>>,
    pub info: Info,
}

impl MetaInfo {
    /// Decode and validate a metafile.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let meta = Self::from_bencode(buf)?;
        meta.info.validate()?;
        Ok(meta)
    }

    pub fn read(path: &Path) -> Result<Self, Error> {
        let buf = std::fs::read(path)
            .map_err(|_| Error::FileOpenError(path.display().to_string()))?;
        Self::from_bytes(&buf)
    }

    /// Tracker tiers in announce order. `announce-list` wins when present,
    /// a lone `announce` not found in it becomes a tier of its own.
    pub fn announce_tiers(&self) -> Vec<Vec<String>> {
        let mut tiers: Vec<Vec<String>> = self
            .announce_list
            .iter()
            .flatten()
            .map(|tier| tier.iter().filter(|u| !u.is_empty()).cloned().collect::<Vec<_>>())
            .filter(|tier| !tier.is_empty())
            .collect();

        let listed = tiers.iter().flatten().any(|u| *u == self.announce);
        if !self.announce.is_empty() && !listed {
            tiers.insert(0, vec![self.announce.clone()]);
        }
        tiers
    }
}

/// Replace the tracker of a metafile, dropping `announce-list`.
///
/// The `info` dictionary is carried over untouched so the info hash stays
/// the same.
pub fn rewrite_announce(buf: &[u8], announce: &str) -> Result<Vec<u8>, Error> {
    let mut meta = bencode::decode(buf)?;
    let dict = meta.as_dict_mut().ok_or(Error::MetaInfoInvalid("not a dictionary"))?;
    if !dict.contains_key(b"info".as_slice()) {
        return Err(Error::MetaInfoInvalid("missing info"));
    }
    dict.remove(b"announce-list".as_slice());
    meta.insert(b"announce", Value::string(announce));
    Ok(bencode::encode(&meta))
}

/// The `info` dictionary. In a multi file torrent `name` is the directory.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    /// Only for single file torrents.
    pub file_length: Option<u64>,
    /// Only for multi file torrents.
    pub files: Option<Vec<File>>,
    pub name: String,
    pub piece_length: u32,
    /// Concatenation of all 20-byte SHA1 hashes, one per piece.
    pub pieces: Vec<u8>,
    pub private: bool,

    // computed while decoding, not part of the dictionary
    pub info_hash: InfoHash,
}

impl Info {
    pub fn info_hash(buf: &[u8]) -> InfoHash {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(buf);
        InfoHash(hasher.digest().bytes())
    }

    /// How many pieces there are.
    #[inline]
    pub fn pieces(&self) -> usize {
        self.pieces.len() / 20
    }

    pub fn piece_hash(&self, index: usize) -> Option<&[u8]> {
        self.pieces.get(index * 20..index * 20 + 20)
    }

    /// Size in bytes of the whole payload.
    pub fn get_torrent_size(&self) -> u64 {
        match &self.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.file_length.unwrap_or(0),
        }
    }

    /// Size in bytes of a piece, the last one may be shorter.
    pub fn piece_size(&self, index: usize) -> u32 {
        let total = self.get_torrent_size();
        let start = index as u64 * self.piece_length as u64;
        (total.saturating_sub(start)).min(self.piece_length as u64) as u32
    }

    /// The blocks a piece is requested in.
    pub fn block_infos_of_piece(&self, index: usize) -> Vec<BlockInfo> {
        let size = self.piece_size(index);
        (0..size.div_ceil(BLOCK_LEN))
            .map(|b| {
                let begin = b * BLOCK_LEN;
                BlockInfo { index: index as u32, begin, len: (size - begin).min(BLOCK_LEN) }
            })
            .collect()
    }

    /// Files as `(path relative to the download dir, length)`.
    pub fn file_list(&self) -> Vec<(PathBuf, u64)> {
        match &self.files {
            None => vec![(PathBuf::from(&self.name), self.file_length.unwrap_or(0))],
            Some(files) => files
                .iter()
                .map(|f| {
                    let mut path = PathBuf::from(&self.name);
                    path.extend(&f.path);
                    (path, f.length)
                })
                .collect(),
        }
    }

    /// Structural checks plus the file name rules that keep a malicious
    /// metafile from writing outside the download directory.
    pub fn validate(&self) -> Result<(), Error> {
        check_name(&self.name)?;

        if self.piece_length == 0 {
            return Err(Error::MetaInfoInvalid("piece length must be positive"));
        }
        if self.pieces.len() % 20 != 0 {
            return Err(Error::MetaInfoInvalid("pieces is not a multiple of 20"));
        }
        match (&self.file_length, &self.files) {
            (Some(_), Some(_)) => {
                return Err(Error::MetaInfoInvalid("both length and files present"))
            }
            (None, None) => return Err(Error::MetaInfoInvalid("missing length or files")),
            (None, Some(files)) => {
                if files.is_empty() {
                    return Err(Error::MetaInfoInvalid("empty file list"));
                }
                for file in files {
                    if file.path.is_empty() {
                        return Err(Error::MetaInfoInvalid("empty file path"));
                    }
                    for part in &file.path {
                        check_name(part)?;
                    }
                }
                let mut paths: Vec<_> = files.iter().map(|f| &f.path).collect();
                paths.sort();
                if paths.windows(2).any(|w| w[0] == w[1]) {
                    return Err(Error::MetaInfoInvalid("duplicate file path"));
                }
            }
            (Some(_), None) => {}
        }

        let expected = self.get_torrent_size().div_ceil(self.piece_length as u64);
        if expected != self.pieces() as u64 {
            return Err(Error::MetaInfoInvalid("piece count does not match the payload size"));
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<(), Error> {
    let bad = name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.starts_with('.')
        || name.starts_with('~')
        || name.contains('\0');
    if bad {
        return Err(Error::UnsafeFileName(name.to_owned()));
    }
    Ok(())
}

/// Files in the [`Info`] are relative to the root folder name,
/// but do not contain it as the first item in the vector.
#[derive(Debug, PartialEq, Clone, Default, Hash, Eq)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

impl ToBencode for File {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", self.length)?;
            e.emit_pair(b"path", &self.path)
        })?;
        Ok(())
    }
}

impl FromBencode for File {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict_dec = object.try_into_dictionary()?;
        let mut length = None;
        let mut path = None;

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"length", value) => {
                    length = u64::decode_bencode_object(value).context("length").map(Some)?;
                }
                (b"path", value) => {
                    path = Vec::<String>::decode_bencode_object(value).context("path").map(Some)?;
                }
                _ => {}
            }
        }

        let length = length.ok_or_else(|| decoding::Error::missing_field("length"))?;
        let path = path.ok_or_else(|| decoding::Error::missing_field("path"))?;
        Ok(Self { length, path })
    }
}

impl ToBencode for MetaInfo {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"announce", &self.announce)?;

            if let Some(announce_list) = &self.announce_list {
                e.emit_pair(b"announce-list", announce_list)?;
            }
            if let Some(comment) = &self.comment {
                e.emit_pair(b"comment", comment)?;
            }
            if let Some(creation_date) = &self.creation_date {
                e.emit_pair(b"creation date", creation_date)?;
            }
            if let Some(seeds) = &self.http_seeds {
                e.emit_pair(b"httpseeds", seeds)?;
            }

            e.emit_pair(b"info", &self.info)
        })?;

        Ok(())
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(files) = &self.files {
                e.emit_pair(b"files", files)?;
            }
            if let Some(file_length) = &self.file_length {
                e.emit_pair(b"length", file_length)?;
            }
            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", self.piece_length)?;
            e.emit_pair(b"pieces", AsString(&self.pieces))?;
            if self.private {
                e.emit_pair(b"private", 1u8)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut announce = None;
        let mut announce_list = None;
        let mut comment = None;
        let mut creation_date = None;
        let mut http_seeds = None;
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"announce", value) => {
                    announce = String::decode_bencode_object(value).context("announce").map(Some)?;
                }
                (b"announce-list", value) => {
                    announce_list = Vec::decode_bencode_object(value)
                        .context("announce_list")
                        .map(Some)?;
                }
                (b"comment", value) => {
                    comment = String::decode_bencode_object(value).context("comment").map(Some)?;
                }
                (b"creation date", value) => {
                    creation_date =
                        u64::decode_bencode_object(value).context("creation_date").map(Some)?;
                }
                (b"httpseeds", value) => {
                    http_seeds = Vec::decode_bencode_object(value).context("http_seeds").map(Some)?;
                }
                (b"info", value) => {
                    info = Info::decode_bencode_object(value).context("info").map(Some)?;
                }
                _ => {}
            }
        }

        let announce = announce.ok_or_else(|| decoding::Error::missing_field("announce"))?;
        let info = info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo { announce, announce_list, comment, creation_date, http_seeds, info })
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut files = None;
        let mut file_length = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;
        let mut private = false;

        let bytes = object.try_into_dictionary()?.into_raw()?;
        let info_hash = Info::info_hash(bytes);
        let mut decoder = Decoder::new(bytes);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| decoding::Error::missing_field("info"))?
            .try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"files", value) => {
                    files = Vec::<File>::decode_bencode_object(value).context("files").map(Some)?;
                }
                (b"length", value) => {
                    file_length = u64::decode_bencode_object(value).context("length").map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value).context("name").map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length =
                        u32::decode_bencode_object(value).context("piece length").map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                (b"private", value) => {
                    private = u8::decode_bencode_object(value).context("private")? == 1;
                }
                _ => {}
            }
        }

        let name = name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let piece_length =
            piece_length.ok_or_else(|| decoding::Error::missing_field("piece_length"))?;
        let pieces = pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;

        Ok(Info { files, file_length, name, piece_length, pieces, private, info_hash })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A single file metainfo whose pieces hash `payload`.
    pub(crate) fn single_file(name: &str, payload: &[u8], piece_length: u32) -> MetaInfo {
        let pieces = payload
            .chunks(piece_length as usize)
            .flat_map(|c| sha1_smol::Sha1::from(c).digest().bytes())
            .collect();
        let info = Info {
            file_length: Some(payload.len() as u64),
            name: name.to_owned(),
            piece_length,
            pieces,
            ..Default::default()
        };
        let meta = MetaInfo {
            announce: "http://localhost/announce".to_owned(),
            info,
            ..Default::default()
        };
        // round trip through the encoder so info_hash is computed
        MetaInfo::from_bytes(&meta.to_bencode().unwrap()).unwrap()
    }

    #[test]
    fn info_hash_is_sha1_of_raw_info() {
        let meta = single_file("a.bin", &[1u8; 40_000], 16384);
        let raw = meta.info.to_bencode().unwrap();
        assert_eq!(meta.info.info_hash, Info::info_hash(&raw));
        assert_eq!(meta.info.pieces(), 3);
    }

    #[test]
    fn block_infos_of_last_piece() {
        let meta = single_file("a.bin", &[0u8; 40_000], 32768);
        assert_eq!(meta.info.piece_size(1), 40_000 - 32768);
        assert_eq!(
            meta.info.block_infos_of_piece(0),
            vec![
                BlockInfo { index: 0, begin: 0, len: BLOCK_LEN },
                BlockInfo { index: 0, begin: BLOCK_LEN, len: BLOCK_LEN },
            ]
        );
        assert_eq!(
            meta.info.block_infos_of_piece(1),
            vec![BlockInfo { index: 1, begin: 0, len: 40_000 - 32768 }]
        );
    }

    #[test]
    fn reject_unsafe_names() {
        for bad in ["../etc", ".hidden", "~root", "a/b", "a\\b", ""] {
            let mut meta = single_file("ok", &[0u8; 10], 16384);
            meta.info.name = bad.to_owned();
            assert!(matches!(meta.info.validate(), Err(Error::UnsafeFileName(_))), "{bad}");
        }

        let mut meta = single_file("ok", &[0u8; 10], 16384);
        meta.info.file_length = None;
        meta.info.files = Some(vec![File { length: 10, path: vec!["..".into(), "x".into()] }]);
        assert!(matches!(meta.info.validate(), Err(Error::UnsafeFileName(_))));
    }

    #[test]
    fn reject_wrong_piece_count() {
        let mut meta = single_file("ok", &[0u8; 100], 16384);
        meta.info.pieces.extend_from_slice(&[0u8; 20]);
        assert!(matches!(meta.info.validate(), Err(Error::MetaInfoInvalid(_))));
    }

    #[test]
    fn multi_file_paths() {
        let mut meta = single_file("dir", &[0u8; 30], 16384);
        meta.info.file_length = None;
        meta.info.files = Some(vec![
            File { length: 10, path: vec!["a".into()] },
            File { length: 20, path: vec!["sub".into(), "b".into()] },
        ]);
        meta.info.validate().unwrap();
        assert_eq!(
            meta.info.file_list(),
            vec![(PathBuf::from("dir/a"), 10), (PathBuf::from("dir/sub/b"), 20)]
        );
    }

    #[test]
    fn tiers_merge_announce() {
        let mut meta = single_file("a", &[0u8; 10], 16384);
        assert_eq!(meta.announce_tiers(), vec![vec!["http://localhost/announce".to_owned()]]);

        meta.announce_list = Some(vec![vec!["udp://t1:80".into(), "".into()], vec![]]);
        assert_eq!(
            meta.announce_tiers(),
            vec![vec!["http://localhost/announce".to_owned()], vec!["udp://t1:80".to_owned()]]
        );
    }

    #[test]
    fn rewrite_keeps_info_hash() {
        let mut meta = single_file("a", &[3u8; 100], 16384);
        meta.announce_list = Some(vec![vec!["udp://old:1".into()]]);
        let buf = meta.to_bencode().unwrap();

        let out = rewrite_announce(&buf, "http://new/announce").unwrap();
        let new = MetaInfo::from_bytes(&out).unwrap();
        assert_eq!(new.announce, "http://new/announce");
        assert_eq!(new.announce_list, None);
        assert_eq!(new.info.info_hash, meta.info.info_hash);
    }
}
