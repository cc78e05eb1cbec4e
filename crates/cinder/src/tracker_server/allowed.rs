//! Which torrents and addresses the tracker serves.
//!
//! The allowed torrents come either from a directory of metafiles or from
//! a list of hex info hashes. Sources are re-read when their modification
//! time changes.
use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::SystemTime,
};

use hashbrown::HashMap;
use tracing::{info, warn};

use crate::{addr::IpList, config::TrackerConfig, error::Error, metainfo::MetaInfo, torrent::InfoHash};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedTorrent {
    pub name: String,
    pub size: u64,
}

/// A file or directory and the modification time it was last read at.
#[derive(Debug)]
struct Watched {
    path: PathBuf,
    mtime: Option<SystemTime>,
}

impl Watched {
    fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf(), mtime: None }
    }

    /// Whether the source changed since the last call. Sources that
    /// cannot be stat'ed count as changed, so the read reports the error.
    fn changed(&mut self) -> bool {
        let mtime = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        if mtime.is_some() && mtime == self.mtime {
            return false;
        }
        self.mtime = mtime;
        true
    }
}

#[derive(Debug, Default)]
pub struct AccessLists {
    dir: Option<Watched>,
    list: Option<Watched>,
    allowed_ips_file: Option<Watched>,
    banned_ips_file: Option<Watched>,
    /// `None` when every torrent is allowed.
    pub torrents: Option<HashMap<InfoHash, AllowedTorrent>>,
    /// `None` when every address is allowed.
    pub allowed_ips: Option<IpList>,
    pub banned_ips: IpList,
}

impl AccessLists {
    /// Read every configured source. Unreadable sources are a
    /// configuration error here, later reloads keep the old data.
    pub fn new(config: &TrackerConfig) -> Result<Self, Error> {
        let mut lists = Self {
            dir: config.allowed_dir.as_deref().map(Watched::new),
            list: config.allowed_list.as_deref().map(Watched::new),
            allowed_ips_file: config.allowed_ips.as_deref().map(Watched::new),
            banned_ips_file: config.banned_ips.as_deref().map(Watched::new),
            ..Default::default()
        };
        lists.reload()?;
        Ok(lists)
    }

    /// Re-read what changed.
    pub fn reload(&mut self) -> Result<(), Error> {
        if let Some(w) = changed(&mut self.dir) {
            let torrents = parse_allowed_dir(&w.path)?;
            info!("{} torrents allowed from {:?}", torrents.len(), w.path);
            self.torrents = Some(torrents);
        }
        if let Some(w) = changed(&mut self.list) {
            let text = fs::read_to_string(&w.path)
                .map_err(|e| Error::ConfigError(format!("cannot read {}: {e}", w.path.display())))?;
            let torrents = parse_allowed_list(&text);
            info!("{} torrents allowed from {:?}", torrents.len(), w.path);
            self.torrents = Some(torrents);
        }
        if let Some(w) = changed(&mut self.allowed_ips_file) {
            self.allowed_ips = Some(IpList::read_file(&w.path)?);
        }
        if let Some(w) = changed(&mut self.banned_ips_file) {
            self.banned_ips = IpList::read_file(&w.path)?;
        }
        Ok(())
    }

    pub fn is_allowed(&self, info_hash: &InfoHash) -> bool {
        self.torrents.as_ref().map_or(true, |t| t.contains_key(info_hash))
    }

    /// The failure reason for a refused address.
    pub fn check_ip(&self, ip: IpAddr) -> Result<(), &'static str> {
        if self.banned_ips.includes(ip) {
            return Err("banned IP");
        }
        if self.allowed_ips.as_ref().is_some_and(|l| !l.includes(ip)) {
            return Err("IP not allowed");
        }
        Ok(())
    }
}

fn changed(source: &mut Option<Watched>) -> Option<&Watched> {
    let w = source.as_mut()?;
    w.changed().then_some(&*w)
}

/// Metafiles in `dir`, not recursive. Files that fail to parse are
/// skipped.
fn parse_allowed_dir(dir: &Path) -> Result<HashMap<InfoHash, AllowedTorrent>, Error> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::ConfigError(format!("cannot read {}: {e}", dir.display())))?;
    let mut torrents = HashMap::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("torrent") {
            continue;
        }
        match MetaInfo::read(&path) {
            Ok(meta) => {
                torrents.insert(
                    meta.info.info_hash,
                    AllowedTorrent { size: meta.info.get_torrent_size(), name: meta.info.name },
                );
            }
            Err(e) => warn!("skipping {path:?}: {e}"),
        }
    }
    Ok(torrents)
}

/// One 40 character hex info hash per line, optionally followed by a
/// name. `#` starts a comment.
fn parse_allowed_list(text: &str) -> HashMap<InfoHash, AllowedTorrent> {
    let mut torrents = HashMap::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let (hash, name) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match hash.parse::<InfoHash>() {
            Ok(h) => {
                torrents.insert(h, AllowedTorrent { name: name.trim().to_string(), size: 0 });
            }
            Err(_) => warn!("ignoring bad info hash on line {}: {line}", n + 1),
        }
    }
    torrents
}

#[cfg(test)]
mod tests {
    use bendy::encoding::ToBencode;

    use super::*;
    use crate::metainfo::tests::single_file;

    #[test]
    fn list_file() {
        let text = format!("# allowed\n{} linux iso\nnot-a-hash\n\n{}\n", "ab".repeat(20), "cd".repeat(20));
        let t = parse_allowed_list(&text);
        assert_eq!(t.len(), 2);
        assert_eq!(t[&InfoHash([0xab; 20])].name, "linux iso");
    }

    #[test]
    fn directory_of_metafiles() {
        let dir = tempfile::tempdir().unwrap();
        let meta = single_file("a.bin", &[1u8; 1000], 512);
        fs::write(dir.path().join("a.torrent"), meta.to_bencode().unwrap()).unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let config = TrackerConfig { allowed_dir: Some(dir.path().to_path_buf()), ..Default::default() };
        let lists = AccessLists::new(&config).unwrap();
        assert!(lists.is_allowed(&meta.info.info_hash));
        assert!(!lists.is_allowed(&InfoHash([0; 20])));
        assert_eq!(lists.torrents.as_ref().unwrap()[&meta.info.info_hash].size, 1000);
    }

    #[test]
    fn ip_lists() {
        let dir = tempfile::tempdir().unwrap();
        let banned = dir.path().join("banned");
        fs::write(&banned, "10.0.0.0/8\n").unwrap();
        let config = TrackerConfig { banned_ips: Some(banned.clone()), ..Default::default() };
        let mut lists = AccessLists::new(&config).unwrap();

        assert_eq!(lists.check_ip("10.1.1.1".parse().unwrap()), Err("banned IP"));
        assert!(lists.check_ip("11.1.1.1".parse().unwrap()).is_ok());
        assert!(lists.is_allowed(&InfoHash([0; 20])));

        fs::write(&banned, "11.0.0.0/8\n").unwrap();
        // force a changed mtime on coarse filesystems
        lists.banned_ips_file.as_mut().unwrap().mtime = None;
        lists.reload().unwrap();
        assert!(lists.check_ip("10.1.1.1".parse().unwrap()).is_ok());
    }

    #[test]
    fn missing_list_is_a_configuration_error() {
        let config = TrackerConfig { allowed_list: Some("/nonexistent/list".into()), ..Default::default() };
        assert!(matches!(AccessLists::new(&config), Err(Error::ConfigError(_))));
    }
}
