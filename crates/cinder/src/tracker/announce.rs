use speedy::{BigEndian, Readable, Writable};

use super::action::Action;
use crate::{error::Error, torrent::Stats, tracker::TrackerFailure};

/// UDP announce, BEP 15.
#[derive(Debug, PartialEq, Clone, Readable, Writable)]
pub struct Request {
    pub connection_id: u64,
    pub action: u32,
    pub transaction_id: u32,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: u32,
    /// 0 lets the tracker use the sender's address.
    pub ip_address: u32,
    pub key: u32,
    /// -1 for the tracker's default.
    pub num_want: i32,
    pub port: u16,
}

impl Request {
    pub const LEN: usize = 98;

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec_with_ctx(BigEndian {})?)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::LEN {
            return Err(TrackerFailure::BadData("short announce request".into()).into());
        }
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::LEN])?)
    }
}

/// Fixed part of an announce response, the compact peers follow.
#[derive(Debug, PartialEq, Clone, Readable, Writable)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
}

impl From<&Response> for Stats {
    fn from(value: &Response) -> Self {
        Self { interval: value.interval, leechers: value.leechers, seeders: value.seeders }
    }
}

impl Response {
    pub const MIN_LEN: usize = 20;

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec_with_ctx(BigEndian {})?)
    }

    /// Split a datagram in the fixed header and the peer bytes.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        if buf.len() < Self::MIN_LEN {
            return Err(TrackerFailure::BadData("short announce response".into()).into());
        }
        let res = Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::MIN_LEN])?;
        Ok((res, &buf[Self::MIN_LEN..]))
    }
}

/// An error datagram, action 3, carries a message instead of a body.
/// Returns `None` when the datagram is not an error.
pub fn error_message(buf: &[u8]) -> Option<String> {
    if buf.len() < 8 {
        return None;
    }
    let action = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    (action == Action::Error as u32).then(|| String::from_utf8_lossy(&buf[8..]).into_owned())
}

/// BEP 41 URLData options carrying the path and query of the tracker URL,
/// split in 255 byte chunks.
pub fn url_data(path_and_query: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in path_and_query.as_bytes().chunks(255) {
        out.push(0x2);
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_98_bytes() {
        let req = Request {
            connection_id: 7,
            action: Action::Announce as u32,
            transaction_id: 9,
            info_hash: [1; 20],
            peer_id: [2; 20],
            downloaded: 0,
            left: 100,
            uploaded: 0,
            event: 2,
            ip_address: 0,
            key: 5,
            num_want: -1,
            port: 6881,
        };
        let buf = req.serialize().unwrap();
        assert_eq!(buf.len(), Request::LEN);
        assert_eq!(&buf[96..], &6881u16.to_be_bytes());
        assert_eq!(&buf[92..96], &[0xff; 4]);
        assert_eq!(Request::deserialize(&buf).unwrap(), req);
    }

    #[test]
    fn error_datagram() {
        let mut buf = vec![0, 0, 0, 3, 0, 0, 0, 1];
        buf.extend_from_slice(b"unregistered torrent");
        assert_eq!(error_message(&buf).as_deref(), Some("unregistered torrent"));
        assert_eq!(error_message(&[0, 0, 0, 1, 0, 0, 0, 1]), None);
    }

    #[test]
    fn url_data_chunks() {
        let long = "a".repeat(300);
        let opts = url_data(&long);
        assert_eq!(opts[..2], [0x2, 255]);
        assert_eq!(opts[257..259], [0x2, 45]);
        assert_eq!(opts.len(), 300 + 4);
    }
}
