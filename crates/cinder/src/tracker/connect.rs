use speedy::{BigEndian, Readable, Writable};

use super::action::Action;
use crate::{error::Error, tracker::TrackerFailure};

#[derive(Debug, PartialEq, Clone, Readable, Writable)]
pub struct Request {
    pub protocol_id: u64,
    pub action: u32,
    pub transaction_id: u32,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub const LEN: usize = 16;
    pub const MAGIC: u64 = 0x41727101980;

    pub fn new() -> Self {
        Self {
            protocol_id: Self::MAGIC,
            action: Action::Connect as u32,
            transaction_id: rand::random::<u32>(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec_with_ctx(BigEndian {})?)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::LEN {
            return Err(TrackerFailure::BadData("short connect request".into()).into());
        }
        let req = Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::LEN])?;
        if req.protocol_id != Self::MAGIC {
            return Err(TrackerFailure::BadData("wrong protocol id".into()).into());
        }
        Ok(req)
    }
}

#[derive(Debug, PartialEq, Clone, Readable, Writable)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    pub connection_id: u64,
}

impl Response {
    pub const LEN: usize = 16;

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec_with_ctx(BigEndian {})?)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::LEN {
            return Err(TrackerFailure::BadData("short connect response".into()).into());
        }
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::LEN])?)
    }
}
