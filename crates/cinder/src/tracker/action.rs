/// Action field of UDP tracker datagrams.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    Connect = 0,
    #[default]
    Announce = 1,
    Scrape = 2,
    Error = 3,
}

impl TryFrom<u32> for Action {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        Ok(match value {
            0 => Action::Connect,
            1 => Action::Announce,
            2 => Action::Scrape,
            3 => Action::Error,
            other => return Err(other),
        })
    }
}
